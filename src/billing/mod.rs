//! Plans, checkout and payment reconciliation.
//!
//! ## Design
//! - Plan catalog comes from configuration and is immutable at runtime
//! - Checkout is a bank transfer; the memo ties the transfer to an account
//! - Payment confirmations grant through the Credit Ledger keyed by payment id
//! - Unmatched payments wait in the guest bucket for an audited migration

pub mod checkout;
pub mod plans;
pub mod reconciler;

pub use checkout::CheckoutInstructions;
pub use plans::{Plan, PlanCatalog};
pub use reconciler::{PaymentConfirmation, PaymentEvent, PaymentReconciler};
