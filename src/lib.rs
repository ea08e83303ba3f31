#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]

//! Credit accounting and session/job lifecycle core for the OPZEN AI tool suite.

pub mod billing;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod jobs;
pub mod ledger;
pub mod service;
pub mod session;
pub mod store;
pub mod tools;

pub use config::Config;
pub use error::{AuthFailure, CoreError, CoreResult, ErrorKind};
pub use service::CreditService;
