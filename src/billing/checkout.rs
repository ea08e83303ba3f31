//! Bank-transfer checkout instructions.

use super::plans::Plan;
use crate::config::CheckoutConfig;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutInstructions {
    pub plan_id: String,
    pub plan_name: String,
    pub amount: u64,
    pub currency: String,
    pub credits: u64,
    pub bank_name: String,
    pub account_holder: String,
    pub account_number: String,
    /// Text the payer must put in the transfer description so the payment
    /// can be matched to an account.
    pub memo: String,
}

impl CheckoutInstructions {
    pub fn for_plan(config: &CheckoutConfig, plan: &Plan, reference: &str) -> Self {
        Self {
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            amount: plan.price,
            currency: plan.currency.clone(),
            credits: plan.credits,
            bank_name: config.bank_name.clone(),
            account_holder: config.account_holder.clone(),
            account_number: config.account_number.clone(),
            memo: render_memo(&config.memo_template, reference, &plan.name),
        }
    }
}

fn render_memo(template: &str, reference: &str, plan_name: &str) -> String {
    template
        .replace("{reference}", reference.trim())
        .replace("{plan}", &plan_name.to_uppercase())
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::PlanCatalog;
    use crate::config::Config;

    #[test]
    fn instructions_name_plan_and_bank() {
        let config = Config::default();
        let catalog = PlanCatalog::from_config(&config.plans).unwrap();
        let plan = catalog.find("plan_pro").unwrap();

        let checkout = CheckoutInstructions::for_plan(&config.checkout, plan, "0912345678");
        assert_eq!(checkout.amount, 599_000);
        assert_eq!(checkout.currency, "VND");
        assert_eq!(checkout.bank_name, "MB Bank");
        assert_eq!(checkout.memo, "0912345678 PRO");
    }

    #[test]
    fn memo_template_is_configurable() {
        assert_eq!(
            render_memo("OPZ-{plan}-{reference}", "u42", "Ultra"),
            "OPZ-ULTRA-u42"
        );
        assert_eq!(render_memo("{reference} {plan}", "", "Pro"), "PRO");
    }
}
