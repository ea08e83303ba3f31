use crate::config::PlanConfig;
use serde::Serialize;
use std::collections::HashSet;

/// A purchasable bundle of credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// Price in the smallest unit of `currency`.
    pub price: u64,
    pub currency: String,
    /// Credits granted upon purchase.
    pub credits: u64,
    /// Subscription validity added per purchase.
    pub duration_months: u32,
    pub description: String,
}

impl From<&PlanConfig> for Plan {
    fn from(config: &PlanConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            price: config.price,
            currency: config.currency.clone(),
            credits: config.credits,
            duration_months: config.duration_months,
            description: config.description.clone(),
        }
    }
}

/// Immutable plan catalog loaded from configuration.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    pub fn from_config(configs: &[PlanConfig]) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        let mut plans = Vec::with_capacity(configs.len());
        for config in configs {
            if config.id.trim().is_empty() {
                anyhow::bail!("Plan with empty id");
            }
            if !seen.insert(config.id.as_str()) {
                anyhow::bail!("Duplicate plan id: {}", config.id);
            }
            if config.credits == 0 {
                anyhow::bail!("Plan {} grants no credits", config.id);
            }
            plans.push(Plan::from(config));
        }
        Ok(Self { plans })
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    /// Look up a plan by id.
    pub fn find(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    /// Look up a plan by price, for transfers that only report an amount.
    pub fn find_by_price(&self, price: u64) -> Option<&Plan> {
        self.plans.iter().find(|p| p.price == price)
    }
}
