//! Plan catalog and server-side pricing.
//!
//! Prices are owned here, never by the client. A checkout names a plan and a
//! billing cycle; the amount charged is looked up from the catalog.
//!
//! ```rust,ignore
//! use carepay::payments::Plans;
//!
//! let plans = Plans::builder()
//!     .plan("premium")
//!         .display_name("Premium")
//!         .monthly_price(84_900)
//!         .annual_price(849_000)
//!         .first_time_monthly_price(49_900)
//!         .done()
//!     .build();
//! ```
//!
//! From the environment, `CAREPAY_PLANS` holds the same catalog as a JSON
//! array of [`Plan`] objects.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error::{PaymentError, Result};
use super::types::{BillingCycle, MAX_AMOUNT_MINOR_UNITS};
use crate::utils::get_env_with_prefix;

/// Currency used when a plan does not name one.
pub const DEFAULT_CURRENCY: &str = "INR";

/// A collection of purchasable plans, keyed by slug.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Plan>", into = "Vec<Plan>")]
pub struct Plans {
    plans: HashMap<String, Plan>,
}

impl Plans {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> PlansBuilder {
        PlansBuilder::new()
    }

    /// Parse a JSON array of plans.
    pub fn from_json(json: &str) -> std::result::Result<Self, String> {
        let plans: Vec<Plan> =
            serde_json::from_str(json).map_err(|e| format!("invalid plan catalog: {}", e))?;
        Ok(plans.into())
    }

    /// Read `CAREPAY_PLANS` (or `PLANS`). `None` when unset.
    pub fn from_env() -> Option<std::result::Result<Self, String>> {
        get_env_with_prefix("PLANS").map(|json| Self::from_json(&json))
    }

    /// Add a plan, replacing any plan with the same slug.
    pub fn add(&mut self, plan: Plan) {
        self.plans.insert(plan.slug.clone(), plan);
    }

    #[must_use]
    pub fn get(&self, slug: &str) -> Option<&Plan> {
        self.plans.get(slug)
    }

    #[must_use]
    pub fn contains(&self, slug: &str) -> bool {
        self.plans.contains_key(slug)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Plans ordered by monthly price, cheapest first.
    #[must_use]
    pub fn sorted(&self) -> Vec<&Plan> {
        let mut plans: Vec<&Plan> = self.plans.values().collect();
        plans.sort_by(|a, b| {
            a.monthly_price
                .cmp(&b.monthly_price)
                .then_with(|| a.slug.cmp(&b.slug))
        });
        plans
    }

    /// Look up a plan, failing with a validation error naming `plan_id`.
    pub fn require(&self, slug: &str) -> Result<&Plan> {
        self.get(slug)
            .ok_or_else(|| PaymentError::validation("plan_id", format!("unknown plan '{}'", slug)))
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        self.plans.values().try_for_each(Plan::validate)
    }
}

impl From<Vec<Plan>> for Plans {
    fn from(plans: Vec<Plan>) -> Self {
        plans.into_iter().collect()
    }
}

impl From<Plans> for Vec<Plan> {
    fn from(plans: Plans) -> Self {
        plans.sorted().into_iter().cloned().collect()
    }
}

impl FromIterator<Plan> for Plans {
    fn from_iter<I: IntoIterator<Item = Plan>>(iter: I) -> Self {
        let mut plans = Plans::new();
        for plan in iter {
            plans.add(plan);
        }
        plans
    }
}

/// One plan and its prices in minor units.
///
/// First-time prices apply to a user's first ever purchase; without one the
/// regular price is charged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub slug: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub monthly_price: u64,
    pub annual_price: u64,
    #[serde(default)]
    pub first_time_monthly_price: Option<u64>,
    #[serde(default)]
    pub first_time_annual_price: Option<u64>,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

impl Plan {
    /// Price for one period of `cycle`.
    #[must_use]
    pub fn price(&self, cycle: BillingCycle, first_time: bool) -> u64 {
        let (regular, introductory) = match cycle {
            BillingCycle::Monthly => (self.monthly_price, self.first_time_monthly_price),
            BillingCycle::Annual => (self.annual_price, self.first_time_annual_price),
        };
        if first_time {
            introductory.unwrap_or(regular)
        } else {
            regular
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.slug.trim().is_empty() {
            return Err("plan slug must not be empty".to_string());
        }
        if self.currency.len() != 3 || !self.currency.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(format!(
                "plan '{}' currency '{}' is not an ISO-4217 code",
                self.slug, self.currency
            ));
        }
        let prices = [
            Some(self.monthly_price),
            Some(self.annual_price),
            self.first_time_monthly_price,
            self.first_time_annual_price,
        ];
        if prices
            .into_iter()
            .flatten()
            .any(|p| p == 0 || p > MAX_AMOUNT_MINOR_UNITS)
        {
            return Err(format!("plan '{}' has a price out of range", self.slug));
        }
        Ok(())
    }
}

/// What a user would be charged for a plan right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
    pub amount_minor_units: u64,
    pub currency: String,
    /// The first-time price was applied.
    pub first_time: bool,
}

impl PriceQuote {
    #[must_use]
    pub fn for_plan(plan: &Plan, billing_cycle: BillingCycle, first_time: bool) -> Self {
        Self {
            plan_id: plan.slug.clone(),
            billing_cycle,
            amount_minor_units: plan.price(billing_cycle, first_time),
            currency: plan.currency.clone(),
            first_time,
        }
    }
}

/// Builder for a [`Plans`] catalog.
#[derive(Debug, Default)]
pub struct PlansBuilder {
    plans: Plans,
}

impl PlansBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start defining a plan.
    #[must_use]
    pub fn plan(self, slug: &str) -> PlanBuilder {
        PlanBuilder {
            parent: self,
            plan: Plan {
                slug: slug.to_string(),
                display_name: None,
                currency: default_currency(),
                monthly_price: 0,
                annual_price: 0,
                first_time_monthly_price: None,
                first_time_annual_price: None,
            },
        }
    }

    #[must_use]
    pub fn build(self) -> Plans {
        self.plans
    }
}

/// Builder for a single plan inside a [`PlansBuilder`].
#[derive(Debug)]
pub struct PlanBuilder {
    parent: PlansBuilder,
    plan: Plan,
}

impl PlanBuilder {
    #[must_use]
    pub fn display_name(mut self, name: &str) -> Self {
        self.plan.display_name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn currency(mut self, currency: &str) -> Self {
        self.plan.currency = currency.to_string();
        self
    }

    #[must_use]
    pub fn monthly_price(mut self, minor_units: u64) -> Self {
        self.plan.monthly_price = minor_units;
        self
    }

    #[must_use]
    pub fn annual_price(mut self, minor_units: u64) -> Self {
        self.plan.annual_price = minor_units;
        self
    }

    #[must_use]
    pub fn first_time_monthly_price(mut self, minor_units: u64) -> Self {
        self.plan.first_time_monthly_price = Some(minor_units);
        self
    }

    #[must_use]
    pub fn first_time_annual_price(mut self, minor_units: u64) -> Self {
        self.plan.first_time_annual_price = Some(minor_units);
        self
    }

    /// Finish this plan and return to the catalog builder.
    #[must_use]
    pub fn done(mut self) -> PlansBuilder {
        self.parent.plans.add(self.plan);
        self.parent
    }
}
