use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::feature::Feature;
use crate::period::PeriodType;
use crate::usage::UsageLimit;

mod error;
mod loader;

pub use error::CatalogError;
pub use loader::StaticPlanCatalog;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub enabled: bool,
    pub limit: UsageLimit,
    pub period_type: PeriodType,
    /// Overrides the service-wide warning threshold (percent).
    #[serde(default)]
    pub warning_threshold: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub plan_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub monthly_token_allocation: u64,
    #[serde(default)]
    pub rollover_limit: u64,
    #[serde(default)]
    pub max_rollover_months: u32,
    /// Plan suggested to customers who hit a limit on this one.
    #[serde(default)]
    pub upgrade_plan_id: Option<String>,
    #[serde(default)]
    pub features: BTreeMap<Feature, FeatureConfig>,
}

impl PlanDefinition {
    pub fn enabled_features(&self) -> impl Iterator<Item = (Feature, &FeatureConfig)> {
        self.features
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(feature, config)| (*feature, config))
    }
}

/// Read-only source of plan definitions.
pub trait PlanCatalog: Send + Sync {
    fn plan(&self, plan_id: &str) -> Option<Arc<PlanDefinition>>;

    fn feature_config(&self, plan_id: &str) -> Option<BTreeMap<Feature, FeatureConfig>> {
        self.plan(plan_id).map(|plan| plan.features.clone())
    }
}
