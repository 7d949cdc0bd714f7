use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use super::{CatalogError, PlanCatalog, PlanDefinition};

#[derive(Debug, Deserialize)]
struct CatalogFile {
    plans: Vec<PlanDefinition>,
}

/// Plan catalog held in memory, usually loaded once from a JSON file.
#[derive(Debug, Default)]
pub struct StaticPlanCatalog {
    plans: HashMap<String, Arc<PlanDefinition>>,
}

impl StaticPlanCatalog {
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let raw = fs::read_to_string(path)?;
        let catalog = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            plans = catalog.plans.len(),
            "loaded plan catalog"
        );
        Ok(catalog)
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(raw)?;
        Self::from_plans(file.plans)
    }

    pub fn from_plans(plans: Vec<PlanDefinition>) -> Result<Self, CatalogError> {
        let mut by_id = HashMap::with_capacity(plans.len());
        for plan in plans {
            validate_plan(&plan)?;
            if by_id.contains_key(&plan.plan_id) {
                return Err(CatalogError::DuplicatePlan(plan.plan_id));
            }
            by_id.insert(plan.plan_id.clone(), Arc::new(plan));
        }

        for plan in by_id.values() {
            if let Some(target) = &plan.upgrade_plan_id {
                if !by_id.contains_key(target) {
                    return Err(CatalogError::InvalidPlan {
                        plan_id: plan.plan_id.clone(),
                        reason: format!("upgrade plan '{target}' is not in the catalog"),
                    });
                }
            }
        }

        Ok(Self { plans: by_id })
    }

    pub fn plan_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plans.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl PlanCatalog for StaticPlanCatalog {
    fn plan(&self, plan_id: &str) -> Option<Arc<PlanDefinition>> {
        self.plans.get(plan_id).cloned()
    }
}

fn validate_plan(plan: &PlanDefinition) -> Result<(), CatalogError> {
    if plan.plan_id.trim().is_empty() {
        return Err(CatalogError::InvalidPlan {
            plan_id: plan.plan_id.clone(),
            reason: "plan_id cannot be empty".into(),
        });
    }

    for (feature, config) in &plan.features {
        if let Some(threshold) = config.warning_threshold {
            if threshold == 0 || threshold > 100 {
                return Err(CatalogError::InvalidPlan {
                    plan_id: plan.plan_id.clone(),
                    reason: format!("warning threshold for {feature} must be within 1..=100"),
                });
            }
        }
    }

    Ok(())
}
