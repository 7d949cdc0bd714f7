use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use feature_gate_metering::{
    AccessControlEngine, ConsumptionRequest, Feature, MeteringConfig, MeteringStore,
    NoopPublisher, PlanCatalog, ReservationRegistry, SqliteStore, StaticPlanCatalog,
    TokenMeteringEngine,
};
use serde_json::json;
use tempfile::TempDir;

pub use feature_gate_metering;

pub const BENCH_PLAN_ID: &str = "bench";

/// Engines over a throwaway SQLite file, with one customer on an
/// effectively unlimited plan.
pub struct MeteringBenchFixture {
    pub access: AccessControlEngine,
    pub tokens: TokenMeteringEngine,
    pub customer_id: String,
    pub temp_dir: TempDir,
}

impl MeteringBenchFixture {
    pub fn new(customer_id: &str) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let store: Arc<dyn MeteringStore> =
            Arc::new(SqliteStore::new(temp_dir.path().join("metering"))?);
        let catalog: Arc<dyn PlanCatalog> = Arc::new(bench_catalog()?);
        let config = MeteringConfig::default();

        let access = AccessControlEngine::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            ReservationRegistry::new(Duration::from_secs(300), Duration::from_secs(60)),
            Arc::new(NoopPublisher),
            &config,
        );
        access.update_customer_feature_limits(customer_id, "bench-subscription", BENCH_PLAN_ID)?;
        let tokens = TokenMeteringEngine::new(store, catalog);

        Ok(Self {
            access,
            tokens,
            customer_id: customer_id.to_string(),
            temp_dir,
        })
    }

    pub fn request(&self, feature: Feature, amount: u64) -> ConsumptionRequest {
        ConsumptionRequest::new(self.customer_id.clone(), feature, amount, "bench", "measure")
    }
}

fn bench_catalog() -> Result<StaticPlanCatalog> {
    let raw = json!({
        "plans": [{
            "plan_id": BENCH_PLAN_ID,
            "monthly_token_allocation": u32::MAX,
            "features": {
                "credit_scoring": { "enabled": true, "limit": i64::MAX, "period_type": "monthly" },
                "ai_assistant": { "enabled": true, "limit": -1, "period_type": "monthly" }
            }
        }]
    });
    Ok(StaticPlanCatalog::from_json(&raw.to_string())?)
}
