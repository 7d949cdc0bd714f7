pub mod engine;
pub mod error;
pub mod types;

pub use engine::AccessControlEngine;
pub use error::MeteringError;
pub use types::{
    AccessResult, ConsumptionRequest, ConsumptionResult, DenialReason, FeatureUsage,
    PlanActivation, ResetType,
};
