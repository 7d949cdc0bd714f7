pub mod access;
pub mod alerts;
pub mod catalog;
pub mod config;
pub mod events;
pub mod feature;
pub mod ledger;
pub mod period;
pub mod reservation;
pub mod rollover;
pub mod storage;
pub mod tokens;
pub mod usage;

pub use access::{
    AccessControlEngine, AccessResult, ConsumptionRequest, ConsumptionResult, DenialReason,
    FeatureUsage, MeteringError, PlanActivation, ResetType,
};
pub use catalog::{FeatureConfig, PlanCatalog, PlanDefinition, StaticPlanCatalog};
pub use config::MeteringConfig;
pub use events::{BroadcastPublisher, DomainEvent, EventPublisher, NoopPublisher, PublishError};
pub use feature::{ConsumptionContext, Feature, ServiceCategory};
pub use period::PeriodType;
pub use reservation::{Reservation, ReservationError, ReservationRegistry};
pub use rollover::{PeriodRolloverJob, RolloverSummary};
pub use storage::{MeteringStore, SqliteStore, StorageError};
pub use tokens::{TokenConsumptionResult, TokenGrant, TokenMeteringEngine};
pub use usage::{UsageLimit, MAX_AMOUNT};
