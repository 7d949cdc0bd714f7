pub mod engine;
pub mod types;

pub use engine::{carry_over, TokenMeteringEngine, TOKEN_METER_SERVICE};
pub use types::{TokenConsumptionResult, TokenGrant};
