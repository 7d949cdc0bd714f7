use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read plan catalog: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse plan catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate plan '{0}' in catalog")]
    DuplicatePlan(String),
    #[error("invalid plan '{plan_id}': {reason}")]
    InvalidPlan { plan_id: String, reason: String },
}
