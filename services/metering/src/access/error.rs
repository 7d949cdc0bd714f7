use thiserror::Error;

use crate::catalog::CatalogError;
use crate::feature::UnknownFeature;
use crate::storage::StorageError;

/// Errors surfaced to administrative callers (billing, operators). Request-path
/// denials are reported through `DenialReason` instead.
#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    UnknownFeature(#[from] UnknownFeature),
    #[error("plan '{0}' not found in catalog")]
    UnknownPlan(String),
    #[error("no token balance for customer {customer_id} in period {period}")]
    MissingBalance { customer_id: String, period: String },
    #[error("plan catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("storage error: {0}")]
    Persistence(#[from] StorageError),
}
