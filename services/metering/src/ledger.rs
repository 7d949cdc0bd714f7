use std::sync::Arc;

use tracing::{debug, warn};

use crate::storage::{ConsumptionRecord, MeteringStore, StorageError};

/// Append-only audit trail of consumption attempts.
#[derive(Clone)]
pub struct ConsumptionLedger {
    store: Arc<dyn MeteringStore>,
}

impl ConsumptionLedger {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self { store }
    }

    /// Writes the record; a failure is logged and never surfaces to the caller.
    pub fn append(&self, record: &ConsumptionRecord) {
        match self.store.record_consumption(record) {
            Ok(()) => {
                debug!(
                    customer_id = %record.customer_id,
                    feature = %record.feature,
                    success = record.success,
                    "recorded consumption attempt"
                );
            }
            Err(err) => {
                warn!(
                    customer_id = %record.customer_id,
                    feature = %record.feature,
                    success = record.success,
                    error = %err,
                    "failed to record consumption attempt"
                );
            }
        }
    }

    pub fn history(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<ConsumptionRecord>, StorageError> {
        self.store.consumption_history(customer_id, limit)
    }
}
