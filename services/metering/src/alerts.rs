use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{DomainEvent, EventPublisher, LimitAlertEvent};
use crate::storage::{AlertRecord, AlertType, MeteringStore, QuotaLimit};

/// Persists threshold alerts and announces them on the event bus.
///
/// Both halves are best-effort: a failed write or publish is logged and the
/// caller's outcome stands.
#[derive(Clone)]
pub struct AlertEmitter {
    store: Arc<dyn MeteringStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl AlertEmitter {
    pub fn new(store: Arc<dyn MeteringStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }

    /// `usage` is the figure the alert reports, which for a denied request is
    /// the usage it would have reached.
    pub fn emit(
        &self,
        limit: &QuotaLimit,
        alert_type: AlertType,
        usage: u64,
        suggested_plan_id: Option<String>,
    ) -> AlertRecord {
        let alert = AlertRecord {
            id: Uuid::new_v4().to_string(),
            customer_id: limit.customer_id.clone(),
            feature: limit.feature,
            alert_type,
            current_usage: usage,
            limit_value: limit.limit_value,
            usage_percentage: limit.limit_value.percentage(usage),
            suggested_plan_id,
            resolved: false,
            created_at: Utc::now(),
        };

        if let Err(err) = self.store.record_alert(&alert) {
            warn!(
                customer_id = %alert.customer_id,
                feature = %alert.feature,
                alert_type = %alert.alert_type,
                error = %err,
                "failed to persist feature alert"
            );
        }

        let event = DomainEvent::LimitAlert(LimitAlertEvent {
            event_id: Uuid::new_v4().to_string(),
            alert_id: alert.id.clone(),
            customer_id: alert.customer_id.clone(),
            feature: alert.feature,
            alert_type,
            current_usage: alert.current_usage,
            limit_value: alert.limit_value,
            usage_percentage: alert.usage_percentage,
            suggested_plan_id: alert.suggested_plan_id.clone(),
            timestamp: alert.created_at,
        });

        if let Err(err) = self.publisher.publish(event) {
            warn!(
                customer_id = %alert.customer_id,
                feature = %alert.feature,
                alert_type = %alert.alert_type,
                error = %err,
                "failed to publish feature alert"
            );
        }

        info!(
            customer_id = %alert.customer_id,
            feature = %alert.feature,
            alert_type = %alert.alert_type,
            usage_percentage = alert.usage_percentage,
            "feature alert emitted"
        );

        alert
    }
}
