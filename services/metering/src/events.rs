use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::feature::{Feature, ServiceCategory};
use crate::storage::AlertType;
use crate::usage::UsageLimit;

pub const FEATURE_CONSUMPTION_TOPIC: &str = "feature.consumption";
pub const FEATURE_LIMIT_ALERT_TOPIC: &str = "feature.limit.alert";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionEvent {
    pub event_id: String,
    pub customer_id: String,
    pub feature: Feature,
    pub category: ServiceCategory,
    pub amount: u64,
    pub service_name: String,
    pub action_type: String,
    pub resource_id: Option<String>,
    pub new_usage: u64,
    pub remaining_usage: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitAlertEvent {
    pub event_id: String,
    pub alert_id: String,
    pub customer_id: String,
    pub feature: Feature,
    pub alert_type: AlertType,
    pub current_usage: u64,
    pub limit_value: UsageLimit,
    pub usage_percentage: f64,
    pub suggested_plan_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum DomainEvent {
    #[serde(rename = "feature.consumption")]
    FeatureConsumption(ConsumptionEvent),
    #[serde(rename = "feature.limit.alert")]
    LimitAlert(LimitAlertEvent),
}

impl DomainEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            DomainEvent::FeatureConsumption(_) => FEATURE_CONSUMPTION_TOPIC,
            DomainEvent::LimitAlert(_) => FEATURE_LIMIT_ALERT_TOPIC,
        }
    }

    pub fn customer_id(&self) -> &str {
        match self {
            DomainEvent::FeatureConsumption(event) => &event.customer_id,
            DomainEvent::LimitAlert(event) => &event.customer_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event transport unavailable: {0}")]
    Unavailable(String),
}

/// Outbound side of the event bus.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: DomainEvent) -> Result<(), PublishError>;
}

/// In-process fan-out over a tokio broadcast channel.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: DomainEvent) -> Result<(), PublishError> {
        let topic = event.topic();
        match self.sender.send(event) {
            Ok(receivers) => {
                debug!(topic, receivers, "published domain event");
            }
            Err(_) => {
                debug!(topic, "no subscribers for domain event");
            }
        }
        Ok(())
    }
}

/// Publisher that drops every event; for embedding without a bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: DomainEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert_event() -> DomainEvent {
        DomainEvent::LimitAlert(LimitAlertEvent {
            event_id: "evt-1".into(),
            alert_id: "alert-1".into(),
            customer_id: "cust-1".into(),
            feature: Feature::CreditScoring,
            alert_type: AlertType::LimitExceeded,
            current_usage: 9,
            limit_value: UsageLimit::Capped(10),
            usage_percentage: 90.0,
            suggested_plan_id: Some("business".into()),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn events_serialize_under_their_topic() {
        let encoded = serde_json::to_value(alert_event()).unwrap();
        assert_eq!(encoded["topic"], FEATURE_LIMIT_ALERT_TOPIC);
        assert_eq!(encoded["payload"]["alert_type"], "limit_exceeded");
        assert_eq!(encoded["payload"]["limit_value"], 10);
    }

    #[tokio::test]
    async fn broadcast_publisher_fans_out() {
        let publisher = BroadcastPublisher::new(8);
        let mut receiver = publisher.subscribe();

        publisher.publish(alert_event()).unwrap();
        let received = receiver.recv().await.expect("event should arrive");
        assert_eq!(received.topic(), FEATURE_LIMIT_ALERT_TOPIC);
        assert_eq!(received.customer_id(), "cust-1");
    }

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let publisher = BroadcastPublisher::new(8);
        assert!(publisher.publish(alert_event()).is_ok());
    }
}
