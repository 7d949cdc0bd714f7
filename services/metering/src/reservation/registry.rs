use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;
use uuid::Uuid;

use crate::feature::Feature;

use super::error::ReservationError;
use super::DEFAULT_RESERVATION_TTL_SECS;

/// Advisory claim on capacity handed out by a successful access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub token: String,
    pub customer_id: String,
    pub feature: Feature,
    pub amount: u64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn matches(&self, customer_id: &str, feature: Feature, amount: u64) -> bool {
        self.customer_id == customer_id && self.feature == feature && self.amount == amount
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Process-local reservations keyed by opaque token.
///
/// Entries leave the map exactly once: redeemed by a matching consume, or
/// purged by the sweeper after they expire.
#[derive(Clone)]
pub struct ReservationRegistry {
    entries: Arc<DashMap<String, Reservation>>,
    ttl: chrono::Duration,
    sweep_interval: Duration,
}

impl ReservationRegistry {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_RESERVATION_TTL_SECS as i64));
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            sweep_interval,
        }
    }

    pub fn issue(&self, customer_id: &str, feature: Feature, amount: u64) -> Reservation {
        self.issue_at(customer_id, feature, amount, Utc::now())
    }

    pub fn issue_at(
        &self,
        customer_id: &str,
        feature: Feature,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Reservation {
        let reservation = Reservation {
            token: Uuid::new_v4().to_string(),
            customer_id: customer_id.to_string(),
            feature,
            amount,
            issued_at: now,
            expires_at: now + self.ttl,
        };
        self.entries
            .insert(reservation.token.clone(), reservation.clone());
        reservation
    }

    pub fn redeem(
        &self,
        token: &str,
        customer_id: &str,
        feature: Feature,
        amount: u64,
    ) -> Result<Reservation, ReservationError> {
        self.redeem_at(token, customer_id, feature, amount, Utc::now())
    }

    /// Burns the token if it matches and is unexpired. A mismatched attempt
    /// leaves the token in place for its rightful holder.
    pub fn redeem_at(
        &self,
        token: &str,
        customer_id: &str,
        feature: Feature,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Reservation, ReservationError> {
        if let Some((_, reservation)) = self.entries.remove_if(token, |_, reservation| {
            reservation.matches(customer_id, feature, amount) && !reservation.is_expired(now)
        }) {
            return Ok(reservation);
        }

        let expired = match self.entries.get(token) {
            None => return Err(ReservationError::Unknown),
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            self.entries.remove(token);
            Err(ReservationError::Expired)
        } else {
            Err(ReservationError::Mismatch)
        }
    }

    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0usize;
        self.entries.retain(|_, reservation| {
            let keep = !reservation.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(registry.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                match registry.sweep_expired() {
                    0 => {}
                    purged => {
                        debug!(purged, remaining = registry.len(), "purged expired reservations");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ReservationRegistry {
        ReservationRegistry::new(Duration::from_secs(300), Duration::from_millis(10))
    }

    #[test]
    fn redeems_exactly_once() {
        let registry = registry();
        let reservation = registry.issue("cust-1", Feature::CreditScoring, 2);

        let redeemed = registry
            .redeem(&reservation.token, "cust-1", Feature::CreditScoring, 2)
            .expect("first redemption succeeds");
        assert_eq!(redeemed, reservation);
        assert_eq!(
            registry.redeem(&reservation.token, "cust-1", Feature::CreditScoring, 2),
            Err(ReservationError::Unknown)
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn mismatch_keeps_token_alive() {
        let registry = registry();
        let reservation = registry.issue("cust-1", Feature::CreditScoring, 2);

        assert_eq!(
            registry.redeem(&reservation.token, "cust-1", Feature::CreditScoring, 3),
            Err(ReservationError::Mismatch)
        );
        assert_eq!(
            registry.redeem(&reservation.token, "cust-2", Feature::CreditScoring, 2),
            Err(ReservationError::Mismatch)
        );
        assert!(registry
            .redeem(&reservation.token, "cust-1", Feature::CreditScoring, 2)
            .is_ok());
    }

    #[test]
    fn expired_tokens_are_rejected_and_dropped() {
        let registry = registry();
        let issued_at = Utc::now();
        let reservation = registry.issue_at("cust-1", Feature::ApiCalls, 1, issued_at);

        let later = issued_at + chrono::Duration::seconds(301);
        assert_eq!(
            registry.redeem_at(&reservation.token, "cust-1", Feature::ApiCalls, 1, later),
            Err(ReservationError::Expired)
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn sweep_purges_only_expired() {
        let registry = registry();
        let now = Utc::now();
        registry.issue_at("cust-1", Feature::ApiCalls, 1, now - chrono::Duration::seconds(400));
        registry.issue_at("cust-1", Feature::ApiCalls, 1, now);

        assert_eq!(registry.sweep_expired_at(now), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn sweeper_task_purges_in_background() {
        let registry = ReservationRegistry::new(Duration::from_millis(1), Duration::from_millis(10));
        registry.issue("cust-1", Feature::ApiCalls, 1);

        let handle = registry.start_sweeper();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(registry.is_empty());
    }
}
