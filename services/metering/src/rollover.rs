use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::storage::MeteringStore;
use crate::tokens::TokenMeteringEngine;

/// Counts from one rollover pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RolloverSummary {
    pub limits_rolled: usize,
    pub balances_checked: usize,
    pub failures: usize,
}

/// Periodically moves due quota rows into their next period and opens the
/// current token period for every customer with a plan.
///
/// Every step is a compare-and-swap or an insert-if-absent, so overlapping
/// passes (or a pass racing lazy resets on the request path) do not double
/// apply.
#[derive(Clone)]
pub struct PeriodRolloverJob {
    store: Arc<dyn MeteringStore>,
    tokens: TokenMeteringEngine,
}

impl PeriodRolloverJob {
    pub fn new(store: Arc<dyn MeteringStore>, tokens: TokenMeteringEngine) -> Self {
        Self { store, tokens }
    }

    pub fn run_once(&self, now: DateTime<Utc>) -> RolloverSummary {
        let mut summary = RolloverSummary::default();

        match self.store.limits_due_for_reset(now) {
            Ok(due) => {
                for limit in due {
                    let usage_period = limit.period_type.period_key(now);
                    let reset_at = limit.period_type.next_reset_at(now);
                    match self.store.roll_limit_period(
                        limit.id,
                        &limit.usage_period,
                        &usage_period,
                        reset_at,
                    ) {
                        Ok(true) => summary.limits_rolled += 1,
                        Ok(false) => {}
                        Err(err) => {
                            summary.failures += 1;
                            warn!(
                                customer_id = %limit.customer_id,
                                feature = %limit.feature,
                                error = %err,
                                "failed to roll quota period"
                            );
                        }
                    }
                }
            }
            Err(err) => {
                summary.failures += 1;
                warn!(error = %err, "failed to list quotas due for reset");
            }
        }

        match self.store.list_customer_plans() {
            Ok(plans) => {
                for plan in plans {
                    summary.balances_checked += 1;
                    if let Err(err) = self.tokens.open_period(&plan.customer_id, now) {
                        summary.failures += 1;
                        warn!(
                            customer_id = %plan.customer_id,
                            error = %err,
                            "failed to open token period"
                        );
                    }
                }
            }
            Err(err) => {
                summary.failures += 1;
                warn!(error = %err, "failed to list customer plans");
            }
        }

        summary
    }

    pub fn start(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let job = self.clone();
                let summary = match tokio::task::spawn_blocking(move || job.run_once(Utc::now()))
                    .await
                {
                    Ok(summary) => summary,
                    Err(err) => {
                        warn!(error = %err, "rollover pass panicked");
                        continue;
                    }
                };

                if summary.limits_rolled > 0 || summary.failures > 0 {
                    info!(
                        limits_rolled = summary.limits_rolled,
                        balances_checked = summary.balances_checked,
                        failures = summary.failures,
                        "rollover pass complete"
                    );
                } else {
                    debug!(balances_checked = summary.balances_checked, "rollover pass idle");
                }
            }
        })
    }
}
