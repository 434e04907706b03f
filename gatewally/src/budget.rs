// gatewally/src/budget.rs
//
// Per-principal budget accounting.
//
// check() runs synchronously before the upstream call with a cheap
// estimate; track() runs fire-and-forget with the realised cost on its own
// storage handle. Concurrent requests may both pass check() and overshoot
// the limit by one request's cost — accepted, the pre-check is best-effort.
//
// Periods roll over at fixed UTC boundaries: daily at midnight, weekly at
// Monday 00:00, monthly on the first. Rollover zeroes the spend.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::config::BudgetConfig;
use crate::errors::{GatewayError, Result};
use crate::store::Store;
use crate::types::{BudgetPeriod, BudgetRecord};

/// Flat pre-check rate: ~1.3 tokens per word at 2e-6 USD per token.
const EST_TOKENS_PER_WORD: f64 = 1.3;
const EST_USD_PER_TOKEN:   f64 = 2e-6;

pub fn estimate_cost(text: &str) -> f64 {
    text.split_whitespace().count() as f64 * EST_TOKENS_PER_WORD * EST_USD_PER_TOKEN
}

/// An alert threshold crossed by a track() call.
#[derive(Debug, Clone)]
pub struct BudgetAlert {
    pub threshold:     f64,
    pub usage_ratio:   f64,
    pub current_spend: f64,
    pub limit:         f64,
}

pub struct BudgetMeter {
    store:            Arc<dyn Store>,
    enabled:          bool,
    default_limit:    f64,
    default_period:   BudgetPeriod,
    alert_thresholds: Vec<f64>,
}

impl BudgetMeter {
    pub fn new(config: &BudgetConfig, store: Arc<dyn Store>) -> Self {
        Self {
            store,
            enabled:          config.enabled,
            default_limit:    config.default_limit,
            default_period:   config.default_period,
            alert_thresholds: config.alert_thresholds.clone(),
        }
    }

    /// Admit iff `current_spend + cost <= limit` for the current period.
    pub async fn check(&self, principal_id: Uuid, cost: f64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let now = Utc::now();
        let mut budget = match self.store.get_budget(principal_id).await? {
            Some(b) => b,
            None    => {
                let budget = BudgetRecord {
                    principal_id,
                    limit_usd:         self.default_limit,
                    period:            self.default_period,
                    current_spend_usd: 0.0,
                    reset_at:          next_reset_at(self.default_period, now),
                    updated_at:        now,
                };
                self.store.put_budget(budget.clone()).await?;
                budget
            }
        };

        if now >= budget.reset_at {
            budget.reset_at          = next_reset_at(budget.period, now);
            budget.current_spend_usd = 0.0;
            budget.updated_at        = now;
            self.store.put_budget(budget.clone()).await?;
        }

        if budget.current_spend_usd + cost > budget.limit_usd {
            return Err(GatewayError::BudgetExceeded {
                current: budget.current_spend_usd,
                limit:   budget.limit_usd,
            });
        }
        Ok(())
    }

    /// Add realised cost. Best-effort: storage failures are logged, never
    /// raised. Returns the alert thresholds this spend crossed so the
    /// caller can notify.
    pub async fn track(&self, principal_id: Uuid, cost: f64) -> Vec<BudgetAlert> {
        if !self.enabled || cost <= 0.0 {
            return Vec::new();
        }

        let updated = match self.store.add_spend(principal_id, cost).await {
            Ok(b) => b,
            Err(e) => {
                warn!("Budget track failed for {principal_id}: {e}");
                return Vec::new();
            }
        };

        if updated.limit_usd <= 0.0 {
            return Vec::new();
        }
        let after  = updated.current_spend_usd / updated.limit_usd;
        let before = (updated.current_spend_usd - cost) / updated.limit_usd;

        self.alert_thresholds
            .iter()
            .filter(|&&t| before < t && after >= t)
            .map(|&threshold| BudgetAlert {
                threshold,
                usage_ratio:   after,
                current_spend: updated.current_spend_usd,
                limit:         updated.limit_usd,
            })
            .collect()
    }
}

// ── Period boundaries ─────────────────────────────────────────────────────────

fn next_reset_at(period: BudgetPeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = |date: NaiveDate| date.and_hms_opt(0, 0, 0).expect("valid midnight").and_utc();

    match period {
        BudgetPeriod::Daily => midnight(now.date_naive() + Duration::days(1)),
        BudgetPeriod::Weekly => {
            let until_monday = (7 - now.weekday().num_days_from_monday() as i64) % 7;
            let days = if until_monday == 0 { 7 } else { until_monday };
            midnight(now.date_naive() + Duration::days(days))
        }
        BudgetPeriod::Monthly => {
            let (year, month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            midnight(NaiveDate::from_ymd_opt(year, month, 1).expect("valid first-of-month"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn meter(limit: f64) -> (BudgetMeter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let meter = BudgetMeter::new(
            &BudgetConfig {
                enabled:          true,
                default_limit:    limit,
                default_period:   BudgetPeriod::Monthly,
                alert_thresholds: vec![0.5, 0.75, 0.9],
            },
            store.clone(),
        );
        (meter, store)
    }

    #[tokio::test]
    async fn budget_is_created_lazily_on_first_check() {
        let (meter, store) = meter(10.0);
        let principal = Uuid::new_v4();
        assert!(store.get_budget(principal).await.unwrap().is_none());

        meter.check(principal, 0.01).await.unwrap();
        let budget = store.get_budget(principal).await.unwrap().unwrap();
        assert!((budget.limit_usd - 10.0).abs() < 1e-9);
        assert!(budget.reset_at > Utc::now());
    }

    #[tokio::test]
    async fn admits_iff_spend_plus_cost_within_limit() {
        let (meter, store) = meter(1.0);
        let principal = Uuid::new_v4();
        meter.check(principal, 0.0).await.unwrap(); // create
        store.add_spend(principal, 0.99).await.unwrap();

        // 0.99 + 0.01 == 1.00 — exactly at the limit, admitted.
        meter.check(principal, 0.01).await.unwrap();

        // 0.99 + 0.02 > 1.00 — rejected with the observed numbers.
        match meter.check(principal, 0.02).await {
            Err(GatewayError::BudgetExceeded { current, limit }) => {
                assert!((current - 0.99).abs() < 1e-9);
                assert!((limit - 1.0).abs() < 1e-9);
            }
            other => panic!("expected budget rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_period_rolls_over_and_zeroes_spend() {
        let (meter, store) = meter(1.0);
        let principal = Uuid::new_v4();
        store
            .put_budget(BudgetRecord {
                principal_id:      principal,
                limit_usd:         1.0,
                period:            BudgetPeriod::Daily,
                current_spend_usd: 0.99,
                reset_at:          Utc::now() - Duration::hours(1),
                updated_at:        Utc::now() - Duration::days(1),
            })
            .await
            .unwrap();

        meter.check(principal, 0.5).await.unwrap(); // would fail without rollover
        let budget = store.get_budget(principal).await.unwrap().unwrap();
        assert_eq!(budget.current_spend_usd, 0.0);
        assert!(budget.reset_at > Utc::now());
    }

    #[tokio::test]
    async fn track_reports_crossed_alert_thresholds() {
        let (meter, store) = meter(1.0);
        let principal = Uuid::new_v4();
        meter.check(principal, 0.0).await.unwrap();
        store.add_spend(principal, 0.4).await.unwrap();

        // 0.40 → 0.80 crosses 0.5 and 0.75, not 0.9.
        let alerts = meter.track(principal, 0.4).await;
        let crossed: Vec<f64> = alerts.iter().map(|a| a.threshold).collect();
        assert_eq!(crossed, vec![0.5, 0.75]);

        // Same ratio again crosses nothing new below 0.9.
        let alerts = meter.track(principal, 0.05).await;
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn track_without_budget_is_swallowed() {
        let (meter, _) = meter(1.0);
        assert!(meter.track(Uuid::new_v4(), 0.5).await.is_empty());
    }

    #[tokio::test]
    async fn disabled_meter_admits_everything() {
        let store = Arc::new(MemoryStore::new());
        let meter = BudgetMeter::new(
            &BudgetConfig { enabled: false, ..BudgetConfig::default() },
            store,
        );
        meter.check(Uuid::new_v4(), 1e9).await.unwrap();
    }

    #[test]
    fn reset_boundaries_land_on_period_starts() {
        let now = Utc.with_ymd_and_hms(2026, 3, 11, 15, 30, 0).unwrap(); // a Wednesday

        let daily = next_reset_at(BudgetPeriod::Daily, now);
        assert_eq!(daily, Utc.with_ymd_and_hms(2026, 3, 12, 0, 0, 0).unwrap());

        let weekly = next_reset_at(BudgetPeriod::Weekly, now);
        assert_eq!(weekly, Utc.with_ymd_and_hms(2026, 3, 16, 0, 0, 0).unwrap()); // next Monday

        let monthly = next_reset_at(BudgetPeriod::Monthly, now);
        assert_eq!(monthly, Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap());

        // December wraps the year.
        let dec = Utc.with_ymd_and_hms(2026, 12, 30, 12, 0, 0).unwrap();
        assert_eq!(
            next_reset_at(BudgetPeriod::Monthly, dec),
            Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap()
        );

        // A Monday rolls to the following Monday, never to itself.
        let monday = Utc.with_ymd_and_hms(2026, 3, 9, 8, 0, 0).unwrap();
        assert_eq!(
            next_reset_at(BudgetPeriod::Weekly, monday),
            Utc.with_ymd_and_hms(2026, 3, 16, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn cost_estimate_matches_the_flat_rate() {
        let text = "one two three four"; // 4 words
        let expected = 4.0 * 1.3 * 2e-6;
        assert!((estimate_cost(text) - expected).abs() < 1e-12);
        assert_eq!(estimate_cost(""), 0.0);
    }
}
