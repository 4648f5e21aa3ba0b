//! Price alert evaluation against aggregated market prices.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use crate::catalog::{headline_price, AggregatedPrice, AlertNotification, CatalogStore, PriceAlert};
use crate::error::StoreResult;
use crate::tasks::TaskContext;

/// Recurring alerts notify at most once per this span.
pub const RENOTIFY_AFTER_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertSummary {
    pub checked: u64,
    pub triggered: u64,
    pub deactivated: u64,
    pub notified: u64,
}

/// Aggregate for the alert's condition, else the printing's headline price.
pub fn current_price(alert: &PriceAlert, aggregates: &[&AggregatedPrice]) -> Option<f64> {
    aggregates
        .iter()
        .find(|a| a.condition == alert.condition)
        .map(|a| a.avg_market_price_usd)
        .or_else(|| headline_price(aggregates.iter().copied()))
}

fn in_cooldown(alert: &PriceAlert, now: DateTime<Utc>) -> bool {
    alert.is_recurring
        && alert
            .last_triggered_at
            .is_some_and(|at| now - at < Duration::hours(RENOTIFY_AFTER_HOURS))
}

pub struct AlertProcessor {
    store: Arc<dyn CatalogStore>,
}

impl AlertProcessor {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, ctx), fields(task_id = ?ctx.task_id()))]
    pub async fn process(&self, ctx: &TaskContext) -> StoreResult<AlertSummary> {
        let alerts = self.store.active_alerts().await?;
        let mut summary = AlertSummary {
            checked: alerts.len() as u64,
            ..AlertSummary::default()
        };
        if alerts.is_empty() {
            return Ok(summary);
        }

        let mut ids: Vec<String> = alerts.iter().map(|a| a.printing_id.clone()).collect();
        ids.sort();
        ids.dedup();
        let aggregates = self.store.aggregates_for(&ids).await?;
        let mut by_printing: HashMap<&str, Vec<&AggregatedPrice>> = HashMap::new();
        for agg in &aggregates {
            by_printing.entry(agg.printing_id.as_str()).or_default().push(agg);
        }

        let now = Utc::now();
        for alert in &alerts {
            let Some(current) = by_printing
                .get(alert.printing_id.as_str())
                .and_then(|aggs| current_price(alert, aggs))
            else {
                continue;
            };
            if !alert.alert_type.is_met(current, alert.target_price) || in_cooldown(alert, now) {
                continue;
            }

            let deactivate = !alert.is_recurring;
            self.store
                .mark_alert_triggered(alert.alert_id, now, deactivate)
                .await?;
            summary.triggered += 1;
            if deactivate {
                summary.deactivated += 1;
            }

            let notification = AlertNotification {
                alert_id: alert.alert_id,
                user_id: alert.user_id.clone(),
                printing_id: alert.printing_id.clone(),
                alert_type: alert.alert_type,
                target_price: alert.target_price,
                current_price: current,
                triggered_at: now,
            };
            self.store.record_notification(&notification).await?;
            summary.notified += 1;
            info!(
                event = "notification",
                alert_id = alert.alert_id,
                user_id = %alert.user_id,
                printing_id = %alert.printing_id,
                alert_type = alert.alert_type.as_str(),
                target = alert.target_price,
                current,
                "price alert triggered"
            );
        }
        ctx.info(format!(
            "alerts: {} checked, {} triggered, {} deactivated, {} notified",
            summary.checked, summary.triggered, summary.deactivated, summary.notified
        ));
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AlertType, Condition};

    fn alert(recurring: bool, last: Option<DateTime<Utc>>) -> PriceAlert {
        PriceAlert {
            alert_id: 1,
            user_id: "u1".into(),
            printing_id: "p1".into(),
            condition: Condition::LightlyPlayed,
            alert_type: AlertType::Below,
            target_price: 10.0,
            is_active: true,
            is_recurring: recurring,
            last_triggered_at: last,
            created_at: Utc::now(),
        }
    }

    fn agg(condition: Condition, avg: f64) -> AggregatedPrice {
        AggregatedPrice {
            printing_id: "p1".into(),
            condition,
            avg_market_price_usd: avg,
            low_price_usd: avg,
            high_price_usd: avg,
            observation_count: 1,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn condition_aggregate_preferred() {
        let nm = agg(Condition::NearMint, 12.0);
        let lp = agg(Condition::LightlyPlayed, 9.0);
        assert_eq!(current_price(&alert(false, None), &[&nm, &lp]), Some(9.0));
        assert_eq!(current_price(&alert(false, None), &[&nm]), Some(12.0));
        assert_eq!(current_price(&alert(false, None), &[]), None);
    }

    #[test]
    fn recurring_cooldown() {
        let now = Utc::now();
        assert!(in_cooldown(&alert(true, Some(now - Duration::hours(2))), now));
        assert!(!in_cooldown(&alert(true, Some(now - Duration::hours(25))), now));
        assert!(!in_cooldown(&alert(false, Some(now)), now));
    }
}
