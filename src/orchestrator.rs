//! Nightly pipeline: health, harvest, repair, aggregate, alerts, verify.
//! Stages run in order; a failed stage stops the run and leaves the
//! progress marker untouched.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;

use crate::aggregation::AggregationEngine;
use crate::alerts::AlertProcessor;
use crate::catalog::CatalogStore;
use crate::harvest::{HarvestScope, Harvester, ProviderWorker, SourceWorker, WorkerManager};
use crate::normalization::Currency;
use crate::tasks::TaskContext;

pub const PROGRESS_FILE: &str = "nightly_progress.json";
pub const REPORT_FILE: &str = "nightly_report.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Health,
    Harvest,
    Repair,
    Aggregate,
    Alerts,
    Verify,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Health,
        Stage::Harvest,
        Stage::Repair,
        Stage::Aggregate,
        Stage::Alerts,
        Stage::Verify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Health => "health",
            Stage::Harvest => "harvest",
            Stage::Repair => "repair",
            Stage::Aggregate => "aggregate",
            Stage::Alerts => "alerts",
            Stage::Verify => "verify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Nightly pipeline report\n\n");
        out.push_str(&format!("- Started: {}\n", self.started_at.to_rfc3339()));
        out.push_str(&format!("- Finished: {}\n", self.finished_at.to_rfc3339()));
        out.push_str(&format!(
            "- Result: {}\n\n",
            if self.success { "success" } else { "failed" }
        ));
        out.push_str("| Stage | Status | Duration (ms) | Detail |\n");
        out.push_str("|---|---|---|---|\n");
        for s in &self.stages {
            let status = match s.status {
                StageStatus::Ok => "ok",
                StageStatus::Failed => "failed",
                StageStatus::Skipped => "skipped",
            };
            let detail = s.detail.to_string().replace('|', "\\|");
            out.push_str(&format!("| {} | {status} | {} | `{detail}` |\n", s.stage, s.duration_ms));
        }
        out
    }
}

/// Written after a fully successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMarker {
    pub last_success: DateTime<Utc>,
    pub stages: Vec<String>,
}

impl ProgressMarker {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(PROGRESS_FILE)
    }

    pub fn load(state_dir: &Path) -> Option<Self> {
        let bytes = fs::read(Self::path(state_dir)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// Functional check of representative read endpoints.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self) -> Result<Value>;
}

pub struct HttpVerifier {
    base_url: String,
    http: reqwest::Client,
}

const VERIFY_PATHS: &[&str] = &["/health", "/api/cards?limit=1", "/api/sets", "/api/products?limit=1"];

impl HttpVerifier {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify(&self) -> Result<Value> {
        let mut checked = Vec::new();
        for path in VERIFY_PATHS {
            let url = format!("{}{path}", self.base_url);
            let resp = self
                .http
                .get(&url)
                .send()
                .await
                .with_context(|| format!("GET {url}"))?;
            let status = resp.status();
            if !status.is_success() {
                bail!("GET {url} returned {status}");
            }
            checked.push(json!({ "path": path, "status": status.as_u16() }));
        }
        Ok(Value::Array(checked))
    }
}

pub struct PipelineSettings {
    pub state_dir: PathBuf,
    pub retention_days: u32,
    /// Secrets the health stage reports as missing.
    pub missing_secrets: Vec<&'static str>,
}

pub struct NightlyPipeline {
    store: Arc<dyn CatalogStore>,
    harvester: Arc<Harvester>,
    aggregation: Arc<AggregationEngine>,
    alerts: Arc<AlertProcessor>,
    verifier: Option<Arc<dyn Verifier>>,
    settings: PipelineSettings,
}

impl NightlyPipeline {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        harvester: Arc<Harvester>,
        aggregation: Arc<AggregationEngine>,
        alerts: Arc<AlertProcessor>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            harvester,
            aggregation,
            alerts,
            verifier: None,
            settings,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    #[instrument(skip_all, fields(task_id = ?ctx.task_id()))]
    pub async fn run(&self, ctx: &TaskContext) -> Result<PipelineReport> {
        let started_at = Utc::now();
        let mut stages: Vec<StageReport> = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            ctx.check_cancelled()?;
            ctx.info(format!("stage {stage} starting"));
            let t0 = Instant::now();
            let outcome = self.run_stage(stage, ctx).await;
            let duration_ms = t0.elapsed().as_millis() as u64;
            match outcome {
                Ok(Some(detail)) => {
                    ctx.info(format!("stage {stage} ok in {duration_ms} ms"));
                    stages.push(StageReport {
                        stage,
                        status: StageStatus::Ok,
                        duration_ms,
                        detail,
                    });
                }
                Ok(None) => {
                    ctx.info(format!("stage {stage} skipped"));
                    stages.push(StageReport {
                        stage,
                        status: StageStatus::Skipped,
                        duration_ms,
                        detail: Value::Null,
                    });
                }
                Err(err) => {
                    ctx.error(format!("stage {stage} failed: {err:#}"));
                    return Err(err.context(format!("nightly stage {stage} failed")));
                }
            }
        }

        let report = PipelineReport {
            started_at,
            finished_at: Utc::now(),
            success: true,
            stages,
        };
        self.commit(&report)?;
        ctx.info("nightly pipeline complete; progress marker written");
        Ok(report)
    }

    /// `Ok(None)` means the stage had nothing to do.
    async fn run_stage(&self, stage: Stage, ctx: &TaskContext) -> Result<Option<Value>> {
        match stage {
            Stage::Health => {
                self.store.ping().await.context("catalog store unreachable")?;
                if !self.settings.missing_secrets.is_empty() {
                    return Err(anyhow!(
                        "missing required env: {:?}",
                        self.settings.missing_secrets
                    ));
                }
                Ok(Some(json!({ "store": "ok", "secrets": "ok" })))
            }
            Stage::Harvest => {
                let workers: Vec<Box<dyn ProviderWorker>> = self
                    .harvester
                    .nightly_sources()
                    .into_iter()
                    .map(|code| {
                        Box::new(SourceWorker::new(self.harvester.clone(), code, HarvestScope::All))
                            as Box<dyn ProviderWorker>
                    })
                    .collect();
                if workers.is_empty() {
                    return Ok(None);
                }
                let report = WorkerManager::new(ctx).run_all(workers).await?;
                Ok(Some(serde_json::to_value(report)?))
            }
            Stage::Repair => {
                let repaired = self.store.repair_price_history().await?;
                let cutoff = Utc::now().date_naive()
                    - Duration::days(i64::from(self.settings.retention_days));
                let converted = match self.harvester.rates().rate(Currency::Eur) {
                    Some(rate) => self.store.fill_usd_from_eur(rate).await?,
                    None => 0,
                };
                let archived = self.store.archive_price_history(cutoff).await?;
                ctx.info(format!(
                    "repair: {} conditions, {} timestamps, {} duplicates, {converted} EUR rows priced in USD; {archived} rows archived before {cutoff}",
                    repaired.conditions_filled, repaired.timestamps_filled, repaired.duplicates_removed
                ));
                Ok(Some(json!({
                    "repair": repaired,
                    "converted": converted,
                    "archived": archived,
                    "cutoff": cutoff,
                })))
            }
            Stage::Aggregate => {
                let summary = self.aggregation.refresh_aggregates().await?;
                Ok(Some(serde_json::to_value(summary)?))
            }
            Stage::Alerts => {
                let summary = self.alerts.process(ctx).await?;
                Ok(Some(serde_json::to_value(summary)?))
            }
            Stage::Verify => match &self.verifier {
                Some(v) => Ok(Some(v.verify().await?)),
                None => Ok(None),
            },
        }
    }

    fn commit(&self, report: &PipelineReport) -> Result<()> {
        let dir = &self.settings.state_dir;
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let marker = ProgressMarker {
            last_success: report.finished_at,
            stages: report.stages.iter().map(|s| s.stage.to_string()).collect(),
        };
        fs::write(ProgressMarker::path(dir), serde_json::to_vec_pretty(&marker)?)
            .context("writing progress marker")?;
        fs::write(dir.join(REPORT_FILE), report.to_markdown()).context("writing nightly report")?;
        Ok(())
    }
}

/// Next instant at `hour`:00 UTC strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn schedule_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 2, 30, 0).unwrap();
        assert_eq!(next_run_after(now, 3), Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        assert_eq!(next_run_after(now, 3), Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 0).unwrap());
    }

    #[test]
    fn markdown_lists_every_stage() {
        let now = Utc::now();
        let report = PipelineReport {
            started_at: now,
            finished_at: now,
            success: true,
            stages: vec![
                StageReport {
                    stage: Stage::Health,
                    status: StageStatus::Ok,
                    duration_ms: 3,
                    detail: json!({"store": "ok"}),
                },
                StageReport {
                    stage: Stage::Verify,
                    status: StageStatus::Skipped,
                    duration_ms: 0,
                    detail: Value::Null,
                },
            ],
        };
        let md = report.to_markdown();
        assert!(md.contains("| health | ok | 3 |"));
        assert!(md.contains("| verify | skipped | 0 |"));
        assert!(md.contains("Result: success"));
    }
}
