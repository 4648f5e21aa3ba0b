use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;

use super::{HarvestScope, HarvestSummary, Harvester};
use crate::tasks::TaskContext;

#[async_trait]
pub trait ProviderWorker: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &TaskContext) -> Result<HarvestSummary>;
}

/// One source's harvest as a worker.
pub struct SourceWorker {
    harvester: Arc<Harvester>,
    source: String,
    scope: HarvestScope,
}

impl SourceWorker {
    pub fn new(harvester: Arc<Harvester>, source: &str, scope: HarvestScope) -> Self {
        Self {
            harvester,
            source: source.to_string(),
            scope,
        }
    }
}

#[async_trait]
impl ProviderWorker for SourceWorker {
    fn name(&self) -> &str {
        &self.source
    }

    async fn run(&self, ctx: &TaskContext) -> Result<HarvestSummary> {
        self.harvester.run_source(&self.source, &self.scope, ctx).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerFailure {
    pub worker: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HarvestReport {
    pub summaries: Vec<HarvestSummary>,
    pub failures: Vec<WorkerFailure>,
}

pub struct WorkerManager {
    ctx: TaskContext,
}

impl WorkerManager {
    pub fn new(ctx: &TaskContext) -> Self {
        Self { ctx: ctx.clone() }
    }

    /// Run workers concurrently, at most one per provider name. Fails only
    /// when every worker failed.
    pub async fn run_all(&self, workers: Vec<Box<dyn ProviderWorker>>) -> Result<HarvestReport> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(workers.len());
        for w in workers {
            if !seen.insert(w.name().to_string()) {
                self.ctx
                    .warn(format!("worker {} already scheduled; dropping duplicate", w.name()));
                continue;
            }
            let ctx = self.ctx.clone();
            tasks.push(tokio::spawn(async move {
                let name = w.name().to_string();
                ctx.info(format!("starting worker {name}"));
                let res = w.run(&ctx).await;
                match &res {
                    Ok(s) => ctx.info(format!(
                        "worker {name} finished: {} inserted, {} failed",
                        s.inserted, s.failed
                    )),
                    Err(e) => ctx.error(format!("worker {name} failed: {e:#}")),
                }
                (name, res)
            }));
        }
        let total = tasks.len();
        let mut report = HarvestReport::default();
        for joined in join_all(tasks).await {
            match joined {
                Ok((_, Ok(summary))) => report.summaries.push(summary),
                Ok((worker, Err(e))) => report.failures.push(WorkerFailure {
                    worker,
                    error: format!("{e:#}"),
                }),
                Err(join_err) => report.failures.push(WorkerFailure {
                    worker: "unknown".to_string(),
                    error: join_err.to_string(),
                }),
            }
        }
        if total > 0 && report.failures.len() == total {
            let detail: Vec<String> = report
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.worker, f.error))
                .collect();
            return Err(anyhow!("all harvest workers failed: {}", detail.join("; ")));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        ok: bool,
    }

    #[async_trait]
    impl ProviderWorker for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _ctx: &TaskContext) -> Result<HarvestSummary> {
            if self.ok {
                Ok(HarvestSummary::new(self.name))
            } else {
                Err(anyhow!("download failed"))
            }
        }
    }

    #[tokio::test]
    async fn partial_failure_is_reported_not_raised() {
        let ctx = TaskContext::detached("harvest");
        let mgr = WorkerManager::new(&ctx);
        let report = mgr
            .run_all(vec![
                Box::new(Fixed { name: "a", ok: true }),
                Box::new(Fixed { name: "b", ok: false }),
                Box::new(Fixed { name: "a", ok: true }),
            ])
            .await
            .unwrap();
        assert_eq!(report.summaries.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].worker, "b");
    }

    #[tokio::test]
    async fn all_failed_is_an_error() {
        let ctx = TaskContext::detached("harvest");
        let err = WorkerManager::new(&ctx)
            .run_all(vec![Box::new(Fixed { name: "b", ok: false })])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("all harvest workers failed"));
    }
}
