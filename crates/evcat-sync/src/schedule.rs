//! Cron-driven collection cycles.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::LocationConfig;
use crate::cycle::{CollectionCycle, CycleRun};
use crate::report::{write_run, RunArtifacts};

/// Runs a cycle over every configured source and writes its report. At most one
/// run is active at a time.
pub struct CycleRunner {
    cycle: Arc<CollectionCycle>,
    locations: Vec<LocationConfig>,
    reports_root: PathBuf,
    running: Mutex<()>,
}

impl CycleRunner {
    pub fn new(cycle: Arc<CollectionCycle>, locations: Vec<LocationConfig>, reports_root: PathBuf) -> Self {
        Self {
            cycle,
            locations,
            reports_root,
            running: Mutex::new(()),
        }
    }

    pub async fn run_once(&self) -> Result<(CycleRun, RunArtifacts)> {
        let _running = self.running.lock().await;
        self.run_locked().await
    }

    async fn run_locked(&self) -> Result<(CycleRun, RunArtifacts)> {
        let sources = self.cycle.sources().to_vec();
        let run = self
            .cycle
            .run_detailed(&self.locations, &sources)
            .await
            .context("running collection cycle")?;
        let artifacts = write_run(&self.reports_root, &run).await?;
        Ok((run, artifacts))
    }

    /// Scheduler entry point. Returns `false` when skipped because a run is active.
    /// Failures are logged, never propagated.
    pub async fn tick(&self) -> bool {
        let Ok(_running) = self.running.try_lock() else {
            warn!("previous collection cycle still running, skipping this trigger");
            return false;
        };
        match self.run_locked().await {
            Ok((run, artifacts)) => info!(
                run_id = %run.report.run_id,
                records = run.report.records_fetched,
                failed_sources = run.report.source_failures.len(),
                report = %artifacts.dir.display(),
                "scheduled collection cycle finished"
            ),
            Err(err) => error!(error = %format!("{err:#}"), "scheduled collection cycle failed"),
        }
        true
    }
}

pub async fn build_scheduler(crons: &[String], runner: Arc<CycleRunner>) -> Result<JobScheduler> {
    if crons.is_empty() {
        bail!("no cron expressions configured");
    }
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in crons {
        let runner = Arc::clone(&runner);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = Arc::clone(&runner);
            Box::pin(async move {
                runner.tick().await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, "collection cycle scheduled");
    }
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use evcat_storage::MemoryGateway;

    fn runner(reports_root: PathBuf) -> Arc<CycleRunner> {
        let cycle = CollectionCycle::new(&CatalogConfig::default(), Vec::new(), Arc::new(MemoryGateway::new()));
        Arc::new(CycleRunner::new(
            Arc::new(cycle),
            vec![LocationConfig::new("Austin", "US")],
            reports_root,
        ))
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path().to_path_buf());
        {
            let _held = runner.running.lock().await;
            assert!(!runner.tick().await);
        }
        assert!(runner.tick().await);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn rejects_bad_or_missing_crons() {
        let dir = tempfile::tempdir().unwrap();
        assert!(build_scheduler(&[], runner(dir.path().to_path_buf())).await.is_err());
        let bad = vec!["every day at six".to_string()];
        assert!(build_scheduler(&bad, runner(dir.path().to_path_buf())).await.is_err());
        let good = vec!["0 0 6 * * *".to_string(), "0 0 18 * * *".to_string()];
        assert!(build_scheduler(&good, runner(dir.path().to_path_buf())).await.is_ok());
    }
}
