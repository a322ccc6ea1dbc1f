// ERP Sync Scheduler
// Runs pull and push jobs on independent intervals, and on demand.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::SchedulerConfig;
use crate::models::{SyncDirection, SyncStats};

use super::error::SyncError;
use super::sync_service::UnifiedSyncService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDirection {
    Pull,
    Push,
    Both,
}

impl FromStr for TriggerDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pull" => Ok(TriggerDirection::Pull),
            "push" => Ok(TriggerDirection::Push),
            "both" => Ok(TriggerDirection::Both),
            other => Err(format!("direction must be pull, push or both, got '{}'", other)),
        }
    }
}

/// Result of one job execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { stats: SyncStats },
    Skipped { reason: String },
    Failed { error: String },
}

impl JobOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, JobOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TriggerReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull: Option<JobOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<JobOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub outcome: JobOutcome,
    pub finished_at: DateTime<Utc>,
}

/// Last outcome per direction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobHistory {
    pub pull: Option<JobRecord>,
    pub push: Option<JobRecord>,
}

/// Executes jobs and records their outcome. Shared by the loop and manual triggers.
#[derive(Clone)]
struct JobRunner {
    service: Arc<UnifiedSyncService>,
    config: SchedulerConfig,
    history: Arc<RwLock<JobHistory>>,
}

impl JobRunner {
    async fn run(&self, direction: SyncDirection) -> JobOutcome {
        let service = self.service.clone();
        let incremental = self.config.erp_pull.incremental;
        let batch_size = self.config.erp_push.batch_size;

        // A sub-task turns a panic inside the job into a JoinError instead of
        // taking the scheduler loop down with it.
        let job = tokio::spawn(async move {
            match direction {
                SyncDirection::ErpToLocal => service.sync_from_erp(incremental).await,
                SyncDirection::LocalToErp => service.sync_to_erp(batch_size).await,
            }
        });

        let outcome = match job.await {
            Ok(Ok(stats)) => JobOutcome::Completed { stats },
            Ok(Err(SyncError::AlreadyRunning(_))) => {
                tracing::info!("ERP {} job skipped, previous run still in progress", direction.job_name());
                JobOutcome::Skipped {
                    reason: format!("a {} sync is already running", direction),
                }
            }
            Ok(Err(e)) => {
                tracing::error!("ERP {} job failed: {}", direction.job_name(), e);
                JobOutcome::Failed { error: e.to_string() }
            }
            Err(join_error) => {
                let error = SyncError::SchedulerJob(format!("{} job aborted: {}", direction.job_name(), join_error));
                tracing::error!("{}", error);
                JobOutcome::Failed { error: error.to_string() }
            }
        };

        let record = JobRecord {
            outcome: outcome.clone(),
            finished_at: Utc::now(),
        };
        let mut history = self.history.write().await;
        match direction {
            SyncDirection::ErpToLocal => history.pull = Some(record),
            SyncDirection::LocalToErp => history.push = Some(record),
        }

        outcome
    }
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ErpSyncScheduler {
    runner: JobRunner,
    running: Mutex<Option<RunningLoop>>,
}

impl ErpSyncScheduler {
    pub fn new(service: Arc<UnifiedSyncService>, config: SchedulerConfig) -> Self {
        Self {
            runner: JobRunner {
                service,
                config,
                history: Arc::new(RwLock::new(JobHistory::default())),
            },
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.runner.config
    }

    pub fn service(&self) -> &Arc<UnifiedSyncService> {
        &self.runner.service
    }

    /// Start the periodic loop. Returns false if it was already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            tracing::debug!("ERP sync scheduler already running");
            return false;
        }

        let (shutdown, receiver) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.runner.clone(), receiver));
        *running = Some(RunningLoop { shutdown, handle });

        let config = &self.runner.config;
        tracing::info!(
            pull_enabled = config.erp_pull.enabled,
            pull_interval_secs = config.erp_pull.interval_seconds,
            push_enabled = config.erp_push.enabled,
            push_interval_secs = config.erp_push.interval_seconds,
            "ERP sync scheduler started"
        );
        true
    }

    /// Signal the loop to exit and wait for the in-flight job up to the stop
    /// timeout. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };

        let _ = running.shutdown.send(true);
        let mut handle = running.handle;
        let wait = Duration::from_secs(self.runner.config.stop_timeout_secs);

        match tokio::time::timeout(wait, &mut handle).await {
            Ok(_) => tracing::info!("ERP sync scheduler stopped"),
            Err(_) => {
                tracing::warn!(
                    "ERP sync scheduler did not stop within {}s, abandoning the loop",
                    wait.as_secs()
                );
                handle.abort();
            }
        }
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run the requested job(s) now and wait for them. `Both` runs pull, then push.
    pub async fn trigger_sync_now(&self, direction: TriggerDirection) -> TriggerReport {
        tracing::info!(?direction, "Manual ERP sync triggered");

        let mut report = TriggerReport::default();
        if matches!(direction, TriggerDirection::Pull | TriggerDirection::Both) {
            report.pull = Some(self.runner.run(SyncDirection::ErpToLocal).await);
        }
        if matches!(direction, TriggerDirection::Push | TriggerDirection::Both) {
            report.push = Some(self.runner.run(SyncDirection::LocalToErp).await);
        }
        report
    }

    pub async fn history(&self) -> JobHistory {
        self.runner.history.read().await.clone()
    }
}

enum Tick {
    Pull,
    Push,
    Shutdown,
}

async fn run_loop(runner: JobRunner, mut shutdown: watch::Receiver<bool>) {
    let config = runner.config.clone();

    if config.run_on_start {
        if config.erp_pull.enabled {
            runner.run(SyncDirection::ErpToLocal).await;
        }
        if config.erp_push.enabled {
            runner.run(SyncDirection::LocalToErp).await;
        }
    }

    let pull_period = Duration::from_secs(config.erp_pull.interval_seconds.max(1));
    let push_period = Duration::from_secs(config.erp_push.interval_seconds.max(1));

    let mut pull_ticker = interval_at(Instant::now() + pull_period, pull_period);
    pull_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut push_ticker = interval_at(Instant::now() + push_period, push_period);
    push_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let tick = tokio::select! {
            _ = shutdown.changed() => Tick::Shutdown,
            _ = pull_ticker.tick(), if config.erp_pull.enabled => Tick::Pull,
            _ = push_ticker.tick(), if config.erp_push.enabled => Tick::Push,
        };

        let outcome = match tick {
            Tick::Shutdown => break,
            Tick::Pull => runner.run(SyncDirection::ErpToLocal).await,
            Tick::Push => runner.run(SyncDirection::LocalToErp).await,
        };

        if outcome.is_failed() && config.error_backoff_secs > 0 {
            tracing::debug!("Backing off for {}s after a failed job", config.error_backoff_secs);
            let backoff = tokio::time::sleep(Duration::from_secs(config.error_backoff_secs));
            let interrupted = tokio::select! {
                _ = backoff => false,
                _ = shutdown.changed() => true,
            };
            if interrupted {
                break;
            }
        }
    }

    tracing::debug!("ERP sync scheduler loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_direction_parsing() {
        assert_eq!("pull".parse::<TriggerDirection>(), Ok(TriggerDirection::Pull));
        assert_eq!(" PUSH ".parse::<TriggerDirection>(), Ok(TriggerDirection::Push));
        assert_eq!("both".parse::<TriggerDirection>(), Ok(TriggerDirection::Both));
        assert!("sideways".parse::<TriggerDirection>().is_err());
    }

    #[test]
    fn test_job_outcome_serialization() {
        let outcome = JobOutcome::Skipped {
            reason: "busy".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "busy");
        assert!(!outcome.is_failed());

        let failed = JobOutcome::Failed {
            error: "boom".to_string(),
        };
        assert!(failed.is_failed());
    }
}
