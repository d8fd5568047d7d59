use crate::task_queue::{EnqueueOptions, TaskQueue};
use crate::types::Priority;
use chrono::{DateTime, Utc};
use cron::Schedule;
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A recurring task enqueued on a cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub name: String,
    pub cron_expression: String,
    /// Name of the task to enqueue; must match a registered handler to run.
    pub task_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Cron-based producer that feeds [`ScheduledJob`]s into a [`TaskQueue`].
#[derive(Debug)]
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    pub fn new(jobs: Vec<ScheduledJob>) -> Self {
        Self { jobs }
    }

    /// Parse a cron expression string into a [`cron::Schedule`].
    ///
    /// Uses the 7-field cron format: sec min hour day-of-month month day-of-week year.
    pub fn parse_cron(cron_expr: &str) -> ForemanResult<Schedule> {
        Schedule::from_str(cron_expr).map_err(|e| {
            ForemanError::Config(format!("Invalid cron expression '{cron_expr}': {e}"))
        })
    }

    /// First fire time strictly after `after`.
    pub fn next_fire_time(cron_expr: &str, after: DateTime<Utc>) -> ForemanResult<DateTime<Utc>> {
        let schedule = Self::parse_cron(cron_expr)?;
        schedule.after(&after).next().ok_or_else(|| {
            ForemanError::Config(format!(
                "Cron expression '{cron_expr}' has no upcoming fire times"
            ))
        })
    }

    pub fn enabled_jobs(&self) -> Vec<&ScheduledJob> {
        self.jobs.iter().filter(|j| j.enabled).collect()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Enabled jobs paired with their next fire time after `now`, earliest
    /// first. Jobs with unusable expressions are skipped with a warning.
    pub fn upcoming(&self, now: DateTime<Utc>) -> Vec<(&ScheduledJob, DateTime<Utc>)> {
        let mut times: Vec<(&ScheduledJob, DateTime<Utc>)> = self
            .enabled_jobs()
            .into_iter()
            .filter_map(|job| match Self::next_fire_time(&job.cron_expression, now) {
                Ok(at) => Some((job, at)),
                Err(e) => {
                    warn!(job = %job.name, error = %e, "Skipping scheduled job");
                    None
                }
            })
            .collect();
        times.sort_by_key(|(_, at)| *at);
        times
    }

    async fn fire(queue: &TaskQueue, job: &ScheduledJob) {
        let options = EnqueueOptions::new(job.task_name.clone())
            .with_payload(job.payload.clone())
            .with_priority(job.priority);
        match queue.enqueue(options).await {
            Ok(task) => info!(job = %job.name, task_id = %task.id, "Scheduled job fired"),
            Err(e) => warn!(job = %job.name, error = %e, "Scheduled job could not be enqueued"),
        }
    }

    /// Spawn the scheduling loop: sleep until the nearest fire time, enqueue
    /// every job due within a one-second window, repeat until `shutdown`.
    pub fn start(self, queue: Arc<TaskQueue>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let upcoming = self.upcoming(now);
                let wait = match upcoming.first() {
                    Some((_, nearest)) => (*nearest - now).to_std().unwrap_or_default(),
                    None => {
                        debug!("Scheduler has no runnable jobs, sleeping 60s");
                        std::time::Duration::from_secs(60)
                    }
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let threshold = Utc::now() + chrono::Duration::seconds(1);
                for (job, at) in &upcoming {
                    if *at <= threshold {
                        Self::fire(&queue, job).await;
                    }
                }
            }
            info!("Scheduler stopped");
        })
    }
}
