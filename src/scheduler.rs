//! Cron-driven job trigger
//!
//! Fires a job at the times described by a cron expression, evaluated in
//! UTC. Runs never overlap: the next fire time is computed only after the
//! current run finishes, so ticks missed while a backup is running are
//! skipped.
//!
//! On shutdown the loop stops waiting for ticks. A run in progress is given
//! `drain_timeout` to finish before its cancellation token is triggered.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::config::ScheduleConfig;
use crate::error::AppError;

/// Parse a cron expression
///
/// Accepts the six or seven field form (seconds first, optional year) and
/// the classic five field form, which fires at second zero. A Quartz-style
/// `?` field means the same as `*`.
///
/// Day-of-week numbers follow the dialect of the form: 0 (or 7) is Sunday
/// in five field expressions, 1 is Sunday in the longer ones.
pub fn parse_schedule(expression: &str) -> Result<Schedule, AppError> {
    let expression = expression.trim();
    let invalid = |reason: &dyn std::fmt::Display| {
        AppError::Schedule(format!("invalid cron expression {:?}: {}", expression, reason))
    };

    let mut fields: Vec<String> = expression
        .split_whitespace()
        .map(|field| if field == "?" { "*" } else { field }.to_string())
        .collect();
    if fields.len() == 5 {
        fields[4] = classic_day_of_week(&fields[4]).map_err(|reason| invalid(&reason))?;
        fields.insert(0, "0".to_string());
    }

    Schedule::from_str(&fields.join(" ")).map_err(|e| invalid(&e))
}

/// Rewrite a classic day-of-week field (0 = Sunday) into the 1 = Sunday
/// numbering. Names and `*` pass through.
fn classic_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (days, step) = match item.split_once('/') {
            Some((days, step)) => (days, Some(step)),
            None => (item, None),
        };
        let with_step = |days: String| match step {
            Some(step) => format!("{}/{}", days, step),
            None => days,
        };

        match days.split_once('-') {
            Some((first, last)) => match (classic_day(first)?, classic_day(last)?) {
                (Some(first), Some(7)) if first > 0 => {
                    if step.is_some() {
                        return Err(format!("day-of-week range {:?} wraps past Sunday", item));
                    }
                    // Ends on Sunday, which is day 1 after the shift
                    items.push(format!("{}-7", first + 1));
                    items.push("1".to_string());
                }
                (Some(first), Some(last)) => {
                    items.push(with_step(format!("{}-{}", first + 1, last.min(6) + 1)))
                }
                _ => items.push(item.to_string()),
            },
            None => match classic_day(days)? {
                Some(day) => items.push(with_step((day % 7 + 1).to_string())),
                None => items.push(item.to_string()),
            },
        }
    }
    Ok(items.join(","))
}

fn classic_day(token: &str) -> Result<Option<u8>, String> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    match token.parse::<u8>() {
        Ok(day) if day <= 7 => Ok(Some(day)),
        _ => Err(format!("day-of-week {:?} is outside 0-7", token)),
    }
}

/// Unit of work fired by the scheduler
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run once; `cancel` fires when the run must stop early
    async fn run(&self, cancel: CancellationToken) -> Result<(), AppError>;
}

/// Sequential cron scheduler
pub struct CronScheduler {
    schedule: Schedule,
    run_on_start: bool,
    drain_timeout: Duration,
}

impl CronScheduler {
    pub fn new(schedule: Schedule, run_on_start: bool, drain_timeout: Duration) -> Self {
        Self {
            schedule,
            run_on_start,
            drain_timeout,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Result<Self, AppError> {
        Ok(Self::new(
            parse_schedule(&config.cron)?,
            config.run_on_start,
            Duration::from_secs(config.drain_timeout_seconds),
        ))
    }

    /// First fire time strictly after `after`
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Fire `job` on schedule until `shutdown` is cancelled
    pub async fn run(&self, job: Arc<dyn ScheduledJob>, shutdown: CancellationToken) {
        tracing::info!(job = %job.name(), "Scheduler started");

        if self.run_on_start && !shutdown.is_cancelled() {
            self.execute(&job, &shutdown).await;
        }

        while !shutdown.is_cancelled() {
            let now = Utc::now();
            let Some(next) = self.next_fire(now) else {
                tracing::warn!(job = %job.name(), "Schedule has no further fire times");
                break;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tracing::info!(job = %job.name(), next = %next, "Next run scheduled");

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            self.execute(&job, &shutdown).await;
        }

        tracing::info!(job = %job.name(), "Scheduler stopped");
    }

    async fn execute(&self, job: &Arc<dyn ScheduledJob>, shutdown: &CancellationToken) {
        let cancel = CancellationToken::new();
        let mut handle = {
            let job = job.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { job.run(cancel).await })
        };

        let finished = tokio::select! {
            result = &mut handle => Some(result),
            _ = shutdown.cancelled() => None,
        };

        let joined = match finished {
            Some(result) => result,
            None => {
                tracing::info!(
                    job = %job.name(),
                    timeout_secs = self.drain_timeout.as_secs(),
                    "Shutdown requested; waiting for running job"
                );
                match tokio::time::timeout(self.drain_timeout, &mut handle).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(job = %job.name(), "Drain timeout elapsed; cancelling job");
                        cancel.cancel();
                        handle.await
                    }
                }
            }
        };

        let result = joined.unwrap_or_else(|e| {
            Err(AppError::Internal(anyhow::anyhow!("job task failed: {}", e)))
        });

        match result {
            Ok(()) => tracing::info!(job = %job.name(), "Job finished"),
            Err(AppError::Cancelled) => {
                tracing::warn!(job = %job.name(), "Job cancelled");
            }
            Err(error) => {
                error.record();
                tracing::error!(job = %job.name(), error = %error, "Job failed");
            }
        }
    }
}
