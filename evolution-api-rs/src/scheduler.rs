// evolution-api-rs/src/scheduler.rs
// Cron-driven full runs over the previous UTC day.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use prompt_evolution::{PipelineOrchestrator, RunRequest};
use shared_types::{RunMode, RunTrigger};
use tokio::task::JoinHandle;

pub const SCHEDULER_ACTOR: &str = "scheduler";

pub fn parse_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(expr)
}

/// First fire time strictly after `after`.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

pub fn scheduled_request() -> RunRequest {
    RunRequest::new(RunMode::Full, RunTrigger::Scheduled, SCHEDULER_ACTOR)
}

/// Run the schedule until the task is aborted. Runs execute inline, so a
/// slow run delays the next tick instead of overlapping it.
pub fn spawn_scheduler(orchestrator: Arc<PipelineOrchestrator>, schedule: Schedule) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(next) = next_fire(&schedule, now) else {
                tracing::warn!("cron schedule has no upcoming fire time; scheduler stopping");
                return;
            };
            tracing::info!(next_run = %next, "next scheduled pipeline run");
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            match orchestrator.run(scheduled_request()).await {
                Ok(run) => tracing::info!(
                    run_id = %run.run_id,
                    outcome = run.outcome.map(|o| o.as_str()).unwrap_or("open"),
                    "scheduled pipeline run finished"
                ),
                Err(err) => {
                    metrics::increment_counter!("scheduled_run_errors_total");
                    tracing::error!(error = %err, "scheduled pipeline run could not be recorded");
                }
            }
        }
    })
}
