use std::sync::Arc;
use std::time::Duration;

use chrono::Datelike;
use tokio::time::sleep;

use crate::services::{instrumentation, webhooks, workflows};
use crate::tenancy::AppContext;

#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub workflow_timeout_poll: Duration,
    pub webhook_retry_poll: Duration,
    pub event_retention_days: i64,
}

/// Per-app background loop: workflow approval timeouts, webhook retries and
/// event retention. Each pass runs inline on the loop task; a failure in one
/// job is logged and never stops the others. The loop exits when the app's
/// shutdown channel fires (teardown or process shutdown).
pub async fn run_app_scheduler(app: Arc<AppContext>, intervals: Intervals) {
    tracing::info!(app = %app.name, "App scheduler started");

    let mut shutdown = app.shutdown_signal();
    let mut last_workflow_run = tokio::time::Instant::now();
    let mut last_retry_run = tokio::time::Instant::now();
    let mut last_retention_day: Option<i64> = None;

    loop {
        tokio::select! {
            _ = sleep(Duration::from_secs(5)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }

        let now = tokio::time::Instant::now();

        // --- Workflow approval timeouts (every 60 s by default) ---
        if now.duration_since(last_workflow_run) >= intervals.workflow_timeout_poll {
            last_workflow_run = now;
            let processed = workflows::run_timeout_scan(&app).await;
            if processed > 0 {
                tracing::info!(app = %app.name, processed, "Scheduler: expired approvals advanced");
            }
        }

        // --- Webhook retries (every 30 s by default) ---
        if now.duration_since(last_retry_run) >= intervals.webhook_retry_poll {
            last_retry_run = now;
            let redispatched = webhooks::retry_due(
                &app.pool,
                &app.http,
                app.backoff_base_seconds,
                app.webhook_timeout,
                100,
            )
            .await;
            if redispatched > 0 {
                tracing::info!(app = %app.name, redispatched, "Scheduler: webhook retries dispatched");
            }
        }

        // --- Event retention (once per calendar day) ---
        let today = chrono::Utc::now().date_naive().num_days_from_ce() as i64;
        if last_retention_day != Some(today) {
            last_retention_day = Some(today);
            match instrumentation::delete_expired_events(&app.pool, intervals.event_retention_days)
                .await
            {
                Ok(deleted) if deleted > 0 => {
                    tracing::info!(app = %app.name, deleted, "Scheduler: expired events removed");
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(app = %app.name, error = %error, "Scheduler: event retention failed");
                }
            }
        }
    }

    tracing::info!(app = %app.name, "App scheduler stopped");
}
