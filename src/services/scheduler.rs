use std::time::Duration;

use tokio::time::sleep;

use crate::services::webhooks;
use crate::services::workflows::{self, WorkflowContext};
use crate::state::AppState;

/// Spawn the background scheduler that runs the periodic engine jobs:
/// the webhook retry sweep and the workflow timeout sweep.
///
/// Each tick fans out over every bootstrapped app context and awaits the
/// work inline, so a slow tick can never overlap the next one for the
/// same job (single-flight per scheduler).
pub async fn run_background_scheduler(state: AppState) {
    tracing::info!("Background scheduler started");

    let retry_interval = Duration::from_secs(state.config.webhook_retry_tick_seconds.max(5));
    let timeout_interval = Duration::from_secs(state.config.workflow_timeout_tick_seconds.max(15));

    let mut last_retry_run = tokio::time::Instant::now();
    let mut last_timeout_run = tokio::time::Instant::now();

    loop {
        sleep(Duration::from_secs(5)).await;
        let now = tokio::time::Instant::now();

        // --- Webhook retry sweep (every N seconds, per app) ---
        if now.duration_since(last_retry_run) >= retry_interval {
            last_retry_run = now;
            let mut retried = 0u32;
            for app in state.manager.active_contexts().await {
                let delivery = state.delivery_config(&app);
                retried += webhooks::run_retry_sweep(
                    &app.pool,
                    &delivery,
                    state.config.webhook_retry_batch_size,
                )
                .await;
            }
            if retried > 0 {
                tracing::info!(retried, "Scheduler: webhook retry sweep completed");
            }
        }

        // --- Workflow approval timeout sweep (every N seconds, per app) ---
        if now.duration_since(last_timeout_run) >= timeout_interval {
            last_timeout_run = now;
            let mut timed_out = 0u32;
            for app in state.manager.active_contexts().await {
                let delivery = state.delivery_config(&app);
                let snapshot = app.registry.get();
                let ctx = WorkflowContext {
                    pool: &app.pool,
                    snapshot: &snapshot,
                    webhooks: &delivery,
                };
                timed_out += workflows::run_timeout_sweep(&ctx).await;
            }
            if timed_out > 0 {
                tracing::info!(timed_out, "Scheduler: workflow timeout sweep completed");
            }
        }
    }
}
