use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::error::{blocking, ApiError};
use super::scheduler::{drain_queue, run_scan_cycle, DrainSummary, ScanSummary};
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct CronParams {
    secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct CronOutcome {
    success: bool,
    scan: ScanSummary,
    drain: DrainSummary,
}

/// `GET /cron?secret=`: one scan-and-enqueue pass plus one bounded drain.
/// The periodic threads cover normal operation; this exists for external
/// cron triggers and manual nudges.
pub(super) async fn trigger(
    State(state): State<AppState>,
    Query(params): Query<CronParams>,
) -> Result<Json<CronOutcome>, ApiError> {
    if params.secret.as_deref() != Some(state.config.cron_secret.as_str()) {
        return Err(ApiError::Unauthorized);
    }

    let outcome = blocking(move || {
        let scan = run_scan_cycle(
            &state.store,
            &*state.queue,
            state.config.follow_up_threshold_days,
            state.config.scan_batch_limit,
        )
        .map_err(|err| ApiError::from_store("cron scan", err))?;
        let drain = drain_queue(&*state.queue, &state.engine, state.config.drain_batch_limit);
        Ok(CronOutcome {
            success: true,
            scan,
            drain,
        })
    })
    .await?;

    Ok(Json(outcome))
}
