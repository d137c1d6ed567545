use crate::error::EngineError;
use crate::models::schedule::{self, ScheduleConfig};
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_schedule).put(set_schedule))
}

async fn get_schedule(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ScheduleConfig>, EngineError> {
    let db = state.db.clone();
    let cfg = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        schedule::get(&conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(cfg))
}

#[derive(Debug, Deserialize)]
pub struct SetScheduleRequest {
    pub frequency: String,
    pub time_of_day: String,
    pub retention_days: i64,
}

async fn set_schedule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetScheduleRequest>,
) -> Result<Json<ScheduleConfig>, EngineError> {
    if !matches!(req.frequency.as_str(), "daily" | "weekly" | "monthly") {
        return Err(EngineError::BadRequest(format!(
            "Invalid frequency '{}' (expected daily, weekly or monthly)",
            req.frequency
        )));
    }
    if chrono::NaiveTime::parse_from_str(&req.time_of_day, "%H:%M").is_err() {
        return Err(EngineError::BadRequest(format!(
            "Invalid time_of_day '{}' (expected HH:MM)",
            req.time_of_day
        )));
    }
    if req.retention_days < 1 {
        return Err(EngineError::BadRequest(
            "retention_days must be at least 1".into(),
        ));
    }

    let db = state.db.clone();
    let cfg = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        // next_run_at is cleared here; the Scheduler re-arms it from the
        // new cadence on its next tick.
        schedule::set(&conn, &req.frequency, &req.time_of_day, req.retention_days)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    tracing::info!(frequency = %cfg.frequency, time_of_day = %cfg.time_of_day, "Schedule updated");
    Ok(Json(cfg))
}
