use crate::error::EngineError;
use crate::models::descriptor::{self, BackupDescriptor, ListFilter};
use crate::models::restore_record::{self, RestoreRecord};
use crate::services::{restore, snapshot};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_backup).get(list_backups))
        .route("/{id}", get(get_backup_detail).delete(delete_backup))
        .route("/{id}/restore", post(restore_backup))
        .route("/{id}/download", get(download_backup))
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateBackupRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
}

async fn create_backup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateBackupRequest>,
) -> Result<(StatusCode, Json<BackupDescriptor>), EngineError> {
    let cancel = state.shutdown.clone();
    let descriptor =
        snapshot::create_backup(state, req.description, req.actor, "manual", cancel).await?;
    Ok((StatusCode::CREATED, Json(descriptor)))
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ListFilter>,
) -> Result<Json<Vec<BackupDescriptor>>, EngineError> {
    let db = state.db.clone();
    let backups = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        descriptor::list(&conn, &filter)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(backups))
}

#[derive(Debug, Serialize)]
pub struct BackupDetail {
    #[serde(flatten)]
    pub descriptor: BackupDescriptor,
    pub restores: Vec<RestoreRecord>,
}

async fn get_backup_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupDetail>, EngineError> {
    let db = state.db.clone();
    let id2 = id.clone();
    let (descriptor, restores) = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let descriptor = descriptor::find_by_id(&conn, &id2)?;
        let restores = restore_record::find_by_backup_id(&conn, &id2)?;
        Ok::<_, anyhow::Error>((descriptor, restores))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    match descriptor {
        Some(descriptor) => Ok(Json(BackupDetail { descriptor, restores })),
        None => Err(EngineError::NotFound("Backup not found".into())),
    }
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RestoreRecord>, EngineError> {
    let cancel = state.shutdown.clone();
    let record = restore::restore_backup(state, id, cancel).await?;
    Ok(Json(record))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, EngineError> {
    // Deleting is a mutating operation: it takes the same token as
    // create/restore so it cannot race an in-flight backup of the same
    // archive.
    let _guard = state.try_begin_operation()?;

    let db = state.db.clone();
    let id2 = id.clone();
    let min_keep = state.config.retention_min_keep;
    let deleted = tokio::task::spawn_blocking(move || {
        let conn = db.get().map_err(anyhow::Error::from)?;
        let Some(d) = descriptor::find_by_id(&conn, &id2)? else {
            return Ok::<_, EngineError>(None);
        };
        if d.status != "complete" {
            return Err(EngineError::BadRequest(format!(
                "Only complete backups can be deleted (status: {})",
                d.status
            )));
        }
        if descriptor::count_complete(&conn)? as usize <= min_keep {
            return Err(EngineError::RetentionViolation(format!(
                "Refusing to delete: at least {min_keep} complete backup(s) must remain"
            )));
        }
        Ok(Some(descriptor::mark_deleted(&conn, &id2)?))
    })
    .await
    .map_err(|e| EngineError::Internal(anyhow::anyhow!(e)))??;

    match deleted {
        Some(true) => {
            state.store.delete(&id).await?;
            tracing::info!(backup_id = %id, "Backup deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        // CAS lost: someone else transitioned the row between the read
        // and the update.
        Some(false) => Err(EngineError::BadRequest("Backup is no longer deletable".into())),
        None => Err(EngineError::NotFound("Backup not found".into())),
    }
}

/// Streams the raw archive. Reads never touch the operation token, so a
/// download stays available during an in-flight backup.
async fn download_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl axum::response::IntoResponse, EngineError> {
    let db = state.db.clone();
    let id2 = id.clone();
    let descriptor = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        descriptor::find_by_id(&conn, &id2)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let Some(descriptor) = descriptor.filter(|d| d.status == "complete") else {
        return Err(EngineError::NotFound("Backup not found".into()));
    };

    let file = state
        .store
        .reader(&descriptor.id)
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("archive unreadable: {e}")))?;
    let stream = ReaderStream::new(file);

    let headers = [
        (header::CONTENT_TYPE, "application/zstd".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.tar.zst\"", descriptor.id),
        ),
        (header::CONTENT_LENGTH, descriptor.size_bytes.to_string()),
    ];
    Ok((headers, Body::from_stream(stream)))
}

pub async fn list_restores(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RestoreRecord>>, EngineError> {
    let db = state.db.clone();
    let records = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        restore_record::find_recent(&conn, 50)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(records))
}

pub async fn storage_usage(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let (objects, total_bytes) = state.store.usage().await?;
    Ok(Json(serde_json::json!({
        "objects": objects,
        "totalBytes": total_bytes,
    })))
}
