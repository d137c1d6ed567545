//! RestoreCoordinator: stage-then-swap restore with rollback.
//!
//! Live state is never touched until every source has fully materialized
//! its replacement in a side location. The swap itself is a sequence of
//! renames in declared source order; a swap failure rolls the
//! already-swapped sources back from their retained pre-swap state, so
//! observers see either the old system or the new one, never a mix.

use crate::archive;
use crate::error::EngineError;
use crate::models::descriptor::{self, BackupDescriptor};
use crate::models::restore_record::{self, RestoreRecord};
use crate::source::{PreSwapRef, StagingHandle, StateSource};
use crate::state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn restore_backup(
    state: Arc<AppState>,
    backup_id: String,
    cancel: CancellationToken,
) -> Result<RestoreRecord, EngineError> {
    let _guard = state.try_begin_operation()?;

    let db = state.db.clone();
    let id = backup_id.clone();
    let descriptor = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        descriptor::find_by_id(&conn, &id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??
    .ok_or_else(|| EngineError::NotFound(format!("Backup {backup_id} not found")))?;

    if descriptor.status != "complete" {
        return Err(EngineError::BadRequest(format!(
            "Backup {} is not restorable (status: {})",
            backup_id, descriptor.status
        )));
    }

    let db = state.db.clone();
    let id = backup_id.clone();
    let record = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        restore_record::create(&conn, &id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    tracing::info!(backup_id = %backup_id, restore_id = %record.id, "Starting restore");
    let result = run_restore(&state, &descriptor, &record.id, &cancel).await;

    let outcome = if result.is_ok() { "succeeded" } else { "failed" };
    let error_detail = result.as_ref().err().map(|e| e.to_string());
    let db = state.db.clone();
    let record_id = record.id.clone();
    let finished = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        restore_record::finish(&conn, &record_id, outcome, error_detail.as_deref())?;
        restore_record::find_by_id(&conn, &record_id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    match result {
        Ok(()) => {
            tracing::info!(backup_id = %backup_id, restore_id = %record.id, "Restore succeeded");
            finished.ok_or_else(|| {
                EngineError::Internal(anyhow::anyhow!("restore record vanished after finish"))
            })
        }
        Err(e) => {
            tracing::warn!(backup_id = %backup_id, restore_id = %record.id, error = %e, "Restore failed");
            Err(e)
        }
    }
}

async fn run_restore(
    state: &Arc<AppState>,
    descriptor: &BackupDescriptor,
    record_id: &str,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    // Restoring is destructive; capture the pre-restore state first so
    // the restore itself is undoable.
    take_safety_snapshot_if_stale(state, descriptor, cancel).await?;

    let work_dir = state.config.work_dir.join(format!("restore-{record_id}"));
    let result = stage_and_swap(state, descriptor, &work_dir, cancel).await;
    let _ = tokio::fs::remove_dir_all(&work_dir).await;
    result
}

/// Takes a `manual` pre-restore snapshot unless a `complete` backup
/// fresh enough to stand in for one already exists.
async fn take_safety_snapshot_if_stale(
    state: &Arc<AppState>,
    descriptor: &BackupDescriptor,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let db = state.db.clone();
    let latest = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        descriptor::find_latest_complete(&conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let freshness = chrono::Duration::seconds(state.config.pre_restore_freshness_secs);
    let cutoff = chrono::Utc::now() - freshness;
    let recent_exists = latest
        .and_then(|d| chrono::DateTime::parse_from_rfc3339(&d.created_at).ok())
        .map(|t| t.with_timezone(&chrono::Utc) > cutoff)
        .unwrap_or(false);
    if recent_exists {
        tracing::debug!("Recent backup exists, skipping pre-restore snapshot");
        return Ok(());
    }

    tracing::info!(backup_id = %descriptor.id, "Taking pre-restore safety snapshot");
    super::snapshot::create_backup_locked(
        state.clone(),
        Some(format!("pre-restore snapshot before restoring {}", descriptor.id)),
        None,
        "manual",
        cancel.clone(),
    )
    .await?;
    Ok(())
}

async fn stage_and_swap(
    state: &Arc<AppState>,
    descriptor: &BackupDescriptor,
    work_dir: &std::path::Path,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    // Unpack and verify every checksum against the re-read bytes before
    // any source is asked to do anything.
    let archive_path = state.store.object_path(&descriptor.id);
    if !state.store.exists(&descriptor.id).await {
        return Err(EngineError::ArchiveCorrupt {
            backup_id: descriptor.id.clone(),
            detail: "archive object missing from store".into(),
        });
    }

    let work = work_dir.to_path_buf();
    let (manifest, segments) =
        tokio::task::spawn_blocking(move || archive::unpack(&archive_path, &work))
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .map_err(|e| EngineError::ArchiveCorrupt {
                backup_id: descriptor.id.clone(),
                detail: format!("{e:#}"),
            })?;

    let mut plan: Vec<(Arc<dyn StateSource>, PathBuf)> = Vec::with_capacity(manifest.len());
    for entry in &manifest {
        let segment = segments
            .iter()
            .find(|(name, _)| name == &entry.source_name)
            .map(|(_, path)| path.clone())
            .ok_or_else(|| EngineError::ArchiveCorrupt {
                backup_id: descriptor.id.clone(),
                detail: format!("no segment for source '{}'", entry.source_name),
            })?;

        let seg = segment.clone();
        let checksum = tokio::task::spawn_blocking(move || archive::sha256_file(&seg))
            .await
            .map_err(|e| anyhow::anyhow!(e))??;
        if checksum != entry.checksum {
            return Err(EngineError::ArchiveCorrupt {
                backup_id: descriptor.id.clone(),
                detail: format!("checksum mismatch for source '{}'", entry.source_name),
            });
        }

        let source = state
            .sources
            .iter()
            .find(|s| s.name() == entry.source_name)
            .cloned()
            .ok_or_else(|| {
                EngineError::BadRequest(format!(
                    "Backup includes source '{}' which is not registered",
                    entry.source_name
                ))
            })?;
        plan.push((source, segment));
    }

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    // Stage every source fully before the first swap. Sources are
    // independent, so staging runs concurrently.
    let staged = stage_all(state, &plan).await?;

    if cancel.is_cancelled() {
        discard_all_staged(&plan, &staged).await;
        return Err(EngineError::Cancelled);
    }

    // Swap phase: sequential, in export order. From here on a failure
    // must restore the pre-swap world.
    let mut swapped: Vec<(Arc<dyn StateSource>, PreSwapRef)> = Vec::with_capacity(plan.len());
    for (i, (source, _)) in plan.iter().enumerate() {
        match source.swap(&staged[i]).await {
            Ok(pre) => swapped.push((source.clone(), pre)),
            Err(swap_err) => {
                for (j, handle) in staged.iter().enumerate().skip(i) {
                    if let Err(e) = plan[j].0.discard_staged(handle).await {
                        tracing::warn!(source = %handle.source_name, error = %e, "Failed to discard staged state");
                    }
                }
                for (src, pre) in swapped.iter().rev() {
                    if let Err(rollback_err) = src.rollback_swap(pre).await {
                        return Err(EngineError::FatalInconsistency {
                            detail: format!(
                                "swap of '{}' failed ({swap_err:#}), and rollback of '{}' failed: {rollback_err:#}",
                                source.name(),
                                src.name(),
                            ),
                        });
                    }
                }
                return Err(EngineError::Swap {
                    source_name: source.name().to_string(),
                    detail: format!("{swap_err:#}"),
                });
            }
        }
    }

    // Fully swapped: the retained pre-swap state is no longer needed.
    for (src, pre) in &swapped {
        if let Err(e) = src.discard_pre_swap(pre).await {
            tracing::warn!(source = %pre.source_name, error = %e, "Failed to discard pre-swap state");
        }
    }
    Ok(())
}

async fn stage_all(
    state: &Arc<AppState>,
    plan: &[(Arc<dyn StateSource>, PathBuf)],
) -> Result<Vec<StagingHandle>, EngineError> {
    let timeout = Duration::from_secs(state.config.source_timeout_secs);
    let futures = plan.iter().map(|(source, segment)| {
        let source = source.clone();
        let segment = segment.clone();
        async move {
            match tokio::time::timeout(timeout, source.stage(&segment)).await {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(e)) => Err(EngineError::Staging {
                    source_name: source.name().to_string(),
                    detail: format!("{e:#}"),
                }),
                Err(_) => Err(EngineError::Staging {
                    source_name: source.name().to_string(),
                    detail: format!("staging timed out after {}s", timeout.as_secs()),
                }),
            }
        }
    });

    let results = futures_util::future::join_all(futures).await;
    let mut staged: Vec<(usize, StagingHandle)> = Vec::with_capacity(plan.len());
    let mut first_err: Option<EngineError> = None;
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(handle) => staged.push((i, handle)),
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }

    match first_err {
        // Abort before any swap: staged artifacts go, live state is
        // untouched.
        Some(err) => {
            for (i, handle) in &staged {
                if let Err(e) = plan[*i].0.discard_staged(handle).await {
                    tracing::warn!(source = %handle.source_name, error = %e, "Failed to discard staged state");
                }
            }
            Err(err)
        }
        None => Ok(staged.into_iter().map(|(_, handle)| handle).collect()),
    }
}

async fn discard_all_staged(plan: &[(Arc<dyn StateSource>, PathBuf)], staged: &[StagingHandle]) {
    for (i, handle) in staged.iter().enumerate() {
        if let Err(e) = plan[i].0.discard_staged(handle).await {
            tracing::warn!(source = %handle.source_name, error = %e, "Failed to discard staged state");
        }
    }
}
