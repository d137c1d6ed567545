//! SnapshotCoordinator: one backup run, from export to catalogued archive.

use crate::archive;
use crate::error::EngineError;
use crate::models::descriptor::{self, BackupDescriptor, NewDescriptor};
use crate::source::SourceManifestEntry;
use crate::state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Creates a backup while holding the system-wide operation token.
/// Fails fast with `Busy` when another backup or restore is in flight.
pub async fn create_backup(
    state: Arc<AppState>,
    description: Option<String>,
    actor: Option<String>,
    kind: &str,
    cancel: CancellationToken,
) -> Result<BackupDescriptor, EngineError> {
    let _guard = state.try_begin_operation()?;
    create_backup_locked(state, description, actor, kind, cancel).await
}

/// Backup run body. The caller must already hold the operation token;
/// the RestoreCoordinator reuses this for the pre-restore safety
/// snapshot, inside its own lock scope.
pub(crate) async fn create_backup_locked(
    state: Arc<AppState>,
    description: Option<String>,
    actor: Option<String>,
    kind: &str,
    cancel: CancellationToken,
) -> Result<BackupDescriptor, EngineError> {
    // A `pending` row goes in first so concurrent observers can see a
    // backup is in flight before any bytes move.
    let db = state.db.clone();
    let new = NewDescriptor {
        created_by: actor,
        kind: kind.to_string(),
        description,
    };
    let pending = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        descriptor::insert(&conn, &new)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let id = pending.id.clone();
    let work_dir = state.config.work_dir.join(format!("backup-{id}"));

    tracing::info!(backup_id = %id, kind, "Starting backup");
    let result = export_and_pack(&state, &id, &work_dir, &cancel).await;
    let _ = tokio::fs::remove_dir_all(&work_dir).await;

    match result {
        Ok((size_bytes, manifest)) => {
            let db = state.db.clone();
            let id2 = id.clone();
            let finalized = tokio::task::spawn_blocking(move || {
                let conn = db.get()?;
                descriptor::finalize_complete(&conn, &id2, size_bytes as i64, &manifest)
            })
            .await
            .map_err(|e| anyhow::anyhow!(e))??;

            if !finalized {
                // Someone else already moved the descriptor out of
                // `pending`; the archive we just published is orphaned.
                state.store.delete(&id).await?;
                return Err(EngineError::Internal(anyhow::anyhow!(
                    "descriptor {id} was finalized concurrently"
                )));
            }

            let db = state.db.clone();
            let id2 = id.clone();
            let descriptor = tokio::task::spawn_blocking(move || {
                let conn = db.get()?;
                descriptor::find_by_id(&conn, &id2)
            })
            .await
            .map_err(|e| anyhow::anyhow!(e))??
            .ok_or_else(|| anyhow::anyhow!("descriptor {id} vanished after finalize"))?;

            tracing::info!(backup_id = %id, size_bytes, "Backup complete");
            Ok(descriptor)
        }
        Err(e) => {
            // A failed backup is additive: partial archive bytes are
            // removed, the descriptor stays for diagnostics.
            state.store.abort(&id).await;
            let _ = state.store.delete(&id).await;

            let db = state.db.clone();
            let id2 = id.clone();
            let marked = tokio::task::spawn_blocking(move || {
                let conn = db.get()?;
                descriptor::mark_failed(&conn, &id2)
            })
            .await;
            if let Err(mark_err) = marked.map_err(|e| anyhow::anyhow!(e)).and_then(|r| r) {
                tracing::error!(backup_id = %id, error = %mark_err, "Failed to mark descriptor failed");
            }

            tracing::warn!(backup_id = %id, error = %e, "Backup failed");
            Err(e)
        }
    }
}

/// Exports every registered source into spool files, hashes them, and
/// packages the archive into the store. Sources run sequentially in
/// declared order; cancellation is honored between sources, never
/// mid-export.
async fn export_and_pack(
    state: &AppState,
    id: &str,
    work_dir: &std::path::Path,
    cancel: &CancellationToken,
) -> Result<(u64, Vec<SourceManifestEntry>), EngineError> {
    tokio::fs::create_dir_all(work_dir)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;

    let timeout = Duration::from_secs(state.config.source_timeout_secs);
    let mut manifest: Vec<SourceManifestEntry> = Vec::with_capacity(state.sources.len());
    let mut spools: Vec<(String, PathBuf)> = Vec::with_capacity(state.sources.len());

    for source in &state.sources {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let name = source.name().to_string();
        let spool = work_dir.join(format!("{name}.export"));

        let item_count = match tokio::time::timeout(timeout, source.export(&spool)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                return Err(EngineError::SourceExport {
                    source_name: name,
                    detail: format!("{e:#}"),
                })
            }
            Err(_) => {
                return Err(EngineError::SourceExport {
                    source_name: name,
                    detail: format!("export timed out after {}s", timeout.as_secs()),
                })
            }
        };

        let spool2 = spool.clone();
        let checksum = tokio::task::spawn_blocking(move || archive::sha256_file(&spool2))
            .await
            .map_err(|e| anyhow::anyhow!(e))??;

        tracing::debug!(backup_id = %id, source = %name, item_count, "Source exported");
        manifest.push(SourceManifestEntry {
            source_name: name.clone(),
            item_count,
            checksum,
        });
        spools.push((name, spool));
    }

    let staging = state.store.staging_path(id);
    let manifest2 = manifest.clone();
    tokio::task::spawn_blocking(move || archive::pack(&staging, &manifest2, &spools))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

    let size_bytes = state.store.commit(id).await?;
    Ok((size_bytes, manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::descriptor::ListFilter;
    use crate::source::StateSource;
    use crate::test_support::engine_with_sources;
    use std::sync::atomic::Ordering;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn successful_backup_finalizes_and_checksums_match_a_fresh_reexport() {
        let h = engine_with_sources(2).await;
        let d = create_backup(
            h.state.clone(),
            Some("nightly".into()),
            Some("ops".into()),
            "manual",
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(d.status, "complete");
        assert_eq!(d.kind, "manual");
        assert_eq!(d.created_by.as_deref(), Some("ops"));
        assert!(d.size_bytes > 0);
        assert!(h.state.store.exists(&d.id).await);

        let manifest = d.manifest();
        assert_eq!(manifest.len(), 2);
        for (i, entry) in manifest.iter().enumerate() {
            assert_eq!(entry.source_name, format!("src{i}"));
            assert_eq!(entry.item_count, 1);
            // Live state has not drifted, so a fresh re-export hashes to
            // the recorded checksum.
            let spool = h.dir.path().join(format!("reexport-{i}"));
            h.mocks[i].export(&spool).await.unwrap();
            assert_eq!(entry.checksum, archive::sha256_file(&spool).unwrap());
        }
    }

    #[tokio::test]
    async fn export_failure_marks_failed_and_leaves_no_archive_bytes() {
        let h = engine_with_sources(3).await;
        h.mocks[1].fail_export.store(true, Ordering::SeqCst);

        let err = create_backup(h.state.clone(), None, None, "manual", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, EngineError::SourceExport { source_name: ref source, .. } if source == "src1"),
            "error must name the failing source, got: {err}"
        );

        let db = h.state.db.clone();
        let failed = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            descriptor::list(&conn, &ListFilter { status: Some("failed".into()), kind: None })
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(failed.len(), 1);
        assert!(!h.state.store.exists(&failed[0].id).await);
        assert_eq!(h.state.store.usage().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn failed_backup_is_additive_and_never_corrupts_prior_backups() {
        let h = engine_with_sources(2).await;
        let good = create_backup(h.state.clone(), None, None, "manual", CancellationToken::new())
            .await
            .unwrap();

        h.mocks[0].fail_export.store(true, Ordering::SeqCst);
        let _ = create_backup(h.state.clone(), None, None, "manual", CancellationToken::new())
            .await
            .unwrap_err();

        assert!(h.state.store.exists(&good.id).await);
        let db = h.state.db.clone();
        let gid = good.id.clone();
        let still_complete = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            descriptor::find_by_id(&conn, &gid)
        })
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(still_complete.status, "complete");
    }

    #[tokio::test]
    async fn concurrent_backup_requests_yield_exactly_one_busy() {
        let h = engine_with_sources(1).await;
        h.mocks[0].export_delay_ms.store(200, Ordering::SeqCst);

        let (a, b) = tokio::join!(
            create_backup(h.state.clone(), None, None, "manual", CancellationToken::new()),
            create_backup(h.state.clone(), None, None, "manual", CancellationToken::new()),
        );
        let busy = (matches!(&a, Err(EngineError::Busy)) as usize)
            + (matches!(&b, Err(EngineError::Busy)) as usize);
        assert_eq!(busy, 1, "exactly one request must fail busy");
        assert_eq!((a.is_ok() as usize) + (b.is_ok() as usize), 1);
    }

    #[tokio::test]
    async fn cancellation_takes_the_failure_cleanup_path() {
        let h = engine_with_sources(2).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = create_backup(h.state.clone(), None, None, "manual", cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(h.state.store.usage().await.unwrap(), (0, 0));

        let db = h.state.db.clone();
        let failed = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            descriptor::list(&conn, &ListFilter { status: Some("failed".into()), kind: None })
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(failed.len(), 1);
    }
}
