//! Startup reconciliation: restore the catalog/store pairing invariant
//! after a crash. Runs once, before the engine accepts requests.

use crate::models::{descriptor, restore_record};
use crate::state::AppState;

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Restores left `in_progress` by a crash, now `failed`.
    pub interrupted_restores: usize,
    /// Descriptors stuck `pending`, now `failed`.
    pub stale_pending: usize,
    /// Store objects with no matching `complete` descriptor, deleted.
    pub orphaned_objects: usize,
}

pub async fn run(state: &AppState) -> anyhow::Result<ReconcileReport> {
    let db = state.db.clone();
    let (interrupted_restores, stale_pending) = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let restores = restore_record::fail_interrupted(&conn)?;
        let pending = descriptor::fail_stale_pending(&conn)?;
        Ok::<_, anyhow::Error>((restores, pending))
    })
    .await??;

    let mut orphaned_objects = 0usize;
    for id in state.store.list_ids().await? {
        let db = state.db.clone();
        let id2 = id.clone();
        let found = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            descriptor::find_by_id(&conn, &id2)
        })
        .await??;

        let keep = found.map(|d| d.status == "complete").unwrap_or(false);
        if !keep {
            tracing::warn!(backup_id = %id, "[Reconcile] Deleting orphaned archive");
            state.store.delete(&id).await?;
            orphaned_objects += 1;
        }
    }

    let report = ReconcileReport {
        interrupted_restores,
        stale_pending,
        orphaned_objects,
    };
    tracing::info!(
        interrupted_restores = report.interrupted_restores,
        stale_pending = report.stale_pending,
        orphaned_objects = report.orphaned_objects,
        "[Reconcile] Startup reconciliation done"
    );
    Ok(report)
}
