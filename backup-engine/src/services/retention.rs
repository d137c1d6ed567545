//! Retention policy: a pure selection function over the catalog, plus the
//! sweep that acts on it. Selection never deletes anything itself.

use crate::models::descriptor::{self, BackupDescriptor, ListFilter};
use crate::state::AppState;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Ids of backups eligible for deletion: `complete` and older than
/// `retention_days`, always excluding the `minimum_keep` most recent
/// `complete` backups regardless of age, so the system is never left
/// without a recoverable backup.
pub fn select(
    descriptors: &[BackupDescriptor],
    retention_days: i64,
    minimum_keep: usize,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut complete: Vec<&BackupDescriptor> = descriptors
        .iter()
        .filter(|d| d.status == "complete")
        .collect();
    complete.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let cutoff = now - Duration::days(retention_days);
    complete
        .into_iter()
        .skip(minimum_keep)
        .filter(|d| {
            DateTime::parse_from_rfc3339(&d.created_at)
                .map(|t| t.with_timezone(&Utc) < cutoff)
                .unwrap_or(false)
        })
        .map(|d| d.id.clone())
        .collect()
}

/// Deletes everything `select` picked: catalog transition first
/// (`complete → deleted`), then the store object. A crash in between
/// leaves an orphaned object for startup reconciliation to sweep.
pub async fn sweep(state: &Arc<AppState>) -> anyhow::Result<usize> {
    let db = state.db.clone();
    let (descriptors, retention_days) = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let descriptors = descriptor::list(&conn, &ListFilter::default())?;
        let cfg = crate::models::schedule::get(&conn)?;
        Ok::<_, anyhow::Error>((descriptors, cfg.retention_days))
    })
    .await??;

    let eligible = select(
        &descriptors,
        retention_days,
        state.config.retention_min_keep,
        Utc::now(),
    );

    let mut deleted = 0usize;
    for id in eligible {
        let db = state.db.clone();
        let id2 = id.clone();
        let marked = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            descriptor::mark_deleted(&conn, &id2)
        })
        .await??;
        if marked {
            state.store.delete(&id).await?;
            tracing::info!(backup_id = %id, "Retention: backup deleted");
            deleted += 1;
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup(id: &str, created_at: &str, status: &str) -> BackupDescriptor {
        BackupDescriptor {
            id: id.to_string(),
            created_at: created_at.to_string(),
            created_by: None,
            kind: "scheduled".to_string(),
            description: None,
            size_bytes: 100,
            source_manifest: "[]".to_string(),
            status: status.to_string(),
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn newest_complete_backup_survives_even_when_expired() {
        let backups = vec![
            backup("t1", "2026-01-01T02:00:00Z", "complete"),
            backup("t2", "2026-01-02T02:00:00Z", "complete"),
            backup("t3", "2026-01-03T02:00:00Z", "complete"),
        ];
        // Everything is far past retention_days=1.
        let eligible = select(&backups, 1, 1, at("2026-06-01T00:00:00Z"));
        assert!(!eligible.contains(&"t3".to_string()), "most recent must never be selected");
        assert_eq!(eligible, vec!["t2".to_string(), "t1".to_string()]);
    }

    #[test]
    fn three_backups_at_t3_plus_two_days_selects_exactly_t1_t2() {
        // T1/T2/T3, retention_days=1, minimum_keep=1, evaluated at
        // T3+2d: only the two older backups may go.
        let backups = vec![
            backup("t1", "2026-03-01T02:00:00Z", "complete"),
            backup("t2", "2026-03-02T02:00:00Z", "complete"),
            backup("t3", "2026-03-03T02:00:00Z", "complete"),
        ];
        let mut eligible = select(&backups, 1, 1, at("2026-03-05T02:00:00Z"));
        eligible.sort();
        assert_eq!(eligible, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn fresh_backups_are_not_selected() {
        let backups = vec![
            backup("old", "2026-01-01T02:00:00Z", "complete"),
            backup("new", "2026-03-04T02:00:00Z", "complete"),
        ];
        let eligible = select(&backups, 30, 1, at("2026-03-05T00:00:00Z"));
        assert_eq!(eligible, vec!["old".to_string()]);
    }

    #[test]
    fn failed_and_deleted_are_never_candidates() {
        let backups = vec![
            backup("f", "2026-01-01T02:00:00Z", "failed"),
            backup("d", "2026-01-02T02:00:00Z", "deleted"),
            backup("c", "2026-01-03T02:00:00Z", "complete"),
        ];
        assert!(select(&backups, 1, 1, at("2026-06-01T00:00:00Z")).is_empty());
    }

    #[test]
    fn minimum_keep_two_protects_two_newest() {
        let backups = vec![
            backup("t1", "2026-01-01T02:00:00Z", "complete"),
            backup("t2", "2026-01-02T02:00:00Z", "complete"),
            backup("t3", "2026-01-03T02:00:00Z", "complete"),
        ];
        let eligible = select(&backups, 1, 2, at("2026-06-01T00:00:00Z"));
        assert_eq!(eligible, vec!["t1".to_string()]);
    }
}
