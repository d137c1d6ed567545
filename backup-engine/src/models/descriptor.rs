use crate::source::SourceManifestEntry;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub id: String,
    pub created_at: String,
    pub created_by: Option<String>,
    pub kind: String,
    pub description: Option<String>,
    pub size_bytes: i64,
    pub source_manifest: String, // JSON array stored as text
    pub status: String,
}

impl BackupDescriptor {
    pub fn manifest(&self) -> Vec<SourceManifestEntry> {
        serde_json::from_str(&self.source_manifest).unwrap_or_default()
    }
}

fn row_to_descriptor(row: &Row) -> rusqlite::Result<BackupDescriptor> {
    Ok(BackupDescriptor {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        created_by: row.get("created_by")?,
        kind: row.get("kind")?,
        description: row.get("description")?,
        size_bytes: row.get("size_bytes")?,
        source_manifest: row.get("source_manifest")?,
        status: row.get("status")?,
    })
}

pub struct NewDescriptor {
    pub created_by: Option<String>,
    pub kind: String,
    pub description: Option<String>,
}

/// Inserts a `pending` descriptor. The id is a UUIDv7, so catalog order
/// and id order agree.
pub fn insert(conn: &Connection, data: &NewDescriptor) -> anyhow::Result<BackupDescriptor> {
    let id = Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO backup_catalog (id, created_at, created_by, kind, description)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, now, data.created_by, data.kind, data.description],
    )?;
    find_by_id(conn, &id)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created descriptor"))
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<BackupDescriptor>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_catalog WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_descriptor(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListFilter {
    pub status: Option<String>,
    pub kind: Option<String>,
}

/// Lists descriptors newest-first. Without an explicit status filter,
/// `failed` and `deleted` entries are excluded.
pub fn list(conn: &Connection, filter: &ListFilter) -> anyhow::Result<Vec<BackupDescriptor>> {
    let mut sql = String::from("SELECT * FROM backup_catalog WHERE 1=1");
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    match &filter.status {
        Some(status) => {
            sql.push_str(" AND status = ?");
            values.push(Box::new(status.clone()));
        }
        None => {
            sql.push_str(" AND status NOT IN ('failed','deleted')");
        }
    }
    if let Some(kind) = &filter.kind {
        sql.push_str(" AND kind = ?");
        values.push(Box::new(kind.clone()));
    }
    sql.push_str(" ORDER BY created_at DESC");

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let rows = stmt.query_map(params.as_slice(), |row| row_to_descriptor(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_latest_complete(conn: &Connection) -> anyhow::Result<Option<BackupDescriptor>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_catalog WHERE status = 'complete' ORDER BY created_at DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map([], |row| row_to_descriptor(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn count_complete(conn: &Connection) -> anyhow::Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM backup_catalog WHERE status = 'complete'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Compare-and-swap finalize: `pending → complete` with the final size and
/// manifest. Returns false when the descriptor was not `pending` anymore,
/// so two concurrent finalizers cannot both succeed.
pub fn finalize_complete(
    conn: &Connection,
    id: &str,
    size_bytes: i64,
    manifest: &[SourceManifestEntry],
) -> anyhow::Result<bool> {
    let manifest_json = serde_json::to_string(manifest)?;
    let changes = conn.execute(
        "UPDATE backup_catalog SET status = 'complete', size_bytes = ?, source_manifest = ?
         WHERE id = ? AND status = 'pending'",
        params![size_bytes, manifest_json, id],
    )?;
    Ok(changes > 0)
}

/// CAS `pending → failed`. The row is retained for diagnostics.
pub fn mark_failed(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_catalog SET status = 'failed' WHERE id = ? AND status = 'pending'",
        params![id],
    )?;
    Ok(changes > 0)
}

/// CAS `complete → deleted`, the only path by which a backup leaves the
/// catalog. Rows are never physically removed.
pub fn mark_deleted(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_catalog SET status = 'deleted' WHERE id = ? AND status = 'complete'",
        params![id],
    )?;
    Ok(changes > 0)
}

/// Any row still `pending` at startup belongs to a crashed run; the
/// engine is the only writer of the catalog.
pub fn fail_stale_pending(conn: &Connection) -> anyhow::Result<usize> {
    let changes = conn.execute(
        "UPDATE backup_catalog SET status = 'failed' WHERE status = 'pending'",
        [],
    )?;
    Ok(changes)
}

pub fn update_description(conn: &Connection, id: &str, description: &str) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_catalog SET description = ? WHERE id = ?",
        params![description, id],
    )?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use tempfile::TempDir;

    fn test_conn(dir: &TempDir) -> crate::db::connection::DbPool {
        let pool = create_pool(dir.path().join("catalog.db").to_str().unwrap());
        migrate(&pool, &dir.path().join("artifacts"), &dir.path().join("work")).unwrap();
        pool
    }

    fn entry(name: &str) -> SourceManifestEntry {
        SourceManifestEntry {
            source_name: name.to_string(),
            item_count: 3,
            checksum: "ab".repeat(32),
        }
    }

    #[test]
    fn insert_starts_pending_and_ids_are_time_ordered() {
        let dir = TempDir::new().unwrap();
        let pool = test_conn(&dir);
        let conn = pool.get().unwrap();

        let a = insert(&conn, &NewDescriptor { created_by: None, kind: "manual".into(), description: None }).unwrap();
        // UUIDv7 is millisecond-granular; step past the boundary.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = insert(&conn, &NewDescriptor { created_by: Some("ops".into()), kind: "scheduled".into(), description: None }).unwrap();

        assert_eq!(a.status, "pending");
        assert!(a.id < b.id, "UUIDv7 ids must sort by creation time");
    }

    #[test]
    fn cas_finalize_succeeds_exactly_once() {
        let dir = TempDir::new().unwrap();
        let pool = test_conn(&dir);
        let conn = pool.get().unwrap();

        let d = insert(&conn, &NewDescriptor { created_by: None, kind: "full".into(), description: None }).unwrap();
        assert!(finalize_complete(&conn, &d.id, 1024, &[entry("records")]).unwrap());
        // Second observer of `pending` must lose the race.
        assert!(!finalize_complete(&conn, &d.id, 2048, &[entry("records")]).unwrap());
        assert!(!mark_failed(&conn, &d.id).unwrap());

        let d = find_by_id(&conn, &d.id).unwrap().unwrap();
        assert_eq!(d.status, "complete");
        assert_eq!(d.size_bytes, 1024);
        assert_eq!(d.manifest().len(), 1);
    }

    #[test]
    fn deleted_is_only_reachable_from_complete() {
        let dir = TempDir::new().unwrap();
        let pool = test_conn(&dir);
        let conn = pool.get().unwrap();

        let d = insert(&conn, &NewDescriptor { created_by: None, kind: "manual".into(), description: None }).unwrap();
        assert!(!mark_deleted(&conn, &d.id).unwrap(), "pending cannot be deleted");
        assert!(mark_failed(&conn, &d.id).unwrap());
        assert!(!mark_deleted(&conn, &d.id).unwrap(), "failed cannot be deleted");
    }

    #[test]
    fn default_listing_hides_failed_and_deleted() {
        let dir = TempDir::new().unwrap();
        let pool = test_conn(&dir);
        let conn = pool.get().unwrap();

        let ok = insert(&conn, &NewDescriptor { created_by: None, kind: "manual".into(), description: None }).unwrap();
        finalize_complete(&conn, &ok.id, 10, &[]).unwrap();
        let bad = insert(&conn, &NewDescriptor { created_by: None, kind: "manual".into(), description: None }).unwrap();
        mark_failed(&conn, &bad.id).unwrap();

        let visible = list(&conn, &ListFilter::default()).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, ok.id);

        let failed = list(&conn, &ListFilter { status: Some("failed".into()), kind: None }).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, bad.id);
    }
}
