use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRecord {
    pub id: String,
    pub backup_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub outcome: String,
    pub error_detail: Option<String>,
}

fn row_to_record(row: &Row) -> rusqlite::Result<RestoreRecord> {
    Ok(RestoreRecord {
        id: row.get("id")?,
        backup_id: row.get("backup_id")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        outcome: row.get("outcome")?,
        error_detail: row.get("error_detail")?,
    })
}

pub fn create(conn: &Connection, backup_id: &str) -> anyhow::Result<RestoreRecord> {
    let id = Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO restore_records (id, backup_id, started_at) VALUES (?1, ?2, ?3)",
        params![id, backup_id, now],
    )?;
    find_by_id(conn, &id)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created restore record"))
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<RestoreRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM restore_records WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_record(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_by_backup_id(conn: &Connection, backup_id: &str) -> anyhow::Result<Vec<RestoreRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM restore_records WHERE backup_id = ? ORDER BY started_at DESC",
    )?;
    let rows = stmt.query_map(params![backup_id], |row| row_to_record(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_recent(conn: &Connection, limit: i64) -> anyhow::Result<Vec<RestoreRecord>> {
    let mut stmt =
        conn.prepare("SELECT * FROM restore_records ORDER BY started_at DESC LIMIT ?")?;
    let rows = stmt.query_map(params![limit], |row| row_to_record(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Records are append-only: the outcome is written once, guarded on
/// `finished_at IS NULL`.
pub fn finish(
    conn: &Connection,
    id: &str,
    outcome: &str,
    error_detail: Option<&str>,
) -> anyhow::Result<bool> {
    let now = chrono::Utc::now().to_rfc3339();
    let changes = conn.execute(
        "UPDATE restore_records SET outcome = ?, finished_at = ?, error_detail = ?
         WHERE id = ? AND finished_at IS NULL",
        params![outcome, now, error_detail, id],
    )?;
    Ok(changes > 0)
}

/// A record still `in_progress` at startup belongs to a crashed process.
pub fn fail_interrupted(conn: &Connection) -> anyhow::Result<usize> {
    let now = chrono::Utc::now().to_rfc3339();
    let changes = conn.execute(
        "UPDATE restore_records SET outcome = 'failed', finished_at = ?,
             error_detail = 'interrupted by engine restart'
         WHERE outcome = 'in_progress'",
        params![now],
    )?;
    Ok(changes)
}
