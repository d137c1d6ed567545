use crate::db::connection::DbPool;
use std::fs;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_catalog (
  id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  created_by TEXT,
  kind TEXT NOT NULL DEFAULT 'manual' CHECK(kind IN ('full','manual','scheduled')),
  description TEXT,
  size_bytes INTEGER NOT NULL DEFAULT 0,
  source_manifest TEXT NOT NULL DEFAULT '[]',
  status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','complete','failed','deleted'))
);

CREATE TABLE IF NOT EXISTS restore_records (
  id TEXT PRIMARY KEY,
  backup_id TEXT NOT NULL REFERENCES backup_catalog(id),
  started_at TEXT NOT NULL DEFAULT (datetime('now')),
  finished_at TEXT,
  outcome TEXT NOT NULL DEFAULT 'in_progress' CHECK(outcome IN ('in_progress','succeeded','failed')),
  error_detail TEXT
);

CREATE TABLE IF NOT EXISTS schedule_config (
  id INTEGER PRIMARY KEY CHECK(id = 1),
  frequency TEXT NOT NULL DEFAULT 'daily' CHECK(frequency IN ('daily','weekly','monthly')),
  time_of_day TEXT NOT NULL DEFAULT '02:00',
  retention_days INTEGER NOT NULL DEFAULT 30,
  next_run_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_backup_catalog_created_at ON backup_catalog(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_restore_records_backup_id ON restore_records(backup_id);
"#;

pub fn migrate(pool: &DbPool, artifacts_dir: &Path, work_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[Catalog] Starting database migration...");

    fs::create_dir_all(artifacts_dir)?;
    fs::create_dir_all(work_dir)?;

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Seed the schedule singleton on first boot
    conn.execute(
        "INSERT OR IGNORE INTO schedule_config (id) VALUES (1)",
        [],
    )?;

    tracing::info!("[Catalog] Migration completed successfully");
    Ok(())
}
