//! StateSource over the application's SQLite records database.
//!
//! Export uses the SQLite online backup API so a consistent snapshot is
//! taken even while the application holds the database open. Swap is a
//! file rename carried out while the engine holds the system-wide
//! operation lock; the `-wal`/`-shm` sidecars travel with the main file
//! so a rollback reinstates the database exactly as displaced.

use super::{path_with_suffix, PreSwapRef, StagingHandle, StateSource};
use async_trait::async_trait;
use rusqlite::backup::Backup;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct SqliteDbSource {
    name: String,
    db_path: PathBuf,
}

impl SqliteDbSource {
    pub fn new(name: impl Into<String>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            db_path: db_path.into(),
        }
    }
}

fn sidecars(path: &Path) -> [PathBuf; 2] {
    [path_with_suffix(path, "-wal"), path_with_suffix(path, "-shm")]
}

/// Moves a database file together with its sidecars; missing sidecars are
/// skipped.
fn move_db(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::rename(from, to)?;
    for (src, dst) in sidecars(from).iter().zip(sidecars(to).iter()) {
        if src.exists() {
            std::fs::rename(src, dst)?;
        }
    }
    Ok(())
}

fn remove_db(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    for side in sidecars(path) {
        if side.exists() {
            std::fs::remove_file(side)?;
        }
    }
    Ok(())
}

/// Counts rows across all user tables of an exported copy.
fn count_rows(conn: &Connection) -> anyhow::Result<u64> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .collect();

    let mut total = 0u64;
    for table in tables {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| {
            row.get(0)
        })?;
        total += n as u64;
    }
    Ok(total)
}

#[async_trait]
impl StateSource for SqliteDbSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, dest: &Path) -> anyhow::Result<u64> {
        let db_path = self.db_path.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let src = Connection::open(&db_path)?;
            let mut dst = Connection::open(&dest)?;
            {
                let backup = Backup::new(&src, &mut dst)?;
                backup.run_to_completion(64, Duration::from_millis(25), None)?;
            }
            // Count on the copy so the number reflects the snapshot, not
            // whatever the live database has moved on to.
            count_rows(&dst)
        })
        .await?
    }

    async fn stage(&self, export: &Path) -> anyhow::Result<StagingHandle> {
        let staged = path_with_suffix(&self.db_path, ".staged");
        if let Some(parent) = staged.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Staged copy lives next to the live file so the later rename
        // stays on one filesystem.
        tokio::fs::copy(export, &staged).await?;
        Ok(StagingHandle {
            source_name: self.name.clone(),
            path: staged,
        })
    }

    async fn swap(&self, staged: &StagingHandle) -> anyhow::Result<PreSwapRef> {
        let db_path = self.db_path.clone();
        let staged_path = staged.path.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let pre = path_with_suffix(&db_path, ".pre-swap");
            remove_db(&pre)?;
            let existed = db_path.exists();
            if existed {
                move_db(&db_path, &pre)?;
            }
            std::fs::rename(&staged_path, &db_path)?;
            Ok(PreSwapRef {
                source_name: name,
                path: pre,
                existed,
            })
        })
        .await?
    }

    async fn rollback_swap(&self, pre: &PreSwapRef) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        let pre = pre.clone();
        tokio::task::spawn_blocking(move || {
            remove_db(&db_path)?;
            if pre.existed {
                move_db(&pre.path, &db_path)?;
            }
            Ok(())
        })
        .await?
    }

    async fn discard_staged(&self, staged: &StagingHandle) -> anyhow::Result<()> {
        let path = staged.path.clone();
        tokio::task::spawn_blocking(move || {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            Ok(())
        })
        .await?
    }

    async fn discard_pre_swap(&self, pre: &PreSwapRef) -> anyhow::Result<()> {
        let path = pre.path.clone();
        tokio::task::spawn_blocking(move || remove_db(&path)).await??;
        Ok(())
    }
}
