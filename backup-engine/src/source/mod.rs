pub mod file_tree;
pub mod sqlite_db;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One entry per StateSource in a backup's manifest, in export order.
/// `checksum` is hex-encoded SHA-256 over the source's exported bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceManifestEntry {
    pub source_name: String,
    pub item_count: u64,
    pub checksum: String,
}

/// Staged-but-not-live state produced by [`StateSource::stage`].
#[derive(Debug, Clone)]
pub struct StagingHandle {
    pub source_name: String,
    pub path: PathBuf,
}

/// Reference to the pre-swap live state retained by [`StateSource::swap`],
/// consumed either by `rollback_swap` or `discard_pre_swap`.
#[derive(Debug, Clone)]
pub struct PreSwapRef {
    pub source_name: String,
    pub path: PathBuf,
    /// False when there was no live state to displace (fresh install).
    pub existed: bool,
}

/// One provider of persistent state. The engine never sees a concrete
/// store, only this capability surface: export the full live state,
/// materialize a replacement on the side, swap it live atomically, and
/// undo a swap from the retained pre-swap state.
#[async_trait]
pub trait StateSource: Send + Sync {
    fn name(&self) -> &str;

    /// Writes a complete, self-consistent export of the live state into
    /// `dest`. Returns the number of items captured (rows, files).
    async fn export(&self, dest: &Path) -> anyhow::Result<u64>;

    /// Materializes exported bytes into a side location, never touching
    /// live state.
    async fn stage(&self, export: &Path) -> anyhow::Result<StagingHandle>;

    /// Atomically replaces live state with the staged state (rename
    /// semantics). Returns a reference to the displaced pre-swap state.
    async fn swap(&self, staged: &StagingHandle) -> anyhow::Result<PreSwapRef>;

    /// Reinstates the pre-swap live state after a partial-swap failure.
    async fn rollback_swap(&self, pre: &PreSwapRef) -> anyhow::Result<()>;

    /// Removes staged state that will not be swapped in. Idempotent.
    async fn discard_staged(&self, staged: &StagingHandle) -> anyhow::Result<()>;

    /// Removes the retained pre-swap state once a restore has fully
    /// succeeded. Idempotent.
    async fn discard_pre_swap(&self, pre: &PreSwapRef) -> anyhow::Result<()>;
}

/// `/a/b/records.db` + `.pre-swap` → `/a/b/records.db.pre-swap`
pub(crate) fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_is_appended_to_the_file_name() {
        assert_eq!(
            path_with_suffix(Path::new("/a/b/records.db"), ".pre-swap"),
            PathBuf::from("/a/b/records.db.pre-swap")
        );
        assert_eq!(
            path_with_suffix(Path::new("/a/uploads"), ".staging"),
            PathBuf::from("/a/uploads.staging")
        );
    }
}
