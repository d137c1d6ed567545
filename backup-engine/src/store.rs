//! Content-addressed, append-only storage for backup archives.
//!
//! Objects live at `<dir>/<id>.tar.zst`. Writers fill `<dir>/tmp/<id>`
//! and publish with a single rename, so a crash mid-write leaves nothing
//! retrievable under the id. Leftover temp files are swept at startup.

use std::path::PathBuf;

const OBJECT_SUFFIX: &str = ".tar.zst";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Creates the store layout and removes temp files from a previous
    /// process.
    pub async fn init(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(self.tmp_dir()).await?;
        let mut entries = tokio::fs::read_dir(self.tmp_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            tracing::warn!(path = %entry.path().display(), "[Store] Removing partial write");
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
        Ok(())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.dir.join("tmp")
    }

    /// Published location of an object; readable by anyone at any time.
    pub fn object_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{OBJECT_SUFFIX}"))
    }

    /// Where a writer builds the object before [`Self::commit`].
    pub fn staging_path(&self, id: &str) -> PathBuf {
        self.tmp_dir().join(id)
    }

    /// Atomically publishes a finished staging file. Returns the object
    /// size in bytes.
    pub async fn commit(&self, id: &str) -> anyhow::Result<u64> {
        let staging = self.staging_path(id);
        let object = self.object_path(id);
        let size = tokio::fs::metadata(&staging).await?.len();
        tokio::fs::rename(&staging, &object).await?;
        Ok(size)
    }

    /// Drops an unfinished staging file. Idempotent.
    pub async fn abort(&self, id: &str) {
        let _ = tokio::fs::remove_file(self.staging_path(id)).await;
    }

    pub async fn exists(&self, id: &str) -> bool {
        tokio::fs::try_exists(self.object_path(id)).await.unwrap_or(false)
    }

    /// Opens a published object for streamed reading.
    pub async fn reader(&self, id: &str) -> anyhow::Result<tokio::fs::File> {
        Ok(tokio::fs::File::open(self.object_path(id)).await?)
    }

    /// Idempotent: deleting an absent object is not an error.
    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.object_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of all published objects, for startup reconciliation.
    pub async fn list_ids(&self) -> anyhow::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(OBJECT_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// (object count, total bytes) across published objects.
    pub async fn usage(&self) -> anyhow::Result<(u64, u64)> {
        let mut count = 0u64;
        let mut bytes = 0u64;
        for id in self.list_ids().await? {
            if let Ok(meta) = tokio::fs::metadata(self.object_path(&id)).await {
                count += 1;
                bytes += meta.len();
            }
        }
        Ok((count, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn commit_publishes_and_abort_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.init().await.unwrap();

        tokio::fs::write(store.staging_path("b1"), b"archive bytes").await.unwrap();
        assert!(!store.exists("b1").await, "uncommitted object must be invisible");

        let size = store.commit("b1").await.unwrap();
        assert_eq!(size, 13);
        assert!(store.exists("b1").await);

        tokio::fs::write(store.staging_path("b2"), b"partial").await.unwrap();
        store.abort("b2").await;
        assert!(!store.exists("b2").await);
        assert_eq!(store.list_ids().await.unwrap(), vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn init_sweeps_partial_writes_from_a_crash() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.init().await.unwrap();
        tokio::fs::write(store.staging_path("dead"), b"half an archive").await.unwrap();

        // Simulated process restart.
        let store = ArtifactStore::new(dir.path());
        store.init().await.unwrap();
        assert!(!store.staging_path("dead").exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.init().await.unwrap();

        tokio::fs::write(store.staging_path("b1"), b"x").await.unwrap();
        store.commit("b1").await.unwrap();
        store.delete("b1").await.unwrap();
        store.delete("b1").await.unwrap();
        assert!(!store.exists("b1").await);
    }

    #[tokio::test]
    async fn usage_sums_published_objects() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.init().await.unwrap();

        for (id, body) in [("a", "12345"), ("b", "123")] {
            tokio::fs::write(store.staging_path(id), body).await.unwrap();
            store.commit(id).await.unwrap();
        }
        assert_eq!(store.usage().await.unwrap(), (2, 8));
    }
}
