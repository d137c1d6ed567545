//! Shared fixtures: an engine wired to mock state sources with
//! per-source failure injection.

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::source::{path_with_suffix, PreSwapRef, StagingHandle, StateSource};
use crate::state::AppState;
use crate::store::ArtifactStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// A StateSource over a single file, with switches to make any phase
/// fail deterministically.
pub struct MockSource {
    name: String,
    live_path: PathBuf,
    pub fail_export: AtomicBool,
    pub fail_stage: AtomicBool,
    pub fail_swap: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub export_delay_ms: AtomicU64,
}

impl MockSource {
    pub fn new(name: impl Into<String>, live_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            live_path: live_path.into(),
            fail_export: AtomicBool::new(false),
            fail_stage: AtomicBool::new(false),
            fail_swap: AtomicBool::new(false),
            fail_rollback: AtomicBool::new(false),
            export_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn write_live(&self, content: &str) {
        std::fs::create_dir_all(self.live_path.parent().unwrap()).unwrap();
        std::fs::write(&self.live_path, content).unwrap();
    }

    pub fn read_live(&self) -> String {
        std::fs::read_to_string(&self.live_path).unwrap()
    }
}

#[async_trait]
impl StateSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, dest: &Path) -> anyhow::Result<u64> {
        let delay = self.export_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.fail_export.load(Ordering::SeqCst) {
            anyhow::bail!("injected export failure");
        }
        tokio::fs::copy(&self.live_path, dest).await?;
        Ok(1)
    }

    async fn stage(&self, export: &Path) -> anyhow::Result<StagingHandle> {
        if self.fail_stage.load(Ordering::SeqCst) {
            anyhow::bail!("injected staging failure");
        }
        let staged = path_with_suffix(&self.live_path, ".staged");
        tokio::fs::copy(export, &staged).await?;
        Ok(StagingHandle {
            source_name: self.name.clone(),
            path: staged,
        })
    }

    async fn swap(&self, staged: &StagingHandle) -> anyhow::Result<PreSwapRef> {
        if self.fail_swap.load(Ordering::SeqCst) {
            anyhow::bail!("injected swap failure");
        }
        let pre = path_with_suffix(&self.live_path, ".pre-swap");
        let existed = self.live_path.exists();
        if existed {
            tokio::fs::rename(&self.live_path, &pre).await?;
        }
        tokio::fs::rename(&staged.path, &self.live_path).await?;
        Ok(PreSwapRef {
            source_name: self.name.clone(),
            path: pre,
            existed,
        })
    }

    async fn rollback_swap(&self, pre: &PreSwapRef) -> anyhow::Result<()> {
        if self.fail_rollback.load(Ordering::SeqCst) {
            anyhow::bail!("injected rollback failure");
        }
        if self.live_path.exists() {
            tokio::fs::remove_file(&self.live_path).await?;
        }
        if pre.existed {
            tokio::fs::rename(&pre.path, &self.live_path).await?;
        }
        Ok(())
    }

    async fn discard_staged(&self, staged: &StagingHandle) -> anyhow::Result<()> {
        if staged.path.exists() {
            tokio::fs::remove_file(&staged.path).await?;
        }
        Ok(())
    }

    async fn discard_pre_swap(&self, pre: &PreSwapRef) -> anyhow::Result<()> {
        if pre.path.exists() {
            tokio::fs::remove_file(&pre.path).await?;
        }
        Ok(())
    }
}

pub struct EngineHarness {
    pub dir: TempDir,
    pub state: Arc<AppState>,
    pub mocks: Vec<Arc<MockSource>>,
}

/// Engine over `n` mock sources seeded with `content-<i>`.
pub async fn engine_with_sources(n: usize) -> EngineHarness {
    engine_with_config(n, |_| {}).await
}

pub async fn engine_with_config(
    n: usize,
    tweak: impl FnOnce(&mut AppConfig),
) -> EngineHarness {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(dir.path().join("catalog.db").to_str().unwrap());
    let artifacts_dir = dir.path().join("artifacts");
    let work_dir = dir.path().join("work");
    migrate(&pool, &artifacts_dir, &work_dir).unwrap();

    let store = ArtifactStore::new(&artifacts_dir);
    store.init().await.unwrap();

    let mut mocks = Vec::with_capacity(n);
    for i in 0..n {
        let mock = Arc::new(MockSource::new(
            format!("src{i}"),
            dir.path().join("live").join(format!("src{i}.dat")),
        ));
        mock.write_live(&format!("content-{i}"));
        mocks.push(mock);
    }
    let sources: Vec<Arc<dyn StateSource>> = mocks
        .iter()
        .map(|m| Arc::clone(m) as Arc<dyn StateSource>)
        .collect();

    let mut config = AppConfig::from_env();
    config.data_dir = dir.path().to_path_buf();
    config.catalog_db_path = dir.path().join("catalog.db");
    config.artifacts_dir = artifacts_dir;
    config.work_dir = work_dir;
    config.source_timeout_secs = 30;
    // A just-taken backup counts as fresh, so restores in tests do not
    // stack extra safety snapshots unless a test asks for them.
    config.pre_restore_freshness_secs = 3600;
    tweak(&mut config);

    let state = Arc::new(AppState::new(pool, config, store, sources));
    EngineHarness { dir, state, mocks }
}
