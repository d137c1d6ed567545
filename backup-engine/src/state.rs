use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::error::EngineError;
use crate::source::StateSource;
use crate::store::ArtifactStore;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub store: ArtifactStore,
    /// Registered providers in declared export order: structured data
    /// stores first, file areas after, so captured cross-references only
    /// point at files in the same or an earlier export.
    pub sources: Vec<Arc<dyn StateSource>>,
    pub shutdown: CancellationToken,
    op_lock: Arc<Mutex<()>>,
}

/// The system-wide backup-or-restore token. Holding this guard is the
/// proof of exclusivity; dropping it on any exit path (including panics)
/// releases the engine.
pub struct OperationGuard {
    _inner: OwnedMutexGuard<()>,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: AppConfig,
        store: ArtifactStore,
        sources: Vec<Arc<dyn StateSource>>,
    ) -> Self {
        Self {
            db,
            config,
            store,
            sources,
            shutdown: CancellationToken::new(),
            op_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Acquires the mutual-exclusion token without waiting. A request
    /// arriving while another backup or restore is in flight fails
    /// immediately rather than queueing.
    pub fn try_begin_operation(&self) -> Result<OperationGuard, EngineError> {
        self.op_lock
            .clone()
            .try_lock_owned()
            .map(|guard| OperationGuard { _inner: guard })
            .map_err(|_| EngineError::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use tempfile::TempDir;

    pub(crate) fn test_state(dir: &TempDir) -> AppState {
        let pool = create_pool(dir.path().join("catalog.db").to_str().unwrap());
        migrate(&pool, &dir.path().join("artifacts"), &dir.path().join("work")).unwrap();
        let mut config = AppConfig::from_env();
        config.data_dir = dir.path().to_path_buf();
        config.artifacts_dir = dir.path().join("artifacts");
        config.work_dir = dir.path().join("work");
        AppState::new(pool, config, ArtifactStore::new(dir.path().join("artifacts")), vec![])
    }

    #[test]
    fn second_acquirer_gets_busy_until_guard_drops() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let guard = state.try_begin_operation().unwrap();
        assert!(matches!(state.try_begin_operation(), Err(EngineError::Busy)));

        drop(guard);
        assert!(state.try_begin_operation().is_ok());
    }
}
