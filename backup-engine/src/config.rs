use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub catalog_db_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub work_dir: PathBuf,
    pub app_db_path: PathBuf,
    pub uploads_dir: PathBuf,
    pub source_timeout_secs: u64,
    pub retention_min_keep: usize,
    pub pre_restore_freshness_secs: i64,
    pub scheduler_tick_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/backup-engine".into()),
        );

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3100),
            catalog_db_path: data_dir.join("catalog.db"),
            artifacts_dir: data_dir.join("artifacts"),
            work_dir: data_dir.join("work"),
            data_dir,
            app_db_path: PathBuf::from(
                std::env::var("APP_DB_PATH").unwrap_or_else(|_| "/srv/app/data/records.db".into()),
            ),
            uploads_dir: PathBuf::from(
                std::env::var("UPLOADS_DIR").unwrap_or_else(|_| "/srv/app/data/uploads".into()),
            ),
            source_timeout_secs: std::env::var("SOURCE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            retention_min_keep: std::env::var("RETENTION_MIN_KEEP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            pre_restore_freshness_secs: std::env::var("PRE_RESTORE_FRESHNESS_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(900),
            scheduler_tick_secs: std::env::var("SCHEDULER_TICK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}
