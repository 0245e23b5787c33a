//! Connection pool construction and schema migrations.
//!
//! Each process builds exactly one pool at start-up and hands it to the
//! repository. All workers open the same SQLite file; WAL journaling plus a
//! busy timeout lets them write concurrently without a shared lock of our own.

use sqlx::{
    SqlitePool,
    migrate::{MigrateError, Migrator},
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, time::Duration};
use tracing::{debug, info};

/// Schema migrations embedded from `migrations/`.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone, Debug)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    /// How long a request may wait for a pooled connection before the
    /// repository reports itself unavailable.
    pub acquire_timeout: Duration,
    /// How long SQLite waits on a lock held by another worker.
    pub busy_timeout: Duration,
}

impl DatabaseSettings {
    pub fn for_path(path: &Path) -> Self {
        Self {
            url: format!("sqlite://{}", path.display()),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(3),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Open a pool against `settings.url`, creating the database file (and its
/// parent directory) if needed.
pub async fn connect(settings: &DatabaseSettings) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&settings.url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(settings.busy_timeout);

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            info!("Created missing directory {:?}", parent);
        }
    }
    debug!("Connecting to {}", options.get_filename().display());

    SqlitePoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect_with(options)
        .await
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
