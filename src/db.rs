use crate::config::AppConfig;
use crate::errors::ServiceError;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Shared handle to the order and stock database.
pub type DbPool = DatabaseConnection;

/// Pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// How long a caller waits for a free connection. Coordinator
    /// transactions hold one connection each, so this bounds how long a
    /// confirm or pay can queue behind others.
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
        }
    }

    /// Every connection to an in-memory SQLite URL opens a separate, empty
    /// database, so such pools are pinned to a single connection.
    pub fn is_in_memory_sqlite(&self) -> bool {
        self.url.starts_with("sqlite::memory:") || self.url.contains("mode=memory")
    }

    fn is_file_sqlite(&self) -> bool {
        self.url.starts_with("sqlite:") && !self.is_in_memory_sqlite()
    }

    fn effective(&self) -> Self {
        let mut settings = self.clone();
        if settings.is_in_memory_sqlite() && settings.max_connections != 1 {
            warn!(
                requested = settings.max_connections,
                "In-memory SQLite pool limited to one connection"
            );
            settings.max_connections = 1;
            settings.min_connections = 1;
        }
        settings
    }
}

impl From<&AppConfig> for PoolSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

/// Opens a pool for `database_url` with default sizing.
pub async fn connect_url(database_url: &str) -> Result<DbPool, ServiceError> {
    connect_with(&PoolSettings::for_url(database_url)).await
}

/// Opens a pool sized from the application configuration.
pub async fn connect(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    connect_with(&PoolSettings::from(cfg)).await
}

pub async fn connect_with(settings: &PoolSettings) -> Result<DbPool, ServiceError> {
    let settings = settings.effective();
    debug!(
        max_connections = settings.max_connections,
        min_connections = settings.min_connections,
        acquire_timeout = ?settings.acquire_timeout,
        "Opening database pool"
    );

    let mut options = ConnectOptions::new(settings.url.clone());
    options
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .connect_timeout(settings.connect_timeout)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .sqlx_logging(false);

    let pool = Database::connect(options).await.map_err(|e| {
        error!(error = %e, "Could not open database pool");
        ServiceError::DatabaseError(e)
    })?;

    // Readers must not block the single writer; the mode sticks to the file.
    if settings.is_file_sqlite() && pool.get_database_backend() == DatabaseBackend::Sqlite {
        pool.execute_unprepared("PRAGMA journal_mode=WAL").await?;
    }

    info!(
        backend = ?pool.get_database_backend(),
        max_connections = settings.max_connections,
        "Database pool ready"
    );
    Ok(pool)
}

/// Brings the schema up to date with the embedded migrations.
///
/// # Errors
/// Returns `ServiceError::DatabaseError` when any migration fails; migrations
/// that already ran stay applied.
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    let started = Instant::now();
    match crate::migrator::Migrator::up(pool, None).await {
        Ok(()) => {
            info!(elapsed = ?started.elapsed(), "Schema migrations applied");
            Ok(())
        }
        Err(e) => {
            error!(elapsed = ?started.elapsed(), error = %e, "Schema migration failed");
            Err(ServiceError::DatabaseError(e))
        }
    }
}

pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    pool.ping().await.map_err(|e| {
        error!(error = %e, "Database ping failed");
        ServiceError::DatabaseError(e)
    })
}
