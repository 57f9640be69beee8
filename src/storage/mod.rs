//! SQLite storage layer -- pools, schema, run records.

pub mod runs;
pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool unavailable: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("malformed stored payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),
}

impl StoreError {
    /// Whether retrying the same operation later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Pool(_) | StoreError::Join(_) => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Open (or create) the run database (tests, runs, session memory) and return a pool.
pub fn open_pool(path: &str) -> StoreResult<Pool> {
    open_with(path, schema::migrate_runs)
}

/// Open (or create) the queue database (stream tables and run events) and return a pool.
pub fn open_queue_pool(path: &str) -> StoreResult<Pool> {
    open_with(path, schema::migrate_queue)
}

type Migration = fn(&rusqlite::Connection) -> rusqlite::Result<()>;

fn open_with(path: &str, migrate: Migration) -> StoreResult<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            // A missing directory surfaces as CannotOpen from the pool below.
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::builder()
        .connection_timeout(std::time::Duration::from_secs(10))
        .build(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    migrate(&conn)?;

    Ok(pool)
}

/// Run a closure against a pooled connection on the blocking thread pool.
pub async fn blocking<T, F>(pool: &Pool, f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut rusqlite::Connection) -> StoreResult<T> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut *conn)
    })
    .await?
}

/// Fixed-width RFC 3339 UTC timestamp; lexical order matches time order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
