//! # Metadata Store
//!
//! Embedded transactional store for the file-system metadata, backed by a
//! single SQLite database file. Provides:
//!
//! - a connection pool; a write transaction owns one pooled connection for
//!   its entire lifetime, so statements inside a transaction always run on
//!   the same connection
//! - nested transactions via savepoints: the outermost level issues
//!   `BEGIN IMMEDIATE`, inner levels `SAVEPOINT`; rolling back an inner
//!   level preserves the outer transaction
//! - retry on `SQLITE_BUSY` with exponential backoff and jitter for at
//!   least ten seconds, then a deadlock warning and an error

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use rand::Rng;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{debug, warn};

pub mod dump;
pub mod schema;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// The database stayed locked past the busy-wait budget.
    #[error("database locked, possible deadlock")]
    Busy,

    /// A query expected to produce exactly one row produced none.
    #[error("no matching row")]
    NoSuchRow,

    #[error("metadata dump malformed: {0}")]
    Dump(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for database operations.
pub type DbResult<T> = Result<T, DatabaseError>;

/// Busy-wait budget before reporting a deadlock.
const BUSY_BUDGET: Duration = Duration::from_secs(10);

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            matches!(code.as_deref(), Some("5") | Some("6") | Some("517"))
        }
        _ => false,
    }
}

/// Handle to the metadata database.
#[derive(Clone)]
pub struct MetaDb {
    pool: SqlitePool,
    path: PathBuf,
}

impl MetaDb {
    /// Open an existing database file.
    pub async fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Self::open_inner(path.as_ref(), false).await
    }

    /// Create the database file (it must not contain a schema yet).
    pub async fn create(path: impl AsRef<Path>) -> DbResult<Self> {
        Self::open_inner(path.as_ref(), true).await
    }

    async fn open_inner(path: &Path, create: bool) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_BUDGET)
            .foreign_keys(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the database file in bytes.
    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Acquire a connection for plain (auto-commit) statements.
    pub async fn acquire(&self) -> DbResult<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Begin a write transaction (`BEGIN IMMEDIATE`). Retries while the
    /// database is locked by another writer.
    pub async fn begin(&self) -> DbResult<Transaction> {
        let mut conn = self.pool.acquire().await?;
        let started = Instant::now();
        let mut step = Duration::from_millis(1);
        loop {
            match sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
                Ok(_) => {
                    return Ok(Transaction {
                        conn: Some(conn),
                        depth: 0,
                        finished: false,
                    })
                }
                Err(err) if is_busy(&err) => {
                    if started.elapsed() > BUSY_BUDGET {
                        warn!("database locked for {:?}, giving up", started.elapsed());
                        return Err(DatabaseError::Busy);
                    }
                    debug!("database busy, retrying transaction start");
                    tokio::time::sleep(step).await;
                    let millis = step.as_millis() as u64;
                    step = Duration::from_millis(
                        rand::thread_rng().gen_range(millis + 1..=2 * (millis + 1)),
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Close the pool, releasing the database file.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// An open write transaction. Must be finished explicitly with
/// [`Transaction::commit`] or [`Transaction::rollback`]; a transaction
/// dropped mid-flight closes its connection, which discards all
/// uncommitted work.
pub struct Transaction {
    conn: Option<PoolConnection<Sqlite>>,
    depth: u32,
    finished: bool,
}

impl Transaction {
    /// The connection this transaction runs on.
    pub fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        self.conn.as_mut().expect("transaction already finished")
    }

    /// Number of open savepoints.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Enter a nested savepoint. Returns a name to pass to
    /// [`Transaction::release`] or [`Transaction::rollback_to`].
    pub async fn savepoint(&mut self) -> DbResult<String> {
        self.depth += 1;
        let name = format!("sp_{}", self.depth);
        sqlx::query(&format!("SAVEPOINT '{}'", name))
            .execute(self.conn())
            .await?;
        Ok(name)
    }

    /// Release (commit) a savepoint.
    pub async fn release(&mut self, name: &str) -> DbResult<()> {
        sqlx::query(&format!("RELEASE '{}'", name))
            .execute(self.conn())
            .await?;
        self.depth = self.depth.saturating_sub(1);
        Ok(())
    }

    /// Roll back to a savepoint, then release it. Outer levels stay
    /// intact.
    pub async fn rollback_to(&mut self, name: &str) -> DbResult<()> {
        sqlx::query(&format!("ROLLBACK TO '{}'", name))
            .execute(self.conn())
            .await?;
        sqlx::query(&format!("RELEASE '{}'", name))
            .execute(self.conn())
            .await?;
        self.depth = self.depth.saturating_sub(1);
        Ok(())
    }

    /// Commit the outermost transaction and return the connection to the
    /// pool.
    pub async fn commit(mut self) -> DbResult<()> {
        sqlx::query("COMMIT").execute(self.conn()).await?;
        self.finished = true;
        Ok(())
    }

    /// Roll back the outermost transaction.
    pub async fn rollback(mut self) -> DbResult<()> {
        sqlx::query("ROLLBACK").execute(self.conn()).await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(conn) = self.conn.take() {
                // Dropping the detached connection closes it, which rolls
                // back the open transaction at the SQLite level.
                warn!("transaction dropped without commit, discarding connection");
                drop(conn.detach());
            }
        }
    }
}

/// Read a single value from the `settings` table.
pub async fn get_setting(
    conn: &mut sqlx::SqliteConnection,
    key: &str,
) -> DbResult<Option<Vec<u8>>> {
    let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(conn)
        .await?;
    Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
}

/// Write a value into the `settings` table.
pub async fn set_setting(
    conn: &mut sqlx::SqliteConnection,
    key: &str,
    value: &[u8],
) -> DbResult<()> {
    sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(conn)
        .await?;
    Ok(())
}

/// Read an integer setting.
pub async fn get_setting_int(
    conn: &mut sqlx::SqliteConnection,
    key: &str,
) -> DbResult<Option<i64>> {
    match get_setting(conn, key).await? {
        Some(raw) if raw.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&raw);
            Ok(Some(i64::from_le_bytes(buf)))
        }
        Some(_) => Err(DatabaseError::Dump("malformed integer setting".into())),
        None => Ok(None),
    }
}

/// Write an integer setting.
pub async fn set_setting_int(
    conn: &mut sqlx::SqliteConnection,
    key: &str,
    value: i64,
) -> DbResult<()> {
    set_setting(conn, key, &value.to_le_bytes()).await
}
