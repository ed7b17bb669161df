//! SQLite-backed key-value store shared between processes.
//!
//! Every write stamps the row with the writer's context id and a
//! store-wide revision. SQLite has no cross-connection change hook, so a
//! watcher thread samples `PRAGMA data_version` and forwards rows with a newer
//! revision to local subscribers, well inside the 500 ms propagation target.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use super::{data_dir, ContextId, KeyValueStore, StoreChange, Subscribers, Subscription};
use crate::error::StoreError;

const WATCH_INTERVAL: Duration = Duration::from_millis(100);
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

struct Shared {
    conn: Mutex<Connection>,
    subscribers: Subscribers,
    stop: AtomicBool,
}

pub struct SqliteStore {
    shared: Arc<Shared>,
    context: ContextId,
    /// `None` for in-memory databases, which no other connection can see.
    path: Option<PathBuf>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteStore {
    /// Open the store at `~/.config/phaseclock/phaseclock.db`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_default() -> Result<Self, StoreError> {
        let path = data_dir()
            .map_err(|e| StoreError::QueryFailed(format!("cannot resolve data dir: {e}")))?
            .join("phaseclock.db");
        Self::open(&path)
    }

    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    /// Open an in-memory store (for tests). Never notifies.
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        migrate(&conn)?;
        Ok(Self {
            shared: Arc::new(Shared {
                conn: Mutex::new(conn),
                subscribers: Subscribers::default(),
                stop: AtomicBool::new(false),
            }),
            context: ContextId::new(),
            path,
            watcher: Mutex::new(None),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.shared
            .conn
            .lock()
            .map_err(|_| StoreError::Poisoned("sqlite connection"))
    }

    fn write(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO kv (key, value, writer, revision)
             VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(revision), 0) + 1 FROM kv))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                writer = excluded.writer,
                revision = excluded.revision",
            params![key, value, self.context.to_string()],
        )?;
        Ok(())
    }

    fn ensure_watcher(&self) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let Ok(mut watcher) = self.watcher.lock() else {
            return;
        };
        if watcher.is_some() {
            return;
        }
        // The revision baseline must be read before `subscribe` returns,
        // otherwise a write landing while the thread starts is never published.
        let start = open_connection(&path).and_then(|conn| {
            let revision = max_revision(&conn)?;
            Ok((conn, revision))
        });
        let (conn, revision) = match start {
            Ok(start) => start,
            Err(e) => {
                tracing::warn!(error = %e, "store watcher could not open database");
                return;
            }
        };
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("phaseclock-kv-watch".into())
            .spawn(move || watch(&conn, &shared, revision));
        match spawned {
            Ok(handle) => *watcher = Some(handle),
            Err(e) => tracing::warn!(error = %e, "failed to start store watcher"),
        }
    }
}

impl KeyValueStore for SqliteStore {
    fn context_id(&self) -> ContextId {
        self.context
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn()?
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()?;
        Ok(value.flatten())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write(key, Some(value))
    }

    /// Removal leaves a tombstone so other processes can observe it.
    fn remove(&self, key: &str) -> Result<(), StoreError> {
        if self.get(key)?.is_none() {
            return Ok(());
        }
        self.write(key, None)
    }

    fn subscribe(&self, key: &str) -> Subscription {
        let subscription = self.shared.subscribers.add(key, self.context);
        self.ensure_watcher();
        subscription
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(handle) = watcher.take() {
                let _ = handle.join();
            }
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path).map_err(|source| StoreError::OpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            key       TEXT PRIMARY KEY,
            value     TEXT,
            writer    TEXT NOT NULL DEFAULT '',
            revision  INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_kv_revision ON kv(revision);",
    )
}

fn max_revision(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("SELECT COALESCE(MAX(revision), 0) FROM kv", [], |row| row.get(0))?)
}

fn data_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA data_version", [], |row| row.get(0))?)
}

/// Watcher loop: forward rows written after `last_revision`.
///
/// The first pass always queries: a write between the baseline and the first
/// `data_version` sample does not show up as a version change.
fn watch(conn: &Connection, shared: &Shared, mut last_revision: i64) {
    let mut last_version = None;
    while !shared.stop.load(Ordering::SeqCst) {
        std::thread::sleep(WATCH_INTERVAL);

        let version = match data_version(conn) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "data_version query failed");
                continue;
            }
        };
        if last_version == Some(version) {
            continue;
        }
        last_version = Some(version);

        match changed_rows(conn, last_revision) {
            Ok(rows) => {
                // Sampled after the query so a key subscribed mid-pass is kept.
                let keys = shared.subscribers.keys();
                for (key, value, writer, revision) in rows {
                    last_revision = last_revision.max(revision);
                    if !keys.contains(&key) {
                        continue;
                    }
                    let Some(origin) = ContextId::parse(&writer) else {
                        continue;
                    };
                    shared.subscribers.publish(&StoreChange {
                        key,
                        new_value: value,
                        origin,
                    });
                }
            }
            Err(e) => tracing::debug!(error = %e, "store watcher query failed"),
        }
    }
}

type ChangedRow = (String, Option<String>, String, i64);

fn changed_rows(conn: &Connection, since: i64) -> Result<Vec<ChangedRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT key, value, writer, revision FROM kv WHERE revision > ?1 ORDER BY revision",
    )?;
    let rows = stmt.query_map(params![since], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    })?;
    rows.collect()
}
