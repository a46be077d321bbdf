use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use super::locks::LockRegistry;

/// Pending writes a single path's writer will buffer before `exec` blocks.
pub const WRITE_QUEUE_CAPACITY: usize = 100;
/// How long a statement waits on a locked database file.
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// One result row: column name and value, in select order.
pub type Row = Vec<(String, SqlValue)>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("storage writer stopped")]
    WriterStopped,

    #[error("connection closed")]
    Closed,
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

struct WriteOp {
    sql: String,
    params: Vec<SqlValue>,
    reply: oneshot::Sender<Result<usize, StorageError>>,
}

/// Hands out [`StorageConnection`]s and owns one writer per storage path.
///
/// Writers are started on the first `connect` for a path and run until every
/// sender for that path is dropped, which for a pool owned by the server means
/// the process lifetime.
pub struct StoragePool {
    data_dir: PathBuf,
    locks: Arc<LockRegistry>,
    writers: Mutex<HashMap<PathBuf, mpsc::Sender<WriteOp>>>,
}

impl StoragePool {
    pub fn new(data_dir: impl Into<PathBuf>, locks: Arc<LockRegistry>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locks,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Maps a script-supplied path to a file under the data directory.
    ///
    /// Absolute paths and `..` components are rejected.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.trim().is_empty() || escapes || relative.file_name().is_none() {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        let normalized: PathBuf = relative
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        Ok(self.data_dir.join(normalized))
    }

    /// Binds a connection to `path`, starting its writer if needed.
    pub fn connect(&self, path: &str) -> Result<StorageConnection, StorageError> {
        let path = self.resolve(path)?;
        let lock = self.locks.lock_for(&path);

        let writer = {
            let mut writers = self
                .writers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match writers.get(&path) {
                Some(tx) if !tx.is_closed() => tx.clone(),
                _ => {
                    let tx = spawn_writer(path.clone(), lock.clone())?;
                    writers.insert(path.clone(), tx.clone());
                    tx
                }
            }
        };

        Ok(StorageConnection {
            path,
            lock,
            writer: Some(writer),
        })
    }

    /// Number of paths with a running writer.
    pub fn writer_count(&self) -> usize {
        self.writers
            .lock()
            .map(|writers| writers.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }
}

/// A script's handle on one storage path.
pub struct StorageConnection {
    path: PathBuf,
    lock: Arc<RwLock<()>>,
    writer: Option<mpsc::Sender<WriteOp>>,
}

impl StorageConnection {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Queues a mutating statement on the path's writer.
    ///
    /// Blocks only while the queue is full.
    pub fn exec(&self, sql: &str, params: Vec<SqlValue>) -> Result<PendingWrite, StorageError> {
        let writer = self.writer.as_ref().ok_or(StorageError::Closed)?;
        let (reply, rx) = oneshot::channel();
        writer
            .blocking_send(WriteOp {
                sql: sql.to_string(),
                params,
                reply,
            })
            .map_err(|_| StorageError::WriterStopped)?;
        Ok(PendingWrite::new(rx))
    }

    /// Runs a read under the path's shared lock.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let _shared = self.lock.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        run_query(&conn, sql, params)
    }

    /// Detaches this handle. The path's writer keeps running.
    pub fn close(&mut self) {
        self.writer = None;
    }
}

/// Completion handle for a queued write.
pub struct PendingWrite {
    rx: Option<oneshot::Receiver<Result<usize, StorageError>>>,
    outcome: Option<Result<usize, StorageError>>,
}

impl PendingWrite {
    fn new(rx: oneshot::Receiver<Result<usize, StorageError>>) -> Self {
        Self {
            rx: Some(rx),
            outcome: None,
        }
    }

    /// Blocks until the writer has applied the statement.
    pub fn wait(&mut self) -> Result<usize, StorageError> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.rx.take() {
            Some(rx) => rx.blocking_recv().unwrap_or(Err(StorageError::WriterStopped)),
            None => Err(StorageError::WriterStopped),
        };
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Returns the outcome if the writer has finished, without blocking.
    pub fn check(&mut self) -> Option<Result<usize, StorageError>> {
        if self.outcome.is_none() {
            if let Some(rx) = self.rx.as_mut() {
                match rx.try_recv() {
                    Ok(outcome) => self.outcome = Some(outcome),
                    Err(TryRecvError::Empty) => return None,
                    Err(TryRecvError::Closed) => {
                        self.outcome = Some(Err(StorageError::WriterStopped))
                    }
                }
                self.rx = None;
            }
        }
        self.outcome.clone()
    }

    pub fn is_done(&mut self) -> bool {
        self.check().is_some()
    }
}

fn spawn_writer(
    path: PathBuf,
    lock: Arc<RwLock<()>>,
) -> Result<mpsc::Sender<WriteOp>, StorageError> {
    let (tx, mut rx) = mpsc::channel::<WriteOp>(WRITE_QUEUE_CAPACITY);
    let name = format!(
        "storage-writer:{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );

    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            tracing::debug!(path = %path.display(), "storage writer started");
            let mut conn: Option<Connection> = None;
            while let Some(op) = rx.blocking_recv() {
                let outcome = apply_write(&path, &lock, &mut conn, &op.sql, &op.params);
                if let Err(e) = &outcome {
                    tracing::warn!(path = %path.display(), error = %e, "storage write failed");
                }
                let _ = op.reply.send(outcome);
            }
            tracing::debug!(path = %path.display(), "storage writer stopped");
        })
        .map_err(|e| StorageError::Database(format!("failed to start writer: {e}")))?;

    Ok(tx)
}

fn apply_write(
    path: &Path,
    lock: &RwLock<()>,
    conn: &mut Option<Connection>,
    sql: &str,
    params: &[SqlValue],
) -> Result<usize, StorageError> {
    let _exclusive = lock.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    let db = match conn.take() {
        Some(db) => db,
        None => open_for_writes(path)?,
    };
    let affected = db.execute(sql, params_from_iter(params.iter()));
    *conn = Some(db);
    Ok(affected?)
}

fn open_for_writes(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StorageError::Database(format!("{}: {e}", parent.display())))?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Vec::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            record.push((name.clone(), row.get::<_, SqlValue>(idx)?));
        }
        out.push(record);
    }
    Ok(out)
}
