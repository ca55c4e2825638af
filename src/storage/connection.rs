//! SQLite connection management.
//!
//! One writer connection behind a mutex plus a small pool of reader
//! connections. In WAL mode readers see the last committed snapshot and never
//! observe a transaction in progress. In-memory databases cannot share data
//! across connections, so they route reads through the writer.

use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::config::DatabaseLocation;

use super::error::{StoreError, StoreResult};
use super::schema;

const READER_COUNT: usize = 4;
const BUSY_TIMEOUT_MS: u32 = 5_000;

struct Readers {
    sender: Sender<Connection>,
    receiver: Receiver<Connection>,
}

/// Thread-safe SQLite connection set.
#[derive(Clone)]
pub struct SqlitePool {
    writer: Arc<Mutex<Connection>>,
    readers: Option<Arc<Readers>>,
}

impl SqlitePool {
    pub fn open(location: &DatabaseLocation) -> StoreResult<Self> {
        match location {
            DatabaseLocation::Memory => Self::memory(),
            DatabaseLocation::File(path) => Self::file(path),
        }
    }

    /// Private in-memory database for tests and one-shot runs.
    pub fn memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn, false)?;
        schema::apply_migrations(&conn)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: None,
        })
    }

    pub fn file(path: &Path) -> StoreResult<Self> {
        tracing::info!(target: "storage", "opening database {}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let writer = Connection::open(path)?;
        configure(&writer, true)?;
        schema::apply_migrations(&writer)?;

        let (sender, receiver) = bounded(READER_COUNT);
        for _ in 0..READER_COUNT {
            let reader = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            configure(&reader, false)?;
            sender
                .send(reader)
                .map_err(|_| StoreError::Connection("reader pool closed".to_string()))?;
        }

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Some(Arc::new(Readers { sender, receiver })),
        })
    }

    /// Execute a closure with a read connection.
    pub fn with_reader<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let Some(readers) = &self.readers else {
            let conn = self.writer.lock();
            return f(&conn);
        };

        let conn = readers
            .receiver
            .recv()
            .map_err(|_| StoreError::Connection("reader pool closed".to_string()))?;
        let result = f(&conn);
        // Sender and receiver live in the same struct; send cannot fail while we hold it
        let _ = readers.sender.send(conn);
        result
    }

    /// Execute a closure with the writer connection.
    pub fn with_writer<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T>,
    {
        let mut conn = self.writer.lock();
        f(&mut conn)
    }
}

fn configure(conn: &Connection, writer: bool) -> StoreResult<()> {
    if writer {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    }
    conn.execute_batch(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"))?;
    conn.execute_batch("PRAGMA temp_store = MEMORY;")?;
    Ok(())
}
