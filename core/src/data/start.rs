//! Database initialization and startup
//!
//! Opens the SQLite database and ensures all required tables exist. The
//! persistence adapter owns the only connection; every access goes through
//! the functions of the `data` module.

use std::path::Path;

use rusqlite::Connection;

use super::schema::create_all_tables;

/// Error type for database startup
#[derive(Debug)]
pub enum StartError {
    /// The parent directory of the database could not be created
    Io(std::io::Error),
    /// SQLite error
    Database(rusqlite::Error),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Io(e) => write!(f, "state directory error: {}", e),
            StartError::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for StartError {}

impl From<rusqlite::Error> for StartError {
    fn from(e: rusqlite::Error) -> Self {
        StartError::Database(e)
    }
}

impl From<std::io::Error> for StartError {
    fn from(e: std::io::Error) -> Self {
        StartError::Io(e)
    }
}

/// Opens the database and ensures all required tables exist
///
/// # Arguments
/// * `db_path` - Path to the database file, parent directories are created
///
/// # Errors
/// - `StartError::Io` when the parent directory cannot be created
/// - `StartError::Database` for SQLite errors
pub fn start_db(db_path: &Path) -> Result<Connection, StartError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;

    // PRAGMA returns the new mode, so we use query_row instead of execute
    let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

    conn.execute("PRAGMA foreign_keys = ON", [])?;

    // Schema creation is idempotent (`CREATE TABLE IF NOT EXISTS`), so always
    // run it to recover cleanly from partially initialized databases.
    create_all_tables(&conn)?;

    Ok(conn)
}

/// Create an in-memory database for testing
pub fn start_memory_db() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    // Note: WAL mode doesn't work with in-memory databases, skip it
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_all_tables(&conn)?;
    Ok(conn)
}
