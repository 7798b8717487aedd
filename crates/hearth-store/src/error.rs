use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No platform data directory to place `hearth.db` in.
    #[error("No data directory available for the Hearth database")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The addressed message, scheduled message or filter rule does not exist.
    #[error("Record not found")]
    NotFound,

    #[error("Schema migration failed: {0}")]
    Migration(String),

    /// A thread panicked while holding the shared connection.
    #[error("Shared database lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;
