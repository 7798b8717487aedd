//! # hearth-store
//!
//! Local SQLite persistence for the Hearth engine: delivered messages with
//! their ephemeral state, scheduled messages, and filter rules.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every record.
//! State transitions that must be exclusive (view admission, dispatcher
//! claims) are single `UPDATE ... RETURNING` statements.

pub mod database;
pub mod filters;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod scheduled;

mod error;

pub use database::{Database, SharedDatabase};
pub use error::{Result, StoreError};
pub use models::*;
