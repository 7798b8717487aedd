//! # hearth-shared
//!
//! Types shared by every Hearth crate: identifiers and enums, the error
//! taxonomy, AES-256-GCM message protection, recurrence rules and the
//! delivery envelope handed to the transport layer.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod recurrence;
pub mod types;
