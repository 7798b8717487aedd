//! # hearth-core
//!
//! The messaging engine behind Hearth rooms.
//!
//! - [`keys::KeyManager`]: per-room AES-256-GCM keys, rotation and access
//! - [`filter::FilterEngine`]: global, contact and room content filters
//! - [`ephemeral::EphemeralLifecycle`]: view limits and self-destruct
//! - [`pipeline::MessageService`]: the send and view paths
//! - [`dispatcher::ScheduledDispatcher`]: deferred and recurring sends
//!
//! Outbound traffic leaves through the [`delivery::Delivery`] trait;
//! [`delivery::RoomFanout`] is the in-process implementation.

pub mod delivery;
pub mod dispatcher;
pub mod ephemeral;
pub mod error;
pub mod filter;
pub mod keys;
pub mod pipeline;

pub use delivery::{Delivery, RoomFanout};
pub use dispatcher::{DispatcherConfig, ScheduledDispatcher};
pub use error::{HearthError, Result};
pub use keys::KeyManager;
pub use pipeline::{MessageService, MessageServiceConfig};
