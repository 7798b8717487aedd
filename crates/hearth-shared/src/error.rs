use thiserror::Error;

use crate::types::{RoomId, UserId};

// Malformed input, wrong key length and tag mismatch all collapse into the
// same variant so callers cannot tell which check failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key: expected 32 bytes of Base64")]
    InvalidKey,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("No encryption key for room {0}")]
    KeyNotFound(RoomId),

    #[error("User {user} has no key access for room {room}")]
    AccessDenied { room: RoomId, user: UserId },

    #[error("Room {0} already has an active key, rotate it instead")]
    KeyExists(RoomId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Message not found")]
    MessageNotFound,

    #[error("Message has expired")]
    MessageExpired,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Scheduled message not found")]
    NotFound,

    #[error("User is not the owner of this scheduled message")]
    NotOwner,

    #[error("Only pending scheduled messages can be modified")]
    NotPending,

    #[error("Scheduled message is not due yet")]
    ScheduleNotDue,

    #[error("Retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    #[error("Invalid recurrence pattern: {0}")]
    InvalidRecurrence(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Filter already exists")]
    FilterExists,

    #[error("Filter not found or access denied")]
    NotFound,

    #[error("Filter content must not be empty")]
    EmptyContent,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("No subscribers for room {0}")]
    NoSubscribers(RoomId),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}
