/// AES-256-GCM IV size in bytes (96 bits)
pub const IV_SIZE: usize = 12;

/// AES-256-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (256 bits)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Hex characters kept from the BLAKE3 key fingerprint
pub const KEY_FINGERPRINT_LEN: usize = 16;

/// BLAKE3 derive-key context for key fingerprints
pub const KDF_CONTEXT_KEY_FINGERPRINT: &str = "hearth-key-fingerprint-v1";

/// Number of key versions retained per room (current + previous)
pub const DEFAULT_KEY_HISTORY_DEPTH: usize = 2;

/// Maximum message content length in characters
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// Delivery attempts before a scheduled message is marked failed
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay before a failed scheduled message is re-attempted
pub const DEFAULT_RETRY_DELAY_SECS: i64 = 300;

/// How long past `scheduled_for` a never-attempted message may sit before it expires
pub const DEFAULT_EXPIRY_GRACE_SECS: i64 = 3_600;

/// A `PROCESSING` claim older than this is considered abandoned
pub const DEFAULT_CLAIM_TIMEOUT_SECS: i64 = 600;

/// Maximum scheduled messages claimed per poll
pub const DEFAULT_DISPATCH_BATCH_SIZE: u32 = 100;

/// Dispatcher poll interval
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Ephemeral / expiry sweep interval
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Terminal scheduled messages older than this are purged
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Per-subscriber buffer for in-process room fan-out
pub const DEFAULT_FANOUT_BUFFER: usize = 256;

/// Presentation marker shown in place of filtered content
pub const FILTERED_MARKER: &str = "[filtered]";
