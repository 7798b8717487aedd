//! Per-room key lifecycle and access control.
//!
//! Each room moves through `NO_KEY -> ACTIVE(1) -> ACTIVE(n) -> REVOKED`.
//! All reads and writes for one room go through that room's mutex, so a
//! reader racing a rotation sees either the old or the new key, never a mix
//! of the two. Different rooms never contend with each other beyond the
//! brief map lookup.
//!
//! Keys live in memory only and are logged by fingerprint.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use hearth_shared::constants::DEFAULT_KEY_HISTORY_DEPTH;
use hearth_shared::crypto::{self, Key};
use hearth_shared::error::KeyError;
use hearth_shared::types::{RoomId, UserId};

#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// How many key versions (current included) stay decryptable.
    pub history_depth: usize,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            history_depth: DEFAULT_KEY_HISTORY_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomKeyState {
    NoKey,
    Active { version: u32 },
    Revoked,
}

/// A key together with the version it was issued as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomKey {
    pub version: u32,
    pub key: Key,
}

#[derive(Default)]
struct RoomKeyring {
    /// Oldest first; the back is the current key.
    keys: VecDeque<RoomKey>,
    access: HashSet<UserId>,
    revoked: bool,
    last_version: u32,
}

impl RoomKeyring {
    fn state(&self) -> RoomKeyState {
        match self.keys.back() {
            Some(current) => RoomKeyState::Active {
                version: current.version,
            },
            None if self.revoked => RoomKeyState::Revoked,
            None => RoomKeyState::NoKey,
        }
    }

    fn current(&self, room: RoomId) -> Result<&RoomKey, KeyError> {
        self.keys.back().ok_or(KeyError::KeyNotFound(room))
    }

    fn check_access(&self, room: RoomId, user: UserId) -> Result<(), KeyError> {
        if self.revoked || !self.access.contains(&user) {
            warn!(room = %room, user = %user, "key access denied");
            return Err(KeyError::AccessDenied { room, user });
        }
        Ok(())
    }

    /// Mutations other than generation need a live key and an initiator
    /// who holds access to it.
    fn check_mutation(&self, room: RoomId, initiator: UserId) -> Result<(), KeyError> {
        if self.revoked {
            return Err(KeyError::AccessDenied {
                room,
                user: initiator,
            });
        }
        self.current(room)?;
        self.check_access(room, initiator)
    }
}

pub struct KeyManager {
    config: KeyManagerConfig,
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<RoomKeyring>>>>,
}

impl KeyManager {
    pub fn new(config: KeyManagerConfig) -> Self {
        Self {
            config: KeyManagerConfig {
                history_depth: config.history_depth.max(1),
            },
            rooms: RwLock::new(HashMap::new()),
        }
    }

    async fn keyring(&self, room: RoomId) -> Option<Arc<Mutex<RoomKeyring>>> {
        self.rooms.read().await.get(&room).cloned()
    }

    async fn keyring_or_default(&self, room: RoomId) -> Arc<Mutex<RoomKeyring>> {
        if let Some(ring) = self.keyring(room).await {
            return ring;
        }
        self.rooms.write().await.entry(room).or_default().clone()
    }

    /// Create the first key for a room (or re-provision a revoked one) and
    /// grant the creator access in the same step.
    pub async fn generate_room_key(&self, room: RoomId, creator: UserId) -> Result<Key, KeyError> {
        let ring = self.keyring_or_default(room).await;
        let mut ring = ring.lock().await;

        if !ring.keys.is_empty() {
            return Err(KeyError::KeyExists(room));
        }

        let version = ring.last_version + 1;
        let key = crypto::generate_key();

        ring.keys.push_back(RoomKey {
            version,
            key: key.clone(),
        });
        ring.access.clear();
        ring.access.insert(creator);
        ring.revoked = false;
        ring.last_version = version;

        info!(
            room = %room,
            creator = %creator,
            key_id = %key.fingerprint(),
            version,
            "room key generated"
        );

        Ok(key)
    }

    pub async fn get_room_key(&self, room: RoomId, user: UserId) -> Result<Key, KeyError> {
        Ok(self.current_room_key(room, user).await?.key)
    }

    /// Current key plus its version, for callers that stamp ciphertext.
    pub async fn current_room_key(&self, room: RoomId, user: UserId) -> Result<RoomKey, KeyError> {
        let ring = self.keyring(room).await.ok_or(KeyError::KeyNotFound(room))?;
        let ring = ring.lock().await;

        // A revoked room has no key, but callers must see a denial.
        if ring.revoked {
            warn!(room = %room, user = %user, "key request for revoked room");
            return Err(KeyError::AccessDenied { room, user });
        }
        let current = ring.current(room)?.clone();
        ring.check_access(room, user)?;
        Ok(current)
    }

    /// A retained historical key, for ciphertext stamped before a rotation.
    pub async fn get_room_key_version(
        &self,
        room: RoomId,
        user: UserId,
        version: u32,
    ) -> Result<Key, KeyError> {
        let ring = self.keyring(room).await.ok_or(KeyError::KeyNotFound(room))?;
        let ring = ring.lock().await;

        ring.check_access(room, user)?;
        ring.keys
            .iter()
            .find(|k| k.version == version)
            .map(|k| k.key.clone())
            .ok_or(KeyError::KeyNotFound(room))
    }

    /// Replace the room key; membership is untouched. Keys beyond the
    /// history depth are dropped and can no longer decrypt.
    pub async fn rotate_room_key(&self, room: RoomId, initiator: UserId) -> Result<Key, KeyError> {
        let ring = self.keyring(room).await.ok_or(KeyError::KeyNotFound(room))?;
        let mut ring = ring.lock().await;

        ring.check_mutation(room, initiator)?;

        let version = ring.last_version + 1;
        let key = crypto::generate_key();
        ring.keys.push_back(RoomKey {
            version,
            key: key.clone(),
        });
        ring.last_version = version;
        while ring.keys.len() > self.config.history_depth {
            ring.keys.pop_front();
        }

        info!(
            room = %room,
            initiator = %initiator,
            key_id = %key.fingerprint(),
            version,
            retained = ring.keys.len(),
            "room key rotated"
        );

        Ok(key)
    }

    pub async fn add_user_to_key_access(
        &self,
        room: RoomId,
        initiator: UserId,
        user: UserId,
    ) -> Result<(), KeyError> {
        let ring = self.keyring(room).await.ok_or(KeyError::KeyNotFound(room))?;
        let mut ring = ring.lock().await;

        ring.check_mutation(room, initiator)?;
        if ring.access.insert(user) {
            debug!(room = %room, user = %user, "key access granted");
        }
        Ok(())
    }

    /// Drops the grant only; the key stays.
    pub async fn remove_user_from_key_access(
        &self,
        room: RoomId,
        initiator: UserId,
        user: UserId,
    ) -> Result<(), KeyError> {
        let ring = self.keyring(room).await.ok_or(KeyError::KeyNotFound(room))?;
        let mut ring = ring.lock().await;

        ring.check_mutation(room, initiator)?;
        if ring.access.remove(&user) {
            debug!(room = %room, user = %user, "key access removed");
        }
        Ok(())
    }

    pub async fn has_key_access(&self, room: RoomId, user: UserId) -> bool {
        match self.keyring(room).await {
            Some(ring) => {
                let ring = ring.lock().await;
                !ring.revoked && ring.access.contains(&user)
            }
            None => false,
        }
    }

    pub async fn users_with_key_access(&self, room: RoomId) -> Vec<UserId> {
        let Some(ring) = self.keyring(room).await else {
            return Vec::new();
        };
        let ring = ring.lock().await;
        let mut users: Vec<UserId> = ring.access.iter().copied().collect();
        users.sort();
        users
    }

    /// Clear every grant and discard all key material. Only a fresh
    /// `generate_room_key` brings the room back.
    pub async fn revoke_all_key_access(&self, room: RoomId, initiator: UserId) -> Result<(), KeyError> {
        let ring = self.keyring(room).await.ok_or(KeyError::KeyNotFound(room))?;
        let mut ring = ring.lock().await;

        ring.check_mutation(room, initiator)?;

        let cleared = ring.access.len();
        ring.access.clear();
        ring.keys.clear();
        ring.revoked = true;

        warn!(
            room = %room,
            initiator = %initiator,
            cleared,
            "all key access revoked"
        );

        Ok(())
    }

    pub async fn room_state(&self, room: RoomId) -> RoomKeyState {
        match self.keyring(room).await {
            Some(ring) => ring.lock().await.state(),
            None => RoomKeyState::NoKey,
        }
    }
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new(KeyManagerConfig::default())
    }
}
