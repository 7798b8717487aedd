use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hearth_shared::constants::DEFAULT_FANOUT_BUFFER;
use hearth_shared::error::DeliveryError;
use hearth_shared::protocol::{DeliveryEnvelope, Notification};
use hearth_shared::types::{RoomId, UserId};

/// Transport collaborator that receives outbound messages and lifecycle
/// notifications. The core never waits on it beyond one call.
pub trait Delivery: Send + Sync {
    fn deliver(&self, envelope: DeliveryEnvelope) -> Result<(), DeliveryError>;

    fn notify(&self, notification: Notification);
}

struct FanoutRoom {
    room: RoomId,
    subscribers: HashMap<UserId, mpsc::Sender<DeliveryEnvelope>>,
}

impl FanoutRoom {
    fn new(room: RoomId) -> Self {
        Self {
            room,
            subscribers: HashMap::new(),
        }
    }

    /// Push to everyone except the sender. Full queues drop the envelope;
    /// closed queues are pruned.
    fn route(&mut self, envelope: &DeliveryEnvelope) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (user, tx) in &self.subscribers {
            if *user == envelope.sender {
                continue;
            }
            match tx.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(
                        room = %self.room,
                        target = %user,
                        "dropping envelope for slow subscriber"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*user),
            }
        }

        for user in closed {
            self.subscribers.remove(&user);
        }
        delivered
    }
}

/// In-process per-room fan-out over bounded channels.
pub struct RoomFanout {
    buffer: usize,
    rooms: RwLock<HashMap<RoomId, FanoutRoom>>,
    watchers: RwLock<Vec<mpsc::Sender<Notification>>>,
}

impl RoomFanout {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            rooms: RwLock::new(HashMap::new()),
            watchers: RwLock::new(Vec::new()),
        }
    }

    /// Join a room (creating it if missing). Returns the envelope receiver.
    pub fn subscribe(
        &self,
        room: RoomId,
        user: UserId,
    ) -> Result<mpsc::Receiver<DeliveryEnvelope>, DeliveryError> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut rooms = self.rooms.write().map_err(|_| poisoned())?;
        let entry = rooms.entry(room).or_insert_with(|| FanoutRoom::new(room));
        entry.subscribers.insert(user, tx);

        info!(
            room = %room,
            user = %user,
            subscribers = entry.subscribers.len(),
            "subscriber joined room"
        );
        Ok(rx)
    }

    /// Leave a room. Empty rooms are removed.
    pub fn unsubscribe(&self, room: RoomId, user: UserId) -> Result<(), DeliveryError> {
        let mut rooms = self.rooms.write().map_err(|_| poisoned())?;
        let should_remove = match rooms.get_mut(&room) {
            Some(entry) => {
                entry.subscribers.remove(&user);
                entry.subscribers.is_empty()
            }
            None => false,
        };

        if should_remove {
            rooms.remove(&room);
            info!(room = %room, "removed empty room");
        }
        Ok(())
    }

    pub fn subscriber_count(&self, room: RoomId) -> usize {
        self.rooms
            .read()
            .map(|rooms| rooms.get(&room).map_or(0, |r| r.subscribers.len()))
            .unwrap_or(0)
    }

    pub fn watch_notifications(&self) -> Result<mpsc::Receiver<Notification>, DeliveryError> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.watchers.write().map_err(|_| poisoned())?.push(tx);
        Ok(rx)
    }
}

impl Default for RoomFanout {
    fn default() -> Self {
        Self::new(DEFAULT_FANOUT_BUFFER)
    }
}

impl Delivery for RoomFanout {
    fn deliver(&self, envelope: DeliveryEnvelope) -> Result<(), DeliveryError> {
        let room = envelope.room;
        let mut rooms = self.rooms.write().map_err(|_| poisoned())?;

        let Some(entry) = rooms.get_mut(&room) else {
            warn!(room = %room, "no subscribers for room");
            return Err(DeliveryError::NoSubscribers(room));
        };

        let delivered = entry.route(&envelope);
        if entry.subscribers.is_empty() {
            rooms.remove(&room);
            warn!(room = %room, "no subscribers for room");
            return Err(DeliveryError::NoSubscribers(room));
        }

        debug!(
            room = %room,
            message = %envelope.message_id,
            delivered,
            "envelope routed"
        );
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        let Ok(mut watchers) = self.watchers.write() else {
            warn!("notification watchers unavailable");
            return;
        };
        watchers.retain(|tx| match tx.try_send(notification.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

fn poisoned() -> DeliveryError {
    DeliveryError::Unavailable("fan-out state poisoned".into())
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hearth_shared::protocol::DeliveryPayload;
    use hearth_shared::types::{FilterStatus, MessageType};
    use uuid::Uuid;

    fn envelope(room: RoomId, sender: UserId) -> DeliveryEnvelope {
        DeliveryEnvelope {
            message_id: Uuid::new_v4(),
            room,
            sender,
            message_type: MessageType::Text,
            payload: DeliveryPayload::Plaintext("hi".into()),
            filter_status: FilterStatus::Allowed,
            screenshot_protection: false,
            scheduled_id: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe() {
        let fanout = RoomFanout::default();
        let _rx = fanout.subscribe(RoomId(1), UserId(1)).unwrap();
        assert_eq!(fanout.subscriber_count(RoomId(1)), 1);

        fanout.unsubscribe(RoomId(1), UserId(1)).unwrap();
        assert_eq!(fanout.subscriber_count(RoomId(1)), 0);
    }

    #[tokio::test]
    async fn test_routing_skips_sender() {
        let fanout = RoomFanout::default();
        let mut sender_rx = fanout.subscribe(RoomId(1), UserId(1)).unwrap();
        let mut receiver_rx = fanout.subscribe(RoomId(1), UserId(2)).unwrap();

        let env = envelope(RoomId(1), UserId(1));
        fanout.deliver(env.clone()).unwrap();

        assert_eq!(receiver_rx.recv().await.unwrap(), env);
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_room_is_an_error() {
        let fanout = RoomFanout::default();
        assert_eq!(
            fanout.deliver(envelope(RoomId(9), UserId(1))),
            Err(DeliveryError::NoSubscribers(RoomId(9)))
        );

        let rx = fanout.subscribe(RoomId(9), UserId(2)).unwrap();
        drop(rx);
        assert_eq!(
            fanout.deliver(envelope(RoomId(9), UserId(1))),
            Err(DeliveryError::NoSubscribers(RoomId(9)))
        );
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_frames() {
        let fanout = RoomFanout::new(1);
        let mut rx = fanout.subscribe(RoomId(1), UserId(2)).unwrap();

        fanout.deliver(envelope(RoomId(1), UserId(1))).unwrap();
        fanout.deliver(envelope(RoomId(1), UserId(1))).unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notifications_reach_watchers() {
        let fanout = RoomFanout::default();
        let mut rx = fanout.watch_notifications().unwrap();
        let n = Notification::ViewLimitReached {
            message_id: Uuid::new_v4(),
            sender: UserId(3),
        };
        fanout.notify(n.clone());
        assert_eq!(rx.recv().await.unwrap(), n);
    }
}
