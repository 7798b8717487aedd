use serde::{Deserialize, Serialize};

// Room and user identities are assigned by the surrounding chat service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoomId(pub i64);

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Implements `as_str` / `parse` for a fieldless enum stored as TEXT.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Location,
    Contact,
    Story,
    Memory,
    Event,
    System,
    Notification,
    Poll,
    Sticker,
    Gif,
}

text_enum!(MessageType {
    Text => "TEXT",
    Image => "IMAGE",
    Video => "VIDEO",
    Audio => "AUDIO",
    Document => "DOCUMENT",
    Location => "LOCATION",
    Contact => "CONTACT",
    Story => "STORY",
    Memory => "MEMORY",
    Event => "EVENT",
    System => "SYSTEM",
    Notification => "NOTIFICATION",
    Poll => "POLL",
    Sticker => "STICKER",
    Gif => "GIF",
});

impl MessageType {
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::Document | Self::Gif | Self::Sticker
        )
    }

    pub fn is_family_specific(&self) -> bool {
        matches!(self, Self::Story | Self::Memory | Self::Event)
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System | Self::Notification)
    }

    pub fn is_text_based(&self) -> bool {
        matches!(self, Self::Text | Self::Story | Self::Memory | Self::Event)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterType {
    Word,
    Emoji,
    Phrase,
}

text_enum!(FilterType {
    Word => "WORD",
    Emoji => "EMOJI",
    Phrase => "PHRASE",
});

/// Who a filter rule belongs to and which messages it applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FilterScope {
    /// Receiver's blanket rule.
    Global { user: UserId },
    /// Receiver's rule about one specific sender.
    Contact { user: UserId, contact: UserId },
    /// Room-wide rule set by a room admin.
    Room { room: RoomId },
}

impl FilterScope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Global { .. } => "GLOBAL",
            Self::Contact { .. } => "CONTACT",
            Self::Room { .. } => "ROOM",
        }
    }
}

/// Presentation outcome of filter resolution. Never an error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterStatus {
    Filtered,
    Allowed,
    /// Rules matched but the requester is the sender and sees the canonical content.
    Overridden,
}

text_enum!(FilterStatus {
    Filtered => "FILTERED",
    Allowed => "ALLOWED",
    Overridden => "OVERRIDDEN",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduledStatus {
    Pending,
    /// Claimed by a dispatcher worker; never visible for longer than one attempt.
    Processing,
    Sent,
    Failed,
    Cancelled,
    Expired,
}

text_enum!(ScheduledStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Sent => "SENT",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
    Expired => "EXPIRED",
});

impl ScheduledStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled | Self::Expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enum_parse_matches_as_str() {
        for status in [
            ScheduledStatus::Pending,
            ScheduledStatus::Processing,
            ScheduledStatus::Sent,
            ScheduledStatus::Failed,
            ScheduledStatus::Cancelled,
            ScheduledStatus::Expired,
        ] {
            assert_eq!(ScheduledStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FilterType::parse("EMOJI"), Some(FilterType::Emoji));
        assert_eq!(MessageType::parse("nope"), None);
    }

    #[test]
    fn test_message_type_predicates() {
        assert!(MessageType::Gif.is_media());
        assert!(MessageType::Memory.is_family_specific());
        assert!(MessageType::Memory.is_text_based());
        assert!(MessageType::Notification.is_system());
        assert!(!MessageType::Text.is_media());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ScheduledStatus::Pending.is_terminal());
        assert!(!ScheduledStatus::Processing.is_terminal());
        assert!(ScheduledStatus::Failed.is_terminal());
        assert!(ScheduledStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&RoomId(42)).unwrap();
        assert_eq!(json, "42");
    }
}
