//! Multi-scope content filtering.
//!
//! Rule sets are checked in a fixed order: ROOM, then CONTACT (the
//! receiver's rules about this sender), then GLOBAL (the receiver's blanket
//! rules). Any active match in any scope blocks the message. Filtering only
//! decides presentation; stored content is never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use hearth_shared::error::FilterError;
use hearth_shared::types::{FilterScope, FilterStatus, FilterType, RoomId, UserId};
use hearth_store::{FilterRule, SharedDatabase};

use crate::error::Result;

/// Outcome of a filter check plus the rules that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDecision {
    pub status: FilterStatus,
    pub matched: Vec<FilterRule>,
}

#[derive(Clone)]
pub struct FilterEngine {
    db: SharedDatabase,
}

impl FilterEngine {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    // ---- Resolution ----

    pub fn should_filter_message(
        &self,
        sender: UserId,
        receiver: UserId,
        room: Option<RoomId>,
        content: &str,
    ) -> Result<bool> {
        if content.trim().is_empty() {
            return Ok(false);
        }

        for scope in precedence(sender, receiver, room) {
            let rules = self.db.with(|db| db.list_active_filters(&scope))?;
            if let Some(rule) = rules.iter().find(|r| rule_matches(r, content)) {
                debug!(
                    scope = scope.kind(),
                    rule = %rule.id,
                    receiver = %receiver,
                    "message filtered"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every active rule that matches, in precedence order.
    pub fn applicable_filters(
        &self,
        sender: UserId,
        receiver: UserId,
        room: Option<RoomId>,
        content: &str,
    ) -> Result<Vec<FilterRule>> {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut matched = Vec::new();
        for scope in precedence(sender, receiver, room) {
            let rules = self.db.with(|db| db.list_active_filters(&scope))?;
            matched.extend(rules.into_iter().filter(|r| rule_matches(r, content)));
        }
        Ok(matched)
    }

    /// Status as seen by `requester`. The sender always sees their own
    /// content, so a match is reported to them as `Overridden`.
    pub fn explain(
        &self,
        sender: UserId,
        requester: UserId,
        room: Option<RoomId>,
        content: &str,
    ) -> Result<FilterDecision> {
        let matched = self.applicable_filters(sender, requester, room, content)?;
        let status = match (matched.is_empty(), requester == sender) {
            (true, _) => FilterStatus::Allowed,
            (false, true) => FilterStatus::Overridden,
            (false, false) => FilterStatus::Filtered,
        };
        Ok(FilterDecision { status, matched })
    }

    /// Room-scope check only; independent of any receiver.
    pub fn room_filter_status(&self, room: RoomId, content: &str) -> Result<FilterStatus> {
        if content.trim().is_empty() {
            return Ok(FilterStatus::Allowed);
        }
        let rules = self
            .db
            .with(|db| db.list_active_filters(&FilterScope::Room { room }))?;
        Ok(if rules.iter().any(|r| rule_matches(r, content)) {
            FilterStatus::Filtered
        } else {
            FilterStatus::Allowed
        })
    }

    // ---- Create ----

    pub fn add_global_filter(
        &self,
        user: UserId,
        content: &str,
        filter_type: FilterType,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FilterRule> {
        self.add_filter(FilterScope::Global { user }, user, content, filter_type, description, now)
    }

    pub fn add_contact_filter(
        &self,
        user: UserId,
        contact: UserId,
        content: &str,
        filter_type: FilterType,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FilterRule> {
        self.add_filter(
            FilterScope::Contact { user, contact },
            user,
            content,
            filter_type,
            description,
            now,
        )
    }

    pub fn add_room_filter(
        &self,
        room: RoomId,
        admin: UserId,
        content: &str,
        filter_type: FilterType,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FilterRule> {
        self.add_filter(FilterScope::Room { room }, admin, content, filter_type, description, now)
    }

    /// Insert a rule, or bring back an identical deactivated one.
    fn add_filter(
        &self,
        scope: FilterScope,
        created_by: UserId,
        content: &str,
        filter_type: FilterType,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FilterRule> {
        let content = content.trim();
        if content.is_empty() {
            return Err(FilterError::EmptyContent.into());
        }

        let rule = self.db.with(|db| {
            if let Some(existing) = db.find_filter(&scope, content, filter_type)? {
                if existing.is_active {
                    return Ok(Err(FilterError::FilterExists));
                }
                db.set_filter_active(existing.id, true, now)?;
                return Ok(Ok(FilterRule {
                    is_active: true,
                    updated_at: now,
                    ..existing
                }));
            }

            let rule = FilterRule {
                id: Uuid::new_v4(),
                scope,
                content: content.to_string(),
                filter_type,
                description,
                is_active: true,
                created_by,
                created_at: now,
                updated_at: now,
            };
            db.insert_filter(&rule)?;
            Ok(Ok(rule))
        })??;

        info!(
            scope = scope.kind(),
            rule = %rule.id,
            filter_type = %rule.filter_type,
            "filter rule active"
        );
        Ok(rule)
    }

    // ---- Delete ----

    /// Soft-deactivate a rule. Only the user who owns the scope (or, for
    /// room rules, the admin who created it) may remove it.
    pub fn remove_filter(&self, owner: UserId, rule_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.db.with(|db| {
            let rule = match db.get_filter(rule_id) {
                Ok(rule) => rule,
                Err(hearth_store::StoreError::NotFound) => return Ok(Err(FilterError::NotFound)),
                Err(e) => return Err(e),
            };
            let owned = match rule.scope {
                FilterScope::Global { user } | FilterScope::Contact { user, .. } => user == owner,
                FilterScope::Room { .. } => rule.created_by == owner,
            };
            if !owned || !rule.is_active {
                return Ok(Err(FilterError::NotFound));
            }
            db.set_filter_active(rule_id, false, now)?;
            Ok(Ok(()))
        })??;

        info!(rule = %rule_id, owner = %owner, "filter rule deactivated");
        Ok(())
    }

    // ---- List ----

    pub fn list_global_filters(&self, user: UserId) -> Result<Vec<FilterRule>> {
        Ok(self
            .db
            .with(|db| db.list_active_filters(&FilterScope::Global { user }))?)
    }

    pub fn list_contact_filters(&self, user: UserId) -> Result<Vec<FilterRule>> {
        Ok(self.db.with(|db| db.list_active_contact_filters(user))?)
    }

    pub fn list_room_filters(&self, room: RoomId) -> Result<Vec<FilterRule>> {
        Ok(self
            .db
            .with(|db| db.list_active_filters(&FilterScope::Room { room }))?)
    }
}

/// Scopes to consult, highest precedence first.
fn precedence(sender: UserId, receiver: UserId, room: Option<RoomId>) -> Vec<FilterScope> {
    let mut scopes = Vec::with_capacity(3);
    if let Some(room) = room {
        scopes.push(FilterScope::Room { room });
    }
    scopes.push(FilterScope::Contact {
        user: receiver,
        contact: sender,
    });
    scopes.push(FilterScope::Global { user: receiver });
    scopes
}

pub fn rule_matches(rule: &FilterRule, content: &str) -> bool {
    rule.is_active && content_matches(rule.filter_type, &rule.content, content)
}

/// Conservative matching: a false positive is acceptable, a miss is not.
pub fn content_matches(filter_type: FilterType, needle: &str, haystack: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() || haystack.trim().is_empty() {
        return false;
    }

    match filter_type {
        FilterType::Emoji => haystack.contains(needle),
        FilterType::Phrase => haystack.to_lowercase().contains(&needle.to_lowercase()),
        FilterType::Word => contains_word(&haystack.to_lowercase(), &needle.to_lowercase()),
    }
}

// Whole-token match: the occurrence must not be glued to other word
// characters on either side. Every start offset is tried, so a glued hit
// cannot hide a clean one overlapping it.
fn contains_word(haystack: &str, word: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let idx = start + pos;
        let before = haystack[..idx].chars().next_back();
        let after = haystack[idx + word.len()..].chars().next();
        if !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char) {
            return true;
        }
        match haystack[idx..].chars().next() {
            Some(c) => start = idx + c.len_utf8(),
            None => return false,
        }
    }
    false
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_store::Database;

    const ROOM: RoomId = RoomId(5);
    const SENDER: UserId = UserId(10);
    const RECEIVER: UserId = UserId(20);
    const ADMIN: UserId = UserId(1);

    fn engine() -> (tempfile::TempDir, FilterEngine) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, FilterEngine::new(db.into_shared()))
    }

    #[test]
    fn test_word_matching_is_whole_token_and_case_insensitive() {
        assert!(content_matches(FilterType::Word, "darn", "Well DARN it"));
        assert!(content_matches(FilterType::Word, "darn", "darn!"));
        assert!(!content_matches(FilterType::Word, "darn", "darnation"));
        assert!(!content_matches(FilterType::Word, "ass", "classic"));
        assert!(content_matches(FilterType::Word, "ass", "classic ass move"));
    }

    #[test]
    fn test_word_matching_checks_overlapping_occurrences() {
        assert!(content_matches(FilterType::Word, "go go", "ergo go go"));
        assert!(content_matches(FilterType::Word, "ha-ha", "aha-ha-ha"));
        assert!(content_matches(FilterType::Word, "aa", "aaa aa"));
        assert!(!content_matches(FilterType::Word, "go go", "ergo go gone"));
    }

    #[test]
    fn test_phrase_and_emoji_matching() {
        assert!(content_matches(FilterType::Phrase, "Bed Time", "it is bedtime? no, bed time now"));
        assert!(content_matches(FilterType::Phrase, "cation", "vacation"));
        assert!(content_matches(FilterType::Emoji, "💩", "lol 💩💩"));
        assert!(!content_matches(FilterType::Emoji, "💩", "lol 😀"));
    }

    #[test]
    fn test_blank_content_is_never_filtered() {
        let (_dir, fe) = engine();
        let now = Utc::now();
        fe.add_global_filter(RECEIVER, "x", FilterType::Phrase, None, now)
            .unwrap();
        assert!(!fe.should_filter_message(SENDER, RECEIVER, None, "   ").unwrap());
        assert!(!content_matches(FilterType::Phrase, "", "anything"));
    }

    #[test]
    fn test_room_filter_applies_without_personal_filters() {
        let (_dir, fe) = engine();
        fe.add_room_filter(ROOM, ADMIN, "x", FilterType::Word, None, Utc::now())
            .unwrap();

        assert!(fe.should_filter_message(SENDER, RECEIVER, Some(ROOM), "x marks the spot").unwrap());
        assert!(!fe.should_filter_message(SENDER, RECEIVER, None, "x marks the spot").unwrap());
        assert_eq!(fe.room_filter_status(ROOM, "x").unwrap(), FilterStatus::Filtered);
    }

    #[test]
    fn test_contact_filter_targets_one_sender() {
        let (_dir, fe) = engine();
        fe.add_contact_filter(RECEIVER, SENDER, "homework", FilterType::Word, None, Utc::now())
            .unwrap();

        assert!(fe.should_filter_message(SENDER, RECEIVER, None, "did your homework?").unwrap());
        assert!(!fe.should_filter_message(UserId(99), RECEIVER, None, "did your homework?").unwrap());
        // The rule belongs to the receiver, not the sender.
        assert!(!fe.should_filter_message(RECEIVER, SENDER, None, "homework").unwrap());
    }

    #[test]
    fn test_applicable_filters_in_precedence_order() {
        let (_dir, fe) = engine();
        let now = Utc::now();
        let global = fe
            .add_global_filter(RECEIVER, "spoiler", FilterType::Phrase, None, now)
            .unwrap();
        let room = fe
            .add_room_filter(ROOM, ADMIN, "spoiler", FilterType::Word, None, now)
            .unwrap();

        let matched = fe
            .applicable_filters(SENDER, RECEIVER, Some(ROOM), "SPOILER: it was the butler")
            .unwrap();
        let ids: Vec<Uuid> = matched.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![room.id, global.id]);
    }

    #[test]
    fn test_explain_statuses() {
        let (_dir, fe) = engine();
        fe.add_room_filter(ROOM, ADMIN, "secret", FilterType::Word, None, Utc::now())
            .unwrap();

        let receiver = fe.explain(SENDER, RECEIVER, Some(ROOM), "the secret").unwrap();
        assert_eq!(receiver.status, FilterStatus::Filtered);
        assert_eq!(receiver.matched.len(), 1);

        let sender = fe.explain(SENDER, SENDER, Some(ROOM), "the secret").unwrap();
        assert_eq!(sender.status, FilterStatus::Overridden);

        let clean = fe.explain(SENDER, RECEIVER, Some(ROOM), "hello").unwrap();
        assert_eq!(clean.status, FilterStatus::Allowed);
        assert!(clean.matched.is_empty());
    }

    #[test]
    fn test_duplicate_add_and_reactivation() {
        let (_dir, fe) = engine();
        let now = Utc::now();
        let rule = fe
            .add_global_filter(RECEIVER, "meh", FilterType::Word, None, now)
            .unwrap();

        assert!(matches!(
            fe.add_global_filter(RECEIVER, "meh", FilterType::Word, None, now),
            Err(crate::HearthError::Filter(FilterError::FilterExists))
        ));

        fe.remove_filter(RECEIVER, rule.id, now).unwrap();
        assert!(fe.list_global_filters(RECEIVER).unwrap().is_empty());
        assert!(!fe.should_filter_message(SENDER, RECEIVER, None, "meh").unwrap());

        let back = fe
            .add_global_filter(RECEIVER, "meh", FilterType::Word, None, now)
            .unwrap();
        assert_eq!(back.id, rule.id);
        assert!(fe.should_filter_message(SENDER, RECEIVER, None, "meh").unwrap());
    }

    #[test]
    fn test_remove_checks_ownership() {
        let (_dir, fe) = engine();
        let now = Utc::now();
        let rule = fe
            .add_contact_filter(RECEIVER, SENDER, "x", FilterType::Word, None, now)
            .unwrap();

        assert!(matches!(
            fe.remove_filter(SENDER, rule.id, now),
            Err(crate::HearthError::Filter(FilterError::NotFound))
        ));
        assert!(matches!(
            fe.remove_filter(RECEIVER, Uuid::new_v4(), now),
            Err(crate::HearthError::Filter(FilterError::NotFound))
        ));
        assert_eq!(fe.list_contact_filters(RECEIVER).unwrap().len(), 1);
        fe.remove_filter(RECEIVER, rule.id, now).unwrap();
        assert!(fe.list_contact_filters(RECEIVER).unwrap().is_empty());
    }

    #[test]
    fn test_empty_rule_rejected() {
        let (_dir, fe) = engine();
        assert!(matches!(
            fe.add_room_filter(ROOM, ADMIN, "  ", FilterType::Phrase, None, Utc::now()),
            Err(crate::HearthError::Filter(FilterError::EmptyContent))
        ));
        assert!(fe.list_room_filters(ROOM).unwrap().is_empty());
    }
}
