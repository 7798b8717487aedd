use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use hearth_shared::types::{FilterScope, FilterType, RoomId, UserId};

use crate::database::{
    conversion_err, fmt_ts, not_found, parse_enum, parse_ts, parse_uuid, Database, UnknownVariant,
};
use crate::error::Result;
use crate::models::FilterRule;

const FILTER_COLUMNS: &str = "id, scope, owner_id, contact_id, content, filter_type,
     description, is_active, created_by, created_at, updated_at";

/// Flatten a scope into its `(scope, owner_id, contact_id)` columns.
fn scope_columns(scope: &FilterScope) -> (&'static str, i64, Option<i64>) {
    match scope {
        FilterScope::Global { user } => (scope.kind(), user.0, None),
        FilterScope::Contact { user, contact } => (scope.kind(), user.0, Some(contact.0)),
        FilterScope::Room { room } => (scope.kind(), room.0, None),
    }
}

impl Database {
    // ---- Create ----

    pub fn insert_filter(&self, rule: &FilterRule) -> Result<()> {
        let (kind, owner, contact) = scope_columns(&rule.scope);
        self.conn().execute(
            "INSERT INTO filter_rules (id, scope, owner_id, contact_id, content, filter_type,
                 description, is_active, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                rule.id.to_string(),
                kind,
                owner,
                contact,
                rule.content,
                rule.filter_type.as_str(),
                rule.description,
                rule.is_active,
                rule.created_by.0,
                fmt_ts(&rule.created_at),
                fmt_ts(&rule.updated_at),
            ],
        )?;
        Ok(())
    }

    // ---- Read ----

    pub fn get_filter(&self, id: Uuid) -> Result<FilterRule> {
        self.conn()
            .query_row(
                &format!("SELECT {FILTER_COLUMNS} FROM filter_rules WHERE id = ?1"),
                params![id.to_string()],
                row_to_filter,
            )
            .map_err(not_found)
    }

    /// Look up a rule by its identity, active or not.
    pub fn find_filter(
        &self,
        scope: &FilterScope,
        content: &str,
        filter_type: FilterType,
    ) -> Result<Option<FilterRule>> {
        let (kind, owner, contact) = scope_columns(scope);
        let rule = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {FILTER_COLUMNS} FROM filter_rules
                     WHERE scope = ?1 AND owner_id = ?2 AND contact_id IS ?3
                       AND content = ?4 AND filter_type = ?5"
                ),
                params![kind, owner, contact, content, filter_type.as_str()],
                row_to_filter,
            )
            .optional()?;
        Ok(rule)
    }

    /// Active rules of exactly this scope, oldest first.
    pub fn list_active_filters(&self, scope: &FilterScope) -> Result<Vec<FilterRule>> {
        let (kind, owner, contact) = scope_columns(scope);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {FILTER_COLUMNS} FROM filter_rules
             WHERE scope = ?1 AND owner_id = ?2 AND contact_id IS ?3 AND is_active = 1
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![kind, owner, contact], row_to_filter)?;

        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    /// Active CONTACT rules `user` holds about any counterpart.
    pub fn list_active_contact_filters(&self, user: UserId) -> Result<Vec<FilterRule>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {FILTER_COLUMNS} FROM filter_rules
             WHERE scope = 'CONTACT' AND owner_id = ?1 AND is_active = 1
             ORDER BY contact_id ASC, created_at ASC"
        ))?;
        let rows = stmt.query_map(params![user.0], row_to_filter)?;

        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    // ---- Update ----

    pub fn set_filter_active(&self, id: Uuid, active: bool, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE filter_rules SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), active, fmt_ts(&now)],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_filter(row: &rusqlite::Row<'_>) -> rusqlite::Result<FilterRule> {
    let id_str: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let owner: i64 = row.get(2)?;
    let contact: Option<i64> = row.get(3)?;
    let type_str: String = row.get(5)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    let scope = match (kind.as_str(), contact) {
        ("GLOBAL", _) => FilterScope::Global { user: UserId(owner) },
        ("CONTACT", Some(contact)) => FilterScope::Contact {
            user: UserId(owner),
            contact: UserId(contact),
        },
        ("ROOM", _) => FilterScope::Room { room: RoomId(owner) },
        _ => return Err(conversion_err(1, UnknownVariant(kind))),
    };

    Ok(FilterRule {
        id: parse_uuid(0, &id_str)?,
        scope,
        content: row.get(4)?,
        filter_type: parse_enum(5, &type_str, FilterType::parse)?,
        description: row.get(6)?,
        is_active: row.get(7)?,
        created_by: UserId(row.get(8)?),
        created_at: parse_ts(9, &created_str)?,
        updated_at: parse_ts(10, &updated_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn rule(scope: FilterScope, content: &str, filter_type: FilterType) -> FilterRule {
        let now = Utc::now();
        FilterRule {
            id: Uuid::new_v4(),
            scope,
            content: content.into(),
            filter_type,
            description: None,
            is_active: true,
            created_by: UserId(1),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn scopes_round_trip() {
        let (_dir, db) = test_db();
        let scopes = [
            FilterScope::Global { user: UserId(1) },
            FilterScope::Contact {
                user: UserId(1),
                contact: UserId(2),
            },
            FilterScope::Room { room: RoomId(9) },
        ];
        for scope in scopes {
            let r = rule(scope, "spoiler", FilterType::Word);
            db.insert_filter(&r).unwrap();
            assert_eq!(db.get_filter(r.id).unwrap().scope, scope);
        }
    }

    #[test]
    fn room_and_global_with_same_owner_id_do_not_mix() {
        let (_dir, db) = test_db();
        db.insert_filter(&rule(FilterScope::Global { user: UserId(5) }, "a", FilterType::Word))
            .unwrap();
        db.insert_filter(&rule(FilterScope::Room { room: RoomId(5) }, "b", FilterType::Word))
            .unwrap();

        let room = db
            .list_active_filters(&FilterScope::Room { room: RoomId(5) })
            .unwrap();
        assert_eq!(room.len(), 1);
        assert_eq!(room[0].content, "b");
    }

    #[test]
    fn find_and_deactivate() {
        let (_dir, db) = test_db();
        let scope = FilterScope::Contact {
            user: UserId(1),
            contact: UserId(2),
        };
        let r = rule(scope, "🍆", FilterType::Emoji);
        db.insert_filter(&r).unwrap();

        assert!(db.find_filter(&scope, "🍆", FilterType::Emoji).unwrap().is_some());
        assert!(db.find_filter(&scope, "🍆", FilterType::Word).unwrap().is_none());

        assert!(db.set_filter_active(r.id, false, Utc::now()).unwrap());
        assert!(db.list_active_filters(&scope).unwrap().is_empty());
        assert!(db.list_active_contact_filters(UserId(1)).unwrap().is_empty());

        let inactive = db.find_filter(&scope, "🍆", FilterType::Emoji).unwrap().unwrap();
        assert!(!inactive.is_active);
    }
}
