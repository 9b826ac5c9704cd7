use rusqlite::{params, Transaction, TransactionBehavior};

use super::helpers::{from_ts, parse_label, parse_uuid, to_ts};
use super::Database;
use crate::error::{Result, StoreError};
use crate::models::{Category, Reassignment, Rule};

impl Database {
    /// All categories, built-ins first
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_categories(&self) -> Result<Vec<Category>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, default_productivity_score, builtin FROM categories ORDER BY id",
        )?;
        let categories = stmt
            .query_map([], |row| {
                Ok(Category {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    default_productivity_score: row.get(2)?,
                    builtin: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(categories)
    }

    /// Create a user category. Ids start at [`Category::FIRST_USER_ID`], so a
    /// user category never shadows a built-in.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for a score outside `[-1, 1]` or a duplicate name
    pub fn add_category(&self, name: &str, default_productivity_score: f64) -> Result<Category> {
        self.ensure_writable()?;
        let name = name.trim();
        if name.is_empty() || !(-1.0..=1.0).contains(&default_productivity_score) {
            return Err(StoreError::Invalid(format!(
                "category {name:?} with score {default_productivity_score}"
            )));
        }

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM categories WHERE name = ?1 COLLATE NOCASE)",
            [name],
            |row| row.get(0),
        )?;
        if taken {
            return Err(StoreError::Invalid(format!("category {name} already exists")));
        }

        let id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(id) + 1, ?1) FROM categories WHERE id >= ?1",
            [Category::FIRST_USER_ID],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO categories (id, name, default_productivity_score, builtin)
             VALUES (?1, ?2, ?3, 0)",
            params![id, name, default_productivity_score],
        )?;
        tx.commit()?;

        log::info!("Added category {name} (id {id})");
        Ok(Category {
            id,
            name: name.to_string(),
            default_productivity_score,
            builtin: false,
        })
    }

    /// Rules in declaration order
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_rules(&self) -> Result<Vec<Rule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, pattern, match_kind, category_id, priority, position, created_at
             FROM rules ORDER BY position",
        )?;
        let rules = stmt
            .query_map([], |row| {
                Ok(Rule {
                    id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    pattern: row.get(1)?,
                    match_kind: parse_label(2, &row.get::<_, String>(2)?)?,
                    category_id: row.get(3)?,
                    priority: row.get(4)?,
                    position: row.get(5)?,
                    created_at: from_ts(6, row.get(6)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Persist a rule and apply the resulting reassignments in one
    /// transaction. Applications pinned by the user are left untouched.
    /// Returns the stored rule with its declaration position.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the rule's category does not exist; nothing is
    /// written in that case
    pub fn add_rule_with_recategorization(
        &self,
        rule: &Rule,
        reassignments: &[Reassignment],
    ) -> Result<Rule> {
        self.ensure_writable()?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        Self::require_category(&tx, rule.category_id)?;

        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM rules",
            [],
            |row| row.get(0),
        )?;
        let created_at = to_ts(rule.created_at);
        tx.execute(
            "INSERT INTO rules (id, pattern, match_kind, category_id, priority, position, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rule.id.to_string(),
                rule.pattern,
                rule.match_kind.as_str(),
                rule.category_id,
                rule.priority,
                position,
                created_at,
            ],
        )?;

        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE applications SET category_id = ?1, productivity_score = ?2
                 WHERE id = ?3 AND user_override = 0",
            )?;
            for update in reassignments {
                changed += stmt.execute(params![
                    update.category_id,
                    update.productivity_score,
                    update.app_id
                ])?;
            }
        }
        tx.commit()?;

        log::info!(
            "Added {} rule {:?} at position {position}; recategorized {changed} app(s)",
            rule.match_kind,
            rule.pattern
        );
        Ok(Rule {
            position,
            created_at: from_ts(6, created_at)?,
            ..rule.clone()
        })
    }

    /// Delete a rule. Applications keep their current category.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub fn delete_rule(&self, rule_id: uuid::Uuid) -> Result<bool> {
        self.ensure_writable()?;
        let deleted = self
            .conn()
            .execute("DELETE FROM rules WHERE id = ?1", [rule_id.to_string()])?;
        Ok(deleted > 0)
    }

    pub(super) fn require_category(tx: &Transaction, category_id: i64) -> Result<()> {
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM categories WHERE id = ?1)",
            [category_id],
            |row| row.get(0),
        )?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("category {category_id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchKind, NewApplication};

    #[test]
    fn test_builtin_categories_seeded() {
        let db = Database::open_in_memory().unwrap();
        let categories = db.get_categories().unwrap();
        assert_eq!(categories.len(), 10);
        assert_eq!(categories[0].name, "Uncategorized");
        assert_eq!(categories[9].id, Category::GAMES);
    }

    #[test]
    fn test_user_categories_get_high_ids() {
        let db = Database::open_in_memory().unwrap();
        let writing = db.add_category("Writing", 1.0).unwrap();
        let reading = db.add_category("Reading", 0.5).unwrap();

        assert_eq!(writing.id, Category::FIRST_USER_ID);
        assert_eq!(reading.id, Category::FIRST_USER_ID + 1);
        assert!(!reading.builtin);

        assert!(matches!(
            db.add_category("games", 0.0),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            db.add_category("Chaos", 2.0),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn test_rules_keep_declaration_order() {
        let db = Database::open_in_memory().unwrap();
        let first = db
            .add_rule_with_recategorization(
                &Rule::new("code", MatchKind::Exact, Category::DEVELOPMENT, 1),
                &[],
            )
            .unwrap();
        let second = db
            .add_rule_with_recategorization(
                &Rule::new("slack", MatchKind::Prefix, Category::COMMUNICATION, 9),
                &[],
            )
            .unwrap();

        assert!(first.position < second.position);
        let rules = db.get_rules().unwrap();
        assert_eq!(rules, vec![first.clone(), second]);

        assert!(db.delete_rule(first.id).unwrap());
        assert!(!db.delete_rule(first.id).unwrap());
        assert_eq!(db.get_rules().unwrap().len(), 1);
    }

    #[test]
    fn test_rule_recategorizes_unpinned_apps_only() {
        let db = Database::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for name in ["notion", "obsidian"] {
            let app = db
                .insert_application(&NewApplication {
                    canonical_name: name.to_string(),
                    display_name: name.to_string(),
                    category_id: Category::UNCATEGORIZED,
                    productivity_score: 0.0,
                })
                .unwrap();
            ids.push(app.id);
        }
        db.set_application_override("obsidian", Category::MEDIA, 0.0)
            .unwrap();

        let reassignments: Vec<_> = ids
            .iter()
            .map(|&app_id| Reassignment {
                app_id,
                category_id: Category::PRODUCTIVITY,
                productivity_score: 1.0,
            })
            .collect();
        db.add_rule_with_recategorization(
            &Rule::new("no", MatchKind::Prefix, Category::PRODUCTIVITY, 0),
            &reassignments,
        )
        .unwrap();

        let notion = db.get_application("notion").unwrap().unwrap();
        let obsidian = db.get_application("obsidian").unwrap().unwrap();
        assert_eq!(notion.category_id, Category::PRODUCTIVITY);
        assert_eq!(obsidian.category_id, Category::MEDIA);
    }

    #[test]
    fn test_rule_with_unknown_category_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let result = db.add_rule_with_recategorization(
            &Rule::new("code", MatchKind::Exact, 4242, 1),
            &[],
        );
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(db.get_rules().unwrap().is_empty());
    }
}
