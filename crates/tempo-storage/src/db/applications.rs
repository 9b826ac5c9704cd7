use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::helpers::to_ts;
use super::Database;
use crate::error::{Result, StoreError};
use crate::models::{Application, NewApplication};

const APPLICATION_COLUMNS: &str =
    "id, canonical_name, display_name, category_id, productivity_score, user_override";

impl Database {
    /// Insert a newly observed application. If another writer created the
    /// same canonical name first, the existing row is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub fn insert_application(&self, app: &NewApplication) -> Result<Application> {
        self.ensure_writable()?;
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO applications
             (canonical_name, display_name, category_id, productivity_score, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                app.canonical_name,
                app.display_name,
                app.category_id,
                app.productivity_score,
                to_ts(Utc::now()),
            ],
        )?;

        let stored = conn.query_row(
            &format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE canonical_name = ?1"),
            [&app.canonical_name],
            Self::row_to_application,
        )?;
        Ok(stored)
    }

    /// Look up an application by canonical name
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_application(&self, canonical_name: &str) -> Result<Option<Application>> {
        let result = self
            .conn()
            .query_row(
                &format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE canonical_name = ?1"),
                [canonical_name],
                Self::row_to_application,
            )
            .optional()?;
        Ok(result)
    }

    /// Look up an application by id
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_application_by_id(&self, id: i64) -> Result<Option<Application>> {
        let result = self
            .conn()
            .query_row(
                &format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE id = ?1"),
                [id],
                Self::row_to_application,
            )
            .optional()?;
        Ok(result)
    }

    /// All known applications, by id
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_applications(&self) -> Result<Vec<Application>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {APPLICATION_COLUMNS} FROM applications ORDER BY id"))?;
        let apps = stmt
            .query_map([], Self::row_to_application)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(apps)
    }

    /// Pin an application to a category and score. Pinned applications are
    /// skipped when rules recategorize history.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown application or category
    pub fn set_application_override(
        &self,
        canonical_name: &str,
        category_id: i64,
        productivity_score: f64,
    ) -> Result<Application> {
        self.ensure_writable()?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        Self::require_category(&tx, category_id)?;

        let updated = tx.execute(
            "UPDATE applications
             SET category_id = ?1, productivity_score = ?2, user_override = 1
             WHERE canonical_name = ?3",
            params![category_id, productivity_score, canonical_name],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("application {canonical_name}")));
        }

        let app = tx.query_row(
            &format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE canonical_name = ?1"),
            [canonical_name],
            Self::row_to_application,
        )?;
        tx.commit()?;

        log::info!(
            "Pinned {canonical_name} to category {category_id} (score {productivity_score})"
        );
        Ok(app)
    }

    fn row_to_application(row: &rusqlite::Row) -> rusqlite::Result<Application> {
        Ok(Application {
            id: row.get(0)?,
            canonical_name: row.get(1)?,
            display_name: row.get(2)?,
            category_id: row.get(3)?,
            productivity_score: row.get(4)?,
            user_override: row.get::<_, i64>(5)? != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;

    fn new_app(name: &str, category_id: i64, score: f64) -> NewApplication {
        NewApplication {
            canonical_name: name.to_string(),
            display_name: name.to_uppercase(),
            category_id,
            productivity_score: score,
        }
    }

    #[test]
    fn test_insert_application_is_idempotent_by_name() {
        let db = Database::open_in_memory().unwrap();
        let first = db
            .insert_application(&new_app("firefox", Category::BROWSING, 0.0))
            .unwrap();
        let second = db
            .insert_application(&new_app("firefox", Category::SOCIAL, -1.0))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(second.category_id, Category::BROWSING);
        assert_eq!(db.get_applications().unwrap().len(), 1);
    }

    #[test]
    fn test_get_application_by_id() {
        let db = Database::open_in_memory().unwrap();
        let app = db
            .insert_application(&new_app("vim", Category::DEVELOPMENT, 1.0))
            .unwrap();

        assert_eq!(db.get_application_by_id(app.id).unwrap(), Some(app));
        assert_eq!(db.get_application_by_id(999).unwrap(), None);
        assert_eq!(db.get_application("emacs").unwrap(), None);
    }

    #[test]
    fn test_override_pins_application() {
        let db = Database::open_in_memory().unwrap();
        db.insert_application(&new_app("discord", Category::SOCIAL, -1.0))
            .unwrap();

        let app = db
            .set_application_override("discord", Category::COMMUNICATION, 0.0)
            .unwrap();
        assert!(app.user_override);
        assert_eq!(app.category_id, Category::COMMUNICATION);

        assert!(matches!(
            db.set_application_override("discord", 4242, 0.0),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            db.set_application_override("slack", Category::COMMUNICATION, 0.0),
            Err(StoreError::NotFound(_))
        ));
    }
}
