use rusqlite::params;

use super::helpers::{parse_label, parse_uuid, to_u32};
use super::Database;
use crate::error::{Result, StoreError};
use crate::models::{Goal, GoalKind};

impl Database {
    /// Save a goal
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for a zero target or an app limit without an app
    pub fn add_goal(&self, goal: &Goal) -> Result<()> {
        self.ensure_writable()?;
        if goal.target_value == 0 {
            return Err(StoreError::Invalid(String::from("goal target must be positive")));
        }
        if goal.kind == GoalKind::AppLimit && goal.scope.is_none() {
            return Err(StoreError::Invalid(String::from(
                "app limit goals need an application name",
            )));
        }

        self.conn().execute(
            "INSERT INTO goals (id, kind, target_value, scope) VALUES (?1, ?2, ?3, ?4)",
            params![
                goal.id.to_string(),
                goal.kind.as_str(),
                goal.target_value,
                goal.scope.as_deref().map(str::to_lowercase),
            ],
        )?;
        Ok(())
    }

    /// List goals
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_goals(&self) -> Result<Vec<Goal>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, kind, target_value, scope FROM goals ORDER BY rowid")?;
        let goals = stmt
            .query_map([], |row| {
                Ok(Goal {
                    id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    kind: parse_label(1, &row.get::<_, String>(1)?)?,
                    target_value: to_u32(row.get(2)?),
                    scope: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    /// Delete a goal
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub fn delete_goal(&self, goal_id: uuid::Uuid) -> Result<bool> {
        self.ensure_writable()?;
        let deleted = self
            .conn()
            .execute("DELETE FROM goals WHERE id = ?1", [goal_id.to_string()])?;
        Ok(deleted > 0)
    }
}
