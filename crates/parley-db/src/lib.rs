pub mod migrations;
pub mod models;
pub mod queries;

use anyhow::Result;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    /// Run `f` inside a single transaction. Commits when `f` returns `Ok`,
    /// rolls back on `Err` so rejected work leaves no trace.
    pub fn transaction<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
        E: From<anyhow::Error>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| E::from(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
        let tx = conn.transaction().map_err(|e| E::from(e.into()))?;

        let value = f(&tx)?;

        tx.commit().map_err(|e| E::from(e.into()))?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries;

    #[test]
    fn transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let user_id = uuid::Uuid::new_v4();

        let result: Result<()> = db.transaction(|tx| {
            queries::create_user(tx, &user_id, None, None, true)?;
            Err(anyhow::anyhow!("abort"))
        });
        assert!(result.is_err());

        let user = db.with_conn(|conn| queries::get_user_by_id(conn, &user_id)).unwrap();
        assert!(user.is_none());
    }

    #[test]
    fn transaction_commits_on_success() {
        let db = Database::open_in_memory().unwrap();
        let user_id = uuid::Uuid::new_v4();

        db.transaction::<_, _, anyhow::Error>(|tx| queries::create_user(tx, &user_id, None, None, true))
            .unwrap();

        let user = db.with_conn(|conn| queries::get_user_by_id(conn, &user_id)).unwrap();
        assert!(user.is_some_and(|u| u.is_anonymous));
    }
}
