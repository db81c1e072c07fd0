use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                username      TEXT UNIQUE,
                password      TEXT,
                is_anonymous  INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE threads (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                title       TEXT NOT NULL DEFAULT '',
                status      TEXT NOT NULL DEFAULT 'ready',
                stream_id   TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE INDEX idx_threads_user
                ON threads(user_id, updated_at);

            CREATE TABLE messages (
                id          TEXT PRIMARY KEY,
                thread_id   TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                role        TEXT NOT NULL,
                parts       TEXT NOT NULL,
                model_id    TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_messages_thread
                ON messages(thread_id, created_at);

            CREATE TABLE models (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                provider_model  TEXT NOT NULL,
                credits         INTEGER NOT NULL
            );

            CREATE TABLE settings (
                user_id              TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                nickname             TEXT,
                custom_instructions  TEXT,
                temperature          REAL NOT NULL DEFAULT 0.7
            );

            CREATE TABLE usage (
                user_id   TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                credits   INTEGER NOT NULL DEFAULT 0,
                search    INTEGER NOT NULL DEFAULT 0,
                research  INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE customers (
                user_id               TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                customer_id           TEXT NOT NULL UNIQUE,
                subscription_ends_at  TEXT
            );

            -- Seed the model catalogue
            INSERT OR IGNORE INTO models (id, name, provider_model, credits) VALUES
                ('gpt-4o-mini', 'GPT-4o mini', 'gpt-4o-mini', 1),
                ('gpt-4o', 'GPT-4o', 'gpt-4o', 5),
                ('o3-mini', 'o3-mini', 'o3-mini', 8);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let models: i64 = conn
            .query_row("SELECT COUNT(*) FROM models", [], |r| r.get(0))
            .unwrap();
        assert_eq!(models, 3);
    }
}
