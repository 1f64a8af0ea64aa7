use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (users, links, messages)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                email       TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password    TEXT NOT NULL,
                image       TEXT,
                last_seen   TEXT,
                created_at  TEXT NOT NULL
            );

            -- One row per member of a user's friends / incoming / outgoing set.
            CREATE TABLE user_links (
                user_id     TEXT NOT NULL REFERENCES users(id),
                kind        TEXT NOT NULL CHECK (kind IN ('friend', 'incoming', 'outgoing')),
                other_id    TEXT NOT NULL REFERENCES users(id),
                created_at  TEXT NOT NULL,
                PRIMARY KEY (user_id, kind, other_id)
            );

            CREATE TABLE messages (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                id              TEXT NOT NULL UNIQUE,
                sender_id       TEXT NOT NULL REFERENCES users(id),
                recipient_id    TEXT NOT NULL REFERENCES users(id),
                message_type    TEXT NOT NULL CHECK (message_type IN ('text', 'image')),
                body            TEXT,
                attachment_ref  TEXT,
                status          TEXT NOT NULL DEFAULT 'sent'
                                CHECK (status IN ('sent', 'delivered', 'read')),
                created_at      TEXT NOT NULL,
                CHECK (
                    (message_type = 'text'  AND body IS NOT NULL AND attachment_ref IS NULL) OR
                    (message_type = 'image' AND attachment_ref IS NOT NULL AND body IS NULL)
                )
            );

            CREATE INDEX idx_messages_pair
                ON messages(sender_id, recipient_id);
            CREATE INDEX idx_messages_created
                ON messages(created_at);

            INSERT INTO schema_version (version) VALUES (1);

            COMMIT;
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

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn message_payload_check_rejects_both_fields() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        conn.execute(
            "INSERT INTO users (id, name, email, password, created_at) VALUES ('u', 'u', 'u@x', 'h', 'now')",
            [],
        )
        .unwrap();

        let res = conn.execute(
            "INSERT INTO messages (id, sender_id, recipient_id, message_type, body, attachment_ref, created_at)
             VALUES ('m', 'u', 'u', 'text', 'hi', '/files/x.png', 'now')",
            [],
        );
        assert!(res.is_err());
    }
}
