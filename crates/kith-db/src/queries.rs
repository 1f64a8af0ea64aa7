use crate::Database;
use crate::models::{
    FriendListMutation, LinkKind, MessageRow, NewMessage, NewUser, UserRow, now_timestamp,
};
use anyhow::Result;
use rusqlite::{Connection, Row, params};

const USER_COLUMNS: &str = "u.id, u.name, u.email, u.password, u.image, u.last_seen, u.created_at";

const MESSAGE_COLUMNS: &str = "m.id, m.sender_id, m.recipient_id, m.message_type, m.body, \
     m.attachment_ref, m.status, m.created_at, s.name, s.image";

/// Ids bound per statement by `delete_messages`.
const DELETE_CHUNK_SIZE: usize = 500;

// The free functions take a plain `&Connection` so the engines can compose
// them inside one `Database::transaction`. The `Database` methods below are
// single-call conveniences over the same functions.

impl Database {
    // -- Users --

    pub fn create_user(&self, user: &NewUser<'_>) -> Result<()> {
        self.with_conn(|conn| insert_user(conn, user))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| user_by_id(conn, id))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| user_by_email(conn, email))
    }

    pub fn touch_last_seen(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_seen = ?1 WHERE id = ?2",
                params![now_timestamp(), id],
            )?;
            Ok(())
        })
    }

    // -- Friend lists --

    /// Apply one user's set edits atomically.
    pub fn update_friend_lists(&self, user_id: &str, mutation: &FriendListMutation) -> Result<()> {
        self.transaction(|tx| apply_mutation(tx, user_id, mutation))
    }

    pub fn get_link_ids(&self, user_id: &str, kind: LinkKind) -> Result<Vec<String>> {
        self.with_conn(|conn| link_ids(conn, user_id, kind))
    }

    pub fn get_linked_users(&self, user_id: &str, kind: LinkKind) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| linked_users(conn, user_id, kind))
    }

    // -- Messages --

    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<()> {
        self.with_conn(|conn| insert_message(conn, msg))
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| message_by_id(conn, id))
    }

    pub fn get_conversation(
        &self,
        user_a: &str,
        user_b: &str,
        after: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| conversation(conn, user_a, user_b, after, limit))
    }

    /// Delete every message whose id is in `ids`. Unknown ids are ignored.
    /// Returns the number of rows removed and the attachment refs they held.
    pub fn delete_messages(&self, ids: &[String]) -> Result<(usize, Vec<String>)> {
        if ids.is_empty() {
            return Ok((0, vec![]));
        }
        self.transaction(|tx| delete_messages(tx, ids))
    }
}

// -- Users --

pub fn insert_user(conn: &Connection, user: &NewUser<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO users (id, name, email, password, image, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user.id,
            user.name,
            user.email,
            user.password_hash,
            user.image,
            now_timestamp()
        ],
    )?;
    Ok(())
}

pub fn user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = ?1");
    conn.query_row(&sql, [id], user_from_row).optional()
}

pub fn user_by_email(conn: &Connection, email: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users u WHERE u.email = ?1");
    conn.query_row(&sql, [email], user_from_row).optional()
}

pub fn user_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn users_except(conn: &Connection, id: &str) -> Result<Vec<UserRow>> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users u WHERE u.id != ?1 ORDER BY u.created_at, u.rowid"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([id], user_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// -- Friend lists --

pub fn has_link(conn: &Connection, user_id: &str, kind: LinkKind, other_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM user_links WHERE user_id = ?1 AND kind = ?2 AND other_id = ?3",
            params![user_id, kind.as_str(), other_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn link_ids(conn: &Connection, user_id: &str, kind: LinkKind) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT other_id FROM user_links WHERE user_id = ?1 AND kind = ?2 ORDER BY rowid",
    )?;
    let ids = stmt
        .query_map(params![user_id, kind.as_str()], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Resolve one of a user's id sets to full rows, in insertion order.
pub fn linked_users(conn: &Connection, user_id: &str, kind: LinkKind) -> Result<Vec<UserRow>> {
    let sql = format!(
        "SELECT {USER_COLUMNS}
         FROM user_links l
         JOIN users u ON u.id = l.other_id
         WHERE l.user_id = ?1 AND l.kind = ?2
         ORDER BY l.rowid"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![user_id, kind.as_str()], user_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn apply_mutation(conn: &Connection, user_id: &str, mutation: &FriendListMutation) -> Result<()> {
    if mutation.is_empty() {
        return Ok(());
    }

    for (kind, other_id) in &mutation.removes {
        conn.execute(
            "DELETE FROM user_links WHERE user_id = ?1 AND kind = ?2 AND other_id = ?3",
            params![user_id, kind.as_str(), other_id],
        )?;
    }

    let now = now_timestamp();
    for (kind, other_id) in &mutation.adds {
        conn.execute(
            "INSERT OR IGNORE INTO user_links (user_id, kind, other_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, kind.as_str(), other_id, now],
        )?;
    }

    Ok(())
}

// -- Messages --

pub fn insert_message(conn: &Connection, msg: &NewMessage<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, sender_id, recipient_id, message_type, body, attachment_ref, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            msg.id,
            msg.sender_id,
            msg.recipient_id,
            msg.message_type,
            msg.body,
            msg.attachment_ref,
            msg.created_at
        ],
    )?;
    Ok(())
}

pub fn message_by_id(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM messages m
         LEFT JOIN users s ON s.id = m.sender_id
         WHERE m.id = ?1"
    );
    conn.query_row(&sql, [id], message_from_row).optional()
}

/// Messages exchanged between `user_a` and `user_b` in either direction,
/// oldest first. Ties on `created_at` fall back to insertion order.
/// `after` is an exclusive cursor (a message id); `limit = None` returns
/// everything past the cursor.
pub fn conversation(
    conn: &Connection,
    user_a: &str,
    user_b: &str,
    after: Option<&str>,
    limit: Option<u32>,
) -> Result<Vec<MessageRow>> {
    // JOIN users to fetch the sender projection in a single query
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM messages m
         LEFT JOIN users s ON s.id = m.sender_id
         WHERE ((m.sender_id = ?1 AND m.recipient_id = ?2)
             OR (m.sender_id = ?2 AND m.recipient_id = ?1))
           AND (?3 IS NULL
             OR (m.created_at, m.seq) > (SELECT created_at, seq FROM messages WHERE id = ?3))
         ORDER BY m.created_at ASC, m.seq ASC
         LIMIT ?4"
    );
    // SQLite treats a negative LIMIT as "no limit"
    let limit = limit.map(i64::from).unwrap_or(-1);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![user_a, user_b, after, limit], message_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_messages(conn: &Connection, ids: &[String]) -> Result<(usize, Vec<String>)> {
    let mut deleted = 0;
    let mut refs = Vec::new();

    // SQLite caps bound parameters per statement
    for chunk in ids.chunks(DELETE_CHUNK_SIZE) {
        let in_list = (1..=chunk.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let params = rusqlite::params_from_iter(chunk.iter());

        let sql = format!(
            "SELECT attachment_ref FROM messages WHERE id IN ({in_list}) AND attachment_ref IS NOT NULL"
        );
        let mut stmt = conn.prepare(&sql)?;
        let chunk_refs = stmt
            .query_map(params, |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        refs.extend(chunk_refs);

        deleted += conn.execute(
            &format!("DELETE FROM messages WHERE id IN ({in_list})"),
            rusqlite::params_from_iter(chunk.iter()),
        )?;
    }

    Ok((deleted, refs))
}

// -- Row mapping --

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        password: row.get(3)?,
        image: row.get(4)?,
        last_seen: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        recipient_id: row.get(2)?,
        message_type: row.get(3)?,
        body: row.get(4)?,
        attachment_ref: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
        sender_name: row.get(8)?,
        sender_image: row.get(9)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
