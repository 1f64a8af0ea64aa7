/// Database row types. These map directly to SQLite rows and are
/// distinct from kith-types API models to keep the DB layer independent.
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password: String,
    pub image: Option<String>,
    pub last_seen: Option<String>,
    pub created_at: String,
}

pub struct NewUser<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub image: Option<&'a str>,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub message_type: String,
    pub body: Option<String>,
    pub attachment_ref: Option<String>,
    pub status: String,
    pub created_at: String,
    pub sender_name: Option<String>,
    pub sender_image: Option<String>,
}

pub struct NewMessage<'a> {
    pub id: &'a str,
    pub sender_id: &'a str,
    pub recipient_id: &'a str,
    pub message_type: &'a str,
    pub body: Option<&'a str>,
    pub attachment_ref: Option<&'a str>,
    pub created_at: &'a str,
}

/// Which of a user's three id sets a link row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Friend,
    /// Requests received and not yet accepted.
    Incoming,
    /// Requests sent and not yet accepted.
    Outgoing,
}

impl LinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Friend => "friend",
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }
}

/// A batch of set edits for one user. Adds are "insert if absent",
/// removes are "delete if present", so applying a mutation twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct FriendListMutation {
    pub adds: Vec<(LinkKind, String)>,
    pub removes: Vec<(LinkKind, String)>,
}

impl FriendListMutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, kind: LinkKind, other_id: impl Into<String>) -> Self {
        self.adds.push((kind, other_id.into()));
        self
    }

    pub fn remove(mut self, kind: LinkKind, other_id: impl Into<String>) -> Self {
        self.removes.push((kind, other_id.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty()
    }
}

/// Current time in the fixed-width format stored in every `*_at` column.
/// Fixed width keeps lexical and chronological order identical.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().ok().or_else(|| {
        // SQLite's datetime('now') format, no timezone
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|ndt| ndt.and_utc())
    })
}
