//! Conversions from store rows to wire models.
//!
//! Rows are written by this crate, so a value that fails to parse means the
//! database was edited by hand. Those are logged and replaced with defaults
//! instead of failing the whole listing.

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use kith_db::models::{MessageRow, UserRow, parse_timestamp};
use kith_types::models::{
    ConversationMessage, DirectoryEntry, FriendDetail, Message, MessageContent, MessageStatus,
    SenderSummary, UserProfile, UserSummary,
};

use crate::error::ApiError;

/// Parse a caller-supplied user id.
pub(crate) fn parse_user_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::validation(format!("Invalid user id: {}", raw)))
}

pub(crate) fn row_id(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

pub(crate) fn row_time(raw: &str, what: &str) -> DateTime<Utc> {
    parse_timestamp(raw).unwrap_or_else(|| {
        warn!("Corrupt {} '{}'", what, raw);
        DateTime::default()
    })
}

pub(crate) fn user_summary(row: &UserRow) -> UserSummary {
    UserSummary {
        id: row_id(&row.id, "user id"),
        name: row.name.clone(),
        email: row.email.clone(),
        image: row.image.clone(),
    }
}

pub(crate) fn friend_detail(row: &UserRow) -> FriendDetail {
    FriendDetail {
        id: row_id(&row.id, "user id"),
        name: row.name.clone(),
        email: row.email.clone(),
        image: row.image.clone(),
        last_seen: row.last_seen.as_deref().map(|ts| row_time(ts, "last_seen")),
    }
}

pub(crate) fn directory_entry(row: &UserRow, has_pending_request: bool, is_friend: bool) -> DirectoryEntry {
    DirectoryEntry {
        id: row_id(&row.id, "user id"),
        name: row.name.clone(),
        email: row.email.clone(),
        image: row.image.clone(),
        has_pending_request,
        is_friend,
    }
}

pub(crate) fn user_profile(
    row: &UserRow,
    friends: &[String],
    pending_incoming: &[String],
    pending_outgoing: &[String],
) -> UserProfile {
    let ids = |list: &[String]| -> Vec<Uuid> {
        list.iter().map(|id| row_id(id, "linked user id")).collect()
    };
    UserProfile {
        id: row_id(&row.id, "user id"),
        name: row.name.clone(),
        email: row.email.clone(),
        image: row.image.clone(),
        last_seen: row.last_seen.as_deref().map(|ts| row_time(ts, "last_seen")),
        created_at: row_time(&row.created_at, "created_at"),
        friends: ids(friends),
        pending_incoming: ids(pending_incoming),
        pending_outgoing: ids(pending_outgoing),
    }
}

pub(crate) fn conversation_message(row: MessageRow) -> ConversationMessage {
    let content = match (row.message_type.as_str(), row.attachment_ref) {
        ("image", Some(attachment_ref)) => MessageContent::Image { attachment_ref },
        (kind, _) => {
            if kind != "text" {
                warn!("Corrupt message_type '{}' on message '{}'", kind, row.id);
            }
            MessageContent::Text {
                body: row.body.unwrap_or_default(),
            }
        }
    };

    let status = row.status.parse().unwrap_or_else(|e| {
        warn!("Corrupt status on message '{}': {}", row.id, e);
        MessageStatus::default()
    });

    let sender_id = row_id(&row.sender_id, "sender_id");
    ConversationMessage {
        sender: SenderSummary {
            id: sender_id,
            name: row.sender_name.unwrap_or_else(|| "unknown".to_string()),
            image: row.sender_image,
        },
        message: Message {
            id: row_id(&row.id, "message id"),
            sender_id,
            recipient_id: row_id(&row.recipient_id, "recipient_id"),
            content,
            status,
            created_at: row_time(&row.created_at, "created_at"),
        },
    }
}
