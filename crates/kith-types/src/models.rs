use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- Users --

/// Public projection of a user, as returned by the listing endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub image: Option<String>,
}

/// A friend as returned by `GET /friends-with-details/{user_id}`.
/// `lastSeen` is always present, `null` for someone who never logged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendDetail {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub image: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Another user as seen from `GET /users/{user_id}`, annotated with the
/// caller's relationship to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub image: Option<String>,
    pub has_pending_request: bool,
    pub is_friend: bool,
}

/// Full user record. The password hash never leaves the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub image: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub friends: Vec<Uuid>,
    pub pending_incoming: Vec<Uuid>,
    pub pending_outgoing: Vec<Uuid>,
}

/// Lightweight sender projection attached to conversation entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderSummary {
    pub id: Uuid,
    pub name: String,
    pub image: Option<String>,
}

// -- Messages --

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unknown {what}: {value}")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            other => Err(UnknownVariant {
                what: "message type",
                value: other.to_string(),
            }),
        }
    }
}

/// Delivery state. Every message is created as `Sent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl FromStr for MessageStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(UnknownVariant {
                what: "message status",
                value: other.to_string(),
            }),
        }
    }
}

/// Message payload. The variant decides which field exists, so a message
/// can never carry both a body and an attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum MessageContent {
    Text { body: String },
    #[serde(rename_all = "camelCase")]
    Image { attachment_ref: String },
}

impl MessageContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Text { body } => Some(body),
            Self::Image { .. } => None,
        }
    }

    pub fn attachment_ref(&self) -> Option<&str> {
        match self {
            Self::Text { .. } => None,
            Self::Image { attachment_ref } => Some(attachment_ref),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    #[serde(flatten)]
    pub content: MessageContent,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// A message inside a conversation listing, with its sender resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    #[serde(flatten)]
    pub message: Message,
    pub sender: SenderSummary,
}
