use std::sync::Arc;

use axum::{
    Json,
    extract::{Multipart, Path, Query, State, multipart::MultipartRejection},
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use kith_blob::{BlobStore, StoredBlob};
use kith_db::Database;
use kith_db::models::{NewMessage, format_timestamp};
use kith_db::queries;
use kith_types::api::{DeleteMessagesRequest, DeleteMessagesResponse};
use kith_types::models::{ConversationMessage, Message, MessageContent, MessageKind, MessageStatus};

use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::rows::{conversation_message, parse_user_id};
use crate::state::{AppState, run_blocking};

/// 5 MB upload limit for image attachments
pub const MAX_IMAGE_SIZE: usize = 5 * 1024 * 1024;

/// Largest conversation page a caller may ask for.
pub const MAX_PAGE_SIZE: u32 = 200;

/// An uploaded file, as received from the form.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Stored extension for an accepted image type. The extension decides the
/// Content-Type `/files` serves, so it never comes from the client's filename.
pub fn image_extension(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    match essence.to_ascii_lowercase().as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Unvalidated input for [`Messenger::send`]. Field values are kept raw so
/// validation can report the first problem in a fixed order.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub sender_id: String,
    pub recipient_id: String,
    pub message_type: String,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
}

/// Validates and persists direct messages, handing image payloads to blob
/// storage.
#[derive(Clone)]
pub struct Messenger {
    db: Arc<Database>,
    blobs: Arc<BlobStore>,
}

impl Messenger {
    pub fn new(db: Arc<Database>, blobs: Arc<BlobStore>) -> Self {
        Self { db, blobs }
    }

    /// Validation order, first failure wins: well-formed ids, both users
    /// exist, known message type, non-blank text (text) or attachment
    /// bytes present (image).
    ///
    /// If the message cannot be stored after its image was written, the
    /// image is deleted again. A failed cleanup is logged, never returned.
    pub async fn send(&self, draft: MessageDraft) -> Result<Message, ApiError> {
        let (sender_id, recipient_id) = match (
            parse_user_id(&draft.sender_id),
            parse_user_id(&draft.recipient_id),
        ) {
            (Ok(s), Ok(r)) => (s, r),
            _ => return Err(ApiError::validation("Invalid user IDs provided")),
        };

        let db = self.db.clone();
        run_blocking(move || {
            db.with_conn(|conn| {
                Ok((
                    queries::user_exists(conn, &sender_id.to_string())?,
                    queries::user_exists(conn, &recipient_id.to_string())?,
                ))
            })
            .map_err(ApiError::from)
            .and_then(|found| match found {
                (false, _) => Err(ApiError::not_found("Sender not found")),
                (_, false) => Err(ApiError::not_found("Recipient not found")),
                _ => Ok(()),
            })
        })
        .await?;

        let kind: MessageKind = draft
            .message_type
            .trim()
            .parse()
            .map_err(|_| ApiError::validation("Invalid message type"))?;

        let (content, stored) = match kind {
            MessageKind::Text => {
                let body = draft.text.as_deref().map(str::trim).unwrap_or_default();
                if body.is_empty() {
                    return Err(ApiError::validation(
                        "Message text cannot be empty for text messages",
                    ));
                }
                (MessageContent::Text { body: body.to_string() }, None)
            }
            MessageKind::Image => {
                let attachment = draft
                    .attachment
                    .filter(|a| !a.bytes.is_empty())
                    .ok_or_else(|| ApiError::validation("Image file is required for image messages"))?;
                let extension = image_extension(&attachment.content_type).ok_or_else(|| {
                    ApiError::validation("Only PNG, JPEG, GIF and WebP images are allowed")
                })?;
                let blob = self.blobs.put(&attachment.bytes, Some(extension)).await?;
                (
                    MessageContent::Image {
                        attachment_ref: blob.url.clone(),
                    },
                    Some(blob),
                )
            }
        };

        let message = Message {
            id: Uuid::new_v4(),
            sender_id,
            recipient_id,
            content,
            status: MessageStatus::Sent,
            // Stored with microsecond precision; truncate so the response
            // matches what a later read returns.
            created_at: Utc::now().trunc_subsecs(6),
        };

        if let Err(e) = self.persist(&message).await {
            if let Some(blob) = stored {
                self.discard_blob(&blob).await;
            }
            return Err(e);
        }

        info!(
            "Message {} ({}) {} -> {}",
            message.id,
            kind,
            message.sender_id,
            message.recipient_id
        );
        Ok(message)
    }

    /// Messages between two users in either direction, oldest first.
    pub async fn conversation(
        &self,
        user_a: &str,
        user_b: &str,
        after: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<ConversationMessage>, ApiError> {
        let user_a = parse_user_id(user_a)?.to_string();
        let user_b = parse_user_id(user_b)?.to_string();
        let after = after
            .map(|raw| {
                raw.parse::<Uuid>()
                    .map(|id| id.to_string())
                    .map_err(|_| ApiError::validation("Invalid cursor"))
            })
            .transpose()?;
        let limit = match limit {
            Some(0) => return Err(ApiError::validation("limit must be at least 1")),
            Some(n) => Some(n.min(MAX_PAGE_SIZE)),
            None => None,
        };

        let db = self.db.clone();
        let rows = run_blocking(move || {
            if let Some(cursor) = &after {
                if db.get_message(cursor)?.is_none() {
                    return Err(ApiError::not_found("Cursor message not found"));
                }
            }
            Ok(db.get_conversation(&user_a, &user_b, after.as_deref(), limit)?)
        })
        .await?;

        Ok(rows.into_iter().map(conversation_message).collect())
    }

    /// Delete messages by id. Unknown ids are skipped; the count covers only
    /// messages that existed. Images of deleted messages are removed too.
    pub async fn delete(&self, ids: Vec<String>) -> Result<usize, ApiError> {
        if ids.is_empty() {
            return Err(ApiError::validation("Invalid request body"));
        }

        let db = self.db.clone();
        let (deleted, refs) = run_blocking(move || Ok(db.delete_messages(&ids)?)).await?;

        for attachment_ref in refs {
            match self.blobs.key_from_url(&attachment_ref) {
                Some(key) => {
                    if let Err(e) = self.blobs.delete(key).await {
                        warn!("Failed to delete image {} of removed message: {}", key, e);
                    }
                }
                None => warn!("Attachment ref {} is not a local blob", attachment_ref),
            }
        }

        Ok(deleted)
    }

    async fn persist(&self, message: &Message) -> Result<(), ApiError> {
        let db = self.db.clone();
        let id = message.id.to_string();
        let sender_id = message.sender_id.to_string();
        let recipient_id = message.recipient_id.to_string();
        let kind = message.content.kind();
        let body = message.content.body().map(str::to_string);
        let attachment_ref = message.content.attachment_ref().map(str::to_string);
        let created_at = format_timestamp(message.created_at);

        run_blocking(move || {
            db.insert_message(&NewMessage {
                id: &id,
                sender_id: &sender_id,
                recipient_id: &recipient_id,
                message_type: kind.as_str(),
                body: body.as_deref(),
                attachment_ref: attachment_ref.as_deref(),
                created_at: &created_at,
            })?;
            Ok(())
        })
        .await
    }

    async fn discard_blob(&self, blob: &StoredBlob) {
        match self.blobs.delete(&blob.key).await {
            Ok(()) => info!("Removed orphaned image {}", blob.key),
            Err(e) => warn!("Failed to remove orphaned image {}: {}", blob.key, e),
        }
    }
}

// -- Handlers --

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    pub limit: Option<u32>,
    /// Cursor-based pagination: id of the last message already seen.
    pub after: Option<String>,
}

/// POST /messages: multipart form with `senderId`, `recipientId`,
/// `messageType`, optional `messageText` and an optional `imageFile`.
pub async fn send_message(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let draft = read_draft(multipart?).await?;
    let message = state.messenger.send(draft).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path((sender_id, recipient_id)): Path<(String, String)>,
    Query(query): Query<ConversationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .messenger
        .conversation(&sender_id, &recipient_id, query.after.as_deref(), query.limit)
        .await?;
    Ok(Json(messages))
}

pub async fn delete_messages(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<DeleteMessagesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.messenger.delete(req.messages).await?;
    Ok(Json(DeleteMessagesResponse {
        message: "Messages deleted successfully".into(),
        deleted,
    }))
}

async fn read_draft(mut multipart: Multipart) -> Result<MessageDraft, ApiError> {
    let mut draft = MessageDraft::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("Malformed form data: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "imageFile" | "image" => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                if !content_type.starts_with("image/") {
                    return Err(ApiError::validation("Only image files are allowed"));
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(format!("Failed to read image: {}", e)))?;
                if bytes.len() > MAX_IMAGE_SIZE {
                    return Err(ApiError::validation("Image exceeds the 5 MB limit"));
                }
                draft.attachment = Some(Attachment {
                    bytes,
                    content_type,
                });
            }
            "senderId" | "recipientId" | "recepientId" | "messageType" | "messageText" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::validation(format!("Malformed field {}: {}", name, e)))?;
                match name.as_str() {
                    "senderId" => draft.sender_id = value,
                    "recipientId" | "recepientId" => draft.recipient_id = value,
                    "messageType" => draft.message_type = value,
                    _ => draft.text = Some(value),
                }
            }
            _ => {
                // Skip unknown fields
            }
        }
    }

    Ok(draft)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::create_account;
    use kith_types::api::RegisterRequest;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        blobs: Arc<BlobStore>,
        messenger: Messenger,
        alice: String,
        bob: String,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let blobs = Arc::new(BlobStore::new(dir.path().join("files"), "/files").await.unwrap());
        let user = |name: &str| {
            create_account(
                &db,
                &RegisterRequest {
                    name: name.into(),
                    email: format!("{name}@example.com"),
                    password: "secret1".into(),
                    image: None,
                },
            )
            .unwrap()
            .id
            .to_string()
        };
        let alice = user("alice");
        let bob = user("bob");
        Fixture {
            messenger: Messenger::new(db.clone(), blobs.clone()),
            _dir: dir,
            db,
            blobs,
            alice,
            bob,
        }
    }

    fn text(from: &str, to: &str, body: &str) -> MessageDraft {
        MessageDraft {
            sender_id: from.into(),
            recipient_id: to.into(),
            message_type: "text".into(),
            text: Some(body.into()),
            attachment: None,
        }
    }

    fn image(from: &str, to: &str) -> MessageDraft {
        MessageDraft {
            sender_id: from.into(),
            recipient_id: to.into(),
            message_type: "image".into(),
            text: None,
            attachment: Some(Attachment {
                bytes: Bytes::from_static(b"\x89PNG fake"),
                content_type: "image/png".into(),
            }),
        }
    }

    async fn blob_count(blobs: &BlobStore) -> usize {
        let mut entries = tokio::fs::read_dir(blobs.dir()).await.unwrap();
        let mut n = 0;
        while entries.next_entry().await.unwrap().is_some() {
            n += 1;
        }
        n
    }

    #[tokio::test]
    async fn text_message_is_trimmed_and_stored() {
        let f = fixture().await;

        let msg = f.messenger.send(text(&f.alice, &f.bob, "  hi  ")).await.unwrap();
        assert_eq!(msg.content, MessageContent::Text { body: "hi".into() });
        assert_eq!(msg.status, MessageStatus::Sent);

        let stored = f.db.get_message(&msg.id.to_string()).unwrap().unwrap();
        assert_eq!(stored.body.as_deref(), Some("hi"));
        assert!(stored.attachment_ref.is_none());
    }

    #[tokio::test]
    async fn blank_text_is_rejected() {
        let f = fixture().await;

        for body in ["", "   ", "\n\t"] {
            let err = f.messenger.send(text(&f.alice, &f.bob, body)).await.unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)));
        }
        let mut draft = text(&f.alice, &f.bob, "");
        draft.text = None;
        assert!(matches!(f.messenger.send(draft).await, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn validation_order_is_ids_users_type_payload() {
        let f = fixture().await;
        let ghost = Uuid::new_v4().to_string();

        let mut draft = text("bad", &ghost, "");
        draft.message_type = "video".into();
        let err = f.messenger.send(draft.clone()).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid user IDs provided");

        draft.sender_id = f.alice.clone();
        let err = f.messenger.send(draft.clone()).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        draft.recipient_id = f.bob.clone();
        let err = f.messenger.send(draft.clone()).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid message type");

        draft.message_type = "text".into();
        let err = f.messenger.send(draft).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn image_message_stores_blob_reference_only() {
        let f = fixture().await;

        let mut draft = image(&f.alice, &f.bob);
        draft.text = Some("ignored caption".into());
        let msg = f.messenger.send(draft).await.unwrap();

        let attachment_ref = msg.content.attachment_ref().unwrap().to_string();
        assert!(attachment_ref.starts_with("/files/"));
        assert!(attachment_ref.ends_with(".png"));
        assert!(msg.content.body().is_none());

        let key = f.blobs.key_from_url(&attachment_ref).unwrap();
        assert!(f.blobs.exists(key).await);
    }

    #[test]
    fn image_extension_follows_content_type() {
        assert_eq!(image_extension("image/png"), Some("png"));
        assert_eq!(image_extension("IMAGE/JPEG; charset=binary"), Some("jpg"));
        assert_eq!(image_extension("image/webp"), Some("webp"));
        assert_eq!(image_extension("image/svg+xml"), None);
        assert_eq!(image_extension("text/html"), None);
    }

    #[tokio::test]
    async fn unsupported_image_type_stores_nothing() {
        let f = fixture().await;

        let mut draft = image(&f.alice, &f.bob);
        draft.attachment.as_mut().unwrap().content_type = "image/svg+xml".into();
        assert!(matches!(f.messenger.send(draft).await, Err(ApiError::Validation(_))));
        assert_eq!(blob_count(&f.blobs).await, 0);
    }

    #[tokio::test]
    async fn image_without_bytes_is_rejected() {
        let f = fixture().await;

        let mut draft = image(&f.alice, &f.bob);
        draft.attachment = None;
        assert!(matches!(f.messenger.send(draft).await, Err(ApiError::Validation(_))));

        let mut draft = image(&f.alice, &f.bob);
        draft.attachment.as_mut().unwrap().bytes = Bytes::new();
        assert!(matches!(f.messenger.send(draft).await, Err(ApiError::Validation(_))));

        assert_eq!(blob_count(&f.blobs).await, 0);
    }

    #[tokio::test]
    async fn failed_insert_removes_orphaned_blob() {
        let f = fixture().await;
        f.db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE messages;")?;
            Ok(())
        })
        .unwrap();

        let err = f.messenger.send(image(&f.alice, &f.bob)).await.unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));
        assert_eq!(blob_count(&f.blobs).await, 0);
    }

    #[tokio::test]
    async fn conversation_is_ordered_and_scoped_to_the_pair() {
        let f = fixture().await;
        let carol = create_account(
            &f.db,
            &RegisterRequest {
                name: "carol".into(),
                email: "carol@example.com".into(),
                password: "secret1".into(),
                image: None,
            },
        )
        .unwrap()
        .id
        .to_string();

        f.messenger.send(text(&f.alice, &f.bob, "1")).await.unwrap();
        f.messenger.send(text(&f.bob, &f.alice, "2")).await.unwrap();
        f.messenger.send(text(&f.alice, &carol, "other")).await.unwrap();
        f.messenger.send(text(&f.alice, &f.bob, "3")).await.unwrap();

        let convo = f.messenger.conversation(&f.bob, &f.alice, None, None).await.unwrap();
        let bodies: Vec<_> = convo.iter().map(|m| m.message.content.body().unwrap()).collect();
        assert_eq!(bodies, vec!["1", "2", "3"]);
        assert!(convo.windows(2).all(|w| w[0].message.created_at <= w[1].message.created_at));
        assert_eq!(convo[1].sender.name, "bob");

        let page = f
            .messenger
            .conversation(&f.alice, &f.bob, Some(&convo[0].message.id.to_string()), Some(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].message.content.body(), Some("2"));
    }

    #[tokio::test]
    async fn delete_counts_only_existing_messages() {
        let f = fixture().await;
        let msg = f.messenger.send(text(&f.alice, &f.bob, "bye")).await.unwrap();

        assert!(matches!(f.messenger.delete(vec![]).await, Err(ApiError::Validation(_))));

        let deleted = f
            .messenger
            .delete(vec![msg.id.to_string(), Uuid::new_v4().to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(f.messenger.conversation(&f.alice, &f.bob, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_image_message_removes_its_blob() {
        let f = fixture().await;
        let msg = f.messenger.send(image(&f.alice, &f.bob)).await.unwrap();
        assert_eq!(blob_count(&f.blobs).await, 1);

        f.messenger.delete(vec![msg.id.to_string()]).await.unwrap();
        assert_eq!(blob_count(&f.blobs).await, 0);
    }
}
