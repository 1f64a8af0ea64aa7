use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::UserSummary;

// -- JWT Claims --

/// Claims carried by the login token. Shared by token issuance and the
/// bearer-auth middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub iat: usize,
    pub exp: usize,
}

// -- Auth --

// Fields default to empty so missing values surface as validation errors
// rather than body rejections.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    pub image: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub message: String,
    pub user: UserSummary,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserSummary,
}

// -- Friend requests --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestBody {
    #[serde(default)]
    pub sender_id: String,
    #[serde(default, alias = "recepientId")]
    pub recipient_id: String,
}

// -- Messages --

#[derive(Debug, Deserialize)]
pub struct DeleteMessagesRequest {
    #[serde(default)]
    pub messages: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteMessagesResponse {
    pub message: String,
    pub deleted: usize,
}

// -- Misc --

#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

impl Ack {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}
