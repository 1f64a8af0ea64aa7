use std::sync::Arc;
use std::time::Duration;

use kith_blob::BlobStore;
use kith_db::Database;

use crate::error::ApiError;
use crate::friends::FriendRequests;
use crate::messages::Messenger;

pub type AppState = Arc<AppStateInner>;

/// Token settings handed down from the server configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl: Duration,
    /// Require a bearer token on every non-public route.
    pub require_auth: bool,
}

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub blobs: Arc<BlobStore>,
    pub auth: AuthConfig,
    pub friends: FriendRequests,
    pub messenger: Messenger,
}

impl AppStateInner {
    pub fn new(db: Arc<Database>, blobs: Arc<BlobStore>, auth: AuthConfig) -> AppState {
        Arc::new(Self {
            friends: FriendRequests::new(db.clone()),
            messenger: Messenger::new(db.clone(), blobs.clone()),
            db,
            blobs,
            auth,
        })
    }
}

/// Run blocking store work (SQLite, password hashing) off the async runtime.
pub(crate) async fn run_blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
