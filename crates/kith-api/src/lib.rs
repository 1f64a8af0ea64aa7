pub mod auth;
pub mod error;
pub mod extract;
pub mod friends;
pub mod messages;
pub mod middleware;
pub mod routes;
pub mod users;

mod rows;
mod state;

pub use error::ApiError;
pub use friends::FriendRequests;
pub use messages::{Attachment, MessageDraft, Messenger};
pub use routes::{FILES_PATH, router};
pub use state::{AppState, AppStateInner, AuthConfig};
