use std::any::Any;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::error;

use kith_types::api::HealthResponse;

use crate::error::ApiError;
use crate::messages::MAX_IMAGE_SIZE;
use crate::middleware::require_auth;
use crate::state::AppState;
use crate::{auth, friends, messages, users};

/// Public path stored images are served under.
pub const FILES_PATH: &str = "/files";

/// Build the full HTTP surface around `state`.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout));

    let mut api_routes = Router::new()
        .route("/users/{user_id}", get(users::list_users))
        .route("/user/{user_id}", get(users::get_user))
        .route("/friend-request", post(friends::send_request))
        .route("/friend-request/accept", post(friends::accept_request))
        .route("/friend-request/{user_id}", get(friends::incoming_requests))
        .route("/friend-requests/sent/{user_id}", get(friends::outgoing_requests))
        .route("/accepted-friends/{user_id}", get(friends::accepted_friends))
        .route("/friends/{user_id}", get(friends::friend_ids))
        .route("/friends-with-details/{user_id}", get(friends::friends_with_details))
        .route(
            "/messages",
            // Headroom over the image limit for the other form fields
            post(messages::send_message).layer(DefaultBodyLimit::max(MAX_IMAGE_SIZE + 64 * 1024)),
        )
        .route("/messages/{sender_id}/{recipient_id}", get(messages::get_conversation))
        .route("/deleteMessages", post(messages::delete_messages));

    if state.auth.require_auth {
        api_routes = api_routes.layer(middleware::from_fn_with_state(state.clone(), require_auth));
    }

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .nest_service(FILES_PATH, ServeDir::new(state.blobs.dir()))
        .fallback(not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// GET /: liveness text.
async fn root() -> &'static str {
    "I am Running"
}

/// GET /health: liveness check (no auth).
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".into(),
    })
}

async fn not_found() -> ApiError {
    ApiError::not_found("Route not found")
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Handler panicked: {}", detail);
    ApiError::Internal(anyhow::anyhow!("handler panicked")).into_response()
}
