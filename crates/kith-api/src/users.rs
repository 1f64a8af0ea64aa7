use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

use kith_db::Database;
use kith_db::models::LinkKind;
use kith_types::models::UserProfile;

use crate::error::ApiError;
use crate::rows::{parse_user_id, user_profile};
use crate::state::{AppState, run_blocking};

/// GET /users/{user_id}: everyone else, flagged with the caller's relationship.
pub async fn list_users(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let friends = state.friends.clone();
    let users = run_blocking(move || friends.list_others(&user_id)).await?;
    Ok(Json(users))
}

/// GET /user/{user_id}: the full record, id sets included.
pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let profile = run_blocking(move || load_profile(&db, &user_id)).await?;
    Ok(Json(profile))
}

pub fn load_profile(db: &Database, user_id: &str) -> Result<UserProfile, ApiError> {
    let id = parse_user_id(user_id)?.to_string();

    let user = db
        .get_user_by_id(&id)?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    let friends = db.get_link_ids(&id, LinkKind::Friend)?;
    let incoming = db.get_link_ids(&id, LinkKind::Incoming)?;
    let outgoing = db.get_link_ids(&id, LinkKind::Outgoing)?;

    Ok(user_profile(&user, &friends, &incoming, &outgoing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::create_account;
    use kith_types::api::RegisterRequest;

    #[test]
    fn profile_lists_sets_and_hides_password() {
        let db = Database::open_in_memory().unwrap();
        let alice = create_account(
            &db,
            &RegisterRequest {
                name: "alice".into(),
                email: "alice@example.com".into(),
                password: "secret1".into(),
                image: Some("https://img.example.com/a.png".into()),
            },
        )
        .unwrap();

        let profile = load_profile(&db, &alice.id.to_string()).unwrap();
        assert_eq!(profile.email, "alice@example.com");
        assert_eq!(profile.image.as_deref(), Some("https://img.example.com/a.png"));
        assert!(profile.friends.is_empty());

        let json = serde_json::to_value(&profile).unwrap();
        assert!(json.get("password").is_none());
        assert!(json.get("pendingIncoming").is_some());
    }

    #[test]
    fn unknown_or_malformed_ids() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            load_profile(&db, &uuid::Uuid::new_v4().to_string()),
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(load_profile(&db, "123"), Err(ApiError::Validation(_))));
    }
}
