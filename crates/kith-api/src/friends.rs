use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use kith_db::{Connection, Database};
use kith_db::models::{FriendListMutation, LinkKind, UserRow};
use kith_db::queries;
use kith_types::api::{Ack, FriendRequestBody};
use kith_types::models::{DirectoryEntry, FriendDetail, UserSummary};

use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::rows::{
    directory_entry, friend_detail, parse_user_id, row_id, user_summary,
};
use crate::state::{AppState, run_blocking};

/// Friend-request state machine over pairs of users.
///
/// For an ordered pair (A, B) the relation is one of: none, requested
/// (`B ∈ A.outgoing`, `A ∈ B.incoming`) or friends (each in the other's
/// `friend` set). Each transition checks its preconditions and edits both
/// users inside one store transaction, so the paired sets never drift.
#[derive(Clone)]
pub struct FriendRequests {
    db: Arc<Database>,
}

impl FriendRequests {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// none → requested(sender → recipient)
    pub fn send_request(&self, sender_id: &str, recipient_id: &str) -> Result<(), ApiError> {
        let (sender, recipient) = distinct_pair(sender_id, recipient_id)?;

        self.db.transaction(|tx| {
            require_users(tx, &[sender.as_str(), recipient.as_str()])?;

            // A request pending in either direction blocks a new one; the
            // other side should accept instead.
            if queries::has_link(tx, &recipient, LinkKind::Incoming, &sender)?
                || queries::has_link(tx, &sender, LinkKind::Incoming, &recipient)?
            {
                return Err(ApiError::AlreadyRequested);
            }
            if queries::has_link(tx, &sender, LinkKind::Friend, &recipient)? {
                return Err(ApiError::AlreadyFriends);
            }

            queries::apply_mutation(
                tx,
                &recipient,
                &FriendListMutation::new().add(LinkKind::Incoming, sender.as_str()),
            )?;
            queries::apply_mutation(
                tx,
                &sender,
                &FriendListMutation::new().add(LinkKind::Outgoing, recipient.as_str()),
            )?;
            Ok::<_, ApiError>(())
        })?;

        info!("Friend request {} -> {}", sender, recipient);
        Ok(())
    }

    /// requested → friends
    ///
    /// Pending entries are cleared in both directions so a pair can never be
    /// friends and pending at the same time.
    pub fn accept_request(&self, sender_id: &str, recipient_id: &str) -> Result<(), ApiError> {
        let (sender, recipient) = distinct_pair(sender_id, recipient_id)?;

        self.db.transaction(|tx| {
            require_users(tx, &[sender.as_str(), recipient.as_str()])?;

            queries::apply_mutation(tx, &sender, &befriend(&recipient))?;
            queries::apply_mutation(tx, &recipient, &befriend(&sender))?;
            Ok::<_, ApiError>(())
        })?;

        info!("Friend request {} -> {} accepted", sender, recipient);
        Ok(())
    }

    pub fn list_incoming(&self, user_id: &str) -> Result<Vec<UserSummary>, ApiError> {
        let rows = self.linked(user_id, LinkKind::Incoming)?;
        Ok(rows.iter().map(user_summary).collect())
    }

    pub fn list_outgoing(&self, user_id: &str) -> Result<Vec<UserSummary>, ApiError> {
        let rows = self.linked(user_id, LinkKind::Outgoing)?;
        Ok(rows.iter().map(user_summary).collect())
    }

    pub fn list_friends(&self, user_id: &str) -> Result<Vec<UserSummary>, ApiError> {
        let rows = self.linked(user_id, LinkKind::Friend)?;
        Ok(rows.iter().map(user_summary).collect())
    }

    pub fn list_friend_details(&self, user_id: &str) -> Result<Vec<FriendDetail>, ApiError> {
        let rows = self.linked(user_id, LinkKind::Friend)?;
        Ok(rows.iter().map(friend_detail).collect())
    }

    pub fn list_friend_ids(&self, user_id: &str) -> Result<Vec<Uuid>, ApiError> {
        let user = parse_user_id(user_id)?.to_string();
        let ids = self.db.transaction(|tx| {
            require_users(tx, &[user.as_str()])?;
            Ok::<_, ApiError>(queries::link_ids(tx, &user, LinkKind::Friend)?)
        })?;
        Ok(ids.iter().map(|id| row_id(id, "friend id")).collect())
    }

    /// Every user except `user_id`, flagged with whether `user_id` has a
    /// pending request to them and whether they are already friends.
    pub fn list_others(&self, user_id: &str) -> Result<Vec<DirectoryEntry>, ApiError> {
        let user = parse_user_id(user_id)?.to_string();

        let (others, outgoing, friends) = self.db.transaction(|tx| {
            require_users(tx, &[user.as_str()])?;
            let outgoing: HashSet<String> =
                queries::link_ids(tx, &user, LinkKind::Outgoing)?.into_iter().collect();
            let friends: HashSet<String> =
                queries::link_ids(tx, &user, LinkKind::Friend)?.into_iter().collect();
            let others = queries::users_except(tx, &user)?;
            Ok::<_, ApiError>((others, outgoing, friends))
        })?;

        Ok(others
            .iter()
            .map(|row| directory_entry(row, outgoing.contains(&row.id), friends.contains(&row.id)))
            .collect())
    }

    fn linked(&self, user_id: &str, kind: LinkKind) -> Result<Vec<UserRow>, ApiError> {
        let user = parse_user_id(user_id)?.to_string();
        self.db.transaction(|tx| {
            require_users(tx, &[user.as_str()])?;
            Ok(queries::linked_users(tx, &user, kind)?)
        })
    }
}

fn distinct_pair(sender_id: &str, recipient_id: &str) -> Result<(String, String), ApiError> {
    let sender = parse_user_id(sender_id)?;
    let recipient = parse_user_id(recipient_id)?;
    if sender == recipient {
        return Err(ApiError::validation("Sender and recipient must be different users"));
    }
    Ok((sender.to_string(), recipient.to_string()))
}

fn require_users(conn: &Connection, ids: &[&str]) -> Result<(), ApiError> {
    for id in ids {
        if !queries::user_exists(conn, id)? {
            return Err(ApiError::not_found("User not found"));
        }
    }
    Ok(())
}

fn befriend(other: &str) -> FriendListMutation {
    FriendListMutation::new()
        .remove(LinkKind::Incoming, other)
        .remove(LinkKind::Outgoing, other)
        .add(LinkKind::Friend, other)
}

// -- Handlers --

pub async fn send_request(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<FriendRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let friends = state.friends.clone();
    run_blocking(move || friends.send_request(&req.sender_id, &req.recipient_id)).await?;
    Ok(Json(Ack::ok("Friend request sent successfully")))
}

pub async fn accept_request(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<FriendRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let friends = state.friends.clone();
    run_blocking(move || friends.accept_request(&req.sender_id, &req.recipient_id)).await?;
    Ok(Json(Ack::ok("Friend request accepted successfully")))
}

pub async fn incoming_requests(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let friends = state.friends.clone();
    let list = run_blocking(move || friends.list_incoming(&user_id)).await?;
    Ok(Json(list))
}

pub async fn outgoing_requests(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let friends = state.friends.clone();
    let list = run_blocking(move || friends.list_outgoing(&user_id)).await?;
    Ok(Json(list))
}

pub async fn accepted_friends(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let friends = state.friends.clone();
    let list = run_blocking(move || friends.list_friends(&user_id)).await?;
    Ok(Json(list))
}

pub async fn friend_ids(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let friends = state.friends.clone();
    let ids = run_blocking(move || friends.list_friend_ids(&user_id)).await?;
    Ok(Json(ids))
}

pub async fn friends_with_details(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let friends = state.friends.clone();
    let list = run_blocking(move || friends.list_friend_details(&user_id)).await?;
    Ok(Json(list))
}
