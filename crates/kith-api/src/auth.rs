use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::info;
use uuid::Uuid;

use kith_db::models::{NewUser, UserRow};
use kith_db::{Database, is_constraint_violation};
use kith_types::api::{Ack, Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use kith_types::models::UserSummary;

use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::rows::user_summary;
use crate::state::{AppState, AuthConfig, run_blocking};

const MIN_PASSWORD_LEN: usize = 6;

pub async fn register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let user = run_blocking(move || create_account(&db, &req)).await?;

    info!("Registered user {} <{}>", user.id, user.email);
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered successfully".into(),
            user,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let user = run_blocking(move || authenticate(&db, &req)).await?;

    let user = user_summary(&user);
    let token = create_token(&state.auth, user.id, &user.email)?;

    Ok(Json(LoginResponse { token, user }))
}

/// Tokens are stateless; logging out is the client discarding its token.
pub async fn logout() -> Json<Ack> {
    Json(Ack::ok("Logged out successfully"))
}

/// Validate a registration and insert the user.
///
/// The duplicate-email check runs as soon as an email is present, so a
/// taken address is reported as such whatever the other fields hold. The
/// UNIQUE constraint backs the check up when two registrations race.
pub fn create_account(db: &Database, req: &RegisterRequest) -> Result<UserSummary, ApiError> {
    let email = req.email.trim();
    if email.is_empty() {
        return Err(ApiError::validation("All fields are required"));
    }
    if db.get_user_by_email(email)?.is_some() {
        return Err(ApiError::DuplicateEmail);
    }

    let name = req.name.trim();
    if name.is_empty() || req.password.is_empty() {
        return Err(ApiError::validation("All fields are required"));
    }
    if !looks_like_email(email) {
        return Err(ApiError::validation("Invalid email address"));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let password_hash = hash_password(&req.password)?;
    let user_id = Uuid::new_v4();
    let image = req.image.as_deref().map(str::trim).filter(|s| !s.is_empty());

    db.create_user(&NewUser {
        id: &user_id.to_string(),
        name,
        email,
        password_hash: &password_hash,
        image,
    })
    .map_err(|e| {
        if is_constraint_violation(&e) {
            ApiError::DuplicateEmail
        } else {
            ApiError::Internal(e)
        }
    })?;

    Ok(UserSummary {
        id: user_id,
        name: name.to_string(),
        email: email.to_string(),
        image: image.map(str::to_string),
    })
}

/// Check credentials and stamp `last_seen` on success.
pub fn authenticate(db: &Database, req: &LoginRequest) -> Result<UserRow, ApiError> {
    let email = req.email.trim();
    if email.is_empty() || req.password.is_empty() {
        return Err(ApiError::validation("Email and password required"));
    }

    let user = db
        .get_user_by_email(email)?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    verify_password(&req.password, &user.password)?;
    db.touch_last_seen(&user.id)?;

    Ok(user)
}

// Hash password with Argon2id
fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
        .to_string();
    Ok(hash)
}

fn verify_password(password: &str, stored_hash: &str) -> Result<(), ApiError> {
    let parsed_hash = PasswordHash::new(stored_hash)
        .map_err(|e| anyhow::anyhow!("stored password hash is unreadable: {}", e))?;

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized("Invalid credentials".into()))
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !email.contains(' '),
        None => false,
    }
}

pub fn create_token(auth: &AuthConfig, user_id: Uuid, email: &str) -> anyhow::Result<String> {
    let now = chrono::Utc::now();
    let ttl = chrono::Duration::from_std(auth.token_ttl)?;
    let claims = Claims {
        sub: user_id,
        email: email.to_string(),
        iat: now.timestamp() as usize,
        exp: (now + ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(auth.jwt_secret.as_bytes()),
    )?;

    Ok(token)
}

pub fn decode_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized("Invalid or expired token".into()))?;

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn register_req(name: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            name: name.into(),
            email: email.into(),
            password: password.into(),
            image: None,
        }
    }

    fn auth_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret".into(),
            token_ttl: Duration::from_secs(3600),
            require_auth: false,
        }
    }

    #[test]
    fn duplicate_email_conflicts_whatever_else_is_sent() {
        let db = Database::open_in_memory().unwrap();
        create_account(&db, &register_req("Alice", "alice@example.com", "secret1")).unwrap();

        for req in [
            register_req("Other", "alice@example.com", "another-pass"),
            register_req("", "alice@example.com", ""),
            register_req("X", "alice@example.com", "abc"),
            register_req("X", "ALICE@example.com", "secret1"),
        ] {
            let err = create_account(&db, &req).unwrap_err();
            assert!(matches!(err, ApiError::DuplicateEmail), "got {err:?}");
        }
    }

    #[test]
    fn registration_validates_fields() {
        let db = Database::open_in_memory().unwrap();

        let cases = [
            register_req("", "a@x.com", "secret1"),
            register_req("A", "", "secret1"),
            register_req("A", "a@x.com", ""),
            register_req("A", "a@x.com", "12345"),
            register_req("A", "not-an-email", "secret1"),
        ];
        for req in cases {
            assert!(matches!(
                create_account(&db, &req),
                Err(ApiError::Validation(_))
            ));
        }
    }

    #[test]
    fn passwords_are_stored_hashed() {
        let db = Database::open_in_memory().unwrap();
        create_account(&db, &register_req("Alice", "alice@example.com", "secret1")).unwrap();

        let row = db.get_user_by_email("alice@example.com").unwrap().unwrap();
        assert_ne!(row.password, "secret1");
        assert!(row.password.starts_with("$argon2id$"));
    }

    #[test]
    fn login_distinguishes_unknown_user_and_bad_password() {
        let db = Database::open_in_memory().unwrap();
        create_account(&db, &register_req("Alice", "alice@example.com", "secret1")).unwrap();

        let wrong = LoginRequest {
            email: "alice@example.com".into(),
            password: "secret2".into(),
        };
        assert!(matches!(authenticate(&db, &wrong), Err(ApiError::Unauthorized(_))));

        let unknown = LoginRequest {
            email: "bob@example.com".into(),
            password: "secret1".into(),
        };
        assert!(matches!(authenticate(&db, &unknown), Err(ApiError::NotFound(_))));

        let ok = LoginRequest {
            email: "alice@example.com".into(),
            password: "secret1".into(),
        };
        let user = authenticate(&db, &ok).unwrap();
        let row = db.get_user_by_id(&user.id).unwrap().unwrap();
        assert!(row.last_seen.is_some());
    }

    #[test]
    fn token_carries_user_id() {
        let auth = auth_config();
        let user_id = Uuid::new_v4();
        let token = create_token(&auth, user_id, "alice@example.com").unwrap();

        let claims = decode_token(&auth.jwt_secret, &token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.exp - claims.iat, 3600);

        assert!(decode_token("other-secret", &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = auth_config();
        let past = (chrono::Utc::now() - chrono::Duration::hours(2)).timestamp() as usize;
        let claims = Claims {
            sub: Uuid::new_v4(),
            email: "a@x.com".into(),
            iat: past,
            exp: past + 60,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(auth.jwt_secret.as_bytes()),
        )
        .unwrap();

        assert!(matches!(
            decode_token(&auth.jwt_secret, &token),
            Err(ApiError::Unauthorized(_))
        ));
    }
}
