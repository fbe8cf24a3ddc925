use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{map_db_error, AppError, AppResult};
use crate::schemas::UserContext;
use crate::tenancy::AppContext;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    roles: Vec<String>,
    app: String,
    iat: i64,
    exp: i64,
}

pub fn issue_access_token(
    app_name: &str,
    jwt_secret: &str,
    user: &UserContext,
    ttl_minutes: i64,
) -> AppResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id.clone(),
        email: user.email.clone(),
        roles: user.roles.clone(),
        app: app_name.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::minutes(ttl_minutes)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .map_err(|error| AppError::Internal(format!("Token signing failed: {error}")))
}

pub fn verify_access_token(app_name: &str, jwt_secret: &str, token: &str) -> AppResult<UserContext> {
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::Unauthorized("Invalid or expired token.".to_string()))?;

    if decoded.claims.app != app_name {
        return Err(AppError::Unauthorized(
            "Token was issued for a different app.".to_string(),
        ));
    }

    Ok(UserContext {
        id: decoded.claims.sub,
        email: decoded.claims.email,
        roles: decoded.claims.roles,
    })
}

fn bearer_token(headers: &HeaderMap) -> AppResult<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token.".to_string()))
}

/// Resolve the caller from the Authorization header against the app's
/// per-tenant secret.
pub fn require_user(app: &AppContext, headers: &HeaderMap) -> AppResult<UserContext> {
    let token = bearer_token(headers)?;
    verify_access_token(&app.name, &app.jwt_secret, token)
}

pub fn require_admin(app: &AppContext, headers: &HeaderMap) -> AppResult<UserContext> {
    let user = require_user(app, headers)?;
    if !user.is_admin() {
        return Err(AppError::Forbidden(
            "Forbidden: admin role required.".to_string(),
        ));
    }
    Ok(user)
}

// ---------------------------------------------------------------------------
// Login / refresh / logout / invites
// ---------------------------------------------------------------------------

pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Uuid,
    pub user: UserContext,
}

impl TokenPair {
    pub fn to_json(&self) -> Value {
        json!({
            "access_token": self.access_token,
            "refresh_token": self.refresh_token.to_string(),
            "user": {
                "id": self.user.id,
                "email": self.user.email,
                "roles": self.user.roles,
            },
        })
    }
}

pub async fn login(
    app: &AppContext,
    email: &str,
    password: &str,
    access_ttl_minutes: i64,
    refresh_ttl_days: i64,
) -> AppResult<TokenPair> {
    let row = sqlx::query(
        "SELECT id::text AS id, email, password_hash, roles FROM _users
         WHERE email = $1 AND active = true LIMIT 1",
    )
    .bind(email.trim().to_ascii_lowercase())
    .fetch_optional(&app.pool)
    .await
    .map_err(map_db_error)?;

    let invalid = || AppError::Unauthorized("Invalid email or password.".to_string());
    let row = row.ok_or_else(invalid)?;

    let hash: Option<String> = row.try_get("password_hash").map_err(map_db_error)?;
    let hash = hash.ok_or_else(invalid)?;
    if !bcrypt::verify(password, &hash).unwrap_or(false) {
        return Err(invalid());
    }

    let user = UserContext {
        id: row.try_get("id").map_err(map_db_error)?,
        email: row.try_get("email").map_err(map_db_error)?,
        roles: roles_from(row.try_get::<Value, _>("roles").ok()),
    };

    let access_token = issue_access_token(&app.name, &app.jwt_secret, &user, access_ttl_minutes)?;
    let refresh_token = mint_refresh_token(app, &user.id, refresh_ttl_days).await?;
    Ok(TokenPair {
        access_token,
        refresh_token,
        user,
    })
}

/// Refresh rotates: the presented token is consumed and a new one minted.
pub async fn refresh(
    app: &AppContext,
    refresh_token: Uuid,
    access_ttl_minutes: i64,
    refresh_ttl_days: i64,
) -> AppResult<TokenPair> {
    let row = sqlx::query(
        "DELETE FROM _refresh_tokens
         WHERE token = $1 AND expires_at > now()
         RETURNING user_id::text AS user_id",
    )
    .bind(refresh_token)
    .fetch_optional(&app.pool)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| AppError::Unauthorized("Invalid or expired refresh token.".to_string()))?;

    let user_id: String = row.try_get("user_id").map_err(map_db_error)?;
    let user_row = sqlx::query(
        "SELECT id::text AS id, email, roles FROM _users WHERE id = $1::uuid AND active = true",
    )
    .bind(&user_id)
    .fetch_optional(&app.pool)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| AppError::Unauthorized("User no longer active.".to_string()))?;

    let user = UserContext {
        id: user_row.try_get("id").map_err(map_db_error)?,
        email: user_row.try_get("email").map_err(map_db_error)?,
        roles: roles_from(user_row.try_get::<Value, _>("roles").ok()),
    };

    let access_token = issue_access_token(&app.name, &app.jwt_secret, &user, access_ttl_minutes)?;
    let new_refresh = mint_refresh_token(app, &user.id, refresh_ttl_days).await?;
    Ok(TokenPair {
        access_token,
        refresh_token: new_refresh,
        user,
    })
}

pub async fn logout(app: &AppContext, refresh_token: Uuid) -> AppResult<()> {
    sqlx::query("DELETE FROM _refresh_tokens WHERE token = $1")
        .bind(refresh_token)
        .execute(&app.pool)
        .await
        .map_err(map_db_error)?;
    Ok(())
}

/// Accept an invite: set a password on the invited user (creating the row if
/// absent) and burn the invite token.
pub async fn accept_invite(app: &AppContext, token: Uuid, password: &str) -> AppResult<Value> {
    if password.len() < 8 {
        return Err(AppError::validation(
            "password",
            "min_length",
            "Password must be at least 8 characters.",
        ));
    }

    let invite = sqlx::query(
        "UPDATE _invites SET accepted_at = now()
         WHERE token = $1 AND accepted_at IS NULL AND expires_at > now()
         RETURNING email, roles",
    )
    .bind(token)
    .fetch_optional(&app.pool)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| AppError::NotFound("Invite not found or already used.".to_string()))?;

    let email: String = invite.try_get("email").map_err(map_db_error)?;
    let roles: Value = invite.try_get("roles").unwrap_or(json!([]));
    let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|error| AppError::Internal(format!("Password hashing failed: {error}")))?;

    let row = sqlx::query(
        "INSERT INTO _users (email, password_hash, roles, active)
         VALUES ($1, $2, $3, true)
         ON CONFLICT (email)
         DO UPDATE SET password_hash = EXCLUDED.password_hash, roles = EXCLUDED.roles,
                       active = true, updated_at = now()
         RETURNING id::text AS id, email, roles",
    )
    .bind(email.trim().to_ascii_lowercase())
    .bind(&hash)
    .bind(&roles)
    .fetch_one(&app.pool)
    .await
    .map_err(map_db_error)?;

    Ok(json!({
        "id": row.try_get::<String, _>("id").unwrap_or_default(),
        "email": row.try_get::<String, _>("email").unwrap_or_default(),
        "roles": roles,
    }))
}

async fn mint_refresh_token(app: &AppContext, user_id: &str, ttl_days: i64) -> AppResult<Uuid> {
    let token = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO _refresh_tokens (token, user_id, expires_at)
         VALUES ($1, $2::uuid, now() + ($3 * interval '1 day'))",
    )
    .bind(token)
    .bind(user_id)
    .bind(ttl_days as f64)
    .execute(&app.pool)
    .await
    .map_err(map_db_error)?;
    Ok(token)
}

fn roles_from(value: Option<Value>) -> Vec<String> {
    value
        .and_then(|roles| {
            roles.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect()
            })
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserContext {
        UserContext {
            id: "550e8400-e29b-41d4-a716-446655440000".into(),
            email: "ada@example.test".into(),
            roles: vec!["admin".into()],
        }
    }

    #[test]
    fn token_round_trip_preserves_identity() {
        let token = issue_access_token("crm", "secret", &user(), 15).unwrap();
        let verified = verify_access_token("crm", "secret", &token).unwrap();
        assert_eq!(verified.id, user().id);
        assert_eq!(verified.email, "ada@example.test");
        assert!(verified.is_admin());
    }

    #[test]
    fn token_rejected_for_other_app_or_secret() {
        let token = issue_access_token("crm", "secret", &user(), 15).unwrap();
        assert!(matches!(
            verify_access_token("billing", "secret", &token),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            verify_access_token("crm", "other-secret", &token),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn expired_token_rejected() {
        let token = issue_access_token("crm", "secret", &user(), -1).unwrap();
        assert!(verify_access_token("crm", "secret", &token).is_err());
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "abc123");
        headers.insert("authorization", "Basic abc123".parse().unwrap());
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn roles_parse_defensively() {
        assert_eq!(
            roles_from(Some(json!(["admin", "editor"]))),
            vec!["admin".to_string(), "editor".to_string()]
        );
        assert!(roles_from(Some(json!("not-a-list"))).is_empty());
        assert!(roles_from(None).is_empty());
    }
}
