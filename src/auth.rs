// Authentication: Telegram login verification, JWT session tokens, and the
// bearer-token extractor.

use std::collections::BTreeMap;

use axum::{
    extract::{FromRef, FromRequestParts, State},
    http::request::Parts,
    Json,
};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::api::{ApiJson, AppState};
use crate::db::{Profile, User};
use crate::error::{AppError, Result};
use crate::identity;

type HmacSha256 = Hmac<Sha256>;

/// Session lifetime.
const TOKEN_TTL_DAYS: i64 = 7;

// ── JWT ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // user id
    pub telegram_id: i64,
    pub username: Option<String>,
    pub exp: usize, // expiry (unix timestamp)
}

impl Claims {
    pub fn user_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }
}

pub fn create_token(user: &User, secret: &str) -> std::result::Result<String, String> {
    let expiration = (chrono::Utc::now() + chrono::Duration::days(TOKEN_TTL_DAYS)).timestamp();

    let claims = Claims {
        sub: user.id.to_string(),
        telegram_id: user.telegram_id,
        username: user.username.clone(),
        exp: expiration as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| format!("Failed to create token: {e}"))
}

pub fn verify_token(token: &str, secret: &str) -> std::result::Result<Claims, String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| format!("Invalid token: {e}"))
}

// ── Telegram login widget ────────────────────────────────────────────

/// `key=value` lines of every field except `hash`, sorted by key.
pub fn data_check_string(data: &Map<String, Value>) -> String {
    let fields: BTreeMap<&str, String> = data
        .iter()
        .filter(|(k, _)| k.as_str() != "hash")
        .filter_map(|(k, v)| {
            let rendered = match v {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((k.as_str(), rendered))
        })
        .collect();

    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Verify the login widget signature: HMAC-SHA256 keyed with
/// SHA-256(bot token) over the data check string.
pub fn check_telegram_auth(data: &Map<String, Value>, bot_token: &str) -> bool {
    let Some(expected) = data
        .get("hash")
        .and_then(Value::as_str)
        .and_then(|h| hex::decode(h).ok())
    else {
        return false;
    };

    let secret = Sha256::digest(bot_token.as_bytes());
    let Ok(mut mac) = HmacSha256::new_from_slice(&secret) else {
        return false;
    };
    mac.update(data_check_string(data).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn string_field(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Telegram sends `id` as a number; accept a numeric string too.
fn telegram_id_field(data: &Map<String, Value>) -> Option<i64> {
    match data.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ── Axum extractor: AuthUser ─────────────────────────────────────────

/// Extracts the authenticated user from the `Authorization: Bearer` header.
/// Usage: `AuthUser(claims)` in handler parameters.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl AuthUser {
    pub fn id(&self) -> i64 {
        // Validated in the extractor.
        self.0.user_id().unwrap_or_default()
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let state = AppState::from_ref(state);

        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::unauthorized("Invalid Authorization header format"))?;

        let claims = verify_token(token, &state.config.jwt_secret).map_err(|e| {
            tracing::debug!("Rejected bearer token: {e}");
            AppError::unauthorized("Invalid token")
        })?;

        if claims.user_id().is_none() {
            return Err(AppError::unauthorized("Invalid token subject"));
        }
        Ok(AuthUser(claims))
    }
}

// ── Auth API handlers ────────────────────────────────────────────────

#[derive(Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

/// POST /api/auth/telegram: verify the login widget payload, resolve the
/// user and issue a session token.
pub async fn telegram_auth(
    State(state): State<AppState>,
    ApiJson(data): ApiJson<Map<String, Value>>,
) -> Result<Json<TokenResponse>> {
    if !state.config.skip_telegram_signature {
        let bot_token = state.config.bot_token.as_deref().ok_or_else(|| {
            tracing::error!("BOT_TOKEN is not configured; cannot verify Telegram login");
            AppError::Internal("Bot token not configured".to_string())
        })?;
        if !check_telegram_auth(&data, bot_token) {
            tracing::warn!("Rejected Telegram login with invalid signature");
            return Err(AppError::invalid_argument("Invalid Telegram signature"));
        }
    }

    let telegram_id = telegram_id_field(&data)
        .ok_or_else(|| AppError::invalid_argument("Missing Telegram user id"))?;

    let profile = Profile {
        username: string_field(&data, "username"),
        first_name: string_field(&data, "first_name"),
        last_name: string_field(&data, "last_name"),
        avatar_url: string_field(&data, "photo_url"),
    };
    let user = identity::resolve(&state.db, telegram_id, &profile).await?;

    let access_token = create_token(&user, &state.config.jwt_secret).map_err(AppError::Internal)?;

    tracing::info!("Issued session token for user {}", user.id);
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
    }))
}

/// GET /api/auth/me
pub async fn me(auth: AuthUser, State(state): State<AppState>) -> Result<Json<User>> {
    let user = identity::get(&state.db, auth.id()).await?;
    Ok(Json(user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_user() -> User {
        User {
            id: 7,
            telegram_id: 123456,
            username: Some("smasher".to_string()),
            first_name: None,
            last_name: None,
            avatar_url: None,
            rating: 1200,
            is_admin: false,
            created_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    fn sign(data: &mut Map<String, Value>, bot_token: &str) {
        let secret = Sha256::digest(bot_token.as_bytes());
        let mut mac = HmacSha256::new_from_slice(&secret).unwrap();
        mac.update(data_check_string(data).as_bytes());
        let hash = hex::encode(mac.finalize().into_bytes());
        data.insert("hash".to_string(), Value::String(hash));
    }

    fn login_payload() -> Map<String, Value> {
        let value = json!({
            "id": 123456,
            "first_name": "Ivan",
            "username": "smasher",
            "auth_date": 1700000000,
        });
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_jwt_create_and_verify() {
        let token = create_token(&sample_user(), "secret").unwrap();
        let claims = verify_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.user_id(), Some(7));
        assert_eq!(claims.telegram_id, 123456);
        assert_eq!(claims.username.as_deref(), Some("smasher"));
    }

    #[test]
    fn test_jwt_wrong_secret() {
        let token = create_token(&sample_user(), "secret").unwrap();
        assert!(verify_token(&token, "other").is_err());
        assert!(verify_token("invalid.token.here", "secret").is_err());
    }

    #[test]
    fn test_data_check_string_sorted_without_hash() {
        let mut data = login_payload();
        data.insert("hash".to_string(), json!("abc"));
        data.insert("last_name".to_string(), Value::Null);
        assert_eq!(
            data_check_string(&data),
            "auth_date=1700000000\nfirst_name=Ivan\nid=123456\nusername=smasher"
        );
    }

    #[test]
    fn test_check_telegram_auth() {
        let mut data = login_payload();
        sign(&mut data, "123:bot-token");
        assert!(check_telegram_auth(&data, "123:bot-token"));
        assert!(!check_telegram_auth(&data, "456:other-token"));

        data.insert("username".to_string(), json!("impostor"));
        assert!(!check_telegram_auth(&data, "123:bot-token"));
    }

    #[test]
    fn test_check_telegram_auth_missing_hash() {
        assert!(!check_telegram_auth(&login_payload(), "123:bot-token"));
    }

    #[test]
    fn test_telegram_id_field_accepts_string() {
        let data = json!({ "id": "42" });
        assert_eq!(telegram_id_field(data.as_object().unwrap()), Some(42));
    }
}
