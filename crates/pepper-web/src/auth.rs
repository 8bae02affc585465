//! Registration, login and the `CurrentUser` extractor.
//!
//! Tokens are HS256 JWTs whose `sub` is the username. A request may carry
//! one in the `access_token` cookie or as `Authorization: Bearer <token>`.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{FromRequestParts, State},
    http::{header, request::Parts, StatusCode},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use pepper_core::{NewUser, User};
use pepper_storage::{authenticate, hash_password, UserStore};

use crate::error::{ApiError, ApiResult};
use crate::{AppState, WebConfig};

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub fn issue_token(config: &WebConfig, username: &str) -> anyhow::Result<String> {
    let exp = (Utc::now() + Duration::minutes(config.access_token_expire_minutes)).timestamp();
    let claims = Claims {
        sub: username.to_string(),
        exp: usize::try_from(exp).context("token expiry before epoch")?,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.secret_key.as_bytes()),
    )
    .context("signing access token")
}

/// Username carried by a valid, unexpired token.
pub fn verify_token(config: &WebConfig, token: &str) -> Option<String> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret_key.as_bytes()),
        &validation,
    )
    .ok()
    .map(|data| data.claims.sub)
}

fn strip_bearer(raw: &str) -> &str {
    raw.strip_prefix("Bearer ").unwrap_or(raw).trim()
}

fn request_token(parts: &Parts) -> Option<String> {
    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(cookie) = jar.get(ACCESS_TOKEN_COOKIE) {
        let token = strip_bearer(cookie.value());
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    let header = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// The authenticated, active user behind a request.
pub struct CurrentUser(pub User);

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = request_token(parts)
            .ok_or_else(|| ApiError::Unauthorized("Not authenticated".into()))?;
        let username = verify_token(&state.config, &token)
            .ok_or_else(|| ApiError::Unauthorized("Could not validate credentials".into()))?;
        let user = state
            .store
            .find_user_by_username(&username)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("Could not validate credentials".into()))?;
        if !user.is_active {
            return Err(ApiError::BadRequest("Inactive user".into()));
        }
        Ok(CurrentUser(user))
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let username = body.username.trim();
    let email = body.email.trim();
    if username.is_empty() || body.password.is_empty() {
        return Err(ApiError::Unprocessable(
            "Username and password are required".into(),
        ));
    }
    if !is_valid_email(email) {
        return Err(ApiError::Unprocessable("Invalid email address".into()));
    }

    let password_hash = hash_password(&body.password, state.config.bcrypt_cost)?;
    let user = state
        .store
        .create_user(NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
        })
        .await?;
    info!(user_id = user.id, username = %user.username, "user registered");
    Ok((StatusCode::CREATED, Json(user)))
}

fn access_cookie(config: &WebConfig, token: String) -> Cookie<'static> {
    let mut cookie = Cookie::new(ACCESS_TOKEN_COOKIE, token);
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");
    if config.cookie_secure {
        cookie.set_secure(true);
    }
    cookie
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<LoginRequest>,
) -> ApiResult<(CookieJar, Json<TokenResponse>)> {
    let Some(user) = authenticate(state.store.as_ref(), &body.username, &body.password).await?
    else {
        warn!(username = %body.username, "login rejected");
        return Err(ApiError::Unauthorized(
            "Incorrect username or password".into(),
        ));
    };
    let token = issue_token(&state.config, &user.username)?;
    let jar = jar.add(access_cookie(&state.config, token.clone()));
    Ok((
        jar,
        Json(TokenResponse {
            access_token: token,
            token_type: "bearer",
        }),
    ))
}

pub async fn logout(jar: CookieJar) -> (CookieJar, Json<JsonValue>) {
    let mut cookie = Cookie::new(ACCESS_TOKEN_COOKIE, "");
    cookie.set_path("/");
    cookie.make_removal();
    (
        jar.add(cookie),
        Json(json!({ "message": "Successfully logged out" })),
    )
}

pub async fn me(CurrentUser(user): CurrentUser) -> Json<User> {
    Json(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shapes() {
        assert!(is_valid_email("alice@example.com"));
        assert!(is_valid_email("a.b@mail.example.org"));
        for bad in ["", "alice", "@example.com", "alice@", "alice@example", "a b@x.io", "a@b@c.io"] {
            assert!(!is_valid_email(bad), "{bad}");
        }
    }

    #[test]
    fn token_round_trips_username() {
        let config = WebConfig::from_lookup(|_| None);
        let token = issue_token(&config, "alice").unwrap();
        assert_eq!(verify_token(&config, &token).as_deref(), Some("alice"));

        let mut other = config.clone();
        other.secret_key = "different".into();
        assert_eq!(verify_token(&other, &token), None);
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut config = WebConfig::from_lookup(|_| None);
        config.access_token_expire_minutes = -10;
        let token = issue_token(&config, "alice").unwrap();
        assert_eq!(verify_token(&config, &token), None);
    }
}
