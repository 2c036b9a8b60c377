//! Request and connection identity.
//!
//! Tokens are issued elsewhere and stored in `auth_tokens`. A client presents
//! one as a bearer header, a `token` query parameter (browsers cannot set
//! headers on WebSocket upgrades) or an `access_token` cookie.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use sqlx::{Pool, Sqlite};

use crate::errors::AppError;
use crate::models::UserId;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// The user a token belongs to, or `None` if it is unknown or expired.
    async fn authenticate(&self, token: &str) -> Result<Option<UserId>, AppError>;
}

pub struct SqliteTokenAuthenticator {
    pool: Pool<Sqlite>,
}

impl SqliteTokenAuthenticator {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Authenticator for SqliteTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Option<UserId>, AppError> {
        let now = chrono::Utc::now().timestamp();
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT user_id FROM auth_tokens WHERE token = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(user_id,)| user_id))
    }
}

fn decode(raw: &str) -> Option<String> {
    let decoded = urlencoding::decode(raw).ok()?;
    let token = decoded.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Pull a token out of a request, in order: bearer header, `token` query
/// parameter, `access_token` cookie.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    let from_query = query.into_iter().flat_map(|q| q.split('&')).find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" {
            decode(value)
        } else {
            None
        }
    });
    if from_query.is_some() {
        return from_query;
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|cookie| {
            let (name, value) = cookie.trim().split_once('=')?;
            if name == "access_token" {
                decode(value)
            } else {
                None
            }
        })
}

/// Resolve the caller to a user id, or an `Auth` error.
pub async fn resolve_user(
    auth: &dyn Authenticator,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<UserId, AppError> {
    let token = extract_token(headers, query)
        .ok_or_else(|| AppError::Auth("Missing credentials".to_string()))?;

    match auth.authenticate(&token).await? {
        Some(user_id) => Ok(user_id),
        None => {
            log::debug!("Rejected unknown or expired token");
            Err(AppError::Auth("Invalid or expired token".to_string()))
        }
    }
}
