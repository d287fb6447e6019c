//! Bearer-token identity for REST and WebSocket callers.

use crate::api::{ApiError, AppState};
use crate::config::AuthConfig;
use crate::database::models::UserRecord;
use crate::users::UserService;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub exp: u64,
}

impl Claims {
    fn subject(&self) -> Option<i64> {
        self.user_id
            .or_else(|| self.sub.as_deref().and_then(|sub| sub.parse().ok()))
    }
}

#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenKeys {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn issue(&self, user_id: i64, ttl: Duration) -> anyhow::Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let claims = Claims {
            user_id: Some(user_id),
            sub: Some(user_id.to_string()),
            exp: (now + ttl).as_secs(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// The user id carried by a valid, unexpired token.
    pub fn verify(&self, token: &str) -> Option<i64> {
        match decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(data) => data.claims.subject(),
            Err(err) => {
                tracing::debug!(error = %err, "rejected bearer token");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// `?token=` wins over `Authorization: Bearer`, since browsers cannot set
/// headers on WebSocket handshakes.
pub fn bearer_token(query_token: Option<String>, headers: &HeaderMap) -> Option<String> {
    query_token.filter(|token| !token.is_empty()).or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    })
}

#[derive(Clone)]
pub struct Authenticator {
    keys: TokenKeys,
    users: UserService,
}

impl Authenticator {
    pub fn new(keys: TokenKeys, users: UserService) -> Self {
        Self { keys, users }
    }

    pub fn keys(&self) -> &TokenKeys {
        &self.keys
    }

    /// Resolves a token to an existing user; anything else is anonymous.
    pub async fn resolve(&self, token: &str) -> Option<UserRecord> {
        let user_id = self.keys.verify(token)?;
        match self.users.get(user_id).await {
            Ok(user) => user,
            Err(err) => {
                tracing::warn!(user_id, error = %err, "user lookup failed during authentication");
                None
            }
        }
    }
}

/// Extractor for REST handlers that require a signed-in caller.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserRecord);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let query_token = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(query)| query.token);
        let token = bearer_token(query_token, &parts.headers).ok_or(ApiError::Unauthorized)?;
        state
            .auth
            .resolve(&token)
            .await
            .map(AuthUser)
            .ok_or(ApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn keys(secret: &str) -> TokenKeys {
        TokenKeys::new(&AuthConfig {
            jwt_secret: secret.into(),
        })
    }

    #[test]
    fn issued_tokens_verify() {
        let keys = keys("s3cret");
        let token = keys.issue(42, Duration::from_secs(300)).unwrap();
        assert_eq!(keys.verify(&token), Some(42));
    }

    #[test]
    fn foreign_and_garbage_tokens_rejected() {
        let token = keys("one").issue(1, Duration::from_secs(300)).unwrap();
        assert_eq!(keys("two").verify(&token), None);
        assert_eq!(keys("one").verify("not-a-jwt"), None);
    }

    #[test]
    fn sub_claim_is_accepted() {
        let keys = keys("s3cret");
        let claims = Claims {
            user_id: None,
            sub: Some("7".into()),
            exp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs()
                + 300,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding).unwrap();
        assert_eq!(keys.verify(&token), Some(7));
    }

    #[test]
    fn query_token_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(
            bearer_token(Some("from-query".into()), &headers).as_deref(),
            Some("from-query")
        );
        assert_eq!(bearer_token(None, &headers).as_deref(), Some("from-header"));
        assert_eq!(bearer_token(Some(String::new()), &HeaderMap::new()), None);
    }
}
