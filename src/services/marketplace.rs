use crate::{config::MarketplaceConfig, entities::marketplace_token, errors::ServiceError};
use chrono::Utc;
use reqwest::{Client, Method};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, QueryOrder, Set};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Errors from the upstream wholesale marketplace boundary
#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error("Marketplace authentication failed: {0}")]
    AuthInit(String),

    #[error("No marketplace token on record; client is not initialized")]
    NoToken,

    #[error("Marketplace rejected credentials after re-authentication")]
    UpstreamAuth,

    #[error("Marketplace API error ({status}): {body}")]
    UpstreamApi { status: u16, body: String },

    #[error("Marketplace transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl From<MarketplaceError> for ServiceError {
    fn from(err: MarketplaceError) -> Self {
        match err {
            MarketplaceError::Database(e) => ServiceError::DatabaseError(e),
            MarketplaceError::UpstreamApi { .. } | MarketplaceError::Transport(_) => {
                ServiceError::ExternalApiError(err.to_string())
            }
            MarketplaceError::AuthInit(_)
            | MarketplaceError::NoToken
            | MarketplaceError::UpstreamAuth => ServiceError::ExternalServiceError(err.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    access_token: String,
    /// Expiry as a unix timestamp (seconds)
    access_exp: i64,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    user: Option<Value>,
}

/// Authenticated client for the upstream wholesale marketplace.
///
/// Bearer tokens are persisted so restarts pick up a still-valid session.
/// Tokens close to expiry are refreshed before use, and a request rejected
/// with 401 triggers exactly one re-login and retry.
pub struct MarketplaceClient {
    db: Arc<DatabaseConnection>,
    http: Client,
    base_url: String,
    email: String,
    password: String,
    refresh_window_secs: i64,
}

impl MarketplaceClient {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: &MarketplaceConfig,
    ) -> Result<Self, MarketplaceError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            db,
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            email: config.email.clone(),
            password: config.password.clone(),
            refresh_window_secs: config.token_refresh_window_secs,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Logs in with the configured credentials and persists the resulting
    /// token as a new row.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<String, MarketplaceError> {
        let response = self
            .http
            .post(self.endpoint("auth/login/"))
            .json(&json!({ "email": self.email, "password": self.password }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketplaceError::AuthInit(format!(
                "login returned {}: {}",
                status, body
            )));
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| MarketplaceError::AuthInit(format!("malformed login response: {}", e)))?;

        let now = Utc::now();
        let row = marketplace_token::ActiveModel {
            id: Set(Uuid::new_v4()),
            access_token: Set(auth.access_token.clone()),
            access_expiry: Set(auth.access_exp),
            signature: Set(auth.signature),
            account_info: Set(auth.user),
            created_at: Set(now),
            updated_at: Set(now),
        };
        row.insert(&*self.db).await?;

        info!("Marketplace session initialized");
        Ok(auth.access_token)
    }

    /// Exchanges the current token for a fresh one, overwriting the stored
    /// row in place.
    #[instrument(skip(self, current))]
    async fn refresh(
        &self,
        current: marketplace_token::Model,
    ) -> Result<String, MarketplaceError> {
        let response = self
            .http
            .post(self.endpoint("auth/refresh/"))
            .bearer_auth(&current.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketplaceError::UpstreamApi {
                status: status.as_u16(),
                body,
            });
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| MarketplaceError::AuthInit(format!("malformed refresh response: {}", e)))?;

        let mut row: marketplace_token::ActiveModel = current.into();
        row.access_token = Set(auth.access_token.clone());
        row.access_expiry = Set(auth.access_exp);
        if auth.signature.is_some() {
            row.signature = Set(auth.signature);
        }
        row.updated_at = Set(Utc::now());
        row.update(&*self.db).await?;

        info!("Marketplace token refreshed");
        Ok(auth.access_token)
    }

    async fn latest_token(&self) -> Result<Option<marketplace_token::Model>, MarketplaceError> {
        Ok(marketplace_token::Entity::find()
            .order_by_desc(marketplace_token::Column::CreatedAt)
            .one(&*self.db)
            .await?)
    }

    /// Returns a token safe to use for at least the refresh window,
    /// refreshing (or, if the refresh is rejected, re-logging-in) as needed.
    pub async fn valid_access_token(&self) -> Result<String, MarketplaceError> {
        let token = self.latest_token().await?.ok_or(MarketplaceError::NoToken)?;

        if !needs_refresh(token.access_expiry, Utc::now().timestamp(), self.refresh_window_secs) {
            return Ok(token.access_token);
        }

        match self.refresh(token).await {
            Ok(access_token) => Ok(access_token),
            Err(MarketplaceError::UpstreamApi { status: 401, .. }) => {
                warn!("Marketplace refresh rejected; re-authenticating");
                self.initialize().await
            }
            Err(e) => Err(e),
        }
    }

    /// Issues an authenticated request. A 401 response triggers exactly one
    /// re-login and retry; a second 401 surfaces as `UpstreamAuth`.
    #[instrument(skip(self, body), fields(%method, path))]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, MarketplaceError> {
        let token = self.valid_access_token().await?;

        match self.execute(method.clone(), path, body, &token).await {
            Err(MarketplaceError::UpstreamApi { status: 401, .. }) => {
                warn!(path, "Marketplace returned 401; re-authenticating once");
                let token = self.initialize().await?;
                match self.execute(method, path, body, &token).await {
                    Err(MarketplaceError::UpstreamApi { status: 401, .. }) => {
                        Err(MarketplaceError::UpstreamAuth)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<Value, MarketplaceError> {
        let mut request = self
            .http
            .request(method, self.endpoint(path))
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(MarketplaceError::UpstreamApi {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// A token counts as expiring once it is within `window_secs` of its expiry.
pub(crate) fn needs_refresh(access_expiry: i64, now: i64, window_secs: i64) -> bool {
    access_expiry - now < window_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_window_boundaries() {
        // Expires well in the future: no refresh
        assert!(!needs_refresh(10_000, 1_000, 300));
        // Inside the window
        assert!(needs_refresh(1_200, 1_000, 300));
        // Exactly at the window edge is still considered valid
        assert!(!needs_refresh(1_300, 1_000, 300));
        // Already expired
        assert!(needs_refresh(900, 1_000, 300));
    }

    #[test]
    fn auth_response_parses_camel_case() {
        let auth: AuthResponse = serde_json::from_str(
            r#"{"accessToken":"tok-1","accessExp":1700000000,"signature":"sig","user":{"qid":"u-1"}}"#,
        )
        .unwrap();
        assert_eq!(auth.access_token, "tok-1");
        assert_eq!(auth.access_exp, 1_700_000_000);
        assert_eq!(auth.signature.as_deref(), Some("sig"));
        assert!(auth.user.is_some());
    }

    #[test]
    fn auth_response_tolerates_missing_optional_fields() {
        let auth: AuthResponse =
            serde_json::from_str(r#"{"accessToken":"tok-2","accessExp":42}"#).unwrap();
        assert_eq!(auth.access_token, "tok-2");
        assert!(auth.signature.is_none());
        assert!(auth.user.is_none());
    }
}
