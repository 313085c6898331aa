//! OAuth session endpoints
//!
//! The gateway treats OAuth as a session-store contract: providers come from
//! configuration, the authorize endpoint hands back a URL, the callback
//! exchanges the code and persists a session row. Nothing here runs on the
//! hot path, and expired sessions are only ever reported, never refreshed.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::admin::envelope;
use crate::error::{Error, Result};
use crate::models::OAuthSession;
use crate::state::AppState;
use crate::store::NewOAuthSession;

/// Session as rendered to admins: tokens masked, expiry flagged
#[derive(Debug, Serialize)]
pub struct SessionView {
    id: String,
    channel_id: Option<String>,
    provider: String,
    scopes: Vec<String>,
    expires_at: chrono::DateTime<Utc>,
    expired: bool,
    has_refresh_token: bool,
    created_at: chrono::DateTime<Utc>,
}

impl From<&OAuthSession> for SessionView {
    fn from(session: &OAuthSession) -> Self {
        Self {
            id: session.id.clone(),
            channel_id: session.channel_id.clone(),
            provider: session.provider.clone(),
            scopes: session.scopes.clone(),
            expires_at: session.expires_at,
            expired: session.is_expired(Utc::now()),
            has_refresh_token: session.refresh_token.is_some(),
            created_at: session.created_at,
        }
    }
}

/// `GET /api/oauth/providers`
pub async fn list_providers(State(state): State<AppState>) -> Result<Json<Value>> {
    let providers: Vec<Value> = state
        .config
        .oauth
        .iter()
        .map(|(name, provider)| {
            json!({
                "name": name,
                "authorize_url": provider.authorize_url,
                "scopes": provider.scopes,
            })
        })
        .collect();
    Ok(envelope(providers))
}

/// `GET /api/oauth/{provider}/authorize`
pub async fn authorize(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
) -> Result<Json<Value>> {
    let provider = state
        .config
        .oauth
        .get(&provider_name)
        .ok_or_else(|| Error::NotFound(format!("oauth provider '{}'", provider_name)))?;

    let oauth_state = Uuid::new_v4().to_string();
    let scopes = provider.scopes.join(" ");
    let url = format!(
        "{}?response_type=code&client_id={}&scope={}&state={}",
        provider.authorize_url, provider.client_id, scopes, oauth_state
    );

    Ok(envelope(json!({
        "provider": provider_name,
        "authorize_url": url,
        "state": oauth_state,
    })))
}

/// Query parameters of the provider callback
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: String,
    #[serde(default)]
    channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// `GET /api/oauth/callback/{provider}`
///
/// Exchanges the authorization code at the provider's token endpoint and
/// persists the resulting session.
pub async fn callback(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>> {
    let provider = state
        .config
        .oauth
        .get(&provider_name)
        .ok_or_else(|| Error::NotFound(format!("oauth provider '{}'", provider_name)))?;
    if provider.token_url.is_empty() {
        return Err(Error::Config(format!(
            "oauth provider '{}' has no token_url",
            provider_name
        )));
    }

    let response = reqwest::Client::new()
        .post(&provider.token_url)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", query.code.as_str()),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
        ])
        .send()
        .await
        .map_err(|e| Error::UpstreamError {
            status: 502,
            body: Some(format!("token exchange failed: {}", e)),
        })?;

    if !response.status().is_success() {
        return Err(Error::UpstreamError {
            status: response.status().as_u16(),
            body: response.text().await.ok(),
        });
    }

    let tokens: TokenResponse = response.json().await.map_err(|e| Error::UpstreamError {
        status: 502,
        body: Some(format!("token response parse failed: {}", e)),
    })?;

    let scopes = tokens
        .scope
        .map(|raw| raw.split_whitespace().map(String::from).collect())
        .unwrap_or_else(|| provider.scopes.clone());
    let expires_at = Utc::now() + Duration::seconds(tokens.expires_in.unwrap_or(3600));

    let session = state
        .store
        .create_session(NewOAuthSession {
            channel_id: query.channel_id,
            provider: provider_name.clone(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at,
            scopes,
            user_info: None,
        })
        .await?;

    tracing::info!(provider = %provider_name, session = %session.id, "oauth session created");
    Ok(envelope(SessionView::from(&session)))
}

/// `GET /api/oauth/sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let session = state.store.get_session(&id).await?;
    Ok(envelope(SessionView::from(&session)))
}

/// `DELETE /api/oauth/sessions/{id}`
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.store.delete_session(&id).await?;
    Ok(envelope(json!({ "deleted": id })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_view_masks_tokens_and_flags_expiry() {
        let now = Utc::now();
        let session = OAuthSession {
            id: "s-1".into(),
            channel_id: None,
            provider: "anthropic".into(),
            access_token: "super-secret-token".into(),
            refresh_token: Some("rtok-4159".into()),
            expires_at: now - Duration::seconds(1),
            scopes: vec!["inference".into()],
            user_info: None,
            created_at: now,
            updated_at: now,
        };
        let view = SessionView::from(&session);
        assert!(view.expired);
        assert!(view.has_refresh_token);

        let rendered = serde_json::to_string(&view).unwrap();
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("rtok-4159"));
    }
}
