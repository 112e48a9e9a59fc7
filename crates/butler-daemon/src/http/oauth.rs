use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use base64::Engine;
use butler_credentials::CredentialStore;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::AppState;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_SCOPES: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// One-time OAuth state tokens with TTL.
///
/// A token validates at most once; expired tokens never validate.
pub struct OAuthStateStore {
    states: DashMap<String, Instant>,
    ttl: Duration,
}

impl OAuthStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            states: DashMap::new(),
            ttl,
        }
    }

    /// Mint a URL-safe one-time token.
    pub fn create(&self) -> String {
        // Prune opportunistically so abandoned flows don't accumulate.
        let now = Instant::now();
        self.states.retain(|_, issued| now - *issued < self.ttl);

        let mut raw = [0u8; 32];
        raw[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        raw[16..].copy_from_slice(Uuid::new_v4().as_bytes());
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
        self.states.insert(token.clone(), now);
        token
    }

    /// Consume a token. True exactly once per unexpired token.
    pub fn consume(&self, token: &str) -> bool {
        match self.states.remove(token) {
            Some((_, issued)) => issued.elapsed() < self.ttl,
            None => false,
        }
    }
}

/// Provider error strings are sanitised before they reach the user; raw
/// provider codes never leak through the HTTP edge.
pub fn sanitize_provider_error(raw: &str) -> String {
    if raw.contains("denied") {
        "Access was denied at the provider consent screen.".to_string()
    } else {
        "The provider reported an authorization error.".to_string()
    }
}

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub redirect: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Pre-exchange validation of the callback. Ordering matters: a provider
/// error is reported without consuming the state token, so a retried consent
/// flow can reuse the same authorization URL.
pub fn decide_callback(
    query: &CallbackQuery,
    states: &OAuthStateStore,
) -> Result<String, (&'static str, String)> {
    if let Some(ref provider_error) = query.error {
        return Err(("provider_error", sanitize_provider_error(provider_error)));
    }
    let Some(ref state) = query.state else {
        return Err(("missing_state", "Missing OAuth state parameter.".to_string()));
    };
    let Some(ref code) = query.code else {
        return Err(("missing_code", "Missing authorization code.".to_string()));
    };
    if !states.consume(state) {
        return Err((
            "invalid_state",
            "OAuth state is unknown, expired, or already used.".to_string(),
        ));
    }
    Ok(code.clone())
}

/// `GET /api/oauth/google/start`.
pub async fn start_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StartQuery>,
) -> Response {
    let Ok(client_id) = std::env::var("GOOGLE_OAUTH_CLIENT_ID") else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error_code": "provider_error", "message": "OAuth is not configured."})),
        )
            .into_response();
    };
    let redirect_uri = std::env::var("GOOGLE_OAUTH_REDIRECT_URI").unwrap_or_else(|_| {
        format!(
            "http://localhost:{}/api/oauth/google/callback",
            state.config.port
        )
    });
    let scopes = std::env::var("GOOGLE_OAUTH_SCOPES").unwrap_or_else(|_| DEFAULT_SCOPES.to_string());

    let token = state.oauth_states.create();
    let authorization_url = format!(
        "{GOOGLE_AUTH_URL}?client_id={}&redirect_uri={}&response_type=code&scope={}\
         &access_type=offline&prompt=consent&state={}",
        urlencoding::encode(&client_id),
        urlencoding::encode(&redirect_uri),
        urlencoding::encode(&scopes),
        urlencoding::encode(&token),
    );

    if query.redirect.unwrap_or(true) {
        Redirect::temporary(&authorization_url).into_response()
    } else {
        Json(json!({"authorization_url": authorization_url, "state": token})).into_response()
    }
}

/// `GET /api/oauth/google/callback`.
pub async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let code = match decide_callback(&query, &state.oauth_states) {
        Ok(code) => code,
        Err((error_code, message)) => return callback_error(error_code, &message),
    };

    let tokens = match exchange_code(&code, state.config.port).await {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!(error = %e, "OAuth token exchange failed");
            return callback_error("token_exchange_failed", "Could not exchange the authorization code.");
        }
    };
    let Some(refresh_token) = tokens.get("refresh_token").and_then(|v| v.as_str()) else {
        return callback_error(
            "no_refresh_token",
            "The provider did not return a refresh token; re-run consent.",
        );
    };

    let persisted = CredentialStore::new(state.db.clone()).and_then(|store| {
        store.store(
            "GOOGLE_REFRESH_TOKEN",
            refresh_token,
            "oauth",
            Some("Google OAuth refresh token"),
            true,
            None,
        )
    });
    if let Err(e) = persisted {
        warn!(error = %e, "failed to persist refresh token");
        return callback_error("token_exchange_failed", "Could not store the credentials.");
    }

    info!("Google OAuth credentials stored");
    match std::env::var("OAUTH_DASHBOARD_URL") {
        Ok(dashboard) if !dashboard.is_empty() => {
            Redirect::temporary(&format!("{dashboard}?oauth=success")).into_response()
        }
        _ => Json(json!({"status": "ok"})).into_response(),
    }
}

fn callback_error(error_code: &str, message: &str) -> Response {
    if let Ok(dashboard) = std::env::var("OAUTH_DASHBOARD_URL") {
        if !dashboard.is_empty() {
            return Redirect::temporary(&format!("{dashboard}?oauth=error&reason={error_code}"))
                .into_response();
        }
    }
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error_code": error_code, "message": message})),
    )
        .into_response()
}

async fn exchange_code(code: &str, port: u16) -> Result<Value, String> {
    let client_id = std::env::var("GOOGLE_OAUTH_CLIENT_ID").map_err(|_| "missing client id")?;
    let client_secret =
        std::env::var("GOOGLE_OAUTH_CLIENT_SECRET").map_err(|_| "missing client secret")?;
    let redirect_uri = std::env::var("GOOGLE_OAUTH_REDIRECT_URI")
        .unwrap_or_else(|_| format!("http://localhost:{port}/api/oauth/google/callback"));

    let response = reqwest::Client::new()
        .post(GOOGLE_TOKEN_URL)
        .form(&[
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri.as_str()),
        ])
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("token endpoint answered {}", response.status()));
    }
    response.json::<Value>().await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> OAuthStateStore {
        OAuthStateStore::new(Duration::from_secs(600))
    }

    #[test]
    fn state_token_is_single_use() {
        let store = store();
        let token = store.create();
        assert!(store.consume(&token));
        assert!(!store.consume(&token));
        assert!(!store.consume("never-issued"));
    }

    #[test]
    fn expired_state_never_validates() {
        let store = OAuthStateStore::new(Duration::ZERO);
        let token = store.create();
        assert!(!store.consume(&token));
    }

    #[test]
    fn provider_denial_reports_before_state_is_touched() {
        let store = store();
        let token = store.create();
        let query = CallbackQuery {
            code: Some("abc".into()),
            state: Some(token.clone()),
            error: Some("access_denied".into()),
        };
        let (code, message) = decide_callback(&query, &store).unwrap_err();
        assert_eq!(code, "provider_error");
        assert!(message.contains("denied"));
        assert!(!message.contains("access_denied"));
        // State survives the provider error and is still consumable.
        assert!(store.consume(&token));
    }

    #[test]
    fn missing_parameters_map_to_error_codes() {
        let store = store();
        let no_state = CallbackQuery {
            code: Some("abc".into()),
            ..CallbackQuery::default()
        };
        assert_eq!(decide_callback(&no_state, &store).unwrap_err().0, "missing_state");

        let token = store.create();
        let no_code = CallbackQuery {
            state: Some(token),
            ..CallbackQuery::default()
        };
        assert_eq!(decide_callback(&no_code, &store).unwrap_err().0, "missing_code");
    }

    #[test]
    fn unknown_state_is_invalid() {
        let store = store();
        let query = CallbackQuery {
            code: Some("abc".into()),
            state: Some("forged".into()),
            error: None,
        };
        assert_eq!(decide_callback(&query, &store).unwrap_err().0, "invalid_state");
    }

    #[test]
    fn valid_callback_yields_the_code_once() {
        let store = store();
        let token = store.create();
        let query = CallbackQuery {
            code: Some("auth-code-1".into()),
            state: Some(token),
            error: None,
        };
        assert_eq!(decide_callback(&query, &store).unwrap(), "auth-code-1");
        // Replays of the same callback fail on the consumed state.
        assert_eq!(decide_callback(&query, &store).unwrap_err().0, "invalid_state");
    }
}
