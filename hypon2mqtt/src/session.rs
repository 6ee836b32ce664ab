use log::{error, info};
use serde_json::json;
use thiserror::Error;

use crate::http_transport::{HttpTransport, TransportError};

/// Application-level code the cloud API uses for a successful call.
pub const CODE_SUCCESS: i64 = 20000;

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("login endpoint returned HTTP status {0}")]
    Status(u16),
    #[error("login response is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("login response is not a JSON object")]
    NotAnObject,
    #[error("login rejected with code {0:?}")]
    Rejected(Option<i64>),
    #[error("no token in login response")]
    MissingToken,
    #[error("no API credentials configured")]
    NoCredentials,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Exchanges username and password for a bearer token. Makes exactly one
/// request; retrying is up to the caller.
pub fn login<H: HttpTransport>(
    http: &H,
    base_url: &str,
    credentials: &Credentials,
) -> Result<String, LoginError> {
    let url = format!("{}/login", base_url.trim_end_matches('/'));
    info!("Attempting login to {url}");
    let body = json!({
        "username": credentials.username,
        "password": credentials.password,
        "oem": null,
    });

    let response = http.post_json(&url, &body)?;
    if !response.is_success() {
        return Err(LoginError::Status(response.status));
    }

    let envelope: serde_json::Value = serde_json::from_str(&response.body)?;
    let envelope = envelope.as_object().ok_or(LoginError::NotAnObject)?;

    let code = envelope.get("code").and_then(serde_json::Value::as_i64);
    if code != Some(CODE_SUCCESS) {
        return Err(LoginError::Rejected(code));
    }

    envelope
        .get("data")
        .and_then(|data| data.get("token"))
        .and_then(serde_json::Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or(LoginError::MissingToken)
}

/// Holds the bearer token of one monitored system together with what is
/// needed to obtain a new one.
#[derive(Clone, Debug)]
pub struct Session {
    base_url: String,
    credentials: Option<Credentials>,
    token: Option<String>,
}

impl Session {
    pub fn new(base_url: &str, credentials: Option<Credentials>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            token: None,
        }
    }

    /// Seeds the session with a token obtained elsewhere, so the first cycle
    /// fetches without logging in.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Logs in and replaces the held token. On failure the previous token is
    /// kept as it was.
    pub fn login<H: HttpTransport>(&mut self, http: &H) -> Result<(), LoginError> {
        let Some(credentials) = &self.credentials else {
            return Err(LoginError::NoCredentials);
        };
        match login(http, &self.base_url, credentials) {
            Ok(token) => {
                info!("Successfully logged in and retrieved token");
                self.token = Some(token);
                Ok(())
            }
            Err(e) => {
                error!("Login failed: {e}");
                Err(e)
            }
        }
    }
}
