use std::fmt;

use log::{debug, error, warn};

use crate::http_transport::HttpTransport;
use crate::session::CODE_SUCCESS;

/// Application-level code signalling an expired or invalid token.
pub const CODE_TOKEN_EXPIRED: i64 = 50008;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Monitor,
    Production,
    Status,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointKind::Monitor => "monitor",
            EndpointKind::Production => "production",
            EndpointKind::Status => "status",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub url: String,
}

impl Endpoint {
    /// The monitor, production and status endpoints of one plant, in that order.
    pub fn for_system(base_url: &str, system_id: &str) -> [Endpoint; 3] {
        let plant = format!("{}/plant/{system_id}", base_url.trim_end_matches('/'));
        [
            Endpoint {
                kind: EndpointKind::Monitor,
                url: format!("{plant}/monitor?refresh=true"),
            },
            Endpoint {
                kind: EndpointKind::Production,
                url: format!("{plant}/production2"),
            },
            Endpoint {
                kind: EndpointKind::Status,
                url: format!("{plant}/status"),
            },
        ]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchOutcome {
    Success(serde_json::Value),
    AuthFailure,
    OtherFailure(String),
}

impl FetchOutcome {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, FetchOutcome::AuthFailure)
    }

    pub fn into_payload(self) -> Option<serde_json::Value> {
        match self {
            FetchOutcome::Success(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Performs one GET against `url` and classifies the response. Never retries.
pub fn fetch<H: HttpTransport>(http: &H, url: &str, token: Option<&str>) -> FetchOutcome {
    debug!("Fetching data from {url}");
    let response = match http.get(url, token) {
        Ok(response) => response,
        Err(e) => {
            error!("Error fetching data from {url}: {e}");
            return FetchOutcome::OtherFailure(e.to_string());
        }
    };
    if !response.is_success() {
        error!("{url} returned HTTP status {}", response.status);
        return FetchOutcome::OtherFailure(format!("HTTP status {}", response.status));
    }

    let body: serde_json::Value = match serde_json::from_str(&response.body) {
        Ok(body) => body,
        Err(e) => {
            error!("Error parsing JSON response from {url}: {e}");
            return FetchOutcome::OtherFailure(e.to_string());
        }
    };
    if !body.is_object() {
        error!("Response from {url} is not a JSON object: {body}");
        return FetchOutcome::OtherFailure("response is not a JSON object".to_string());
    }

    match body.get("code").and_then(serde_json::Value::as_i64) {
        Some(CODE_SUCCESS) => {
            debug!("Successfully fetched data from {url}");
            FetchOutcome::Success(body)
        }
        Some(CODE_TOKEN_EXPIRED) => {
            warn!("Authentication failed (code {CODE_TOKEN_EXPIRED}) for {url}, token may be expired");
            FetchOutcome::AuthFailure
        }
        code => {
            error!("API returned error code {code:?} from {url}");
            FetchOutcome::OtherFailure(format!("API code {code:?}"))
        }
    }
}
