use std::thread;

use log::{debug, error, info, warn};

use crate::fetcher::{fetch, Endpoint, FetchOutcome};
use crate::http_transport::HttpTransport;
use crate::merger::{merge, MergedRecord};
use crate::session::{Credentials, Session};

pub const DEFAULT_AUTH_RETRIES: u32 = 1;

/// Polls the monitor, production and status endpoints of one system and
/// merges their payloads. Recovers from expired tokens by logging in again,
/// at most `auth_retries` times per cycle.
pub struct Collector<H: HttpTransport> {
    http: H,
    system_id: String,
    session: Session,
    endpoints: [Endpoint; 3],
    auth_retries: u32,
}

impl<H: HttpTransport> Collector<H> {
    pub fn new(
        http: H,
        base_url: &str,
        system_id: &str,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            http,
            system_id: system_id.to_string(),
            session: Session::new(base_url, credentials),
            endpoints: Endpoint::for_system(base_url, system_id),
            auth_retries: DEFAULT_AUTH_RETRIES,
        }
    }

    pub fn with_auth_retries(mut self, auth_retries: u32) -> Self {
        self.auth_retries = auth_retries;
        self
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Runs one fetch cycle. Returns `None` when login fails or no endpoint
    /// delivered data.
    pub fn fetch_all(&mut self) -> Option<MergedRecord> {
        if self.session.token().is_none() && self.session.has_credentials() {
            info!("[{}] Logging in to retrieve bearer token", self.system_id);
            if self.session.login(&self.http).is_err() {
                error!("[{}] Failed to retrieve bearer token, skipping cycle", self.system_id);
                return None;
            }
        }

        let mut attempt = 0;
        let outcomes = loop {
            let outcomes = self.fetch_endpoints();
            if !outcomes.iter().any(FetchOutcome::is_auth_failure) {
                break outcomes;
            }

            warn!(
                "[{}] Authentication failed during fetch (attempt {}/{})",
                self.system_id,
                attempt + 1,
                self.auth_retries + 1
            );
            if attempt >= self.auth_retries {
                error!("[{}] Max retries reached for authentication", self.system_id);
                break outcomes;
            }
            if !self.session.has_credentials() {
                error!("[{}] No credentials to re-authenticate", self.system_id);
                break outcomes;
            }

            info!("[{}] Attempting to re-login", self.system_id);
            if self.session.login(&self.http).is_err() {
                error!("[{}] Re-authentication failed, skipping cycle", self.system_id);
                return None;
            }
            attempt += 1;
        };

        let [monitor, production, status] = outcomes.map(FetchOutcome::into_payload);
        if monitor.is_none() && production.is_none() && status.is_none() {
            warn!("[{}] All API requests failed or returned no data", self.system_id);
            return None;
        }

        let merged = merge(monitor.as_ref(), production.as_ref(), status.as_ref());
        debug!("[{}] Merged {} fields", self.system_id, merged.len());
        Some(merged)
    }

    // One worker per endpoint, all joined before returning. The token is only
    // borrowed here, so a re-login can never overlap a running fetch.
    fn fetch_endpoints(&self) -> [FetchOutcome; 3] {
        let http = &self.http;
        let token = self.session.token();

        thread::scope(|scope| {
            let workers = self
                .endpoints
                .each_ref()
                .map(|endpoint| scope.spawn(move || fetch(http, &endpoint.url, token)));

            let outcomes = workers.map(|worker| {
                worker.join().unwrap_or_else(|_| {
                    FetchOutcome::OtherFailure("fetch worker panicked".to_string())
                })
            });
            for (endpoint, outcome) in self.endpoints.iter().zip(outcomes.iter()) {
                if let FetchOutcome::OtherFailure(reason) = outcome {
                    debug!("[{}] {} endpoint missing: {reason}", self.system_id, endpoint.kind);
                }
            }
            outcomes
        })
    }
}
