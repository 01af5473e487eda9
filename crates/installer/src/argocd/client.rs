//! ArgoCD REST client.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{Application, SessionRequest, SessionResponse, SyncRequest};
use super::ArgoCdError;

/// Base URL through the local tunnel.
pub const LOCAL_BASE_URL: &str = "https://localhost:8080";

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Body fragment ArgoCD returns when a sync is already running.
const OPERATION_IN_PROGRESS: &str = "another operation is already in progress";

/// Result of one sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Accepted; `synced` reflects the returned application status.
    Accepted { synced: bool },
    /// An operation is already running.
    InProgress,
    Rejected { status: u16, body: String },
}

/// Client for the ArgoCD server. Certificates are not verified since the
/// server is only reached over a local tunnel.
#[derive(Clone)]
pub struct ArgoCdClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for ArgoCdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgoCdClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

impl ArgoCdClient {
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ArgoCdError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Exchange credentials for a session token and keep it.
    ///
    /// # Errors
    /// Returns [`ArgoCdError::Api`] if the credentials are rejected.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<String, ArgoCdError> {
        let response = self
            .client
            .post(self.url("/api/v1/session"))
            .json(&SessionRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArgoCdError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let session: SessionResponse = response.json().await?;
        info!("Authenticated with ArgoCD");
        self.token = Some(session.token.clone());
        Ok(session.token)
    }

    /// Request a sync of `app`.
    ///
    /// # Errors
    /// Returns error only for transport failures; HTTP statuses are folded
    /// into [`SyncOutcome`].
    pub async fn sync(&self, app: &str) -> Result<SyncOutcome, ArgoCdError> {
        let response = self
            .authorized(
                self.client
                    .post(self.url(&format!("/api/v1/applications/{app}/sync"))),
            )
            .json(&SyncRequest::default())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status == StatusCode::OK {
            let synced = serde_json::from_str::<Application>(&body)
                .map(|a| a.is_synced())
                .unwrap_or(false);
            return Ok(SyncOutcome::Accepted { synced });
        }
        if status == StatusCode::BAD_REQUEST && body.contains(OPERATION_IN_PROGRESS) {
            return Ok(SyncOutcome::InProgress);
        }
        Ok(SyncOutcome::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    /// Fetch `app`, asking the server to refresh it first.
    ///
    /// # Errors
    /// Returns error on transport failures or non-success statuses.
    pub async fn refresh(&self, app: &str) -> Result<Application, ArgoCdError> {
        self.get_application(app, true).await
    }

    /// # Errors
    /// Returns error on transport failures or non-success statuses.
    pub async fn application(&self, app: &str) -> Result<Application, ArgoCdError> {
        self.get_application(app, false).await
    }

    async fn get_application(&self, app: &str, refresh: bool) -> Result<Application, ArgoCdError> {
        let mut request = self
            .authorized(self.client.get(self.url(&format!("/api/v1/applications/{app}"))));
        if refresh {
            request = request.query(&[("refresh", "normal")]);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArgoCdError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    /// # Errors
    /// Returns error if the application cannot be read.
    pub async fn is_synced(&self, app: &str) -> Result<bool, ArgoCdError> {
        Ok(self.application(app).await?.is_synced())
    }

    /// Delete `app` without cascading to its resources. A missing app is success.
    ///
    /// # Errors
    /// Returns error on transport failures or other non-success statuses.
    pub async fn delete_no_cascade(&self, app: &str) -> Result<(), ArgoCdError> {
        let response = self
            .authorized(
                self.client
                    .delete(self.url(&format!("/api/v1/applications/{app}"))),
            )
            .query(&[("cascade", "false")])
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            info!(app = %app, "Deleted ArgoCD application");
            return Ok(());
        }
        Err(ArgoCdError::Api {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }

    /// Sync `app` up to `attempts` times, `interval` apart.
    ///
    /// The first request is immediate. An in-progress response uses up the
    /// attempt but is not a failure. Returns `Ok(true)` once synced and
    /// `Ok(false)` when attempts run out while still pending.
    ///
    /// # Errors
    /// Returns [`ArgoCdError::SyncFailed`] if the last attempt was rejected.
    pub async fn sync_retry(
        &self,
        app: &str,
        attempts: u32,
        interval: Duration,
    ) -> Result<bool, ArgoCdError> {
        let mut last_failure: Option<(u16, String)> = None;

        for attempt in 1..=attempts {
            match self.sync(app).await {
                Ok(SyncOutcome::Accepted { synced: true }) => {
                    info!(app = %app, attempt, "Application synced");
                    return Ok(true);
                }
                Ok(SyncOutcome::Accepted { synced: false }) => {
                    debug!(app = %app, attempt, "Sync accepted, not yet synced");
                    last_failure = None;
                }
                Ok(SyncOutcome::InProgress) => {
                    debug!(app = %app, attempt, "Sync already in progress");
                    last_failure = None;
                }
                Ok(SyncOutcome::Rejected { status, body }) => {
                    warn!(app = %app, attempt, status, "Sync rejected");
                    last_failure = Some((status, body));
                }
                Err(e) => {
                    warn!(app = %app, attempt, error = %e, "Sync request failed");
                    last_failure = Some((0, e.to_string()));
                }
            }
            tokio::time::sleep(interval).await;
        }

        match last_failure {
            Some((last_status, message)) => Err(ArgoCdError::SyncFailed {
                app: app.to_string(),
                last_status,
                message,
            }),
            None => Ok(false),
        }
    }
}
