//! OAuth device authorization flow.
//!
//! <https://docs.github.com/en/apps/oauth-apps/building-oauth-apps/authorizing-oauth-apps#device-flow>

use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{debug, info};

use super::client::REQUIRED_SCOPES;
use super::models::{AccessTokenResponse, DeviceCodeResponse};
use crate::traits::ScmError;

/// GitHub's OAuth endpoints.
const OAUTH_BASE_URL: &str = "https://github.com";

/// Grant type for the token exchange.
const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Extra delay GitHub asks for on `slow_down`.
const SLOW_DOWN_STEP_SECS: u64 = 5;

/// Code the operator has to enter in the browser.
#[derive(Debug, Clone)]
pub struct UserCode {
    /// The code.
    pub code: String,
    /// Where to enter it.
    pub verification_uri: String,
}

/// Device flow client.
#[derive(Debug, Clone)]
pub struct DeviceFlow {
    client: Client,
    base_url: String,
    client_id: String,
}

impl DeviceFlow {
    /// Create a flow for the OAuth app `client_id`.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(client_id: impl Into<String>) -> Result<Self, ScmError> {
        let client = Client::builder()
            .user_agent("kubefirst")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: OAUTH_BASE_URL.to_string(),
            client_id: client_id.into(),
        })
    }

    /// Point the flow at a different OAuth root (used by tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Run the flow to completion.
    ///
    /// `on_code` is invoked once with the code to show to the operator.
    ///
    /// # Errors
    /// Returns [`ScmError::Auth`] when the operator denies access or the code
    /// expires.
    pub async fn authorize(&self, on_code: impl FnOnce(&UserCode)) -> Result<String, ScmError> {
        let scope = REQUIRED_SCOPES.join(" ");
        let response = self
            .client
            .post(format!("{}/login/device/code", self.base_url))
            .header("Accept", "application/json")
            .form(&[("client_id", self.client_id.as_str()), ("scope", &scope)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ScmError::Api {
                status: response.status().as_u16(),
                message: response.text().await?,
            });
        }
        let device: DeviceCodeResponse = response.json().await?;

        on_code(&UserCode {
            code: device.user_code.clone(),
            verification_uri: device.verification_uri.clone(),
        });

        let deadline = Instant::now() + Duration::from_secs(device.expires_in);
        let mut interval = Duration::from_secs(device.interval.max(1));

        loop {
            tokio::time::sleep(interval).await;
            if Instant::now() >= deadline {
                return Err(ScmError::Auth("device code expired".to_string()));
            }

            let token: AccessTokenResponse = self
                .client
                .post(format!("{}/login/oauth/access_token", self.base_url))
                .header("Accept", "application/json")
                .form(&[
                    ("client_id", self.client_id.as_str()),
                    ("device_code", device.device_code.as_str()),
                    ("grant_type", DEVICE_GRANT),
                ])
                .send()
                .await?
                .json()
                .await?;

            if let Some(access_token) = token.access_token.filter(|t| !t.is_empty()) {
                info!("GitHub device authorization completed");
                return Ok(access_token);
            }

            match token.error.as_deref() {
                Some("authorization_pending") | None => {
                    debug!("Waiting for operator to authorize device");
                }
                Some("slow_down") => {
                    interval = token.interval.map_or_else(
                        || interval + Duration::from_secs(SLOW_DOWN_STEP_SECS),
                        Duration::from_secs,
                    );
                    debug!(interval_secs = interval.as_secs(), "GitHub asked to slow down");
                }
                Some("expired_token") => {
                    return Err(ScmError::Auth("device code expired".to_string()));
                }
                Some(other) => {
                    return Err(ScmError::Auth(format!("device authorization failed: {other}")));
                }
            }
        }
    }
}
