use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

use crate::config::{endpoints, AuthFlow, MSAL_CLIENT_ID};
use crate::errors::{AuthError, Result};
use crate::models::{DeviceCodeResponse, MsTokenResponse, OAuthErrorResponse};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// What the operator has to see to complete a device-code sign-in.
#[derive(Debug, Clone)]
pub struct DeviceCodePrompt {
    /// Which configured account this prompt is for (display hint only).
    pub email: String,
    pub verification_uri: String,
    pub user_code: String,
    pub expires_in: Duration,
}

/// Sink for device-code prompts. The pipeline never writes to stdout
/// directly; tests and embedders supply their own presenter.
#[async_trait::async_trait]
pub trait UserCodePresenter: Send + Sync {
    async fn present(&self, prompt: &DeviceCodePrompt);
}

/// Default presenter: surfaces the prompt through the log stream.
#[derive(Debug, Default)]
pub struct TracingPresenter;

#[async_trait::async_trait]
impl UserCodePresenter for TracingPresenter {
    async fn present(&self, prompt: &DeviceCodePrompt) {
        tracing::info!(
            account = %prompt.email,
            url = %prompt.verification_uri,
            code = %prompt.user_code,
            valid_for = ?prompt.expires_in,
            "sign in: visit the URL and enter the code"
        );
    }
}

/// How one poll response should drive the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    SlowDown,
    Declined,
    InvalidGrant,
    UnauthorizedClient,
    Other(String),
}

/// Classify an OAuth error string from the token endpoint.
pub fn classify_poll_error(error: &str) -> PollOutcome {
    match error {
        "authorization_pending" => PollOutcome::Pending,
        "slow_down" => PollOutcome::SlowDown,
        "authorization_declined" | "expired_token" => PollOutcome::Declined,
        "invalid_grant" => PollOutcome::InvalidGrant,
        "unauthorized_client" => PollOutcome::UnauthorizedClient,
        other => PollOutcome::Other(other.to_string()),
    }
}

/// One device-code flow: request a code, hand it to the presenter, poll the
/// token endpoint until the operator completes sign-in or the deadline hits.
pub struct DeviceCodeFlow {
    http: Client,
    flow: AuthFlow,
    client_id: String,
    scope: String,
}

impl DeviceCodeFlow {
    pub fn new(http: Client, flow: AuthFlow, client_id: &str, scope: &str) -> Self {
        let client_id = match flow {
            AuthFlow::Live => client_id.to_string(),
            AuthFlow::Msal => MSAL_CLIENT_ID.to_string(),
        };
        Self {
            http,
            flow,
            client_id,
            scope: scope.to_string(),
        }
    }

    fn code_endpoint(&self) -> &'static str {
        match self.flow {
            AuthFlow::Live => endpoints::LIVE_DEVICE_CODE,
            AuthFlow::Msal => endpoints::MSAL_DEVICE_CODE,
        }
    }

    fn token_endpoint(&self) -> &'static str {
        match self.flow {
            AuthFlow::Live => endpoints::LIVE_TOKEN,
            AuthFlow::Msal => endpoints::MSAL_TOKEN,
        }
    }

    /// Ask the authorization server for a fresh user code.
    #[instrument(skip(self))]
    pub async fn request_code(&self) -> Result<DeviceCodeResponse> {
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("scope", self.scope.as_str()),
        ];
        if self.flow == AuthFlow::Live {
            form.push(("response_type", "device_code"));
        }

        debug!(flow = ?self.flow, "requesting device code");
        let response = self
            .http
            .post(self.code_endpoint())
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status, body));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| AuthError::MalformedResponse(format!("device code response: {e}")))
    }

    /// Poll until the grant completes. `deadline` bounds the whole wait;
    /// the poll interval honors the server's `interval` and `slow_down`.
    #[instrument(skip(self, code))]
    pub async fn poll(&self, code: &DeviceCodeResponse, deadline: Duration) -> Result<MsTokenResponse> {
        let started = Instant::now();
        let expiry = Duration::from_secs(code.expires_in).min(deadline);
        let mut interval = Duration::from_secs(code.interval.max(1));

        loop {
            if started.elapsed() >= expiry {
                return Err(AuthError::DeadlineExceeded(started.elapsed()));
            }
            sleep(interval).await;

            let form = [
                ("client_id", self.client_id.as_str()),
                ("grant_type", DEVICE_CODE_GRANT),
                ("device_code", code.device_code.as_str()),
            ];
            let response = self
                .http
                .post(self.token_endpoint())
                .form(&form)
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;

            if status.is_success() {
                return serde_json::from_str(&body)
                    .map_err(|e| AuthError::MalformedResponse(format!("token response: {e}")));
            }

            let error: OAuthErrorResponse = match serde_json::from_str(&body) {
                Ok(e) => e,
                Err(_) => return Err(http_error(status, body)),
            };
            match classify_poll_error(&error.error) {
                PollOutcome::Pending => {}
                PollOutcome::SlowDown => {
                    interval += Duration::from_secs(5);
                    debug!(?interval, "token endpoint asked to slow down");
                }
                PollOutcome::Declined => return Err(AuthError::DeviceCodeDeclined),
                PollOutcome::InvalidGrant => return Err(AuthError::OAuthInvalidGrant),
                PollOutcome::UnauthorizedClient => return Err(AuthError::UnauthorizedClient),
                PollOutcome::Other(other) => {
                    warn!(error = %other, "unexpected poll error, treating as pending");
                }
            }
        }
    }

    /// Redeem a refresh token for fresh Microsoft access material.
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh(&self, refresh_token: &str) -> Result<MsTokenResponse> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", self.scope.as_str()),
        ];

        debug!(flow = ?self.flow, "refreshing Microsoft access token");
        let response = self
            .http
            .post(self.token_endpoint())
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            if body.contains("invalid_grant") {
                return Err(AuthError::OAuthInvalidGrant);
            }
            return Err(http_error(status, body));
        }

        serde_json::from_str(&body)
            .map_err(|e| AuthError::MalformedResponse(format!("refresh response: {e}")))
    }
}

fn http_error(status: StatusCode, body: String) -> AuthError {
    AuthError::Http {
        status,
        body_snippet: body.chars().take(200).collect(),
    }
}
