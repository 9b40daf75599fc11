use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::{endpoints, relying_party, HttpTimeouts, XSTS_TIMEOUT, XSTS_USER_AGENT};
use crate::errors::{AuthError, Result, XstsApiError};
use crate::models::*;
use crate::parse::{parse_xsts_response, ParsedXsts};

/// Client for the Xbox secure token services: XASU user tokens, XASD device
/// tokens, XAST title tokens, and the final XSTS authorize.
#[derive(Debug, Clone)]
pub struct XboxAuthClient {
    http: Client,
}

impl XboxAuthClient {
    pub fn new(timeouts: &HttpTimeouts) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.request)
            .user_agent(XSTS_USER_AGENT)
            .build()?;
        Ok(Self { http })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// XASU: exchange a Microsoft access token for an Xbox user token.
    ///
    /// Some accounts require the RPS ticket prefixed with `d=`; a 400 on
    /// the plain ticket is retried once with the prefix.
    #[instrument(skip(self, ms_access_token))]
    pub async fn user_token(&self, ms_access_token: &str) -> Result<XboxTokenResponse> {
        match self
            .post_user_authenticate(&format!("t={ms_access_token}"))
            .await
        {
            Err(AuthError::Http {
                status: StatusCode::BAD_REQUEST,
                ..
            }) => {
                warn!("XASU rejected plain RPS ticket, retrying with 'd=' prefix");
                self.post_user_authenticate(&format!("d={ms_access_token}"))
                    .await
            }
            other => other,
        }
    }

    async fn post_user_authenticate(&self, rps_ticket: &str) -> Result<XboxTokenResponse> {
        let request = UserTokenRequest {
            properties: UserTokenProperties {
                auth_method: "RPS".to_string(),
                site_name: "user.auth.xboxlive.com".to_string(),
                rps_ticket: rps_ticket.to_string(),
            },
            relying_party: relying_party::XBOX_AUTH.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("requesting XASU user token");
        let response = self
            .http
            .post(endpoints::USER_AUTHENTICATE)
            .header("Accept", "application/json")
            .header("x-xbl-contract-version", "1")
            .json(&request)
            .send()
            .await?;

        read_token_response(response).await
    }

    /// XASD: request a device token for a synthetic device identity.
    #[instrument(skip(self))]
    pub async fn device_token(&self) -> Result<XboxTokenResponse> {
        let request = DeviceTokenRequest {
            properties: DeviceTokenProperties {
                auth_method: "ProofOfPossession".to_string(),
                id: format!("{{{}}}", Uuid::new_v4()),
                device_type: "Nintendo".to_string(),
                version: "0.0.0".to_string(),
            },
            relying_party: relying_party::XBOX_AUTH.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("requesting XASD device token");
        let response = self
            .http
            .post(endpoints::DEVICE_AUTHENTICATE)
            .header("Accept", "application/json")
            .header("x-xbl-contract-version", "1")
            .json(&request)
            .send()
            .await?;

        read_token_response(response).await
    }

    /// XAST: request a title token bound to a device token.
    #[instrument(skip(self, ms_access_token, device_token))]
    pub async fn title_token(
        &self,
        ms_access_token: &str,
        device_token: &str,
    ) -> Result<XboxTokenResponse> {
        let request = TitleTokenRequest {
            properties: TitleTokenProperties {
                auth_method: "RPS".to_string(),
                device_token: device_token.to_string(),
                site_name: "user.auth.xboxlive.com".to_string(),
                rps_ticket: format!("t={ms_access_token}"),
            },
            relying_party: relying_party::XBOX_AUTH.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("requesting XAST title token");
        let response = self
            .http
            .post(endpoints::TITLE_AUTHENTICATE)
            .header("Accept", "application/json")
            .header("x-xbl-contract-version", "1")
            .json(&request)
            .send()
            .await?;

        read_token_response(response).await
    }

    /// XSTS authorize. The body goes through the hardened parser, so a
    /// truncated response can still yield a usable token.
    #[instrument(skip(self, user_token, device_token, title_token))]
    pub async fn xsts_authorize(
        &self,
        user_token: &str,
        device_token: Option<&str>,
        title_token: Option<&str>,
        relying_party: &str,
    ) -> Result<ParsedXsts> {
        let request = XstsAuthRequest {
            properties: XstsAuthProperties {
                sandbox_id: "RETAIL".to_string(),
                user_tokens: vec![user_token.to_string()],
                device_token: device_token.map(str::to_string),
                title_token: title_token.map(str::to_string),
                optional_display_claims: None,
            },
            relying_party: relying_party.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!(relying_party, "requesting XSTS authorization");
        let response = self
            .http
            .post(endpoints::XSTS_AUTHORIZE)
            .header("Accept", "application/json")
            .header("x-xbl-contract-version", "1")
            .timeout(XSTS_TIMEOUT)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            if let Ok(denied) = serde_json::from_str::<XstsErrorResponse>(&body) {
                return Err(XstsApiError::from_xerr(denied.xerr).into());
            }
            return Err(AuthError::Http {
                status,
                body_snippet: body.chars().take(200).collect(),
            });
        }
        if !status.is_success() {
            // XErr payloads can arrive on other statuses too.
            if let Ok(denied) = serde_json::from_str::<XstsErrorResponse>(&body) {
                return Err(XstsApiError::from_xerr(denied.xerr).into());
            }
            return Err(AuthError::Http {
                status,
                body_snippet: body.chars().take(200).collect(),
            });
        }

        parse_xsts_response(&body)
    }

    /// Best-effort lookup of the account's XUID and gamertag via an XSTS
    /// request carrying the gamertag display claims.
    #[instrument(skip(self, user_token))]
    pub async fn fetch_xuid_gamertag(
        &self,
        user_token: &str,
    ) -> Result<Option<(String, String)>> {
        let request = XstsAuthRequest {
            properties: XstsAuthProperties {
                sandbox_id: "RETAIL".to_string(),
                user_tokens: vec![user_token.to_string()],
                device_token: None,
                title_token: None,
                optional_display_claims: Some(vec![
                    "mgt".to_string(),
                    "mgs".to_string(),
                    "umg".to_string(),
                ]),
            },
            relying_party: relying_party::XBOX_LIVE.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("fetching XUID and gamertag");
        let response = self
            .http
            .post(endpoints::XSTS_AUTHORIZE)
            .header("Accept", "application/json")
            .header("x-xbl-contract-version", "1")
            .timeout(XSTS_TIMEOUT)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Http {
                status,
                body_snippet: body.chars().take(200).collect(),
            });
        }

        let parsed: XstsAuthResponse = response
            .json()
            .await
            .map_err(|e| AuthError::MalformedResponse(format!("display claims response: {e}")))?;
        let claim = parsed.display_claims.xui.into_iter().next();
        Ok(claim.and_then(|c| match (c.xid, c.gtg) {
            (Some(xid), Some(gtg)) => Some((xid, gtg)),
            _ => None,
        }))
    }
}

async fn read_token_response(response: reqwest::Response) -> Result<XboxTokenResponse> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(AuthError::Http {
            status,
            body_snippet: body.chars().take(200).collect(),
        });
    }
    serde_json::from_str(&body)
        .map_err(|e| AuthError::MalformedResponse(format!("token service response: {e}")))
}
