use serde::{Deserialize, Serialize};

/// Device code issuance response.
///
/// Both the live flow (`oauth20_connect.srf`) and the MSAL flow
/// (`/devicecode`) return this shape.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub user_code: String,
    pub device_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

/// Microsoft OAuth token response (device-code poll and refresh_token grants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsTokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
}

/// OAuth error body returned while the device-code grant is pending or dead.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// XASU user.authenticate request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserTokenRequest {
    pub properties: UserTokenProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserTokenProperties {
    pub auth_method: String,
    pub site_name: String,
    pub rps_ticket: String,
}

/// XASD device.authenticate request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceTokenRequest {
    pub properties: DeviceTokenProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceTokenProperties {
    pub auth_method: String,
    pub id: String,
    pub device_type: String,
    pub version: String,
}

/// XAST title.authenticate request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TitleTokenRequest {
    pub properties: TitleTokenProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TitleTokenProperties {
    pub auth_method: String,
    pub device_token: String,
    pub site_name: String,
    pub rps_ticket: String,
}

/// Shared response shape of the XASU/XASD/XAST token services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XboxTokenResponse {
    pub token: String,
    pub display_claims: Option<DisplayClaims>,
    #[serde(default)]
    pub issue_instant: Option<String>,
    #[serde(default)]
    pub not_after: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayClaims {
    #[serde(default)]
    pub xui: Vec<XuiClaim>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XuiClaim {
    pub uhs: String,
    #[serde(default)]
    pub xid: Option<String>,
    #[serde(default)]
    pub gtg: Option<String>,
}

/// XSTS authorize request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthRequest {
    pub properties: XstsAuthProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthProperties {
    pub sandbox_id: String,
    pub user_tokens: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional_display_claims: Option<Vec<String>>,
}

/// XSTS authorize response. Parsing of real-world bodies goes through
/// [`crate::parse::parse_xsts_response`]; this type is the clean-JSON shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthResponse {
    pub token: String,
    pub display_claims: DisplayClaims,
    #[serde(default)]
    pub issue_instant: Option<String>,
    #[serde(default)]
    pub not_after: Option<String>,
}

/// XSTS error response (body-level, not HTTP).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsErrorResponse {
    #[serde(rename = "XErr")]
    pub xerr: u64,
    #[serde(default)]
    pub message: Option<String>,
}
