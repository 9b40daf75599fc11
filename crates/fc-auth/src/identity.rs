use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{AuthError, Result};

/// Minimum XSTS token length accepted as valid.
pub const MIN_XSTS_LEN: usize = 100;

/// Minimum length for XUIDs and user hashes.
pub const MIN_ID_LEN: usize = 10;

/// The Xbox title an authentication is scoped to. This determines which
/// MPSD session templates are reachable with the resulting token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AuthTitle {
    /// Broadest acceptance for session creation; the default.
    #[default]
    MinecraftNintendoSwitch,
    MinecraftAndroid,
    MinecraftJava,
}

impl AuthTitle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MinecraftNintendoSwitch => "MinecraftNintendoSwitch",
            Self::MinecraftAndroid => "MinecraftAndroid",
            Self::MinecraftJava => "MinecraftJava",
        }
    }

    /// OAuth client id registered for this title's live flow.
    pub fn client_id(&self) -> &'static str {
        match self {
            Self::MinecraftNintendoSwitch => "00000000441cc96b",
            Self::MinecraftAndroid => "0000000048183522",
            Self::MinecraftJava => "00000000402b5328",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MinecraftNintendoSwitch" => Some(Self::MinecraftNintendoSwitch),
            "MinecraftAndroid" => Some(Self::MinecraftAndroid),
            "MinecraftJava" => Some(Self::MinecraftJava),
            _ => None,
        }
    }
}

/// How an identity's final XSTS token was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    /// Restored or refreshed from the on-disk cache without user interaction.
    CachedRefresh,
    /// Interactive device-code flow against login.live.com.
    DeviceCodeLive,
    /// Interactive device-code flow against login.microsoftonline.com.
    DeviceCodeMsal,
    /// Manual user/device/title + XSTS exchange recovery path.
    ManualExchange,
}

/// A fully authenticated bot identity.
///
/// The invariant is all-or-nothing: a stored `Identity` always has a
/// non-empty XUID, user hash, and XSTS token with `not_after` in the future.
/// Downstream code consumes only the XUID and the authorization header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Configured email. An identifier only; the signed-in account is
    /// whatever the operator completed the device-code flow with.
    pub email: String,
    pub xuid: String,
    /// Display-only; populated best-effort from the gamertag claims.
    pub gamertag: Option<String>,
    pub user_hash: String,
    pub xsts_token: String,
    pub auth_method: AuthMethod,
    pub issued_at: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub title: AuthTitle,
    /// Set when the token was recovered by the regex-fallback parser.
    pub derived: bool,
}

impl Identity {
    /// Authorization header consumed by every Xbox Live service call.
    pub fn authorization_header(&self) -> String {
        format!("XBL3.0 x={};{}", self.user_hash, self.xsts_token)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.not_after
    }

    /// Enforce the output guarantees of the pipeline: length-validated
    /// tokens and an expiry strictly in the future.
    pub fn validate(&self) -> Result<()> {
        if self.xuid.len() < MIN_ID_LEN {
            return Err(AuthError::InvalidIdentity(format!(
                "XUID too short ({} chars)",
                self.xuid.len()
            )));
        }
        if self.user_hash.len() < MIN_ID_LEN {
            return Err(AuthError::InvalidIdentity(format!(
                "user hash too short ({} chars)",
                self.user_hash.len()
            )));
        }
        if self.xsts_token.len() < MIN_XSTS_LEN {
            return Err(AuthError::InvalidIdentity(format!(
                "XSTS token too short ({} chars)",
                self.xsts_token.len()
            )));
        }
        if self.not_after <= Utc::now() {
            return Err(AuthError::InvalidIdentity(format!(
                "token already expired at {}",
                self.not_after
            )));
        }
        Ok(())
    }

    /// When the proactive refresh timer should fire: one hour before the
    /// token expires, but never sooner than one hour from now.
    pub fn refresh_deadline(&self) -> DateTime<Utc> {
        let early = self.not_after - Duration::hours(1);
        let floor = Utc::now() + Duration::hours(1);
        early.max(floor)
    }
}

/// On-disk token bundle for one (email, title) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCacheEntry {
    pub email: String,
    pub title: AuthTitle,
    /// Which flow produced the refresh material, so a silent refresh can
    /// replay against the right token endpoint.
    pub refresh_flow: Option<AuthMethod>,
    pub refresh_token: Option<String>,
    pub xuid: Option<String>,
    pub gamertag: Option<String>,
    pub user_hash: Option<String>,
    pub xsts_token: Option<String>,
    pub xsts_not_after: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
}

impl TokenCacheEntry {
    pub fn new(email: &str, title: AuthTitle) -> Self {
        Self {
            email: email.to_string(),
            title,
            refresh_flow: None,
            refresh_token: None,
            xuid: None,
            gamertag: None,
            user_hash: None,
            xsts_token: None,
            xsts_not_after: None,
            saved_at: Utc::now(),
        }
    }

    /// A cached XSTS bundle usable without any network round trip.
    pub fn usable_xsts(&self) -> bool {
        let unexpired = self
            .xsts_not_after
            .map(|t| t > Utc::now() + Duration::minutes(5))
            .unwrap_or(false);
        unexpired
            && self.xuid.is_some()
            && self.user_hash.is_some()
            && self.xsts_token.is_some()
    }
}

/// Stable cache key for an (email, title) pair: hex SHA-256, truncated.
pub fn identity_key(email: &str, title: AuthTitle) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    hasher.update(b"\n");
    hasher.update(title.as_str().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(xsts_len: usize) -> Identity {
        Identity {
            email: "a@x.test".to_string(),
            xuid: "2535412345678901".to_string(),
            gamertag: None,
            user_hash: "1234567890123".to_string(),
            xsts_token: "e".repeat(xsts_len),
            auth_method: AuthMethod::DeviceCodeLive,
            issued_at: Utc::now(),
            not_after: Utc::now() + Duration::hours(8),
            title: AuthTitle::MinecraftNintendoSwitch,
            derived: false,
        }
    }

    #[test]
    fn authorization_header_matches_xbl3_format() {
        let id = identity(150);
        let header = id.authorization_header();
        let re = regex::Regex::new(r"^XBL3\.0 x=[^;]+;.+$").unwrap();
        assert!(re.is_match(&header), "header was {header}");
    }

    #[test]
    fn validate_rejects_short_xsts_token() {
        let id = identity(99);
        assert!(matches!(
            id.validate(),
            Err(AuthError::InvalidIdentity(_))
        ));
        assert!(identity(100).validate().is_ok());
    }

    #[test]
    fn validate_rejects_expired_token() {
        let mut id = identity(150);
        id.not_after = Utc::now() - Duration::minutes(1);
        assert!(id.validate().is_err());
    }

    #[test]
    fn refresh_deadline_is_at_least_an_hour_away() {
        let mut id = identity(150);
        // Token expires in 10 minutes: the refresh floor wins.
        id.not_after = Utc::now() + Duration::minutes(10);
        let deadline = id.refresh_deadline();
        assert!(deadline >= Utc::now() + Duration::minutes(59));

        // Token expires in a day: refresh an hour early.
        id.not_after = Utc::now() + Duration::hours(24);
        let deadline = id.refresh_deadline();
        assert!(deadline < id.not_after);
        assert!(deadline >= id.not_after - Duration::minutes(61));
    }

    #[test]
    fn identity_key_is_stable_and_distinct() {
        let a = identity_key("a@x.test", AuthTitle::MinecraftNintendoSwitch);
        let b = identity_key("a@x.test", AuthTitle::MinecraftNintendoSwitch);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, identity_key("b@x.test", AuthTitle::MinecraftNintendoSwitch));
        assert_ne!(a, identity_key("a@x.test", AuthTitle::MinecraftJava));
    }

    #[test]
    fn cache_entry_usable_only_when_complete_and_fresh() {
        let mut entry = TokenCacheEntry::new("a@x.test", AuthTitle::default());
        assert!(!entry.usable_xsts());

        entry.xuid = Some("2535412345678901".to_string());
        entry.user_hash = Some("1234567890123".to_string());
        entry.xsts_token = Some("e".repeat(150));
        entry.xsts_not_after = Some(Utc::now() + Duration::hours(2));
        assert!(entry.usable_xsts());

        entry.xsts_not_after = Some(Utc::now() - Duration::hours(2));
        assert!(!entry.usable_xsts());
    }
}
