use std::time::Duration;

use thiserror::Error;

/// Errors produced by the authentication pipeline.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("authentication deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("device code flow declined or expired before completion")]
    DeviceCodeDeclined,

    #[error("OAuth invalid_grant - refresh material revoked or expired")]
    OAuthInvalidGrant,

    #[error("OAuth unauthorized_client - client id not allowed for this flow")]
    UnauthorizedClient,

    #[error("XSTS authorization denied: {0}")]
    XstsDenied(#[from] XstsApiError),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error {status}: {body_snippet}")]
    Http {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("all authentication strategies failed for {email}")]
    AllStrategiesFailed { email: String },

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
}

impl AuthError {
    /// Permanent failures are surfaced once and never retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::OAuthInvalidGrant | Self::UnauthorizedClient | Self::DeviceCodeDeclined => true,
            Self::XstsDenied(e) => e.is_permanent(),
            _ => false,
        }
    }

    /// Transient failures go back through the jittered backoff loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Http { .. } | Self::MalformedResponse(_)
        )
    }

    /// True when the failure came from a body we could not parse. The
    /// pipeline invalidates the on-disk cache before retrying these.
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, Self::MalformedResponse(_))
    }
}

/// XSTS-specific error codes from the body-level `XErr` field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XstsApiError {
    #[error("account doesn't have Xbox Live access (XErr: 2148916233)")]
    NoXboxAccount,

    #[error("Xbox Live not available in this region (XErr: 2148916235)")]
    RegionNotSupported,

    #[error("adult verification required (XErr: 2148916236/2148916237)")]
    AdultVerificationRequired,

    #[error("child account requires a family (XErr: 2148916238)")]
    ChildAccountRequiresFamily,

    #[error("unknown XSTS error code: {0}")]
    Unknown(u64),
}

impl XstsApiError {
    /// Parse the `XErr` code from an XSTS error response.
    pub fn from_xerr(code: u64) -> Self {
        match code {
            2148916233 => Self::NoXboxAccount,
            2148916235 => Self::RegionNotSupported,
            2148916236 | 2148916237 => Self::AdultVerificationRequired,
            2148916238 => Self::ChildAccountRequiresFamily,
            code => Self::Unknown(code),
        }
    }

    /// The account itself cannot authenticate; retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NoXboxAccount | Self::ChildAccountRequiresFamily)
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xerr_codes_map_to_permanent_failures() {
        assert_eq!(
            XstsApiError::from_xerr(2148916233),
            XstsApiError::NoXboxAccount
        );
        assert_eq!(
            XstsApiError::from_xerr(2148916238),
            XstsApiError::ChildAccountRequiresFamily
        );
        assert!(XstsApiError::from_xerr(2148916233).is_permanent());
        assert!(XstsApiError::from_xerr(2148916238).is_permanent());
        assert!(!XstsApiError::from_xerr(2148916235).is_permanent());
    }

    #[test]
    fn permanent_errors_are_not_transient() {
        let err = AuthError::OAuthInvalidGrant;
        assert!(err.is_permanent());
        assert!(!err.is_transient());

        let err = AuthError::XstsDenied(XstsApiError::NoXboxAccount);
        assert!(err.is_permanent());
    }

    #[test]
    fn malformed_response_is_transient_parse_failure() {
        let err = AuthError::MalformedResponse("unexpected end of JSON input".to_string());
        assert!(err.is_transient());
        assert!(err.is_parse_failure());
        assert!(!err.is_permanent());
    }
}
