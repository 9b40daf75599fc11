//! Hardened parsing for XSTS authorize responses.
//!
//! XSTS bodies occasionally arrive truncated mid-stream. Rather than failing
//! the whole strategy, the parser walks a recovery ladder: direct parse,
//! truncate-at-last-brace reparse, then regex extraction of the token and
//! user hash. Only when every rung fails does the caller see a transient
//! error and go back through the retry loop.

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::errors::{AuthError, Result};
use crate::models::XstsAuthResponse;

/// Outcome of parsing one XSTS body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedXsts {
    pub token: String,
    pub user_hash: Option<String>,
    pub xuid: Option<String>,
    pub not_after: Option<DateTime<Utc>>,
    /// True when the body had to be recovered by regex extraction instead of
    /// structural parsing.
    pub derived: bool,
}

/// Parse an XSTS authorize body, tolerating truncation.
pub fn parse_xsts_response(body: &str) -> Result<ParsedXsts> {
    let cleaned = body.trim_start_matches('\u{feff}').trim();
    if cleaned.is_empty() {
        return Err(AuthError::MalformedResponse(
            "empty XSTS response body".to_string(),
        ));
    }

    if let Some(parsed) = try_structural(cleaned) {
        return Ok(parsed);
    }

    // Bodies cut off mid-object usually still contain a complete prefix.
    // Retry from the last closing brace.
    if !cleaned.ends_with('}') && !cleaned.ends_with(']') {
        if let Some(idx) = cleaned.rfind('}') {
            let truncated = &cleaned[..=idx];
            if let Some(parsed) = try_structural(truncated) {
                debug!(
                    dropped = cleaned.len() - truncated.len(),
                    "recovered XSTS body by truncating at last brace"
                );
                return Ok(parsed);
            }
        }
    }

    if let Some(parsed) = try_regex(cleaned) {
        warn!("XSTS body recovered by regex extraction; marking identity as derived");
        return Ok(parsed);
    }

    Err(AuthError::MalformedResponse(
        "unparseable XSTS response (direct, truncated, and regex recovery all failed)".to_string(),
    ))
}

/// Direct serde parse. Requires both `Token` and `DisplayClaims`.
fn try_structural(body: &str) -> Option<ParsedXsts> {
    let response: XstsAuthResponse = serde_json::from_str(body).ok()?;
    let user_hash = response.display_claims.xui.first().map(|x| x.uhs.clone());
    user_hash.as_ref()?;
    let xuid = response
        .display_claims
        .xui
        .first()
        .and_then(|x| x.xid.clone());
    Some(ParsedXsts {
        token: response.token,
        user_hash,
        xuid,
        not_after: response.not_after.as_deref().and_then(parse_timestamp),
        derived: false,
    })
}

/// Last resort: pull `"Token":"…"` and `xui[0].uhs` straight out of the text.
/// When display claims cannot be recovered the caller synthesizes a minimal
/// set downstream; the identity is flagged as derived either way.
fn try_regex(body: &str) -> Option<ParsedXsts> {
    let token_re = Regex::new(r#""Token"\s*:\s*"([^"]+)""#).expect("static regex");
    let uhs_re = Regex::new(r#""uhs"\s*:\s*"([^"]+)""#).expect("static regex");
    let xid_re = Regex::new(r#""xid"\s*:\s*"([^"]+)""#).expect("static regex");
    let not_after_re = Regex::new(r#""NotAfter"\s*:\s*"([^"]+)""#).expect("static regex");

    let token = token_re.captures(body)?.get(1)?.as_str().to_string();
    if token.is_empty() {
        return None;
    }

    let user_hash = uhs_re
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let xuid = xid_re
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let not_after = not_after_re
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| parse_timestamp(m.as_str()));

    Some(ParsedXsts {
        token,
        user_hash,
        xuid,
        not_after,
        derived: true,
    })
}

/// XSTS timestamps come back as RFC 3339 with sub-second precision.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_token() -> String {
        format!("eyJhbGciOiJIUzI1NiJ9.{}", "a".repeat(120))
    }

    #[test]
    fn clean_body_parses_structurally() {
        let token = long_token();
        let body = format!(
            r#"{{"IssueInstant":"2026-08-01T10:00:00.000Z","NotAfter":"2026-08-02T02:00:00.000Z","Token":"{token}","DisplayClaims":{{"xui":[{{"uhs":"1234567890123","xid":"2535412345678901"}}]}}}}"#
        );

        let parsed = parse_xsts_response(&body).unwrap();
        assert_eq!(parsed.token, token);
        assert_eq!(parsed.user_hash.as_deref(), Some("1234567890123"));
        assert_eq!(parsed.xuid.as_deref(), Some("2535412345678901"));
        assert!(!parsed.derived);
        assert!(parsed.not_after.is_some());
    }

    #[test]
    fn bom_and_whitespace_are_stripped() {
        let token = long_token();
        let body = format!(
            "\u{feff}  {{\"Token\":\"{token}\",\"DisplayClaims\":{{\"xui\":[{{\"uhs\":\"1234567890123\"}}]}}}}  "
        );

        let parsed = parse_xsts_response(&body).unwrap();
        assert_eq!(parsed.token, token);
        assert!(!parsed.derived);
    }

    #[test]
    fn trailing_garbage_recovers_by_truncation() {
        let token = long_token();
        let body = format!(
            r#"{{"Token":"{token}","DisplayClaims":{{"xui":[{{"uhs":"1234567890123"}}]}}}}garbage after the document"#
        );

        let parsed = parse_xsts_response(&body).unwrap();
        assert_eq!(parsed.token, token);
        assert!(!parsed.derived);
    }

    #[test]
    fn truncated_body_recovers_via_regex_with_uhs() {
        // Missing the closing braces of DisplayClaims, xui, and the root.
        let token = long_token();
        let body = format!(r#"{{"Token":"{token}","DisplayClaims":{{"xui":[{{"uhs":"h"}}]"#);

        let parsed = parse_xsts_response(&body).unwrap();
        assert_eq!(parsed.token, token);
        assert!(parsed.token.len() >= 100);
        assert_eq!(parsed.user_hash.as_deref(), Some("h"));
        assert!(parsed.derived);
    }

    #[test]
    fn token_only_body_recovers_without_display_claims() {
        let token = long_token();
        let body = format!(r#"{{"NotAfter":"2026-08-02T02:00:00.000Z","Token":"{token}""#);

        let parsed = parse_xsts_response(&body).unwrap();
        assert_eq!(parsed.token, token);
        assert!(parsed.user_hash.is_none());
        assert!(parsed.derived);
        assert!(parsed.not_after.is_some());
    }

    #[test]
    fn hopeless_bodies_fail_as_malformed() {
        for body in ["", "   ", "not json at all", r#"{"DisplayClaims":{}}"#] {
            let err = parse_xsts_response(body).unwrap_err();
            assert!(err.is_parse_failure(), "body {body:?} gave {err}");
        }
    }

    #[test]
    fn timestamps_parse_from_rfc3339() {
        let t = parse_timestamp("2026-08-02T02:00:00.0000000Z");
        assert!(t.is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
