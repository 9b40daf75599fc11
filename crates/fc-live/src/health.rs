use chrono::{DateTime, Utc};

/// One health probe result for a subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSample {
    pub healthy: bool,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl HealthSample {
    pub fn healthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: true,
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Capability handle for one authenticated identity: everything the Xbox
/// Live clients need, and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveIdentity {
    pub xuid: String,
    /// Full `XBL3.0 x=<hash>;<token>` header value.
    pub authorization: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_carry_their_verdict() {
        assert!(HealthSample::healthy("ok").healthy);
        assert!(!HealthSample::unhealthy("bad").healthy);
    }
}
