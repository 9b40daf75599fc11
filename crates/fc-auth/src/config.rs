use std::time::Duration;

use rand::Rng;

/// Microsoft and Xbox Live service endpoints.
pub mod endpoints {
    pub const LIVE_DEVICE_CODE: &str = "https://login.live.com/oauth20_connect.srf";
    pub const LIVE_TOKEN: &str = "https://login.live.com/oauth20_token.srf";
    pub const MSAL_DEVICE_CODE: &str =
        "https://login.microsoftonline.com/consumers/oauth2/v2.0/devicecode";
    pub const MSAL_TOKEN: &str = "https://login.microsoftonline.com/consumers/oauth2/v2.0/token";
    pub const USER_AUTHENTICATE: &str = "https://user.auth.xboxlive.com/user/authenticate";
    pub const DEVICE_AUTHENTICATE: &str = "https://device.auth.xboxlive.com/device/authenticate";
    pub const TITLE_AUTHENTICATE: &str = "https://title.auth.xboxlive.com/title/authenticate";
    pub const XSTS_AUTHORIZE: &str = "https://xsts.auth.xboxlive.com/xsts/authorize";
}

/// Relying parties an XSTS token can be scoped to.
pub mod relying_party {
    pub const XBOX_LIVE: &str = "http://xboxlive.com";
    pub const REALMS: &str = "https://pocket.realms.minecraft.net/";
    pub const MULTIPLAYER: &str = "https://multiplayer.minecraft.net/";
    /// Intermediate user/device/title tokens are issued against this.
    pub const XBOX_AUTH: &str = "http://auth.xboxlive.com";
}

/// OAuth scopes.
pub const LIVE_SCOPE: &str = "service::user.auth.xboxlive.com::MBI_SSL";
pub const MSAL_SCOPE: &str = "XboxLive.signin offline_access";

/// Public MSAL client id used for the consumers device-code flow.
pub const MSAL_CLIENT_ID: &str = "389b1b32-b5d5-43b2-bddc-84ce938d6737";

/// User agent the XSTS service expects.
pub const XSTS_USER_AGENT: &str = "XboxServicesAPI/2021.11.20201204.000 c";

/// Overall deadline for one interactive authentication.
pub const AUTH_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// Timeout for a single XSTS exchange.
pub const XSTS_TIMEOUT: Duration = Duration::from_secs(30);

/// Synthesized token lifetime when the server omitted `NotAfter`.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 3600);

/// Which OAuth front door a strategy goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthFlow {
    Live,
    Msal,
}

/// One row of the strategy ladder: a flow, the relying party the final XSTS
/// token is scoped to, and the OAuth scope requested up front.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub flow: AuthFlow,
    pub relying_party: &'static str,
    pub scope: &'static str,
}

/// The ladder tried in order until one yields a usable token. Covers the
/// common relying parties across both flows.
pub fn default_strategies() -> Vec<Strategy> {
    vec![
        Strategy {
            flow: AuthFlow::Live,
            relying_party: relying_party::XBOX_LIVE,
            scope: LIVE_SCOPE,
        },
        Strategy {
            flow: AuthFlow::Msal,
            relying_party: relying_party::XBOX_LIVE,
            scope: MSAL_SCOPE,
        },
        Strategy {
            flow: AuthFlow::Live,
            relying_party: relying_party::REALMS,
            scope: LIVE_SCOPE,
        },
        Strategy {
            flow: AuthFlow::Msal,
            relying_party: relying_party::MULTIPLAYER,
            scope: MSAL_SCOPE,
        },
    ]
}

/// HTTP client timeouts.
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Jittered exponential backoff policy for one strategy's attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), with +/-25% jitter
    /// so parallel supervisors do not synchronize against the same endpoint.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::rng().random_range(0.75..=1.25);
        exp.mul_f64(jitter).min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_ladder_covers_required_relying_parties() {
        let strategies = default_strategies();
        assert!(strategies.len() >= 4);

        let parties: Vec<&str> = strategies.iter().map(|s| s.relying_party).collect();
        assert!(parties.contains(&relying_party::XBOX_LIVE));
        assert!(parties.contains(&relying_party::REALMS));
        assert!(parties.contains(&relying_party::MULTIPLAYER));

        assert!(strategies.iter().any(|s| s.flow == AuthFlow::Live));
        assert!(strategies.iter().any(|s| s.flow == AuthFlow::Msal));
    }

    #[test]
    fn retry_delay_grows_and_respects_cap() {
        let policy = RetryPolicy::default();
        for _ in 0..20 {
            let first = policy.delay_for_attempt(0);
            assert!(first >= Duration::from_millis(1500), "first was {first:?}");
            assert!(first <= Duration::from_millis(2500), "first was {first:?}");

            let late = policy.delay_for_attempt(10);
            assert!(late <= policy.max_delay, "late was {late:?}");
        }
    }

    #[test]
    fn retry_budget_is_five_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }
}
