//! Configuration loading and validation.
//!
//! A single TOML file plus a handful of environment overrides. Validation
//! failures are fatal: the process refuses to start on an empty server
//! list, a server without accounts, or an invalid port.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "./friend-connect.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub friends: FriendSettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
    /// Keep the remaining supervisors alive when one fails to initialize.
    #[serde(default)]
    pub continue_on_server_failure: bool,
    /// Parsed for compatibility; simulation is not part of this binary.
    #[serde(default)]
    pub demo_mode: bool,
    #[serde(default)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    /// IP or hostname of the actual game server.
    pub address: String,
    /// UDP port of the actual game server.
    pub port: u16,
    pub host_name: String,
    pub world_name: String,
    #[serde(default = "defaults::version")]
    pub version: String,
    #[serde(default = "defaults::protocol")]
    pub protocol: u32,
    #[serde(default = "defaults::max_players")]
    pub max_players: u32,
    /// Identity emails, in authentication order. The first becomes the
    /// session host.
    pub accounts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub auto_recover: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_delay_secs: 5,
            max_reconnect_delay_secs: 60,
            heartbeat_interval_secs: 60,
            auto_recover: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub token_path: PathBuf,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Xbox title the tokens are scoped to.
    pub title: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_path: PathBuf::from("./auth"),
            max_retries: 5,
            retry_delay_secs: 2,
            title: "MinecraftNintendoSwitch".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FriendSettings {
    pub max_concurrent_requests: usize,
    pub request_delay_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for FriendSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            request_delay_secs: 1,
            poll_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub check_interval_secs: u64,
    pub health_threshold: f64,
    pub critical_threshold: f64,
    pub max_failures: u32,
    pub restart_on_critical_failure: bool,
    pub max_inactivity_secs: u64,
    pub stats_interval_secs: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            health_threshold: 0.8,
            critical_threshold: 0.3,
            max_failures: 3,
            restart_on_critical_failure: true,
            max_inactivity_secs: 300,
            stats_interval_secs: 300,
        }
    }
}

mod defaults {
    pub fn version() -> String {
        "1.21.0".to_string()
    }
    pub fn protocol() -> u32 {
        686
    }
    pub fn max_players() -> u32 {
        40
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AppConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig =
            toml::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("FRIEND_CONNECT_TOKEN_PATH") {
            self.auth.token_path = PathBuf::from(path);
        }
        if let Ok(val) = std::env::var("FRIEND_CONNECT_CONTINUE_ON_FAILURE") {
            if let Ok(flag) = val.parse() {
                self.continue_on_server_failure = flag;
            }
        }
        if let Ok(val) = std::env::var("FRIEND_CONNECT_LOG_JSON") {
            if let Ok(flag) = val.parse() {
                self.log_json = flag;
            }
        }
    }

    /// Startup validation. Every problem is collected so the operator sees
    /// the full list at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.servers.is_empty() {
            problems.push("no servers configured".to_string());
        }
        let mut seen_ids = std::collections::HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                problems.push("server with empty id".to_string());
            } else if !seen_ids.insert(server.id.as_str()) {
                problems.push(format!("duplicate server id '{}'", server.id));
            }
            if server.address.trim().is_empty() {
                problems.push(format!("server '{}' has an empty address", server.id));
            }
            if server.port == 0 {
                problems.push(format!("server '{}' has port 0", server.id));
            }
            if server.accounts.is_empty() {
                problems.push(format!("server '{}' has no accounts", server.id));
            }
            for email in &server.accounts {
                if email.trim().is_empty() {
                    problems.push(format!("server '{}' has a blank account email", server.id));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.monitoring.health_threshold) {
            problems.push("monitoring.health_threshold must be within 0..=1".to_string());
        }
        if !(0.0..=1.0).contains(&self.monitoring.critical_threshold) {
            problems.push("monitoring.critical_threshold must be within 0..=1".to_string());
        }
        if fc_auth::AuthTitle::parse(&self.auth.title).is_none() {
            problems.push(format!("unknown auth title '{}'", self.auth.title));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn auth_title(&self) -> fc_auth::AuthTitle {
        fc_auth::AuthTitle::parse(&self.auth.title).unwrap_or_default()
    }

    pub fn session_tuning(&self) -> fc_live::SessionTuning {
        fc_live::SessionTuning {
            heartbeat_interval: Duration::from_secs(self.session.heartbeat_interval_secs),
            reconnect_delay: Duration::from_secs(self.session.reconnect_delay_secs),
            max_reconnect_delay: Duration::from_secs(self.session.max_reconnect_delay_secs),
            max_reconnect_attempts: self.session.max_reconnect_attempts,
            auto_reconnect: self.session.auto_reconnect,
            ..fc_live::SessionTuning::default()
        }
    }

    pub fn friend_tuning(&self) -> fc_live::FriendTuning {
        fc_live::FriendTuning {
            max_concurrent_requests: self.friends.max_concurrent_requests,
            request_delay: Duration::from_secs(self.friends.request_delay_secs),
            poll_interval: Duration::from_secs(self.friends.poll_interval_secs),
            ..fc_live::FriendTuning::default()
        }
    }

    pub fn pipeline_options(&self) -> fc_auth::PipelineOptions {
        fc_auth::PipelineOptions {
            title: self.auth_title(),
            retry: fc_auth::RetryPolicy {
                max_attempts: self.auth.max_retries,
                base_delay: Duration::from_secs(self.auth.retry_delay_secs),
                ..fc_auth::RetryPolicy::default()
            },
            ..fc_auth::PipelineOptions::default()
        }
    }
}

impl ServerConfig {
    pub fn advert(&self) -> fc_live::ServerAdvert {
        fc_live::ServerAdvert {
            id: self.id.clone(),
            address: self.address.clone(),
            port: self.port,
            host_name: self.host_name.clone(),
            world_name: self.world_name.clone(),
            version: self.version.clone(),
            protocol: self.protocol,
            max_players: self.max_players,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[server]]
        id = "main-server"
        address = "play.example.com"
        port = 19132
        host_name = "Example Server"
        world_name = "Example World"
        accounts = ["a@x.test", "b@x.test"]
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = AppConfig::parse_str(MINIMAL).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].max_players, 40);
        assert_eq!(config.session.heartbeat_interval_secs, 60);
        assert_eq!(config.session.max_reconnect_attempts, 10);
        assert_eq!(config.friends.max_concurrent_requests, 5);
        assert_eq!(config.monitoring.max_failures, 3);
        assert_eq!(config.monitoring.stats_interval_secs, 300);
        assert!(!config.continue_on_server_failure);
        assert_eq!(
            config.auth_title(),
            fc_auth::AuthTitle::MinecraftNintendoSwitch
        );
    }

    #[test]
    fn empty_server_list_is_fatal() {
        let err = AppConfig::parse_str("").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("no servers configured"));
    }

    #[test]
    fn server_without_accounts_is_fatal() {
        let toml = r#"
            [[server]]
            id = "s1"
            address = "play.example.com"
            port = 19132
            host_name = "H"
            world_name = "W"
            accounts = []
        "#;
        let err = AppConfig::parse_str(toml).unwrap_err();
        assert!(err.to_string().contains("no accounts"));
    }

    #[test]
    fn port_zero_is_fatal() {
        let toml = r#"
            [[server]]
            id = "s1"
            address = "play.example.com"
            port = 0
            host_name = "H"
            world_name = "W"
            accounts = ["a@x.test"]
        "#;
        let err = AppConfig::parse_str(toml).unwrap_err();
        assert!(err.to_string().contains("port 0"));
    }

    #[test]
    fn duplicate_server_ids_are_fatal() {
        let toml = r#"
            [[server]]
            id = "s1"
            address = "a.example.com"
            port = 19132
            host_name = "H"
            world_name = "W"
            accounts = ["a@x.test"]

            [[server]]
            id = "s1"
            address = "b.example.com"
            port = 19133
            host_name = "H2"
            world_name = "W2"
            accounts = ["b@x.test"]
        "#;
        let err = AppConfig::parse_str(toml).unwrap_err();
        assert!(err.to_string().contains("duplicate server id"));
    }

    #[test]
    fn unknown_auth_title_is_fatal() {
        let toml = format!("{MINIMAL}\n[auth]\ntitle = \"MinecraftVita\"\n");
        let err = AppConfig::parse_str(&toml).unwrap_err();
        assert!(err.to_string().contains("unknown auth title"));
    }

    #[test]
    fn tunings_map_into_subsystem_types() {
        let config = AppConfig::parse_str(MINIMAL).unwrap();

        let session = config.session_tuning();
        assert_eq!(session.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(session.reconnect_delay, Duration::from_secs(5));
        assert_eq!(session.max_reconnect_attempts, 10);

        let friends = config.friend_tuning();
        assert_eq!(friends.max_concurrent_requests, 5);
        assert_eq!(friends.request_delay, Duration::from_secs(1));

        let pipeline = config.pipeline_options();
        assert_eq!(pipeline.retry.max_attempts, 5);
        assert_eq!(pipeline.retry.base_delay, Duration::from_secs(2));
    }
}
