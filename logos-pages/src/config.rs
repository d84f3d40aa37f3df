//! Server and page-session configuration.
//!
//! Environment variables read by [`ServerConfig::from_env`]:
//!
//! | Variable                      | Default          | Meaning                              |
//! |-------------------------------|------------------|--------------------------------------|
//! | `LOGOS_PAGES_BIND`            | `127.0.0.1:9090` | WebSocket listen address             |
//! | `LOGOS_PAGES_DATA`            | unset            | RocksDB directory (unset = in-memory)|
//! | `LOGOS_PAGES_HEARTBEAT_SECS`  | `30`             | Presence timeout                     |
//! | `LOGOS_PAGES_TOKENS`          | empty            | `token=user_uuid:Name,...`           |

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::identity::Identity;
use crate::oplog::LogConfig;

/// Tuning for page sessions and the session manager.
#[derive(Debug, Clone)]
pub struct PagesConfig {
    /// Presence is dropped after this long without a heartbeat or update
    pub heartbeat_timeout: Duration,
    /// A connection with no inbound traffic for this long is closed
    pub idle_timeout: Duration,
    /// How often the maintenance task sweeps presence
    pub sweep_interval: Duration,
    /// How often dirty pages are flushed to the document store
    pub flush_interval: Duration,
    /// Events buffered per subscriber before it lags
    pub broadcast_capacity: usize,
    /// Messages buffered per connection on the way out
    pub outbound_capacity: usize,
    pub max_sessions_per_page: usize,
    pub log: LogConfig,
}

impl Default for PagesConfig {
    fn default() -> Self {
        let heartbeat_timeout = Duration::from_secs(30);
        Self {
            heartbeat_timeout,
            idle_timeout: heartbeat_timeout * 2,
            sweep_interval: Duration::from_secs(5),
            flush_interval: Duration::from_secs(2),
            broadcast_capacity: 256,
            outbound_capacity: 256,
            max_sessions_per_page: 100,
            log: LogConfig::default(),
        }
    }
}

impl PagesConfig {
    /// Config for testing (small buffers, short windows).
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 64,
            outbound_capacity: 64,
            max_sessions_per_page: 8,
            log: LogConfig::for_testing(),
            ..Self::default()
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self.idle_timeout = timeout * 2;
        self
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue { key: String, value: String },
    InvalidToken(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value } => write!(f, "Invalid value for {key}: {value:?}"),
            ConfigError::InvalidToken(entry) => {
                write!(f, "Invalid token entry {entry:?} (expected token=user_uuid:Name)")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Bearer token accepted by the static identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub identity: Identity,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// RocksDB directory; `None` keeps everything in memory
    pub storage_path: Option<PathBuf>,
    pub tokens: Vec<TokenGrant>,
    pub pages: PagesConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            tokens: Vec::new(),
            pages: PagesConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(bind) = lookup("LOGOS_PAGES_BIND") {
            config.bind_addr = bind;
        }
        config.storage_path = lookup("LOGOS_PAGES_DATA")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        if let Some(raw) = lookup("LOGOS_PAGES_HEARTBEAT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "LOGOS_PAGES_HEARTBEAT_SECS".into(),
                value: raw.clone(),
            })?;
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "LOGOS_PAGES_HEARTBEAT_SECS".into(),
                    value: raw,
                });
            }
            config.pages = config.pages.with_heartbeat_timeout(Duration::from_secs(secs));
        }
        if let Some(raw) = lookup("LOGOS_PAGES_TOKENS") {
            config.tokens = parse_tokens(&raw)?;
        }
        Ok(config)
    }
}

fn parse_tokens(raw: &str) -> Result<Vec<TokenGrant>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || ConfigError::InvalidToken(entry.to_string());
            let (token, rest) = entry.split_once('=').ok_or_else(invalid)?;
            let (user, name) = rest.split_once(':').ok_or_else(invalid)?;
            let user_id = Uuid::parse_str(user.trim()).map_err(|_| invalid())?;
            if token.trim().is_empty() || name.trim().is_empty() {
                return Err(invalid());
            }
            Ok(TokenGrant {
                token: token.trim().to_string(),
                identity: Identity {
                    user_id,
                    display_name: name.trim().to_string(),
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_pages_config_default() {
        let config = PagesConfig::default();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.max_sessions_per_page, 100);
        assert_eq!(config.log.replay_threshold, 200);
        assert_eq!(config.log.history_retention, 500);
    }

    #[test]
    fn test_server_config_defaults_without_env() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert!(config.storage_path.is_none());
        assert!(config.tokens.is_empty());
    }

    #[test]
    fn test_server_config_from_lookup() {
        let user = Uuid::new_v4();
        let tokens = format!("abc={user}:Alice, def={user}:Alice Again");
        let config = ServerConfig::from_lookup(lookup(&[
            ("LOGOS_PAGES_BIND", "0.0.0.0:8080"),
            ("LOGOS_PAGES_DATA", "/var/lib/pages"),
            ("LOGOS_PAGES_HEARTBEAT_SECS", "10"),
            ("LOGOS_PAGES_TOKENS", &tokens),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/pages")));
        assert_eq!(config.pages.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.pages.idle_timeout, Duration::from_secs(20));
        assert_eq!(config.tokens.len(), 2);
        assert_eq!(config.tokens[1].identity.display_name, "Alice Again");
        assert_eq!(config.tokens[0].identity.user_id, user);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            ServerConfig::from_lookup(lookup(&[("LOGOS_PAGES_HEARTBEAT_SECS", "soon")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            ServerConfig::from_lookup(lookup(&[("LOGOS_PAGES_HEARTBEAT_SECS", "0")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            ServerConfig::from_lookup(lookup(&[("LOGOS_PAGES_TOKENS", "abc=not-a-uuid:Bob")])),
            Err(ConfigError::InvalidToken(_))
        ));
        assert!(matches!(
            ServerConfig::from_lookup(lookup(&[("LOGOS_PAGES_TOKENS", "missing-separator")])),
            Err(ConfigError::InvalidToken(_))
        ));
    }
}
