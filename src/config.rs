//! Configuration module
//!
//! TOML-based configuration for the proxy process. Unlike most settings,
//! `primary_url` has no sensible default and is required; a config file
//! without it fails validation and the process exits.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::support::errors::ProxyError;

/// Canonical name of the upstream at ordinal 0.
pub const PRIMARY_NAME: &str = "PRI";
/// Canonical name of the optional upstream at ordinal 1.
pub const SECONDARY_NAME: &str = "SEC";

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener and upstream settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Alert flags and delivery credentials
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Listener and upstream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind host for the charge-point-facing listener
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Primary central system URL. The client id is appended on connect,
    /// so the URL should end with its path separator.
    #[serde(default)]
    pub primary_url: String,

    /// Optional standby central system mirrored alongside the primary.
    /// Only the primary's replies to charge point requests are surfaced
    /// back to the charge point.
    #[serde(default)]
    pub secondary_url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Per-event alert flags plus delivery channel credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Charge point connected to the proxy
    #[serde(default)]
    pub client_connected: bool,

    /// Charge point disconnected from the proxy
    #[serde(default)]
    pub client_disconnected: bool,

    /// An upstream link came up
    #[serde(default)]
    pub upstream_connected: bool,

    /// An upstream link went down
    #[serde(default)]
    pub upstream_disconnected: bool,

    /// StatusNotification requests from the charge point
    #[serde(default)]
    pub status_notification: bool,

    /// StartTransaction requests from the charge point
    #[serde(default)]
    pub start_transaction: bool,

    /// StopTransaction requests from the charge point
    #[serde(default)]
    pub stop_transaction: bool,

    /// Pushover delivery credentials; alerts stay log-only when absent
    #[serde(default)]
    pub pushover: Option<PushoverConfig>,
}

/// Pushover API credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushoverConfig {
    pub token: String,
    pub user: String,
}

/// One configured upstream: its canonical name and base URL.
/// Position in [`AppConfig::upstreams`] is significant; ordinal 0 is
/// the primary.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub base_url: String,
}

// ── Default value helpers ──────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    9000
}
fn default_log_level() -> String {
    "info".into()
}

// ── Trait implementations ──────────────────────────────────────

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            logging: LoggingConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            primary_url: String::new(),
            secondary_url: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── File I/O ───────────────────────────────────────────────────

/// Default configuration directory and file
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-mirror")
        .join("config.toml")
}

impl AppConfig {
    /// Load configuration from a TOML file.
    /// Environment variables override TOML values (highest priority).
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut cfg: AppConfig = toml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("invalid TOML in {}: {}", path.display(), e)))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply environment variable overrides for sensitive values.
    ///
    /// Supported variables:
    /// - `OCPP_PROXY_PUSHOVER_TOKEN` → `[notify.pushover].token`
    /// - `OCPP_PROXY_PUSHOVER_USER` → `[notify.pushover].user`
    fn apply_env_overrides(&mut self) {
        let token = std::env::var("OCPP_PROXY_PUSHOVER_TOKEN").ok();
        let user = std::env::var("OCPP_PROXY_PUSHOVER_USER").ok();
        if token.is_some() || user.is_some() {
            let pushover = self.notify.pushover.get_or_insert(PushoverConfig {
                token: String::new(),
                user: String::new(),
            });
            if let Some(token) = token {
                pushover.token = token;
            }
            if let Some(user) = user {
                pushover.user = user;
            }
        }
    }

    /// Validate required fields and normalize upstream URLs.
    pub fn validate(&mut self) -> Result<(), ProxyError> {
        if self.proxy.primary_url.trim().is_empty() {
            return Err(ProxyError::Config("proxy.primary_url is required".into()));
        }
        self.proxy.primary_url = normalize_ws_url(&self.proxy.primary_url)?;
        if let Some(url) = self.proxy.secondary_url.take() {
            self.proxy.secondary_url = Some(normalize_ws_url(&url)?);
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" => {}
            other => {
                return Err(ProxyError::Config(format!(
                    "logging.level '{}' is not one of error|warn|info|debug",
                    other
                )))
            }
        }

        if let Some(pushover) = &self.notify.pushover {
            if pushover.token.is_empty() || pushover.user.is_empty() {
                return Err(ProxyError::Config(
                    "notify.pushover requires both token and user".into(),
                ));
            }
        }

        Ok(())
    }

    /// Configured upstreams in ordinal order: the primary (`PRI`) first,
    /// then the secondary (`SEC`) when present.
    pub fn upstreams(&self) -> Vec<UpstreamConfig> {
        let mut upstreams = vec![UpstreamConfig {
            name: PRIMARY_NAME.to_string(),
            base_url: self.proxy.primary_url.clone(),
        }];
        if let Some(url) = &self.proxy.secondary_url {
            upstreams.push(UpstreamConfig {
                name: SECONDARY_NAME.to_string(),
                base_url: url.clone(),
            });
        }
        upstreams
    }

    /// `host:port` of the charge-point-facing listener
    pub fn address(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

/// Check the scheme and guarantee the trailing separator the client id
/// gets appended after.
fn normalize_ws_url(url: &str) -> Result<String, ProxyError> {
    let url = url.trim();
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(ProxyError::Config(format!(
            "upstream URL '{}' must start with ws:// or wss://",
            url
        )));
    }
    if url.ends_with('/') {
        Ok(url.to_string())
    } else {
        Ok(format!("{}/", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> AppConfig {
        let mut cfg: AppConfig = toml::from_str(toml_text).unwrap();
        cfg.validate().unwrap();
        cfg
    }

    fn parse_err(toml_text: &str) -> String {
        let mut cfg: AppConfig = toml::from_str(toml_text).unwrap();
        cfg.validate().unwrap_err().to_string()
    }

    #[test]
    fn minimal_config() {
        let cfg = parse(
            r#"
            [proxy]
            primary_url = "ws://cs.example.com/ocpp/"
            "#,
        );
        assert_eq!(cfg.proxy.host, "0.0.0.0");
        assert_eq!(cfg.proxy.port, 9000);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.proxy.secondary_url.is_none());
        assert!(!cfg.notify.client_connected);
    }

    #[test]
    fn missing_primary_url_fails() {
        let err = parse_err("[proxy]\nport = 9001\n");
        assert!(err.contains("primary_url"));
    }

    #[test]
    fn trailing_slash_is_added() {
        let cfg = parse(
            r#"
            [proxy]
            primary_url = "ws://cs.example.com/ocpp"
            secondary_url = "wss://mirror.example.com"
            "#,
        );
        assert_eq!(cfg.proxy.primary_url, "ws://cs.example.com/ocpp/");
        assert_eq!(cfg.proxy.secondary_url.as_deref(), Some("wss://mirror.example.com/"));
    }

    #[test]
    fn non_ws_scheme_fails() {
        let err = parse_err("[proxy]\nprimary_url = \"http://cs.example.com/\"\n");
        assert!(err.contains("ws://"));
    }

    #[test]
    fn invalid_log_level_fails() {
        let err = parse_err(
            r#"
            [proxy]
            primary_url = "ws://cs.example.com/"
            [logging]
            level = "verbose"
            "#,
        );
        assert!(err.contains("logging.level"));
    }

    #[test]
    fn upstreams_are_ordered_primary_first() {
        let cfg = parse(
            r#"
            [proxy]
            primary_url = "ws://cs.example.com/"
            secondary_url = "ws://mirror.example.com/"
            "#,
        );
        let upstreams = cfg.upstreams();
        assert_eq!(upstreams.len(), 2);
        assert_eq!(upstreams[0].name, PRIMARY_NAME);
        assert_eq!(upstreams[0].base_url, "ws://cs.example.com/");
        assert_eq!(upstreams[1].name, SECONDARY_NAME);
    }

    #[test]
    fn single_upstream_when_no_secondary() {
        let cfg = parse("[proxy]\nprimary_url = \"ws://cs.example.com/\"\n");
        assert_eq!(cfg.upstreams().len(), 1);
    }

    #[test]
    fn notify_flags_parse() {
        let cfg = parse(
            r#"
            [proxy]
            primary_url = "ws://cs.example.com/"
            [notify]
            client_connected = true
            status_notification = true
            [notify.pushover]
            token = "t"
            user = "u"
            "#,
        );
        assert!(cfg.notify.client_connected);
        assert!(cfg.notify.status_notification);
        assert!(!cfg.notify.stop_transaction);
        assert_eq!(cfg.notify.pushover.unwrap().token, "t");
    }

    #[test]
    fn pushover_requires_both_fields() {
        let err = parse_err(
            r#"
            [proxy]
            primary_url = "ws://cs.example.com/"
            [notify.pushover]
            token = "t"
            user = ""
            "#,
        );
        assert!(err.contains("pushover"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[proxy]\nprimary_url = \"ws://cs.example.com/\"\n").unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.proxy.primary_url, "ws://cs.example.com/");
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(AppConfig::load(Path::new("/nonexistent/config.toml")).is_err());
    }
}
