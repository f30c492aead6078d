//! Server configuration.
//!
//! Three layers, in rising precedence: built-in defaults, a TOML config
//! file, CLI flags. Unknown keys in the file are a startup error rather than
//! a silent ignore.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ServerError;

/// Default request-socket port.
pub const DEFAULT_DEALER_PORT: u16 = 5555;
/// Default publish-socket port.
pub const DEFAULT_PUB_PORT: u16 = 5556;
/// Default discovery-beacon port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;
/// Default admin-interface port.
pub const DEFAULT_ADMIN_PORT: u16 = 8800;

/// Cap on the advertised server name, in ASCII bytes.
pub const MAX_SERVER_NAME_LEN: usize = 64;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable log lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Request-socket port (0 picks an ephemeral port).
    pub dealer_port: u16,
    /// Publish-socket port.
    pub pub_port: u16,
    /// Discovery-beacon port.
    pub discovery_port: u16,
    /// Whether to answer discovery probes.
    pub enable_discovery: bool,
    /// Name advertised in discovery replies.
    pub server_name: String,
    /// Silence after which a client is reaped.
    pub inactivity_timeout: Duration,
    /// Fastest adaptive broadcast period.
    pub broadcast_min_period: Duration,
    /// Slowest adaptive broadcast period.
    pub broadcast_max_period: Duration,
    /// Admin-interface port.
    pub admin_port: u16,
    /// Whether to serve the admin interface.
    pub admin_enabled: bool,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dealer_port: DEFAULT_DEALER_PORT,
            pub_port: DEFAULT_PUB_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            enable_discovery: true,
            server_name: "roomcast".to_owned(),
            inactivity_timeout: Duration::from_secs(1),
            broadcast_min_period: Duration::from_millis(50),
            broadcast_max_period: Duration::from_millis(500),
            admin_port: DEFAULT_ADMIN_PORT,
            admin_enabled: true,
            log_level: "info".to_owned(),
            log_format: LogFormat::Text,
        }
    }
}

/// The config-file schema. Every key optional; unknown keys are fatal.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    dealer_port: Option<u16>,
    pub_port: Option<u16>,
    discovery_port: Option<u16>,
    enable_discovery: Option<bool>,
    server_name: Option<String>,
    inactivity_timeout_seconds: Option<f64>,
    broadcast_min_period_ms: Option<u64>,
    broadcast_max_period_ms: Option<u64>,
    admin_port: Option<u16>,
    admin_enabled: Option<bool>,
    log_level: Option<String>,
    log_format: Option<LogFormat>,
}

impl FileConfig {
    /// Parse TOML text.
    pub fn parse(text: &str) -> Result<Self, ServerError> {
        toml::from_str(text).map_err(|e| ServerError::Config(format!("invalid config file: {e}")))
    }
}

/// CLI-provided overrides; every field optional.
#[derive(Debug, Default)]
pub struct Overrides {
    /// Request-socket port.
    pub dealer_port: Option<u16>,
    /// Publish-socket port.
    pub pub_port: Option<u16>,
    /// Discovery-beacon port.
    pub discovery_port: Option<u16>,
    /// Whether to answer discovery probes.
    pub enable_discovery: Option<bool>,
    /// Advertised server name.
    pub server_name: Option<String>,
    /// Inactivity timeout in seconds.
    pub inactivity_timeout_seconds: Option<f64>,
    /// Fastest broadcast period in milliseconds.
    pub broadcast_min_period_ms: Option<u64>,
    /// Slowest broadcast period in milliseconds.
    pub broadcast_max_period_ms: Option<u64>,
    /// Admin-interface port.
    pub admin_port: Option<u16>,
    /// Whether to serve the admin interface.
    pub admin_enabled: Option<bool>,
    /// Default log filter.
    pub log_level: Option<String>,
    /// Log output format.
    pub log_format: Option<LogFormat>,
}

impl Config {
    /// Layer file and CLI values over the defaults and validate.
    pub fn resolve(file: FileConfig, cli: Overrides) -> Result<Self, ServerError> {
        let mut config = Self::default();

        if let Some(v) = file.dealer_port {
            config.dealer_port = v;
        }
        if let Some(v) = file.pub_port {
            config.pub_port = v;
        }
        if let Some(v) = file.discovery_port {
            config.discovery_port = v;
        }
        if let Some(v) = file.enable_discovery {
            config.enable_discovery = v;
        }
        if let Some(v) = file.server_name {
            config.server_name = v;
        }
        if let Some(v) = file.inactivity_timeout_seconds {
            config.inactivity_timeout = seconds(v)?;
        }
        if let Some(v) = file.broadcast_min_period_ms {
            config.broadcast_min_period = Duration::from_millis(v);
        }
        if let Some(v) = file.broadcast_max_period_ms {
            config.broadcast_max_period = Duration::from_millis(v);
        }
        if let Some(v) = file.admin_port {
            config.admin_port = v;
        }
        if let Some(v) = file.admin_enabled {
            config.admin_enabled = v;
        }
        if let Some(v) = file.log_level {
            config.log_level = v;
        }
        if let Some(v) = file.log_format {
            config.log_format = v;
        }

        if let Some(v) = cli.dealer_port {
            config.dealer_port = v;
        }
        if let Some(v) = cli.pub_port {
            config.pub_port = v;
        }
        if let Some(v) = cli.discovery_port {
            config.discovery_port = v;
        }
        if let Some(v) = cli.enable_discovery {
            config.enable_discovery = v;
        }
        if let Some(v) = cli.server_name {
            config.server_name = v;
        }
        if let Some(v) = cli.inactivity_timeout_seconds {
            config.inactivity_timeout = seconds(v)?;
        }
        if let Some(v) = cli.broadcast_min_period_ms {
            config.broadcast_min_period = Duration::from_millis(v);
        }
        if let Some(v) = cli.broadcast_max_period_ms {
            config.broadcast_max_period = Duration::from_millis(v);
        }
        if let Some(v) = cli.admin_port {
            config.admin_port = v;
        }
        if let Some(v) = cli.admin_enabled {
            config.admin_enabled = v;
        }
        if let Some(v) = cli.log_level {
            config.log_level = v;
        }
        if let Some(v) = cli.log_format {
            config.log_format = v;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ServerError> {
        if self.server_name.is_empty()
            || self.server_name.len() > MAX_SERVER_NAME_LEN
            || !self.server_name.is_ascii()
        {
            return Err(ServerError::Config(format!(
                "server_name must be 1..={MAX_SERVER_NAME_LEN} ASCII bytes"
            )));
        }
        if self.server_name.contains('|') {
            return Err(ServerError::Config(
                "server_name must not contain the discovery separator '|'".to_owned(),
            ));
        }
        if self.broadcast_min_period.is_zero()
            || self.broadcast_min_period > self.broadcast_max_period
        {
            return Err(ServerError::Config(format!(
                "broadcast periods must satisfy 0 < min <= max (got {:?} / {:?})",
                self.broadcast_min_period, self.broadcast_max_period
            )));
        }
        Ok(())
    }
}

fn seconds(value: f64) -> Result<Duration, ServerError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ServerError::Config(format!(
            "inactivity_timeout_seconds must be a positive number, got {value}"
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_ports() {
        let config = Config::default();
        assert_eq!(config.dealer_port, 5555);
        assert_eq!(config.pub_port, 5556);
        assert_eq!(config.discovery_port, 9999);
        assert_eq!(config.admin_port, 8800);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(1));
    }

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let file = FileConfig::parse(
            r#"
            dealer_port = 6000
            server_name = "stage-left"
            inactivity_timeout_seconds = 2.5
            "#,
        )
        .unwrap();

        let cli = Overrides { dealer_port: Some(7000), ..Overrides::default() };
        let config = Config::resolve(file, cli).unwrap();

        assert_eq!(config.dealer_port, 7000);
        assert_eq!(config.server_name, "stage-left");
        assert_eq!(config.inactivity_timeout, Duration::from_secs_f64(2.5));
        // Untouched keys keep their defaults.
        assert_eq!(config.pub_port, DEFAULT_PUB_PORT);
    }

    #[test]
    fn unknown_keys_fail_at_parse() {
        let err = FileConfig::parse("dealer_prot = 6000").unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn invalid_values_fail_at_resolve() {
        let file = FileConfig::parse("inactivity_timeout_seconds = -1.0").unwrap();
        assert!(Config::resolve(file, Overrides::default()).is_err());

        let file = FileConfig::parse(
            "broadcast_min_period_ms = 500\nbroadcast_max_period_ms = 50",
        )
        .unwrap();
        assert!(Config::resolve(file, Overrides::default()).is_err());

        let cli = Overrides {
            server_name: Some("x".repeat(MAX_SERVER_NAME_LEN + 1)),
            ..Overrides::default()
        };
        assert!(Config::resolve(FileConfig::default(), cli).is_err());
    }

    #[test]
    fn log_format_parses_from_toml() {
        let file = FileConfig::parse(r#"log_format = "json""#).unwrap();
        let config = Config::resolve(file, Overrides::default()).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
    }
}
