//! Signaling service configuration.
//!
//! Configuration is loaded from environment variables. Every variable is
//! optional; malformed values fail startup instead of silently falling back
//! to defaults.

use media_engine::{EngineConfig, WebRtcTransportOptions};
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default IP media transports listen on.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default lowest RTC port.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10_000;

/// Default highest RTC port.
pub const DEFAULT_RTC_MAX_PORT: u16 = 10_100;

/// Default retention of revoked producer tombstones in seconds.
pub const DEFAULT_PRODUCER_TOMBSTONE_TTL_SECONDS: u64 = 60;

/// Default maximum inbound WebSocket message size in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE_BYTES: usize = 64 * 1024;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sfu";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::InvalidValue(format!(
                "SFU_LOG_FORMAT must be 'text' or 'json', got '{other}'"
            ))),
        }
    }
}

/// Signaling service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health/metrics endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this instance.
    pub instance_id: String,

    /// IP media transports listen on.
    pub listen_ip: IpAddr,

    /// Public address announced in ICE candidates (for NAT deployments).
    pub announced_address: Option<String>,

    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// Default transport network policy; clients may override per request.
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub prefer_tcp: bool,

    /// Per-call media engine timeout. `None` waits indefinitely.
    pub engine_call_timeout: Option<Duration>,

    /// How long revoked producer ids are remembered.
    pub producer_tombstone_ttl: Duration,

    /// Maximum inbound WebSocket message size.
    pub max_message_size: usize,

    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{name}='{raw}': {e}"))),
        None => Ok(default),
    }
}

fn parse_bool(vars: &HashMap<String, String>, name: &str, default: bool) -> Result<bool, ConfigError> {
    match vars.get(name).map(|raw| raw.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue(format!(
                "{name}='{raw}': expected true or false"
            ))),
        },
    }
}

/// Check that a transport network policy is usable.
///
/// At least one protocol must be enabled, a preferred protocol must be
/// enabled, and at most one protocol may be preferred.
pub fn check_transport_options(options: &WebRtcTransportOptions) -> Result<(), String> {
    if !options.enable_udp && !options.enable_tcp {
        return Err("at least one of UDP or TCP must be enabled".to_string());
    }
    if options.prefer_udp && !options.enable_udp {
        return Err("cannot prefer UDP when UDP is disabled".to_string());
    }
    if options.prefer_tcp && !options.enable_tcp {
        return Err("cannot prefer TCP when TCP is disabled".to_string());
    }
    if options.prefer_udp && options.prefer_tcp {
        return Err("cannot prefer both UDP and TCP".to_string());
    }
    Ok(())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let listen_ip = match vars.get("SFU_LISTEN_IP") {
            Some(raw) => raw.trim().parse().map_err(|e| {
                ConfigError::InvalidValue(format!("SFU_LISTEN_IP='{raw}': {e}"))
            })?,
            None => DEFAULT_LISTEN_IP
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("default listen IP: {e}")))?,
        };

        let announced_address = vars
            .get("SFU_ANNOUNCED_ADDRESS")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let rtc_min_port = parse_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) must not exceed SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let enable_udp = parse_bool(vars, "SFU_ENABLE_UDP", true)?;
        let enable_tcp = parse_bool(vars, "SFU_ENABLE_TCP", true)?;
        let prefer_udp = parse_bool(vars, "SFU_PREFER_UDP", true)?;
        let prefer_tcp = parse_bool(vars, "SFU_PREFER_TCP", false)?;

        let engine_call_timeout = match vars.get("SFU_ENGINE_CALL_TIMEOUT_MS") {
            Some(_) => {
                let ms: u64 = parse_var(vars, "SFU_ENGINE_CALL_TIMEOUT_MS", 0)?;
                if ms == 0 {
                    return Err(ConfigError::InvalidValue(
                        "SFU_ENGINE_CALL_TIMEOUT_MS must be greater than zero".to_string(),
                    ));
                }
                Some(Duration::from_millis(ms))
            }
            None => None,
        };

        let producer_tombstone_ttl = Duration::from_secs(parse_var(
            vars,
            "SFU_PRODUCER_TOMBSTONE_TTL_SECONDS",
            DEFAULT_PRODUCER_TOMBSTONE_TTL_SECONDS,
        )?);

        let max_message_size = parse_var(
            vars,
            "SFU_MAX_MESSAGE_SIZE_BYTES",
            DEFAULT_MAX_MESSAGE_SIZE_BYTES,
        )?;

        let log_format = match vars.get("SFU_LOG_FORMAT") {
            Some(raw) => raw.trim().to_ascii_lowercase().parse()?,
            None => LogFormat::default(),
        };

        // Generate instance ID
        let instance_id = vars.get("SFU_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        let config = Config {
            signaling_bind_address,
            health_bind_address,
            instance_id,
            listen_ip,
            announced_address,
            rtc_min_port,
            rtc_max_port,
            enable_udp,
            enable_tcp,
            prefer_udp,
            prefer_tcp,
            engine_call_timeout,
            producer_tombstone_ttl,
            max_message_size,
            log_format,
        };

        check_transport_options(&config.transport_options())
            .map_err(|e| ConfigError::InvalidValue(format!("transport defaults: {e}")))?;

        Ok(config)
    }

    /// Settings handed to the media engine at startup.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            ..EngineConfig::default()
        }
    }

    /// Default network options for new transports.
    #[must_use]
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.listen_ip,
            announced_address: self.announced_address.clone(),
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_udp: self.prefer_udp,
            prefer_tcp: self.prefer_tcp,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.listen_ip.to_string(), DEFAULT_LISTEN_IP);
        assert_eq!(config.announced_address, None);
        assert_eq!(config.rtc_min_port, DEFAULT_RTC_MIN_PORT);
        assert_eq!(config.rtc_max_port, DEFAULT_RTC_MAX_PORT);
        assert!(config.enable_udp);
        assert!(config.enable_tcp);
        assert!(config.prefer_udp);
        assert!(!config.prefer_tcp);
        assert_eq!(config.engine_call_timeout, None);
        assert_eq!(
            config.producer_tombstone_ttl,
            Duration::from_secs(DEFAULT_PRODUCER_TOMBSTONE_TTL_SECONDS)
        );
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        assert_eq!(config.log_format, LogFormat::Text);
        // Instance ID should be auto-generated
        assert!(config.instance_id.starts_with("sfu-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let config = Config::from_vars(&vars(&[
            ("SFU_SIGNALING_BIND_ADDRESS", "127.0.0.1:3001"),
            ("SFU_HEALTH_BIND_ADDRESS", "127.0.0.1:8082"),
            ("SFU_LISTEN_IP", "10.0.0.5"),
            ("SFU_ANNOUNCED_ADDRESS", "203.0.113.7"),
            ("SFU_RTC_MIN_PORT", "40000"),
            ("SFU_RTC_MAX_PORT", "40100"),
            ("SFU_ENABLE_TCP", "false"),
            ("SFU_ENGINE_CALL_TIMEOUT_MS", "2500"),
            ("SFU_PRODUCER_TOMBSTONE_TTL_SECONDS", "5"),
            ("SFU_MAX_MESSAGE_SIZE_BYTES", "1024"),
            ("SFU_INSTANCE_ID", "sfu-custom-001"),
            ("SFU_LOG_FORMAT", "JSON"),
        ]))
        .expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, "127.0.0.1:3001");
        assert_eq!(config.health_bind_address, "127.0.0.1:8082");
        assert_eq!(config.listen_ip.to_string(), "10.0.0.5");
        assert_eq!(config.announced_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(config.rtc_min_port, 40_000);
        assert_eq!(config.rtc_max_port, 40_100);
        assert!(!config.enable_tcp);
        assert_eq!(config.engine_call_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.producer_tombstone_ttl, Duration::from_secs(5));
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.instance_id, "sfu-custom-001");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_engine_config_carries_port_range_and_codecs() {
        let config = Config::from_vars(&vars(&[
            ("SFU_RTC_MIN_PORT", "20000"),
            ("SFU_RTC_MAX_PORT", "20010"),
        ]))
        .unwrap();

        let engine = config.engine_config();
        assert_eq!(engine.rtc_min_port, 20_000);
        assert_eq!(engine.rtc_max_port, 20_010);
        assert_eq!(engine.media_codecs.len(), 2);
    }

    #[test]
    fn test_min_port_above_max_port_is_invalid() {
        let result = Config::from_vars(&vars(&[
            ("SFU_RTC_MIN_PORT", "10200"),
            ("SFU_RTC_MAX_PORT", "10100"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        for (name, value) in [
            ("SFU_RTC_MIN_PORT", "ten"),
            ("SFU_RTC_MAX_PORT", "70000"),
            ("SFU_PRODUCER_TOMBSTONE_TTL_SECONDS", "-1"),
            ("SFU_ENGINE_CALL_TIMEOUT_MS", "0"),
            ("SFU_MAX_MESSAGE_SIZE_BYTES", "lots"),
        ] {
            let result = Config::from_vars(&vars(&[(name, value)]));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue(ref msg)) if msg.contains(name)),
                "{name}={value} should be rejected, got {result:?}"
            );
        }
    }

    #[test]
    fn test_invalid_booleans_and_ip_are_rejected() {
        assert!(Config::from_vars(&vars(&[("SFU_ENABLE_UDP", "maybe")])).is_err());
        assert!(Config::from_vars(&vars(&[("SFU_LISTEN_IP", "not-an-ip")])).is_err());
        assert!(Config::from_vars(&vars(&[("SFU_LOG_FORMAT", "xml")])).is_err());
    }

    #[test]
    fn test_unusable_transport_defaults_are_rejected() {
        let result = Config::from_vars(&vars(&[
            ("SFU_ENABLE_UDP", "false"),
            ("SFU_ENABLE_TCP", "false"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));

        // Default prefers UDP, so disabling UDP alone must also flip the preference.
        let result = Config::from_vars(&vars(&[("SFU_ENABLE_UDP", "false")]));
        assert!(result.is_err());

        let config = Config::from_vars(&vars(&[
            ("SFU_ENABLE_UDP", "false"),
            ("SFU_PREFER_UDP", "false"),
            ("SFU_PREFER_TCP", "true"),
        ]))
        .unwrap();
        assert!(config.transport_options().prefer_tcp);
    }

    #[test]
    fn test_check_transport_options() {
        let ok = WebRtcTransportOptions::default();
        assert!(check_transport_options(&ok).is_ok());

        let both_preferred = WebRtcTransportOptions {
            prefer_tcp: true,
            ..WebRtcTransportOptions::default()
        };
        assert!(check_transport_options(&both_preferred).is_err());
    }

    #[test]
    fn test_debug_lists_effective_settings() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("signaling_bind_address"));
        assert!(debug_output.contains("producer_tombstone_ttl"));
    }
}
