//! Environment-driven configuration.
//!
//! Every component has its own `from_env()`; this module holds the shared
//! parsing helpers and the server-level settings.

use std::str::FromStr;

/// Read an env var, trimmed, treating empty values as unset
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Parse an env var, falling back to `default` when unset or unparseable
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
                default
            }
        },
        None => default,
    }
}

/// Boolean flag: "0" and "false" disable, anything else enables
pub fn env_flag(key: &str, default: bool) -> bool {
    env_string(key)
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(default)
}

/// Which `PairingChannel` implementation the binary wires up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// In-process channel that pairs automatically; for local development
    Simulated,
    /// HTTP messaging gateway sidecar
    Gateway { base_url: String, session: String },
}

/// Settings of the hosting binary
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub transport: TransportKind,
    /// Directory for the paired account's credential blob
    pub credentials_dir: String,
    /// Start pairing as soon as the process starts
    pub auto_connect: bool,
    /// Delay used when a broadcast request does not specify one
    pub default_delay_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            transport: TransportKind::Simulated,
            credentials_dir: ".zapcast_auth".to_string(),
            auto_connect: true,
            default_delay_seconds: 5,
        }
    }
}

impl ServerConfig {
    /// Load server settings from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let transport = match env_string("TRANSPORT").as_deref() {
            Some("gateway") => match env_string("GATEWAY_URL") {
                Some(base_url) => TransportKind::Gateway {
                    base_url: base_url.trim_end_matches('/').to_string(),
                    session: env_string("GATEWAY_SESSION").unwrap_or_else(|| "default".into()),
                },
                None => {
                    tracing::warn!("TRANSPORT=gateway requires GATEWAY_URL, using simulated");
                    TransportKind::Simulated
                }
            },
            Some("simulated") | None => TransportKind::Simulated,
            Some(other) => {
                tracing::warn!("Unknown TRANSPORT {:?}, using simulated", other);
                TransportKind::Simulated
            }
        };

        Self {
            port: env_parse("PORT", defaults.port),
            transport,
            credentials_dir: env_string("CREDENTIALS_DIR").unwrap_or(defaults.credentials_dir),
            auto_connect: env_flag("AUTO_CONNECT", defaults.auto_connect),
            default_delay_seconds: env_parse(
                "BROADCAST_DEFAULT_DELAY_SECONDS",
                defaults.default_delay_seconds,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for key in [
            "PORT",
            "TRANSPORT",
            "GATEWAY_URL",
            "GATEWAY_SESSION",
            "CREDENTIALS_DIR",
            "AUTO_CONNECT",
            "BROADCAST_DEFAULT_DELAY_SECONDS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear();
        let config = ServerConfig::from_env();
        assert_eq!(config.port, 3000);
        assert_eq!(config.transport, TransportKind::Simulated);
        assert!(config.auto_connect);
        assert_eq!(config.default_delay_seconds, 5);
    }

    #[test]
    #[serial]
    fn test_gateway_transport_from_env() {
        clear();
        std::env::set_var("TRANSPORT", "gateway");
        std::env::set_var("GATEWAY_URL", "http://localhost:8080/");
        std::env::set_var("PORT", "not-a-port");
        std::env::set_var("AUTO_CONNECT", "false");

        let config = ServerConfig::from_env();
        assert_eq!(
            config.transport,
            TransportKind::Gateway {
                base_url: "http://localhost:8080".to_string(),
                session: "default".to_string(),
            }
        );
        assert_eq!(config.port, 3000);
        assert!(!config.auto_connect);
        clear();
    }

    #[test]
    #[serial]
    fn test_gateway_without_url_falls_back() {
        clear();
        std::env::set_var("TRANSPORT", "gateway");
        assert_eq!(ServerConfig::from_env().transport, TransportKind::Simulated);
        clear();
    }
}
