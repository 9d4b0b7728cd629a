//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_core::identity::{KeyType, PeerIdParseError, ED25519_KEY_BITS};
use relay_core::multiaddr::{Multiaddr, MultiaddrError, Protocol};
use relay_core::{KeyGenerationError, PeerId, RelayConfig};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}: invalid value {value:?}")]
    Env { var: &'static str, value: String },
    #[error("listen address {addr:?}: {source}")]
    Listen {
        addr: String,
        source: MultiaddrError,
    },
    #[error("listen address {addr:?}: no UDP transport, use /tcp or /tcp/<port>/ws")]
    UdpListen { addr: String },
    #[error("deny entry {peer:?}: {source}")]
    Deny {
        peer: String,
        source: PeerIdParseError,
    },
    #[error(transparent)]
    Key(#[from] KeyGenerationError),
}

/// Node configuration. File: ~/.config/relay-node/config.toml or /etc/relay-node/config.toml.
/// Env overrides: RELAY_NODE_LISTEN (comma separated), RELAY_NODE_MAX_RESERVATIONS,
/// RELAY_NODE_RESERVATION_TTL_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen multiaddrs (default `/ip4/0.0.0.0/tcp/4003/ws`).
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    #[serde(default = "default_key_type")]
    pub key_type: String,
    #[serde(default = "default_key_bits")]
    pub key_bits: u32,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[relay]` table. Durations are whole seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RelaySection {
    pub max_reservations: usize,
    pub reservation_ttl_secs: u64,
    pub max_circuits: usize,
    pub max_circuits_per_peer: usize,
    pub circuit_bytes: u64,
    pub circuit_duration_secs: u64,
    pub circuit_idle_timeout_secs: u64,
    pub negotiation_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub deny: Vec<String>,
}

impl Default for RelaySection {
    fn default() -> Self {
        let d = RelayConfig::default();
        Self {
            max_reservations: d.max_reservations,
            reservation_ttl_secs: d.reservation_ttl.as_secs(),
            max_circuits: d.max_circuits,
            max_circuits_per_peer: d.max_circuits_per_peer,
            circuit_bytes: d.circuit_bytes,
            circuit_duration_secs: d.circuit_duration.as_secs(),
            circuit_idle_timeout_secs: d.circuit_idle_timeout.as_secs(),
            negotiation_timeout_secs: d.negotiation_timeout.as_secs(),
            sweep_interval_secs: d.sweep_interval.as_secs(),
            deny: Vec::new(),
        }
    }
}

fn default_listen() -> Vec<String> {
    vec!["/ip4/0.0.0.0/tcp/4003/ws".to_string()]
}
fn default_key_type() -> String {
    "ed25519".to_string()
}
fn default_key_bits() -> u32 {
    ED25519_KEY_BITS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            key_type: default_key_type(),
            key_bits: default_key_bits(),
            relay: RelaySection::default(),
        }
    }
}

impl Config {
    /// Parse every listen string. Nothing is bound yet. The node only carries TCP and
    /// WebSocket transports, so `/udp` addresses are refused here.
    pub fn listen_addrs(&self) -> Result<Vec<Multiaddr>, ConfigError> {
        self.listen
            .iter()
            .map(|s| {
                let addr: Multiaddr = s.parse().map_err(|source| ConfigError::Listen {
                    addr: s.clone(),
                    source,
                })?;
                if addr.iter().any(|p| matches!(p, Protocol::Udp(_))) {
                    return Err(ConfigError::UdpListen { addr: s.clone() });
                }
                Ok(addr)
            })
            .collect()
    }

    pub fn key_type(&self) -> Result<KeyType, ConfigError> {
        Ok(self.key_type.parse()?)
    }

    pub fn relay_config(&self) -> Result<RelayConfig, ConfigError> {
        let r = &self.relay;
        let deny = r
            .deny
            .iter()
            .map(|s| {
                s.parse::<PeerId>().map_err(|source| ConfigError::Deny {
                    peer: s.clone(),
                    source,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(RelayConfig {
            max_reservations: r.max_reservations,
            reservation_ttl: Duration::from_secs(r.reservation_ttl_secs),
            max_circuits: r.max_circuits,
            max_circuits_per_peer: r.max_circuits_per_peer,
            circuit_bytes: r.circuit_bytes,
            circuit_duration: Duration::from_secs(r.circuit_duration_secs),
            circuit_idle_timeout: Duration::from_secs(r.circuit_idle_timeout_secs),
            negotiation_timeout: Duration::from_secs(r.negotiation_timeout_secs),
            sweep_interval: Duration::from_secs(r.sweep_interval_secs.max(1)),
            deny,
        })
    }

    /// Apply overrides from `var` (the process environment in production).
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("RELAY_NODE_LISTEN") {
            self.listen = s
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(s) = var("RELAY_NODE_MAX_RESERVATIONS") {
            self.relay.max_reservations = parse_env("RELAY_NODE_MAX_RESERVATIONS", s)?;
        }
        if let Some(s) = var("RELAY_NODE_RESERVATION_TTL_SECS") {
            self.relay.reservation_ttl_secs = parse_env("RELAY_NODE_RESERVATION_TTL_SECS", s)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

/// Load config: default, then the config file (`explicit` or the first standard path
/// that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match path {
        Some(p) => from_path(&p)?,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/relay-node/config.toml"));
    }
    out.push(PathBuf::from("/etc/relay-node/config.toml"));
    out
}

pub fn from_path(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.listen, default_listen());
        assert_eq!(c.key_type().unwrap(), KeyType::Ed25519);
        assert_eq!(c.key_bits, 256);
        let relay = c.relay_config().unwrap();
        assert_eq!(relay.max_reservations, RelayConfig::default().max_reservations);
        assert_eq!(relay.reservation_ttl, RelayConfig::default().reservation_ttl);
    }

    #[test]
    fn relay_table_maps_to_relay_config() {
        let peer = relay_core::Keypair::random().unwrap().peer_id();
        let c: Config = toml::from_str(&format!(
            r#"
            listen = ["/ip4/127.0.0.1/tcp/0/ws", "/ip4/127.0.0.1/tcp/0"]
            [relay]
            max_reservations = 1
            reservation_ttl_secs = 10
            circuit_bytes = 4096
            deny = ["{peer}"]
            "#
        ))
        .unwrap();
        assert_eq!(c.listen_addrs().unwrap().len(), 2);
        let relay = c.relay_config().unwrap();
        assert_eq!(relay.max_reservations, 1);
        assert_eq!(relay.reservation_ttl, Duration::from_secs(10));
        assert_eq!(relay.circuit_bytes, 4096);
        assert_eq!(relay.deny, vec![peer]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn malformed_listen_address_is_reported() {
        let c = Config {
            listen: vec!["/ip4/not-an-ip/tcp/1".to_string()],
            ..Config::default()
        };
        assert!(matches!(c.listen_addrs(), Err(ConfigError::Listen { .. })));
    }

    #[test]
    fn udp_listen_address_is_refused() {
        let c = Config {
            listen: vec![
                "/ip4/127.0.0.1/tcp/4003/ws".to_string(),
                "/ip4/127.0.0.1/udp/4003".to_string(),
            ],
            ..Config::default()
        };
        let err = c.listen_addrs().unwrap_err();
        assert!(matches!(&err, ConfigError::UdpListen { addr } if addr == "/ip4/127.0.0.1/udp/4003"));
        assert!(err.to_string().contains("no UDP transport"));
    }

    #[test]
    fn unsupported_key_type_is_reported() {
        let c = Config {
            key_type: "rsa".to_string(),
            ..Config::default()
        };
        assert!(matches!(c.key_type(), Err(ConfigError::Key(_))));
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("RELAY_NODE_LISTEN", "/ip4/127.0.0.1/tcp/5000, /ip4/127.0.0.1/tcp/5001/ws"),
            ("RELAY_NODE_MAX_RESERVATIONS", "7"),
            ("RELAY_NODE_RESERVATION_TTL_SECS", "30"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.listen.len(), 2);
        assert_eq!(c.listen[1], "/ip4/127.0.0.1/tcp/5001/ws");
        assert_eq!(c.relay.max_reservations, 7);
        assert_eq!(c.relay.reservation_ttl_secs, 30);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut c = Config::default();
        let err = c
            .apply_env(|k| (k == "RELAY_NODE_MAX_RESERVATIONS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn parse_error_names_the_file() {
        let path = std::env::temp_dir().join(format!("relay-node-{}.toml", std::process::id()));
        std::fs::write(&path, "listen = 5").unwrap();
        let err = from_path(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
