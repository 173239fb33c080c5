//! Daemon Configuration
//!
//! Loaded from environment variables (a `.env` file is read by the binary
//! first). Parsing goes through a lookup function so tests never touch the
//! process environment.
//!
//! # Environment Variables
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `EMS_LISTEN_ADDR` | `127.0.0.1:6116` | client WebSocket listener |
//! | `EMS_BROKERD` | (none) | `name=url,...` broker adapters |
//! | `EMS_ACCOUNTS` | (none) | `account=broker,...` routing table |
//! | `EMS_DEFAULT_BROKER` | (none) | broker for unrouted accounts |
//! | `EMS_RECONNECT_MAX_ATTEMPTS` | 1000 | connect attempts per reconnect, 0 = unlimited |
//! | `EMS_RECONNECT_DELAY_MS` | 500 | delay between attempts |
//! | `EMS_CONNECT_TIMEOUT_SECS` | 10 | deadline per connect attempt |
//! | `EMS_RPC_START_ID` | 0 | first JSON-RPC correlation id |
//! | `EMS_RELAY_RESTART_SECS` | 5 | pause before reopening a lost broker session |
//! | `EMS_METRICS_PORT` | (disabled) | Prometheus listener port |
//! | `EMS_CLIENT_NAME` | `emsd` | name announced to broker adapters |

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use duplex_transport::{ChannelConfig, ReconnectConfig, RpcConfig};

use crate::application::Routes;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:6116";
const DEFAULT_MAX_ATTEMPTS: u32 = 1000;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 500;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RELAY_RESTART_SECS: u64 = 5;
const DEFAULT_CLIENT_NAME: &str = "emsd";

/// One broker adapter endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerdEndpoint {
    /// Broker name used in routes and logs.
    pub name: String,
    /// Adapter URL (`ws://` or `wss://`).
    pub url: String,
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EmsConfig {
    /// Client WebSocket listener.
    pub listen_addr: SocketAddr,
    /// Broker adapters, in configuration order.
    pub brokerds: Vec<BrokerdEndpoint>,
    /// Account to broker routing table.
    pub accounts: BTreeMap<String, String>,
    /// Broker for accounts missing from `accounts`.
    pub default_broker: Option<String>,
    /// Reconnect budget for every broker session.
    pub reconnect: ReconnectConfig,
    /// Deadline for one connect attempt.
    pub connect_timeout: Duration,
    /// JSON-RPC session parameters.
    pub rpc: RpcConfig,
    /// Pause before reopening a lost broker session.
    pub relay_restart: Duration,
    /// Prometheus listener port, if metrics are exported.
    pub metrics_port: Option<u16>,
    /// Name announced to broker adapters.
    pub client_name: String,
}

impl EmsConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for malformed values or routes naming an
    /// unconfigured broker.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from `lookup`.
    ///
    /// # Errors
    ///
    /// See [`EmsConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let listen_addr = parse_or(
            "EMS_LISTEN_ADDR",
            get("EMS_LISTEN_ADDR").as_deref(),
            DEFAULT_LISTEN_ADDR,
        )?;

        let brokerds = get("EMS_BROKERD")
            .map(|raw| parse_brokerds(&raw))
            .transpose()?
            .unwrap_or_default();
        let known = |name: &str| brokerds.iter().any(|b| b.name == name);

        let mut accounts = BTreeMap::new();
        if let Some(raw) = get("EMS_ACCOUNTS") {
            for (account, broker) in parse_pairs("EMS_ACCOUNTS", &raw)? {
                if !known(&broker) {
                    return Err(ConfigError::UnknownBroker {
                        key: "EMS_ACCOUNTS",
                        broker,
                    });
                }
                accounts.insert(account, broker);
            }
        }

        let default_broker = get("EMS_DEFAULT_BROKER").map(|b| b.trim().to_string());
        if let Some(broker) = &default_broker
            && !known(broker)
        {
            return Err(ConfigError::UnknownBroker {
                key: "EMS_DEFAULT_BROKER",
                broker: broker.clone(),
            });
        }

        let max_attempts = parse_or_default(
            "EMS_RECONNECT_MAX_ATTEMPTS",
            get("EMS_RECONNECT_MAX_ATTEMPTS").as_deref(),
            DEFAULT_MAX_ATTEMPTS,
        )?;
        let delay_ms = parse_or_default(
            "EMS_RECONNECT_DELAY_MS",
            get("EMS_RECONNECT_DELAY_MS").as_deref(),
            DEFAULT_RECONNECT_DELAY_MS,
        )?;
        let timeout_secs = parse_or_default(
            "EMS_CONNECT_TIMEOUT_SECS",
            get("EMS_CONNECT_TIMEOUT_SECS").as_deref(),
            DEFAULT_CONNECT_TIMEOUT_SECS,
        )?;
        let start_id = parse_or_default("EMS_RPC_START_ID", get("EMS_RPC_START_ID").as_deref(), 0)?;
        let restart_secs = parse_or_default(
            "EMS_RELAY_RESTART_SECS",
            get("EMS_RELAY_RESTART_SECS").as_deref(),
            DEFAULT_RELAY_RESTART_SECS,
        )?;
        let metrics_port = get("EMS_METRICS_PORT")
            .map(|v| parse_value("EMS_METRICS_PORT", &v))
            .transpose()?;
        let client_name = get("EMS_CLIENT_NAME").unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string());

        Ok(Self {
            listen_addr,
            brokerds,
            accounts,
            default_broker,
            reconnect: ReconnectConfig::fixed(Duration::from_millis(delay_ms), max_attempts),
            connect_timeout: Duration::from_secs(timeout_secs),
            rpc: RpcConfig { start_id },
            relay_restart: Duration::from_secs(restart_secs),
            metrics_port,
            client_name,
        })
    }

    /// Routing table for the engine.
    #[must_use]
    pub fn routes(&self) -> Routes {
        let mut routes = Routes::new(self.brokerds.iter().map(|b| b.name.clone()));
        for (account, broker) in &self.accounts {
            routes = routes.with_account(account.clone(), broker.clone());
        }
        match &self.default_broker {
            Some(broker) => routes.with_default(broker.clone()),
            None => routes,
        }
    }

    /// Accounts routed to `broker`, announced when its session opens.
    #[must_use]
    pub fn accounts_for(&self, broker: &str) -> Vec<String> {
        self.accounts
            .iter()
            .filter(|(_, b)| b.as_str() == broker)
            .map(|(a, _)| a.clone())
            .collect()
    }

    /// Channel parameters for one adapter.
    #[must_use]
    pub fn channel_config(&self, endpoint: &BrokerdEndpoint) -> ChannelConfig {
        ChannelConfig::new(endpoint.url.clone())
            .with_reconnect(self.reconnect.clone())
            .with_connect_timeout(self.connect_timeout)
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: &'static str,
        /// Raw value.
        value: String,
        /// Parse failure.
        reason: String,
    },
    /// A route names a broker missing from `EMS_BROKERD`.
    #[error("{key} routes to unknown broker {broker}")]
    UnknownBroker {
        /// Variable name.
        key: &'static str,
        /// Broker name.
        broker: String,
    },
    /// The same broker name appears twice in `EMS_BROKERD`.
    #[error("broker {0} is configured more than once")]
    DuplicateBroker(String),
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T>(key: &'static str, raw: Option<&str>, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_value(key, raw.unwrap_or(default))
}

fn parse_or_default<T>(key: &'static str, raw: Option<&str>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map_or(Ok(default), |v| parse_value(key, v))
}

/// Split `a=b,c=d`, skipping empty entries.
fn parse_pairs(key: &'static str, raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = |reason: &str| ConfigError::Invalid {
                key,
                value: entry.to_string(),
                reason: reason.to_string(),
            };
            let (left, right) = entry.split_once('=').ok_or_else(|| invalid("expected name=value"))?;
            let (left, right) = (left.trim(), right.trim());
            if left.is_empty() || right.is_empty() {
                return Err(invalid("both sides of '=' must be set"));
            }
            Ok((left.to_string(), right.to_string()))
        })
        .collect()
}

fn parse_brokerds(raw: &str) -> Result<Vec<BrokerdEndpoint>, ConfigError> {
    let mut endpoints: Vec<BrokerdEndpoint> = Vec::new();
    for (name, url) in parse_pairs("EMS_BROKERD", raw)? {
        if endpoints.iter().any(|e| e.name == name) {
            return Err(ConfigError::DuplicateBroker(name));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                key: "EMS_BROKERD",
                value: url,
                reason: "expected a ws:// or wss:// url".to_string(),
            });
        }
        endpoints.push(BrokerdEndpoint { name, url });
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<EmsConfig, ConfigError> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        EmsConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_to_an_empty_environment() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:6116");
        assert!(config.brokerds.is_empty());
        assert_eq!(config.reconnect.max_attempts, 1000);
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(500));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.rpc.start_id, 0);
        assert_eq!(config.relay_restart, Duration::from_secs(5));
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.client_name, "emsd");
    }

    #[test]
    fn brokers_and_accounts_build_routes() {
        let config = config(&[
            ("EMS_BROKERD", "kraken=ws://127.0.0.1:7001, ib=wss://ib.local/rpc"),
            ("EMS_ACCOUNTS", "acct1=kraken,acct2=ib,acct3=kraken"),
            ("EMS_DEFAULT_BROKER", "ib"),
            ("EMS_METRICS_PORT", "9464"),
        ])
        .unwrap();

        assert_eq!(config.brokerds.len(), 2);
        assert_eq!(config.brokerds[1].url, "wss://ib.local/rpc");
        assert_eq!(config.accounts_for("kraken"), vec!["acct1", "acct3"]);
        assert_eq!(config.default_broker.as_deref(), Some("ib"));
        assert_eq!(config.metrics_port, Some(9464));
        let routes = config.routes();
        assert_eq!(routes.brokers().collect::<Vec<_>>(), vec!["ib", "kraken"]);
    }

    #[test]
    fn unknown_account_broker_is_refused() {
        let err = config(&[
            ("EMS_BROKERD", "kraken=ws://127.0.0.1:7001"),
            ("EMS_ACCOUNTS", "acct1=ib"),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownBroker {
                key: "EMS_ACCOUNTS",
                broker: "ib".into()
            }
        );
    }

    #[test]
    fn unknown_default_broker_is_refused() {
        let err = config(&[("EMS_DEFAULT_BROKER", "kraken")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBroker { key: "EMS_DEFAULT_BROKER", .. }));
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = config(&[("EMS_RECONNECT_MAX_ATTEMPTS", "lots")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "EMS_RECONNECT_MAX_ATTEMPTS",
                ..
            }
        ));
        assert!(config(&[("EMS_LISTEN_ADDR", "localhost")]).is_err());
    }

    #[test]
    fn broker_entries_need_a_websocket_url() {
        assert!(config(&[("EMS_BROKERD", "kraken")]).is_err());
        assert!(config(&[("EMS_BROKERD", "kraken=http://x")]).is_err());
        assert_eq!(
            config(&[("EMS_BROKERD", "a=ws://x,a=ws://y")]).unwrap_err(),
            ConfigError::DuplicateBroker("a".into())
        );
    }

    #[test]
    fn channel_config_carries_reconnect_budget() {
        let config = config(&[
            ("EMS_BROKERD", "kraken=ws://127.0.0.1:7001"),
            ("EMS_RECONNECT_MAX_ATTEMPTS", "3"),
            ("EMS_RECONNECT_DELAY_MS", "20"),
            ("EMS_CONNECT_TIMEOUT_SECS", "2"),
        ])
        .unwrap();
        let channel = config.channel_config(&config.brokerds[0]);
        assert_eq!(channel.url, "ws://127.0.0.1:7001");
        assert_eq!(channel.reconnect, ReconnectConfig::fixed(Duration::from_millis(20), 3));
        assert_eq!(channel.connect_timeout, Duration::from_secs(2));
    }
}
