//! Environment-driven configuration structures shared by all binaries.

use std::{env, str::FromStr, time::Duration};

use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::model::ProgramId;

/// Ledger network the relay follows. Each profile carries a default RPC
/// endpoint that `LEDGER_RPC_URL` can override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum NetworkProfile {
    Mainnet,
    Testnet,
    #[default]
    Privnet,
}

impl NetworkProfile {
    pub fn default_rpc_url(self) -> &'static str {
        match self {
            NetworkProfile::Mainnet => "http://seed1.neo.org:10332",
            NetworkProfile::Testnet => "http://seed1.neo.org:20332",
            NetworkProfile::Privnet => "http://127.0.0.1:30333",
        }
    }
}

/// Ledger-side settings: where the chain is read from and how fast it is
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    database_url: String,
    network: NetworkProfile,
    rpc_url: String,
    start_height: u64,
    persist_interval: Duration,
    max_blocks_per_tick: u64,
}

impl LedgerConfig {
    pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_MAX_BLOCKS_PER_TICK: u64 = 20;

    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let network = match get_optional_var("LEDGER_NETWORK") {
            Some(raw) => {
                NetworkProfile::from_str(&raw).map_err(|_| ConfigError::InvalidValue {
                    key: "LEDGER_NETWORK",
                    reason: format!("unknown network profile `{raw}`"),
                })?
            }
            None => NetworkProfile::default(),
        };
        let rpc_url = get_optional_var("LEDGER_RPC_URL")
            .unwrap_or_else(|| network.default_rpc_url().to_string());

        Ok(Self {
            database_url: get_required_var("DATABASE_URL")?,
            network,
            rpc_url,
            start_height: get_optional_number("LEDGER_START_HEIGHT")?.unwrap_or(0),
            persist_interval: get_optional_number("LEDGER_PERSIST_INTERVAL_MS")?
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(Self::DEFAULT_PERSIST_INTERVAL),
            max_blocks_per_tick: get_optional_number("LEDGER_MAX_BLOCKS_PER_TICK")?
                .filter(|n| *n > 0)
                .unwrap_or(Self::DEFAULT_MAX_BLOCKS_PER_TICK),
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn network(&self) -> NetworkProfile {
        self.network
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn start_height(&self) -> u64 {
        self.start_height
    }

    pub fn persist_interval(&self) -> Duration {
        self.persist_interval
    }

    pub fn max_blocks_per_tick(&self) -> u64 {
        self.max_blocks_per_tick
    }
}

/// Relay-side settings: which program to watch and how subscribers are
/// served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    program_id: ProgramId,
    ws_host: String,
    ws_port: u16,
    heartbeat_interval: Option<Duration>,
    send_timeout: Duration,
    dispatch_workers: usize,
    dispatch_queue: usize,
}

impl RelayConfig {
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);
    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_DISPATCH_QUEUE: usize = 1024;

    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let raw_program = get_required_var("RELAY_PROGRAM_ID")?;
        let program_id =
            ProgramId::parse(&raw_program).map_err(|err| ConfigError::InvalidValue {
                key: "RELAY_PROGRAM_ID",
                reason: err.to_string(),
            })?;
        let ws_port = parse_number("RELAY_WS_PORT", &get_required_var("RELAY_WS_PORT")?)?;

        let heartbeat_interval = match get_optional_number::<u64>("RELAY_HEARTBEAT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Self::DEFAULT_HEARTBEAT),
        };

        Ok(Self {
            program_id,
            ws_host: get_optional_var("RELAY_WS_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            ws_port,
            heartbeat_interval,
            send_timeout: get_optional_number("RELAY_SEND_TIMEOUT_MS")?
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(Self::DEFAULT_SEND_TIMEOUT),
            dispatch_workers: get_optional_number("RELAY_DISPATCH_WORKERS")?
                .filter(|n| *n > 0)
                .unwrap_or(1),
            dispatch_queue: get_optional_number("RELAY_DISPATCH_QUEUE")?
                .filter(|n| *n > 0)
                .unwrap_or(Self::DEFAULT_DISPATCH_QUEUE),
        })
    }

    /// Builds a config in code, mostly for embedding and tests. Optional knobs
    /// start at their defaults.
    pub fn new(program_id: ProgramId, ws_host: impl Into<String>, ws_port: u16) -> Self {
        Self {
            program_id,
            ws_host: ws_host.into(),
            ws_port,
            heartbeat_interval: Some(Self::DEFAULT_HEARTBEAT),
            send_timeout: Self::DEFAULT_SEND_TIMEOUT,
            dispatch_workers: 1,
            dispatch_queue: Self::DEFAULT_DISPATCH_QUEUE,
        }
    }

    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_dispatch(mut self, workers: usize, queue: usize) -> Self {
        self.dispatch_workers = workers.max(1);
        self.dispatch_queue = queue.max(1);
        self
    }

    pub fn program_id(&self) -> &ProgramId {
        &self.program_id
    }

    pub fn ws_bind_address(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub fn dispatch_workers(&self) -> usize {
        self.dispatch_workers
    }

    pub fn dispatch_queue(&self) -> usize {
        self.dispatch_queue
    }
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    get_optional_var(key).ok_or(ConfigError::MissingVar { key })
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn get_optional_number<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    get_optional_var(key)
        .map(|raw| parse_number(key, &raw))
        .transpose()
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    raw.parse()
        .map_err(|source| ConfigError::InvalidNumber { key, source })
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("NOTIFY_RELAY_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("invalid value in `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_GUARD: Mutex<()> = Mutex::new(());

    const OPTIONAL_KEYS: &[&str] = &[
        "LEDGER_NETWORK",
        "LEDGER_RPC_URL",
        "LEDGER_START_HEIGHT",
        "LEDGER_PERSIST_INTERVAL_MS",
        "LEDGER_MAX_BLOCKS_PER_TICK",
        "RELAY_WS_HOST",
        "RELAY_HEARTBEAT_SECS",
        "RELAY_SEND_TIMEOUT_MS",
        "RELAY_DISPATCH_WORKERS",
        "RELAY_DISPATCH_QUEUE",
    ];

    fn set_env() {
        std::env::set_var("NOTIFY_RELAY_SKIP_DOTENV", "1");
        std::env::set_var("DATABASE_URL", "sqlite://relay.db");
        std::env::set_var("RELAY_PROGRAM_ID", "cfdff42a0fa99aeee31e2af5e140e0f9040b5d46");
        std::env::set_var("RELAY_WS_PORT", "8765");
        for key in OPTIONAL_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn ledger_config_uses_privnet_defaults() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();

        let config = LedgerConfig::load_from_env().expect("ledger config loads");
        assert_eq!(config.database_url(), "sqlite://relay.db");
        assert_eq!(config.network(), NetworkProfile::Privnet);
        assert_eq!(config.rpc_url(), "http://127.0.0.1:30333");
        assert_eq!(config.start_height(), 0);
        assert_eq!(config.persist_interval(), Duration::from_millis(100));
        assert_eq!(config.max_blocks_per_tick(), 20);
    }

    #[test]
    fn ledger_config_reads_profile_and_overrides() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("LEDGER_NETWORK", "TestNet");
        std::env::set_var("LEDGER_PERSIST_INTERVAL_MS", " 250 ");
        std::env::set_var("LEDGER_START_HEIGHT", "42");

        let config = LedgerConfig::load_from_env().expect("ledger config loads");
        assert_eq!(config.network(), NetworkProfile::Testnet);
        assert_eq!(config.rpc_url(), "http://seed1.neo.org:20332");
        assert_eq!(config.persist_interval(), Duration::from_millis(250));
        assert_eq!(config.start_height(), 42);

        std::env::set_var("LEDGER_RPC_URL", "http://node:10332");
        let config = LedgerConfig::load_from_env().expect("ledger config loads");
        assert_eq!(config.rpc_url(), "http://node:10332");

        set_env();
    }

    #[test]
    fn unknown_network_is_rejected() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("LEDGER_NETWORK", "devnet");

        let err = LedgerConfig::load_from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "LEDGER_NETWORK",
                ..
            }
        ));

        set_env();
    }

    #[test]
    fn relay_config_reads_env() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("RELAY_HEARTBEAT_SECS", "0");
        std::env::set_var("RELAY_DISPATCH_WORKERS", "4");

        let config = RelayConfig::load_from_env().expect("relay config loads");
        assert_eq!(
            config.program_id().to_string(),
            "0xcfdff42a0fa99aeee31e2af5e140e0f9040b5d46"
        );
        assert_eq!(config.ws_bind_address(), "127.0.0.1:8765");
        assert_eq!(config.heartbeat_interval(), None);
        assert_eq!(config.send_timeout(), Duration::from_secs(5));
        assert_eq!(config.dispatch_workers(), 4);
        assert_eq!(config.dispatch_queue(), 1024);

        set_env();
    }

    #[test]
    fn empty_required_env_var_is_treated_as_missing() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("RELAY_WS_PORT", "   ");

        let err = RelayConfig::load_from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingVar {
                key: "RELAY_WS_PORT"
            }
        ));

        set_env();
    }

    #[test]
    fn malformed_port_and_program_are_reported() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("RELAY_WS_PORT", "70000");
        assert!(matches!(
            RelayConfig::load_from_env().unwrap_err(),
            ConfigError::InvalidNumber {
                key: "RELAY_WS_PORT",
                ..
            }
        ));

        set_env();
        std::env::set_var("RELAY_PROGRAM_ID", "not-a-hash");
        assert!(matches!(
            RelayConfig::load_from_env().unwrap_err(),
            ConfigError::InvalidValue {
                key: "RELAY_PROGRAM_ID",
                ..
            }
        ));

        set_env();
    }
}
