use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use runway_id::EnvId;

use crate::db::DbConfig;
use crate::lock::LockConfig;
use crate::machines::{MachineConfig, MachinePreset};
use crate::payload::DEFAULT_INLINE_THRESHOLD;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub lock: LockConfig,
    pub machines: MachineConfig,
    /// Master queue that API triggers are attached to.
    pub master_queue: String,
    pub inline_threshold: usize,
    pub datetime_poll_interval: Duration,
    pub datetime_batch_size: usize,
    /// `(api_key, env_id)` pairs for the static authenticator.
    pub api_keys: Vec<(String, EnvId)>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("RUNWAY_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:3030".to_string())
            .parse()
            .context("RUNWAY_LISTEN_ADDR")?;

        let log_level = var("RUNWAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = var("RUNWAY_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let defaults = LockConfig::default();
        let lock = LockConfig {
            lease_duration: millis(&var, "RUNWAY_LOCK_LEASE_MS")?
                .unwrap_or(defaults.lease_duration),
            acquire_timeout: millis(&var, "RUNWAY_LOCK_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or(defaults.acquire_timeout),
            retry_interval: millis(&var, "RUNWAY_LOCK_RETRY_MS")?
                .unwrap_or(defaults.retry_interval),
        };

        let mut machines = match var("RUNWAY_MACHINES") {
            Some(raw) => parse_machines(&raw)?,
            None => MachineConfig::default(),
        };
        if let Some(default_machine) = var("RUNWAY_DEFAULT_MACHINE") {
            machines.default_machine = default_machine;
        }

        let master_queue = var("RUNWAY_MASTER_QUEUE").unwrap_or_else(|| "main".to_string());

        let inline_threshold = match var("RUNWAY_INLINE_THRESHOLD_BYTES") {
            Some(raw) => raw.parse().context("RUNWAY_INLINE_THRESHOLD_BYTES")?,
            None => DEFAULT_INLINE_THRESHOLD,
        };

        let datetime_poll_interval =
            millis(&var, "RUNWAY_DATETIME_POLL_MS")?.unwrap_or(Duration::from_secs(1));

        let datetime_batch_size = match var("RUNWAY_DATETIME_BATCH_SIZE") {
            Some(raw) => raw.parse().context("RUNWAY_DATETIME_BATCH_SIZE")?,
            None => 100,
        };

        let api_keys = match var("RUNWAY_API_KEYS") {
            Some(raw) => parse_api_keys(&raw)?,
            None => Vec::new(),
        };

        let db_defaults = DbConfig::default();
        let database = DbConfig {
            database_url: var("RUNWAY_DATABASE_URL")
                .or_else(|| var("DATABASE_URL"))
                .filter(|url| !url.trim().is_empty()),
            max_connections: match var("RUNWAY_DB_MAX_CONNECTIONS") {
                Some(raw) => raw.parse().context("RUNWAY_DB_MAX_CONNECTIONS")?,
                None => db_defaults.max_connections,
            },
            ..db_defaults
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            lock,
            machines,
            master_queue,
            inline_threshold,
            datetime_poll_interval,
            datetime_batch_size,
            api_keys,
        })
    }
}

fn millis(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    var(key)
        .map(|raw| {
            raw.parse::<u64>()
                .map(Duration::from_millis)
                .with_context(|| format!("{key} must be a number of milliseconds"))
        })
        .transpose()
}

/// Parses `key=env_id,key=env_id`. Env ids may be friendly or internal.
fn parse_api_keys(raw: &str) -> Result<Vec<(String, EnvId)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, env) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("RUNWAY_API_KEYS entry is not key=env_id"))?;
            let env = env.trim();
            let env_id = env
                .parse::<EnvId>()
                .or_else(|_| EnvId::from_internal(env))
                .with_context(|| format!("RUNWAY_API_KEYS has an invalid env id '{env}'"))?;
            Ok((key.trim().to_string(), env_id))
        })
        .collect()
}

/// Parses a JSON array of presets, replacing the built-in table.
fn parse_machines(raw: &str) -> Result<MachineConfig> {
    let presets: Vec<MachinePreset> =
        serde_json::from_str(raw).context("RUNWAY_MACHINES must be a JSON array of presets")?;
    let defaults = MachineConfig::default();
    let default_machine = if presets.iter().any(|p| p.name == defaults.default_machine) {
        defaults.default_machine
    } else {
        presets
            .first()
            .map(|p| p.name.clone())
            .ok_or_else(|| anyhow!("RUNWAY_MACHINES is empty"))?
    };

    Ok(MachineConfig {
        default_machine,
        machines: presets.into_iter().map(|p| (p.name.clone(), p)).collect(),
        base_cost_in_cents: defaults.base_cost_in_cents,
    })
}
