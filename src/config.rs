// concentrator/src/config.rs

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::engine::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_JUNCTION_PORT, DEFAULT_LISTEN_PORT,
    DEFAULT_PUMP_DEADLINE_SECS,
};

/// Runtime configuration. The two host lists keep the key spelling used by
/// the conf file; requests that pin their own backend never consult them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "Load Balancer")]
    pub load_balancer: String,

    #[serde(rename = "Service Junction")]
    pub service_junction: String,

    pub listen_port: u16,

    /// Backend port used when a request does not pin a `Server`.
    pub junction_port: u16,

    pub pump_deadline_secs: u64,

    pub connect_timeout_secs: u64,

    /// Fixed seed for the backend pick; unset in production.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            load_balancer: String::new(),
            service_junction: String::new(),
            listen_port: DEFAULT_LISTEN_PORT,
            junction_port: DEFAULT_JUNCTION_PORT,
            pump_deadline_secs: DEFAULT_PUMP_DEADLINE_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            rng_seed: None,
        }
    }
}

impl Config {
    /// Load from `<conf_dir>/concentrator.conf` (a flat JSON object), then
    /// apply environment overrides. A missing conf dir yields the defaults.
    pub fn load(conf_dir: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match conf_dir {
            Some(dir) => {
                let path = dir.join("concentrator.conf");
                if path.exists() {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("failed to parse {}", path.display()))?
                } else {
                    Self::default()
                }
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(value) = env_nonempty("CONCENTRATOR_LOAD_BALANCER") {
            self.load_balancer = value;
        }
        if let Some(value) = env_nonempty("CONCENTRATOR_SERVICE_JUNCTION") {
            self.service_junction = value;
        }
        if let Some(value) = env_nonempty("CONCENTRATOR_PORT") {
            self.listen_port = value
                .parse::<u16>()
                .context("CONCENTRATOR_PORT must be a TCP port")?;
        }
        Ok(())
    }

    pub fn pump_deadline(&self) -> Duration {
        Duration::from_secs(self.pump_deadline_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}
