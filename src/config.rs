use crate::prelude::*;

use crate::envertech::client::DEFAULT_PORT;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Vec::new")]
    pub inverters: Vec<Inverter>,

    #[serde(default)]
    pub discovery: Discovery,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .with_context(|| format!("reading config file {}", file))?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn loglevel(&self) -> String {
        self.loglevel.clone()
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn enabled_inverters(&self) -> impl Iterator<Item = &Inverter> {
        self.inverters.iter().filter(|i| i.enabled())
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_port() -> u16 {
        DEFAULT_PORT
    }
}

// Inverter {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_port")]
    pub port: u16,
    pub serial: Serial,

    pub poll_interval: Option<u64>,
    pub receive_timeout: Option<u64>,
}

impl Inverter {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.unwrap_or(5))
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout.unwrap_or(10))
    }
} // }}}

// Discovery {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Discovery {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    /// Local IPv4 addresses to bind the broadcast probes from. Enumerating
    /// interfaces is left to whoever writes this list; binding through
    /// 0.0.0.0 is the default.
    #[serde(default = "Discovery::default_bind_addresses")]
    pub bind_addresses: Vec<Ipv4Addr>,

    #[serde(default = "Discovery::default_timeout")]
    pub timeout: u64,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addresses: Self::default_bind_addresses(),
            timeout: Self::default_timeout(),
        }
    }
}

impl Discovery {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn bind_addresses(&self) -> &[Ipv4Addr] {
        &self.bind_addresses
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn default_bind_addresses() -> Vec<Ipv4Addr> {
        vec![Ipv4Addr::UNSPECIFIED]
    }

    fn default_timeout() -> u64 {
        3
    }
} // }}}
