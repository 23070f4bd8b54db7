//! On-disk representation of the daemon config. Every field is optional in
//! the file; defaults are filled in here and validated when the wire form is
//! decoded into [`crate::Config`].

use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 1081;
pub const DEFAULT_PROBES: u32 = 3;
/// Seconds between scheduled probe runs when a topic does not say otherwise.
pub const DEFAULT_INTERVAL_SECS: u64 = 120;
/// Seconds between notification buffer flushes.
pub const DEFAULT_UPDATES_INTERVAL_SECS: u64 = 30;
/// Seconds between catalog snapshots.
pub const DEFAULT_SAVE_INTERVAL_SECS: u64 = 180;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listen: Listen,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub pinger: Pinger,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Listen {
    #[serde(default = "default_listen_ip")]
    pub ip: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for Listen {
    fn default() -> Self {
        Self {
            ip: default_listen_ip(),
            port: DEFAULT_LISTEN_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Log {
    /// Log file path; empty logs to stderr only.
    #[serde(default)]
    pub path: String,
    /// Lower the default log filter to `debug`.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Pinger {
    /// URL template for asynchronous ping results (`{host}`, `{alive}`,
    /// `{ns}`, `{ms}` are substituted).
    #[serde(rename = "result-url", default)]
    pub result_url: String,
    #[serde(rename = "default-probes", default = "default_probes")]
    pub default_probes: u32,
    #[serde(rename = "default-interval", default = "default_interval")]
    pub default_interval: u64,
    #[serde(rename = "updates-interval", default = "default_updates_interval")]
    pub updates_interval: u64,
    #[serde(rename = "save-interval", default = "default_save_interval")]
    pub save_interval: u64,
    /// Snapshot file for the topic catalog; empty disables persistence.
    #[serde(rename = "save-path", default)]
    pub save_path: String,
}

impl Default for Pinger {
    fn default() -> Self {
        Self {
            result_url: String::new(),
            default_probes: DEFAULT_PROBES,
            default_interval: DEFAULT_INTERVAL_SECS,
            updates_interval: DEFAULT_UPDATES_INTERVAL_SECS,
            save_interval: DEFAULT_SAVE_INTERVAL_SECS,
            save_path: String::new(),
        }
    }
}

fn default_listen_ip() -> String {
    DEFAULT_LISTEN_IP.to_owned()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_probes() -> u32 {
    DEFAULT_PROBES
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_updates_interval() -> u64 {
    DEFAULT_UPDATES_INTERVAL_SECS
}

fn default_save_interval() -> u64 {
    DEFAULT_SAVE_INTERVAL_SECS
}
