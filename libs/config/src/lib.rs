//! pinger daemon config
//!
//! Loads the TOML config file into [`wire`] structs (every key optional,
//! defaults applied by serde) and decodes them into the validated [`Config`]
//! the rest of the daemon consumes.

pub mod wire;

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// Validated daemon config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    listen: SocketAddr,
    log_path: Option<PathBuf>,
    log_debug: bool,
    result_url: Option<String>,
    default_probes: u32,
    default_interval_secs: u64,
    updates_interval: Duration,
    save_interval: Duration,
    save_path: Option<PathBuf>,
}

impl Config {
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = Self::parse_str(
            &std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config at {}", path.display()))?,
        )?;
        debug!(?config);
        Ok(config)
    }

    pub fn parse_str(s: &str) -> Result<Self> {
        let wire: wire::Config = toml::from_str(s).context("failed to decode config")?;
        wire.try_into()
    }

    /// Address the HTTP control plane binds to.
    pub fn listen(&self) -> SocketAddr {
        self.listen
    }

    /// Log file, if logs should go to a file in addition to stderr.
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Whether `log.debug` lowers the default filter to `debug`.
    pub fn log_debug(&self) -> bool {
        self.log_debug
    }

    /// URL template for `/ping-api` results, if configured.
    pub fn result_url(&self) -> Option<&str> {
        self.result_url.as_deref()
    }

    /// Probe count hosts inherit when neither host nor topic sets one.
    pub fn default_probes(&self) -> u32 {
        self.default_probes
    }

    /// Probe interval (seconds) hosts inherit when neither host nor topic
    /// sets one.
    pub fn default_interval_secs(&self) -> u64 {
        self.default_interval_secs
    }

    /// Period of the notification buffer flush.
    pub fn updates_interval(&self) -> Duration {
        self.updates_interval
    }

    /// Period of the catalog snapshot.
    pub fn save_interval(&self) -> Duration {
        self.save_interval
    }

    /// Snapshot file for the topic catalog; `None` disables persistence.
    pub fn save_path(&self) -> Option<&Path> {
        self.save_path.as_deref()
    }
}

impl TryFrom<wire::Config> for Config {
    type Error = anyhow::Error;

    fn try_from(wire: wire::Config) -> Result<Self> {
        let ip: IpAddr = wire
            .listen
            .ip
            .parse()
            .with_context(|| format!("listen.ip '{}' is not an IP address", wire.listen.ip))?;

        if wire.pinger.default_probes < 1 {
            bail!("pinger.default-probes must be at least 1");
        }
        if wire.pinger.default_interval < 30 {
            bail!("pinger.default-interval must be at least 30 seconds");
        }
        if wire.pinger.updates_interval < 1 {
            bail!("pinger.updates-interval must be at least 1 second");
        }
        if wire.pinger.save_interval < 1 {
            bail!("pinger.save-interval must be at least 1 second");
        }

        let none_if_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        Ok(Self {
            listen: SocketAddr::new(ip, wire.listen.port),
            log_path: none_if_empty(wire.log.path).map(PathBuf::from),
            log_debug: wire.log.debug,
            result_url: none_if_empty(wire.pinger.result_url),
            default_probes: wire.pinger.default_probes,
            default_interval_secs: wire.pinger.default_interval,
            updates_interval: Duration::from_secs(wire.pinger.updates_interval),
            save_interval: Duration::from_secs(wire.pinger.save_interval),
            save_path: none_if_empty(wire.pinger.save_path).map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse_str("").unwrap();
        assert_eq!(config.listen(), "0.0.0.0:1081".parse().unwrap());
        assert_eq!(config.default_probes(), 3);
        assert_eq!(config.default_interval_secs(), 120);
        assert_eq!(config.updates_interval(), Duration::from_secs(30));
        assert_eq!(config.save_interval(), Duration::from_secs(180));
        assert!(config.result_url().is_none());
        assert!(config.save_path().is_none());
        assert!(config.log_path().is_none());
        assert!(!config.log_debug());
    }

    #[test]
    fn full_config_round_trips() {
        let config = Config::parse_str(
            r#"
            [listen]
            ip = "127.0.0.1"
            port = 8080

            [log]
            path = "/var/log/pinger.log"
            debug = true

            [pinger]
            result-url = "http://collector/result?host={host}&alive={alive}"
            default-probes = 5
            default-interval = 60
            updates-interval = 10
            save-interval = 300
            save-path = "/var/lib/pinger/hosts.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.log_path(), Some(Path::new("/var/log/pinger.log")));
        assert!(config.log_debug());
        assert_eq!(config.default_probes(), 5);
        assert_eq!(config.default_interval_secs(), 60);
        assert_eq!(config.save_interval(), Duration::from_secs(300));
        assert_eq!(
            config.save_path(),
            Some(Path::new("/var/lib/pinger/hosts.json"))
        );
    }

    #[test]
    fn out_of_range_defaults_are_rejected() {
        assert!(Config::parse_str("[pinger]\ndefault-interval = 10").is_err());
        assert!(Config::parse_str("[pinger]\ndefault-probes = 0").is_err());
    }

    #[test]
    fn unknown_keys_fail_loudly() {
        // the old TLS keys are gone; a stale config should not be half-read
        assert!(Config::parse_str("[listen]\nssl = true").is_err());
    }

    #[test]
    fn bad_listen_ip_is_rejected() {
        assert!(Config::parse_str("[listen]\nip = \"not-an-ip\"").is_err());
    }
}
