//! # pinger-core
//!
//! The probing and notification engine: the topic/host catalog, the per-IP
//! probe schedulers, the notification buffer and the snapshotter, tied
//! together by the [`Monitor`] facade the HTTP control plane calls into.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use icmp_ping::{PingProbe, PingResult};

pub mod catalog;
pub mod metrics;
pub mod notify;
mod sched;
pub mod snapshot;
pub mod trace;
pub mod wire;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::notify::NotifyBuffer;
use crate::wire::{Defaults, HostSpec, LivenessSnapshot, TopicsDoc};

/// Topic single-host registrations land in when no topic is named.
pub const DEFAULT_TOPIC: &str = "default";

/// Connect and read/write timeout for result-URL GETs.
const RESULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors surfaced to the control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad address, out-of-range interval or probe count.
    #[error("{0}")]
    InvalidInput(String),
    /// The IP is not in any topic.
    #[error("no topic contains host '{0}'")]
    NotFound(Ipv4Addr),
    /// The name is neither an IPv4 literal nor resolvable to one.
    #[error("'{0}' is not an IPv4 address and did not resolve to one")]
    ResolveFailed(String),
    /// A probing failure, including a job already in flight for the IP.
    #[error(transparent)]
    Ping(#[from] icmp_ping::Error),
}

/// The probing seam between the engine and the shared ICMP socket.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Run one probe job against `ip`.
    async fn probe(&self, ip: Ipv4Addr, probes: u32) -> icmp_ping::Result<PingResult>;
}

#[async_trait]
impl Prober for icmp_ping::Reactor {
    async fn probe(&self, ip: Ipv4Addr, probes: u32) -> icmp_ping::Result<PingResult> {
        self.ping(ip, probes).await
    }
}

/// Composition root of the monitor.
///
/// Owns the reactor, catalog and notification buffer and exposes the
/// operations the HTTP layer calls. Constructed once at startup, in
/// dependency order: reactor, then catalog and buffer, then (via
/// [`Monitor::start`]) the background tickers, and finally the HTTP adapter
/// on top.
pub struct Monitor {
    prober: Arc<dyn Prober>,
    catalog: Arc<Catalog>,
    buffer: Arc<NotifyBuffer>,
    result_client: reqwest::Client,
    result_url: Option<String>,
    defaults: Defaults,
    updates_interval: Duration,
    save_interval: Duration,
    save_path: Option<PathBuf>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("catalog", &self.catalog)
            .field("defaults", &self.defaults)
            .field("save_path", &self.save_path)
            .finish()
    }
}

impl Monitor {
    /// Open the raw ICMP socket and assemble the engine around it. Failing
    /// to open the socket is fatal; there is nothing to monitor without it.
    pub fn new(config: &config::Config) -> anyhow::Result<Arc<Self>> {
        let reactor = icmp_ping::Reactor::new()
            .context("cannot open raw icmp socket (CAP_NET_RAW or root required)")?;
        Self::with_prober(Arc::new(reactor), config)
    }

    /// Assemble the engine around an arbitrary prober.
    pub fn with_prober(
        prober: Arc<dyn Prober>,
        config: &config::Config,
    ) -> anyhow::Result<Arc<Self>> {
        let defaults = Defaults {
            probes: config.default_probes(),
            interval_secs: config.default_interval_secs(),
        };
        let buffer = NotifyBuffer::new()?;
        let catalog = Catalog::new(prober.clone(), buffer.clone(), defaults);
        let result_client = reqwest::Client::builder()
            .connect_timeout(RESULT_TIMEOUT)
            .timeout(RESULT_TIMEOUT)
            .build()
            .context("failed to build result http client")?;

        Ok(Arc::new(Self {
            prober,
            catalog,
            buffer,
            result_client,
            result_url: config.result_url().map(str::to_owned),
            defaults,
            updates_interval: config.updates_interval(),
            save_interval: config.save_interval(),
            save_path: config.save_path().map(PathBuf::from),
        }))
    }

    /// Bring up the background machinery: restore the snapshot (which starts
    /// the schedulers for every persisted host), then the snapshot and
    /// notification tickers.
    pub fn start(&self, stop: CancellationToken) {
        if let Some(path) = &self.save_path {
            if let Some(doc) = snapshot::load(path) {
                match wire::decode_topics(doc, self.defaults) {
                    Ok(specs) => {
                        let topics = specs.len();
                        let hosts: usize = specs.iter().map(|t| t.hosts.len()).sum();
                        self.catalog.get_or_store(specs, false);
                        info!(topics, hosts, path = %path.display(), "loaded hosts from snapshot");
                    }
                    Err(err) => error!(%err, "cannot parse saved hosts"),
                }
            }
            let _ = snapshot::start_saver(
                self.catalog.clone(),
                path.clone(),
                self.save_interval,
                stop.clone(),
            );
        }
        let _ = self.buffer.start(self.updates_interval, stop);
    }

    /// Probe `host` right now and wait for the verdict.
    pub async fn ping_now(&self, host: &str, probes: u32) -> Result<PingResult, Error> {
        let ip = self.resolve(host).await?;
        Ok(self.prober.probe(ip, probes).await?)
    }

    /// Probe `host` in the background and report the verdict with a single
    /// GET against the configured result URL template.
    pub fn ping_then_notify(self: &Arc<Self>, host: String, probes: u32, template: String) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let ip = match monitor.resolve(&host).await {
                Ok(ip) => ip,
                Err(err) => {
                    error!(%host, %err, "cannot resolve ping target");
                    return;
                }
            };
            let result = match monitor.prober.probe(ip, probes).await {
                Ok(result) => result,
                Err(err) => {
                    error!(%host, %err, "background ping failed");
                    return;
                }
            };
            let url = render_result_url(&template, &host, &result);
            debug!(%url, "reporting ping result");
            match monitor.result_client.get(&url).send().await {
                Ok(response) if !response.status().is_success() => {
                    error!(%url, status = %response.status(), "result request failed")
                }
                Ok(_) => {}
                Err(err) => error!(%url, %err, "error requesting result api"),
            }
        });
    }

    /// Merge a topics document and return the post-merge liveness snapshot.
    pub fn register(&self, doc: TopicsDoc, remove_old: bool) -> Result<LivenessSnapshot, Error> {
        let specs = wire::decode_topics(doc, self.defaults)?;
        Ok(self.catalog.get_or_store(specs, remove_old))
    }

    /// Upsert a single host into the [`DEFAULT_TOPIC`].
    pub fn store_host(&self, host: &str, interval_secs: u64, probes: u32) -> Result<(), Error> {
        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| Error::InvalidInput(format!("'{host}' is not an IPv4 address")))?;
        let spec = HostSpec {
            ip,
            alive: false,
            probes,
            interval_secs,
            update_url: String::new(),
        };
        wire::validate_host(&spec)?;
        self.catalog.store_host(DEFAULT_TOPIC, spec);
        Ok(())
    }

    /// Remove an IP from every topic it appears in.
    pub fn remove(&self, host: &str) -> Result<(), Error> {
        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| Error::InvalidInput(format!("'{host}' is not an IPv4 address")))?;
        self.catalog.remove_ip(ip)
    }

    /// The current catalog as a topics document.
    pub fn dump(&self) -> TopicsDoc {
        self.catalog.dump()
    }

    /// The configured result URL template for `/ping-api`, if any.
    pub fn result_url(&self) -> Option<&str> {
        self.result_url.as_deref()
    }

    /// The daemon-wide default probe count.
    pub fn default_probes(&self) -> u32 {
        self.defaults.probes
    }

    /// The daemon-wide default probe interval in seconds.
    pub fn default_interval_secs(&self) -> u64 {
        self.defaults.interval_secs
    }

    /// Find the IPv4 address for a literal or a DNS name. IPv6 results are
    /// skipped; the monitor probes IPv4 only.
    async fn resolve(&self, host: &str) -> Result<Ipv4Addr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return match ip {
                IpAddr::V4(ip) => Ok(ip),
                IpAddr::V6(_) => Err(Error::InvalidInput(format!(
                    "'{host}' is not an IPv4 address"
                ))),
            };
        }
        let mut addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|_| Error::ResolveFailed(host.to_owned()))?;
        addrs
            .find_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| Error::ResolveFailed(host.to_owned()))
    }
}

/// Textual substitution of the `{host}`, `{alive}`, `{ns}` and `{ms}` tokens.
fn render_result_url(template: &str, host: &str, result: &PingResult) -> String {
    template
        .replace("{host}", host)
        .replace("{alive}", if result.alive { "true" } else { "false" })
        .replace("{ns}", &result.avg_rtt_ns.to_string())
        .replace("{ms}", &format!("{:.6}", result.avg_rtt_ms))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    pub(crate) fn alive_result() -> PingResult {
        PingResult {
            alive: true,
            success_percent: 100,
            avg_rtt_ns: 1_000_000,
            avg_rtt_ms: 1.0,
        }
    }

    pub(crate) fn dead_result() -> PingResult {
        PingResult::dead()
    }

    #[derive(Debug)]
    enum Behavior {
        Respond(PingResult),
        AlreadyRunning,
    }

    /// A prober that answers instantly, for exercising the engine without a
    /// raw socket.
    #[derive(Debug)]
    pub(crate) struct MockProber {
        behavior: Behavior,
        calls: Mutex<Vec<(Ipv4Addr, u32)>>,
    }

    impl MockProber {
        pub(crate) fn alive() -> Arc<Self> {
            Arc::new(Self {
                behavior: Behavior::Respond(alive_result()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn busy() -> Arc<Self> {
            Arc::new(Self {
                behavior: Behavior::AlreadyRunning,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn calls(&self) -> Vec<(Ipv4Addr, u32)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Prober for MockProber {
        async fn probe(&self, ip: Ipv4Addr, probes: u32) -> icmp_ping::Result<PingResult> {
            self.calls.lock().push((ip, probes));
            match &self.behavior {
                Behavior::Respond(result) => Ok(*result),
                Behavior::AlreadyRunning => Err(icmp_ping::Error::AlreadyRunning { ip }),
            }
        }
    }
}
