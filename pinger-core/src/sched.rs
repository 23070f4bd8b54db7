//! The probing pool: one long-lived scheduler task per monitored IP.
//!
//! Each entry ticks on its own interval, runs one probe job per tick and
//! hands the verdict to the catalog for fan-out. A running ticker cannot be
//! reset, so a changed interval replaces the whole entry.

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Weak},
    time::Duration,
};

use crate::catalog::Catalog;
use crate::metrics;

/// Mutable probe parameters of one entry, updated in place while the
/// interval stays put.
#[derive(Debug, Clone)]
struct ProbeParams {
    probes: u32,
    /// Advisory copy of the latest write; notifications are driven by each
    /// topic host's own URL.
    update_url: String,
}

/// The long-lived timer loop probing one IP.
#[derive(Debug)]
struct SchedulerEntry {
    interval: Duration,
    params: Arc<Mutex<ProbeParams>>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerEntry {
    /// Signal the run loop to stop its ticker and exit. Idempotent; calling
    /// it again after the loop finished does nothing.
    fn stop(&self) {
        self.stop.cancel();
    }

    fn finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// One scheduler entry per IP that appears in any topic.
#[derive(Debug, Default)]
pub(crate) struct SchedulerPool {
    entries: Mutex<HashMap<Ipv4Addr, SchedulerEntry>>,
}

impl SchedulerPool {
    /// Create or reshape the entry for `ip`. The caller passes the minimum
    /// interval across every topic referencing the IP; a changed interval
    /// replaces the running entry, an unchanged one updates probes and URL
    /// in place.
    pub(crate) fn upsert(
        &self,
        catalog: &Arc<Catalog>,
        ip: Ipv4Addr,
        interval_secs: u64,
        probes: u32,
        update_url: String,
    ) {
        let interval = Duration::from_secs(interval_secs);
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&ip) {
            if entry.interval == interval && !entry.finished() {
                let mut params = entry.params.lock();
                params.probes = probes;
                params.update_url = update_url;
                return;
            }
            debug!(%ip, ?interval, "replacing scheduler entry");
            entry.stop();
        } else {
            debug!(%ip, ?interval, "adding host to the probing pool");
        }

        let params = Arc::new(Mutex::new(ProbeParams { probes, update_url }));
        let stop = CancellationToken::new();
        let task = spawn_probe_loop(
            Arc::downgrade(catalog),
            ip,
            interval,
            params.clone(),
            stop.clone(),
        );
        entries.insert(
            ip,
            SchedulerEntry {
                interval,
                params,
                stop,
                task,
            },
        );
        metrics::PROBED_HOSTS.set(entries.len() as i64);
    }

    /// Stop and drop the entry for `ip`, if any.
    pub(crate) fn remove(&self, ip: Ipv4Addr) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.remove(&ip) {
            debug!(%ip, "stopping probe scheduler");
            entry.stop();
        }
        metrics::PROBED_HOSTS.set(entries.len() as i64);
    }

    /// Current probe parameters of the entry for `ip`.
    pub(crate) fn params(&self, ip: Ipv4Addr) -> Option<(u32, String)> {
        self.entries.lock().get(&ip).map(|entry| {
            let params = entry.params.lock();
            (params.probes, params.update_url.clone())
        })
    }

    pub(crate) fn interval(&self, ip: Ipv4Addr) -> Option<Duration> {
        self.entries.lock().get(&ip).map(|entry| entry.interval)
    }

    pub(crate) fn contains(&self, ip: Ipv4Addr) -> bool {
        self.entries.lock().contains_key(&ip)
    }
}

fn spawn_probe_loop(
    catalog: Weak<Catalog>,
    ip: Ipv4Addr,
    interval: Duration,
    params: Arc<Mutex<ProbeParams>>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // first probe fires one full interval after registration; a run that
        // overruns the interval delays the next tick instead of queueing it
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(%ip, "probe scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let Some(catalog) = catalog.upgrade() else { return };
                    let probes = params.lock().probes;
                    match catalog.prober().probe(ip, probes).await {
                        Ok(result) => catalog.broadcast(ip, result),
                        Err(err) => error!(%ip, %err, "failed to ping"),
                    }
                }
            }
        }
    })
}
