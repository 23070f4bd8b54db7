//! The notification buffer.
//!
//! State changes are coalesced per destination URL between flushes; a host
//! flipping twice inside one window only reports its last state. Each flush
//! drains a destination's map and posts one JSON body of `ip -> alive`.
//! Failed batches are dropped, the next state change queues the host again.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use icmp_ping::PingResult;

use crate::metrics;

/// Connect and read/write timeout for notification POSTs.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(15);

/// Coalesces per-URL state changes and flushes them on a fixed tick.
pub struct NotifyBuffer {
    client: reqwest::Client,
    pending: Mutex<HashMap<String, HashMap<Ipv4Addr, PingResult>>>,
}

impl std::fmt::Debug for NotifyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyBuffer")
            .field("pending_urls", &self.pending.lock().len())
            .finish()
    }
}

impl NotifyBuffer {
    pub fn new() -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .connect_timeout(NOTIFY_TIMEOUT)
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .context("failed to build notification http client")?;
        Ok(Arc::new(Self {
            client,
            pending: Mutex::new(HashMap::new()),
        }))
    }

    /// Record a state change for `ip` bound for `url`. Repeated changes for
    /// the same pair within one flush window keep the last value.
    pub fn buffer(&self, url: &str, ip: Ipv4Addr, result: PingResult) {
        self.pending
            .lock()
            .entry(url.to_owned())
            .or_default()
            .insert(ip, result);
    }

    /// Spawn the flush loop ticking every `interval`.
    pub fn start(self: &Arc<Self>, interval: Duration, stop: CancellationToken) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!("notification flush loop stopping");
                        return;
                    }
                    _ = ticker.tick() => buffer.flush().await,
                }
            }
        })
    }

    /// Drain and deliver every pending batch.
    async fn flush(&self) {
        let drained: Vec<(String, HashMap<Ipv4Addr, PingResult>)> =
            self.pending.lock().drain().collect();
        for (url, updates) in drained {
            if updates.is_empty() {
                continue;
            }
            // only the liveness bit is exported in this payload
            let body: BTreeMap<String, bool> = updates
                .iter()
                .map(|(ip, result)| (ip.to_string(), result.alive))
                .collect();
            debug!(%url, updates = body.len(), "posting state changes");

            match self.client.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    metrics::NOTIFY_POST_COUNT.inc();
                }
                Ok(response) => {
                    metrics::NOTIFY_FAIL_COUNT.inc();
                    error!(%url, status = %response.status(), "update request failed, dropping batch");
                }
                Err(err) => {
                    metrics::NOTIFY_FAIL_COUNT.inc();
                    error!(%url, %err, "update request failed, dropping batch");
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> HashMap<String, HashMap<Ipv4Addr, PingResult>> {
        self.pending.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn clear_pending(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{alive_result, dead_result};

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn repeated_changes_keep_last_value() {
        let buffer = NotifyBuffer::new().unwrap();
        buffer.buffer("http://u/", ip("127.0.0.1"), alive_result());
        buffer.buffer("http://u/", ip("127.0.0.1"), dead_result());
        buffer.buffer("http://u/", ip("127.0.0.1"), alive_result());

        let pending = buffer.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending["http://u/"].len(), 1);
        assert!(pending["http://u/"][&ip("127.0.0.1")].alive);
    }

    #[tokio::test]
    async fn destinations_are_kept_apart() {
        let buffer = NotifyBuffer::new().unwrap();
        buffer.buffer("http://a/", ip("10.0.0.1"), alive_result());
        buffer.buffer("http://b/", ip("10.0.0.1"), dead_result());

        let pending = buffer.pending();
        assert!(pending["http://a/"][&ip("10.0.0.1")].alive);
        assert!(!pending["http://b/"][&ip("10.0.0.1")].alive);
    }

    #[tokio::test]
    async fn failed_flush_drops_the_batch() {
        let buffer = NotifyBuffer::new().unwrap();
        // nothing listens on this port; the POST fails fast
        buffer.buffer("http://127.0.0.1:1/", ip("10.0.0.1"), alive_result());
        buffer.flush().await;
        assert!(buffer.pending().is_empty());
    }
}
