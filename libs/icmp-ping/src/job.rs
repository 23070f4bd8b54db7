use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, Instant},
};

/// Spacing between consecutive echo requests within one probe job. The pause
/// after the final request doubles as its reply window.
pub const PROBE_SPACING: Duration = Duration::from_secs(2);

/// One echo reply routed from the reactor's read loop to an in-flight job.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reply {
    pub(crate) ident: u16,
    pub(crate) seq_cnt: u16,
    pub(crate) received: Instant,
}

/// A single in-flight run of echo probes against one host.
///
/// The reactor keeps at most one of these per IP in its job map and hands
/// replies over through the job's lane until the job is marked done.
#[derive(Debug)]
pub struct ProbeJob {
    ip: Ipv4Addr,
    started: Instant,
    lane: Mutex<ReplyLane>,
}

#[derive(Debug)]
struct ReplyLane {
    tx: mpsc::UnboundedSender<Reply>,
    done: bool,
}

impl ProbeJob {
    pub(crate) fn new(ip: Ipv4Addr) -> (Arc<Self>, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let job = Arc::new(Self {
            ip,
            started: Instant::now(),
            lane: Mutex::new(ReplyLane { tx, done: false }),
        });
        (job, rx)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Hand a decoded reply to this job. The lane mutex closes the race
    /// between delivery and collector shutdown: no send happens once done.
    pub(crate) fn deliver(&self, reply: Reply) {
        let lane = self.lane.lock();
        if !lane.done {
            let _ = lane.tx.send(reply);
        }
    }

    pub(crate) fn finish(&self) {
        self.lane.lock().done = true;
    }
}

/// Outcome of a single echo probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingProbe {
    pub success: bool,
    pub rtt_ns: u64,
}

/// Aggregated verdict of one probe job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    pub alive: bool,
    pub success_percent: u8,
    pub avg_rtt_ns: u64,
    pub avg_rtt_ms: f64,
}

impl PingResult {
    /// Verdict for a job that sent nothing or heard nothing.
    pub fn dead() -> Self {
        Self {
            alive: false,
            success_percent: 0,
            avg_rtt_ns: 0,
            avg_rtt_ms: 0.0,
        }
    }

    /// Fold per-probe outcomes into the coarse liveness verdict. The average
    /// is taken over successful probes only.
    pub fn from_probes(probes: &[PingProbe]) -> Self {
        let successes = probes.iter().filter(|p| p.success).count() as u64;
        if successes == 0 {
            return Self::dead();
        }
        let sum: u64 = probes.iter().filter(|p| p.success).map(|p| p.rtt_ns).sum();
        let avg_rtt_ns = sum / successes;
        Self {
            alive: true,
            success_percent: (100 * successes / probes.len() as u64) as u8,
            avg_rtt_ns,
            avg_rtt_ms: avg_rtt_ns as f64 / 1_000_000.0,
        }
    }
}

/// Drain the reply lane until the stop signal, recording the arrival time of
/// the first reply per sequence number. Replies for other ping identifiers
/// belong to stale jobs and are dropped.
pub(crate) async fn collect(
    mut rx: mpsc::UnboundedReceiver<Reply>,
    ping_id: u16,
    mut stop: oneshot::Receiver<()>,
) -> HashMap<u16, Instant> {
    let mut replies = HashMap::new();
    loop {
        tokio::select! {
            reply = rx.recv() => match reply {
                Some(reply) => {
                    if reply.ident != ping_id {
                        trace!(ident = reply.ident, expected = ping_id, "reply for another ping id");
                        continue;
                    }
                    replies.entry(reply.seq_cnt).or_insert(reply.received);
                }
                None => break,
            },
            _ = &mut stop => break,
        }
    }
    replies
}

/// Pair send and receive timestamps per sequence number. Sequences without a
/// reply count as lost; replies outside `1..=probes` are ignored.
pub(crate) fn collate(
    sent: &HashMap<u16, Instant>,
    replies: &HashMap<u16, Instant>,
    probes: u16,
) -> Vec<PingProbe> {
    (1..=probes)
        .map(|seq_cnt| match (sent.get(&seq_cnt), replies.get(&seq_cnt)) {
            (Some(tx), Some(rx)) => PingProbe {
                success: true,
                rtt_ns: rx.saturating_duration_since(*tx).as_nanos() as u64,
            },
            _ => PingProbe {
                success: false,
                rtt_ns: 0,
            },
        })
        .collect()
}
