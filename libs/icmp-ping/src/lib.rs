//! Shared ICMP echo socket with per-host probe jobs.
//!
//! One raw IPv4 socket serves every monitored host: outbound echo requests
//! are serialized through a write lock, while a single read loop decodes
//! replies and routes them to the in-flight job registered for the sender's
//! address. Inside a job, replies are matched to requests by ping identifier
//! and sequence number.

mod errors;
mod icmp;
mod job;
pub mod metrics;
mod socket;

pub use crate::errors::{Error, Result};
pub use crate::icmp::{ECHO_PAYLOAD, EchoReply, EchoRequest, ICMP_HEADER_SIZE, PacketError};
pub use crate::job::{PROBE_SPACING, PingProbe, PingResult, ProbeJob};

use crate::job::Reply;
use crate::socket::Socket;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, trace};

use core::fmt;
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    ops::RangeInclusive,
    sync::Arc,
    time::Instant,
};

/// Largest datagram the read loop will accept.
const READ_BUFFER_SIZE: usize = 1500;

/// Inclusive range probe identifiers are drawn from.
const PING_ID_RANGE: RangeInclusive<u16> = 1..=9999;

/// Owns the raw ICMP socket, serializes writes to it and routes echo replies
/// to in-flight probe jobs. One instance lives for the whole process.
pub struct Reactor {
    shared: Arc<Shared>,
    read_task: JoinHandle<()>,
}

struct Shared {
    socket: Socket,
    write_lock: tokio::sync::Mutex<()>,
    jobs: Mutex<HashMap<Ipv4Addr, Arc<ProbeJob>>>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("jobs", &self.shared.jobs.lock().len())
            .finish()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.read_task.abort();
        debug!("icmp reactor dropped");
    }
}

impl Reactor {
    /// Open the raw socket and start the reply read loop.
    ///
    /// Fails when the process may not open raw ICMP sockets (CAP_NET_RAW or
    /// root on most systems); there is no unprivileged fallback.
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared {
            socket: Socket::new()?,
            write_lock: tokio::sync::Mutex::new(()),
            jobs: Mutex::new(HashMap::new()),
        });
        debug!("created raw icmpv4 socket");
        let read_task = task::spawn(read_loop(shared.clone()));
        Ok(Self { shared, read_task })
    }

    /// Run one probe job: `probes` sequenced echos against `ip`, two seconds
    /// apart, collecting whatever replies arrive in that window.
    ///
    /// At most one job per IP may be in flight; a concurrent second caller
    /// gets [`Error::AlreadyRunning`].
    pub async fn ping(&self, ip: Ipv4Addr, probes: u32) -> Result<PingResult> {
        let probes = probes.min(u16::MAX as u32) as u16;
        let (job, rx) = ProbeJob::new(ip);
        {
            let mut jobs = self.shared.jobs.lock();
            if jobs.contains_key(&ip) {
                return Err(Error::AlreadyRunning { ip });
            }
            jobs.insert(ip, job.clone());
        }
        // make sure the map entry and lane are cleaned up, even if this
        // future is dropped mid-run
        let _guard = JobGuard {
            shared: self.shared.clone(),
            job: job.clone(),
        };

        let ping_id = rand::thread_rng().gen_range(PING_ID_RANGE);
        let (stop_tx, stop_rx) = oneshot::channel();
        let collector = task::spawn(job::collect(rx, ping_id, stop_rx));

        let mut sent = HashMap::new();
        for seq_cnt in 1..=probes {
            let at = self.send_echo(ip, ping_id, seq_cnt).await;
            sent.insert(seq_cnt, at);
            tokio::time::sleep(PROBE_SPACING).await;
        }

        let _ = stop_tx.send(());
        let replies = collector
            .await
            .map_err(|_| Error::CollectorGone { ip })?;
        let result = PingResult::from_probes(&job::collate(&sent, &replies, probes));
        debug!(
            %ip,
            elapsed = ?job.elapsed(),
            alive = result.alive,
            success_percent = result.success_percent,
            "probe job finished"
        );
        Ok(result)
    }

    /// Encode and write one echo request, returning the timestamp captured
    /// right after the write. Failures are logged and the timestamp still
    /// returned; the missing reply then counts as a lost probe.
    async fn send_echo(&self, ip: Ipv4Addr, ident: u16, seq_cnt: u16) -> Instant {
        let mut buf = [0u8; icmp::ECHO_REQUEST_BUFFER_SIZE];
        if let Err(err) = (EchoRequest { ident, seq_cnt }).encode(&mut buf) {
            error!(%ip, %err, "cannot encode echo request");
            return Instant::now();
        }
        let target = SocketAddr::new(IpAddr::V4(ip), 0);

        let _write = self.shared.write_lock.lock().await;
        match self.shared.socket.send_to(&buf, &target).await {
            Ok(_) => metrics::ECHO_REQUEST_COUNT.inc(),
            Err(err) => error!(%ip, %err, "cannot send echo request"),
        }
        Instant::now()
    }
}

/// Removes a job from the shared map and closes its reply lane on drop.
struct JobGuard {
    shared: Arc<Shared>,
    job: Arc<ProbeJob>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.job.finish();
        self.shared.jobs.lock().remove(&self.job.ip());
    }
}

async fn read_loop(shared: Arc<Shared>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let (n, addr) = match shared.socket.recv(&mut buf).await {
            Ok(read) => read,
            Err(err) => {
                error!(%err, "error reading from icmp socket");
                continue;
            }
        };
        let received = Instant::now();
        let IpAddr::V4(peer) = addr.ip() else {
            continue;
        };

        let job = shared.jobs.lock().get(&peer).cloned();
        let Some(job) = job else {
            trace!(%peer, "icmp message from host with no in-flight job");
            continue;
        };
        match EchoReply::decode(&buf[..n]) {
            Ok(reply) => {
                metrics::ECHO_REPLY_COUNT.inc();
                job.deliver(Reply {
                    ident: reply.ident,
                    seq_cnt: reply.seq_cnt,
                    received,
                });
            }
            Err(PacketError::NotEchoReply) => trace!(%peer, "non-reply icmp message"),
            Err(err) => debug!(%peer, %err, "undecodable icmp packet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    #[ignore = "needs CAP_NET_RAW for the raw icmp socket"]
    async fn loopback_probe_is_alive() -> Result<()> {
        let reactor = Reactor::new()?;
        let result = reactor.ping("127.0.0.1".parse().unwrap(), 2).await?;
        assert!(result.alive);
        assert!(result.avg_rtt_ns > 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    #[ignore = "needs CAP_NET_RAW for the raw icmp socket"]
    async fn second_job_for_same_ip_is_rejected() -> Result<()> {
        let reactor = Arc::new(Reactor::new()?);
        let ip: Ipv4Addr = "127.0.0.1".parse().unwrap();

        let first = {
            let reactor = reactor.clone();
            tokio::spawn(async move { reactor.ping(ip, 2).await })
        };
        // give the first job time to claim the slot
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let second = reactor.ping(ip, 1).await;
        assert!(matches!(second, Err(Error::AlreadyRunning { .. })));

        assert!(first.await.unwrap()?.alive);
        Ok(())
    }

    #[tokio::test]
    async fn zero_probes_yields_dead_result() {
        // no sends happen, so this does not touch the socket map contention;
        // it still needs the raw socket to construct the reactor
        if let Ok(reactor) = Reactor::new() {
            let result = reactor.ping("192.0.2.1".parse().unwrap(), 0).await.unwrap();
            assert_eq!(result, PingResult::dead());
        }
    }
}
