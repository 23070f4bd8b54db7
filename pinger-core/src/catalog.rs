//! The topic/host catalog.
//!
//! Topics group hosts under shared default parameters; the same IP may sit
//! in any number of topics but is probed by exactly one scheduler entry,
//! ticking at the tightest interval any referencing topic asks for. Probe
//! verdicts fan out to every topic entry, and a liveness flip queues a
//! notification for the entry's own update URL.

use parking_lot::Mutex;
use tracing::debug;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use icmp_ping::PingResult;

use crate::notify::NotifyBuffer;
use crate::sched::SchedulerPool;
use crate::wire::{Defaults, HostSpec, LivenessSnapshot, TopicSpec, TopicsDoc, WireHost, WireTopic};
use crate::{Error, Prober};

pub struct Catalog {
    /// Also the catalog-wide lock: merges, removals and fan-out serialize on
    /// it, with topic and host locks nested inside.
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    pool: SchedulerPool,
    prober: Arc<dyn Prober>,
    buffer: Arc<NotifyBuffer>,
    defaults: Defaults,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("topics", &self.topics.lock().len())
            .field("defaults", &self.defaults)
            .finish()
    }
}

struct Topic {
    name: String,
    /// Defaults newly stored hosts inherit; refreshed on every registration.
    params: Mutex<TopicParams>,
    hosts: Mutex<HashMap<Ipv4Addr, Arc<HostEntry>>>,
}

#[derive(Debug, Clone)]
struct TopicParams {
    probes: u32,
    interval_secs: u64,
    update_url: String,
}

struct HostEntry {
    ip: Ipv4Addr,
    state: Mutex<HostState>,
}

#[derive(Debug, Clone)]
struct HostState {
    probes: u32,
    interval_secs: u64,
    update_url: String,
    alive: bool,
}

impl Topic {
    fn new(spec: &TopicSpec) -> Self {
        Self {
            name: spec.name.clone(),
            params: Mutex::new(TopicParams {
                probes: spec.probes,
                interval_secs: spec.interval_secs,
                update_url: spec.update_url.clone(),
            }),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn with_defaults(name: &str, defaults: Defaults) -> Self {
        Self {
            name: name.to_owned(),
            params: Mutex::new(TopicParams {
                probes: defaults.probes,
                interval_secs: defaults.interval_secs,
                update_url: String::new(),
            }),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn set_params(&self, spec: &TopicSpec) {
        let mut params = self.params.lock();
        params.probes = spec.probes;
        params.interval_secs = spec.interval_secs;
        params.update_url = spec.update_url.clone();
    }
}

impl HostEntry {
    fn new(spec: &HostSpec) -> Self {
        Self {
            ip: spec.ip,
            state: Mutex::new(HostState {
                probes: spec.probes,
                interval_secs: spec.interval_secs,
                update_url: spec.update_url.clone(),
                alive: spec.alive,
            }),
        }
    }

    /// Refresh probe parameters from a registration. Liveness is only ever
    /// flipped by [`Catalog::broadcast`]; merging never clobbers it. Returns
    /// the current liveness for the registration snapshot.
    fn update_params(&self, spec: &HostSpec) -> bool {
        let mut state = self.state.lock();
        state.probes = spec.probes;
        state.interval_secs = spec.interval_secs;
        state.update_url = spec.update_url.clone();
        state.alive
    }
}

impl Catalog {
    pub fn new(prober: Arc<dyn Prober>, buffer: Arc<NotifyBuffer>, defaults: Defaults) -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            pool: SchedulerPool::default(),
            prober,
            buffer,
            defaults,
        })
    }

    pub(crate) fn prober(&self) -> &Arc<dyn Prober> {
        &self.prober
    }

    /// Merge a batch of topic definitions into the live catalog and return
    /// the post-merge liveness of every incoming host.
    ///
    /// With `remove_old`, hosts a topic no longer names are dropped from it
    /// (and from the probing pool when that was their last reference);
    /// without it, the merge is purely additive.
    pub fn get_or_store(
        self: &Arc<Self>,
        specs: Vec<TopicSpec>,
        remove_old: bool,
    ) -> LivenessSnapshot {
        let mut snapshot = LivenessSnapshot::new();
        let mut topics = self.topics.lock();

        for spec in &specs {
            if !topics.contains_key(&spec.name) {
                debug!(topic = %spec.name, "creating topic");
                topics.insert(spec.name.clone(), Arc::new(Topic::new(spec)));
            }
        }

        let topics = &*topics;
        for spec in specs {
            let Some(topic) = topics.get(&spec.name) else {
                continue;
            };
            topic.set_params(&spec);

            let incoming: HashSet<Ipv4Addr> = spec.hosts.iter().map(|h| h.ip).collect();
            let mut alive_map = BTreeMap::new();
            for host in spec.hosts {
                let alive = self.merge_host(topics, topic, host.clone());
                alive_map.insert(host.ip.to_string(), alive);
            }

            if remove_old {
                let stale: Vec<Ipv4Addr> = topic
                    .hosts
                    .lock()
                    .keys()
                    .filter(|ip| !incoming.contains(ip))
                    .copied()
                    .collect();
                for ip in stale {
                    debug!(%ip, topic = %topic.name, "removing host absent from incoming definition");
                    topic.hosts.lock().remove(&ip);
                    self.reconcile(topics, ip, None);
                }
            }

            snapshot.insert(spec.name, alive_map);
        }
        snapshot
    }

    /// Upsert a single host into `topic_name`, creating the topic with the
    /// daemon defaults if needed.
    pub fn store_host(self: &Arc<Self>, topic_name: &str, spec: HostSpec) {
        let mut topics = self.topics.lock();
        if !topics.contains_key(topic_name) {
            debug!(topic = %topic_name, "creating topic");
            topics.insert(
                topic_name.to_owned(),
                Arc::new(Topic::with_defaults(topic_name, self.defaults)),
            );
        }
        let topics = &*topics;
        if let Some(topic) = topics.get(topic_name) {
            self.merge_host(topics, topic, spec);
        }
    }

    fn merge_host(
        self: &Arc<Self>,
        topics: &HashMap<String, Arc<Topic>>,
        topic: &Topic,
        spec: HostSpec,
    ) -> bool {
        let existing = topic.hosts.lock().get(&spec.ip).cloned();
        let alive = match existing {
            Some(entry) => entry.update_params(&spec),
            None => {
                debug!(ip = %spec.ip, topic = %topic.name, "adding host to topic");
                let alive = spec.alive;
                topic
                    .hosts
                    .lock()
                    .insert(spec.ip, Arc::new(HostEntry::new(&spec)));
                alive
            }
        };
        self.reconcile(topics, spec.ip, Some((spec.probes, spec.update_url)));
        alive
    }

    /// Remove `ip` from every topic that references it; the scheduler entry
    /// goes away with the last reference.
    pub fn remove_ip(self: &Arc<Self>, ip: Ipv4Addr) -> Result<(), Error> {
        let topics = self.topics.lock();
        let mut found = false;
        for topic in topics.values() {
            if topic.hosts.lock().remove(&ip).is_some() {
                debug!(%ip, topic = %topic.name, "removed host from topic");
                found = true;
            }
        }
        if !found {
            return Err(Error::NotFound(ip));
        }
        self.reconcile(&topics, ip, None);
        Ok(())
    }

    /// Fan a probe verdict out to every topic entry for `ip`. A liveness
    /// flip updates the entry and, when it carries an update URL, queues a
    /// notification for that URL.
    pub fn broadcast(&self, ip: Ipv4Addr, result: PingResult) {
        let topics = self.topics.lock();
        for topic in topics.values() {
            let entry = topic.hosts.lock().get(&ip).cloned();
            if let Some(entry) = entry {
                let mut state = entry.state.lock();
                if state.alive != result.alive {
                    debug!(%ip, topic = %topic.name, alive = result.alive, "host state changed");
                    state.alive = result.alive;
                    if !state.update_url.is_empty() {
                        self.buffer.buffer(&state.update_url, ip, result);
                    }
                }
            }
        }
    }

    /// Serialize the catalog into the topics document. Host fields matching
    /// the topic defaults are left implicit, the way registrations write
    /// them.
    pub fn dump(&self) -> TopicsDoc {
        let topics = self.topics.lock();
        let mut doc = TopicsDoc::new();
        for (name, topic) in topics.iter() {
            let params = topic.params.lock().clone();
            let mut hosts: Vec<WireHost> = topic
                .hosts
                .lock()
                .values()
                .map(|entry| {
                    let state = entry.state.lock();
                    WireHost {
                        host: entry.ip.to_string(),
                        alive: state.alive,
                        probes: (state.probes != params.probes).then_some(state.probes),
                        interval: (state.interval_secs != params.interval_secs)
                            .then_some(state.interval_secs),
                        update_url: (state.update_url != params.update_url)
                            .then(|| state.update_url.clone()),
                    }
                })
                .collect();
            hosts.sort_by(|a, b| a.host.cmp(&b.host));
            doc.insert(
                name.clone(),
                WireTopic {
                    probes: Some(params.probes),
                    interval: Some(params.interval_secs),
                    update_url: Some(params.update_url),
                    hosts,
                },
            );
        }
        doc
    }

    /// Re-derive the scheduler entry for `ip` from every topic that still
    /// references it: the tightest interval wins, probes and URL come from
    /// the latest write when there was one.
    fn reconcile(
        self: &Arc<Self>,
        topics: &HashMap<String, Arc<Topic>>,
        ip: Ipv4Addr,
        latest: Option<(u32, String)>,
    ) {
        let mut min_interval: Option<u64> = None;
        for topic in topics.values() {
            if let Some(entry) = topic.hosts.lock().get(&ip) {
                let interval = entry.state.lock().interval_secs;
                min_interval = Some(min_interval.map_or(interval, |m| m.min(interval)));
            }
        }
        match min_interval {
            None => self.pool.remove(ip),
            Some(interval_secs) => {
                let (probes, update_url) = latest
                    .or_else(|| self.pool.params(ip))
                    .unwrap_or((self.defaults.probes, String::new()));
                self.pool.upsert(self, ip, interval_secs, probes, update_url);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SchedulerPool {
        &self.pool
    }
}
