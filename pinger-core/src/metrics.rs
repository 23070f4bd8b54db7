#![allow(missing_docs)]

//! # metrics
//!
//! counters and gauges for the monitoring engine

use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntGauge, register_int_counter, register_int_gauge,
};

lazy_static! {
    /// When the daemon started
    pub static ref START_TIME: Instant = Instant::now();
    /// Uptime in seconds, set when metrics are scraped
    pub static ref UPTIME: IntGauge =
        register_int_gauge!("pinger_uptime_seconds", "uptime in seconds").unwrap();
    /// IPs currently owned by the probing pool
    pub static ref PROBED_HOSTS: IntGauge = register_int_gauge!(
        "pinger_probed_hosts",
        "number of hosts with a running probe scheduler"
    )
    .unwrap();
    /// Notification batches delivered
    pub static ref NOTIFY_POST_COUNT: IntCounter = register_int_counter!(
        "pinger_notify_posts_total",
        "number of state-change batches delivered"
    )
    .unwrap();
    /// Notification batches dropped after a failed POST
    pub static ref NOTIFY_FAIL_COUNT: IntCounter = register_int_counter!(
        "pinger_notify_failures_total",
        "number of state-change batches dropped after a failed POST"
    )
    .unwrap();
    /// Catalog snapshots written
    pub static ref SNAPSHOT_SAVE_COUNT: IntCounter = register_int_counter!(
        "pinger_snapshot_saves_total",
        "number of catalog snapshots written to disk"
    )
    .unwrap();
}
