#![allow(missing_docs)]

//! # metrics
//!
//! counters for traffic on the shared ICMP socket

use lazy_static::lazy_static;
use prometheus::{IntCounter, register_int_counter};

lazy_static! {
    /// Echo requests written to the shared socket
    pub static ref ECHO_REQUEST_COUNT: IntCounter = register_int_counter!(
        "pinger_echo_requests_total",
        "number of ICMP echo requests written to the shared socket"
    )
    .unwrap();
    /// Echo replies decoded and routed to an in-flight probe job
    pub static ref ECHO_REPLY_COUNT: IntCounter = register_int_counter!(
        "pinger_echo_replies_total",
        "number of ICMP echo replies routed to probe jobs"
    )
    .unwrap();
}
