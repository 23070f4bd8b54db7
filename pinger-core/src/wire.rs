//! The topics document: the JSON shape shared by the bulk registration
//! endpoints and the on-disk snapshot.
//!
//! Every parameter is optional on the wire; a host inherits what its topic
//! does not override, and a topic inherits the daemon-wide defaults.
//! Inheritance and validation happen here, after decode, so the catalog only
//! ever sees fully resolved host definitions.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::Error;

/// Probe intervals tighter than this are rejected.
pub const MIN_INTERVAL_SECS: u64 = 30;

/// The whole document: topic name to topic body.
pub type TopicsDoc = BTreeMap<String, WireTopic>;

/// Liveness snapshot returned by bulk registration: `{topic: {ip: alive}}`.
pub type LivenessSnapshot = BTreeMap<String, BTreeMap<String, bool>>;

/// One topic as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WireTopic {
    #[serde(rename = "Probes", default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<u32>,
    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(rename = "UpdateURL", default, skip_serializing_if = "Option::is_none")]
    pub update_url: Option<String>,
    #[serde(rename = "Hosts", default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<WireHost>,
}

/// One host inside a topic as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHost {
    pub host: String,
    #[serde(default)]
    pub alive: bool,
    #[serde(rename = "Probes", default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<u32>,
    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(rename = "UpdateURL", default, skip_serializing_if = "Option::is_none")]
    pub update_url: Option<String>,
}

/// Daemon-wide fallbacks for probe count and interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Defaults {
    pub probes: u32,
    pub interval_secs: u64,
}

/// A topic with inheritance resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub probes: u32,
    pub interval_secs: u64,
    pub update_url: String,
    pub hosts: Vec<HostSpec>,
}

/// A host with inheritance resolved and parameters validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub ip: Ipv4Addr,
    pub alive: bool,
    pub probes: u32,
    pub interval_secs: u64,
    pub update_url: String,
}

/// Resolve inheritance and validate a decoded topics document.
pub fn decode_topics(doc: TopicsDoc, defaults: Defaults) -> Result<Vec<TopicSpec>, Error> {
    doc.into_iter()
        .map(|(name, topic)| decode_topic(name, topic, defaults))
        .collect()
}

fn decode_topic(name: String, topic: WireTopic, defaults: Defaults) -> Result<TopicSpec, Error> {
    let probes = topic.probes.unwrap_or(defaults.probes);
    let interval_secs = topic.interval.unwrap_or(defaults.interval_secs);
    let update_url = topic.update_url.unwrap_or_default();

    let hosts = topic
        .hosts
        .into_iter()
        .map(|host| {
            let ip: Ipv4Addr = host.host.parse().map_err(|_| {
                Error::InvalidInput(format!(
                    "'{}' in topic '{name}' is not an IPv4 address",
                    host.host
                ))
            })?;
            let spec = HostSpec {
                ip,
                alive: host.alive,
                probes: host.probes.unwrap_or(probes),
                interval_secs: host.interval.unwrap_or(interval_secs),
                update_url: host.update_url.unwrap_or_else(|| update_url.clone()),
            };
            validate_host(&spec)?;
            Ok(spec)
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(TopicSpec {
        name,
        probes,
        interval_secs,
        update_url,
        hosts,
    })
}

pub(crate) fn validate_host(spec: &HostSpec) -> Result<(), Error> {
    if spec.interval_secs < MIN_INTERVAL_SECS {
        return Err(Error::InvalidInput(format!(
            "Interval should be {MIN_INTERVAL_SECS}+ seconds, {} given",
            spec.interval_secs
        )));
    }
    if spec.probes < 1 {
        return Err(Error::InvalidInput(format!(
            "Probes should be 1+, {} given",
            spec.probes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULTS: Defaults = Defaults {
        probes: 3,
        interval_secs: 120,
    };

    fn decode(json: &str) -> Result<Vec<TopicSpec>, Error> {
        decode_topics(serde_json::from_str(json).unwrap(), DEFAULTS)
    }

    #[test]
    fn host_inherits_topic_then_global_defaults() {
        let topics = decode(
            r#"{"backbone": {
                "Interval": 60, "UpdateURL": "http://u/",
                "Hosts": [
                    {"host": "10.0.0.1"},
                    {"host": "10.0.0.2", "Probes": 8, "Interval": 30, "UpdateURL": ""}
                ]
            }}"#,
        )
        .unwrap();

        let topic = &topics[0];
        assert_eq!(topic.name, "backbone");
        // topic falls back to the global probe count
        assert_eq!(topic.probes, 3);
        assert_eq!(topic.interval_secs, 60);

        let inherited = &topic.hosts[0];
        assert_eq!(inherited.probes, 3);
        assert_eq!(inherited.interval_secs, 60);
        assert_eq!(inherited.update_url, "http://u/");
        assert!(!inherited.alive);

        let explicit = &topic.hosts[1];
        assert_eq!(explicit.probes, 8);
        assert_eq!(explicit.interval_secs, 30);
        assert_eq!(explicit.update_url, "");
    }

    #[test]
    fn alive_survives_decode() {
        let topics =
            decode(r#"{"t": {"Hosts": [{"host": "1.1.1.1", "alive": true}]}}"#).unwrap();
        assert!(topics[0].hosts[0].alive);
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(decode(r#"{"t": {"Hosts": [{"host": "nonsense"}]}}"#).is_err());
        // IPv6 is out of scope
        assert!(decode(r#"{"t": {"Hosts": [{"host": "::1"}]}}"#).is_err());
    }

    #[test]
    fn rejects_out_of_range_parameters() {
        let err = decode(r#"{"t": {"Hosts": [{"host": "1.1.1.1", "Interval": 10}]}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        assert!(decode(r#"{"t": {"Probes": 0, "Hosts": [{"host": "1.1.1.1"}]}}"#).is_err());
    }

    #[test]
    fn empty_topic_is_fine() {
        let topics = decode(r#"{"empty": {}}"#).unwrap();
        assert!(topics[0].hosts.is_empty());
        assert_eq!(topics[0].interval_secs, 120);
    }

    #[test]
    fn wire_round_trip_drops_unset_fields() {
        let topic = WireTopic {
            probes: Some(2),
            interval: Some(30),
            update_url: Some("http://u/".into()),
            hosts: vec![WireHost {
                host: "127.0.0.1".into(),
                alive: true,
                probes: None,
                interval: None,
                update_url: None,
            }],
        };
        let json = serde_json::to_string(&topic).unwrap();
        assert!(!json.contains(r#""Probes":null"#));
        let back: WireTopic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, topic);
    }
}
