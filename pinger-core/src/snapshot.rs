//! Best-effort persistence of the topic catalog.
//!
//! The snapshot file holds the same topics document the bulk registration
//! endpoints speak, so a restored catalog goes through the ordinary merge
//! path. Saves replace the file atomically (write-then-rename); every
//! failure here is logged and otherwise ignored.

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::metrics;
use crate::wire::TopicsDoc;

/// Read and decode the snapshot file. Failures are logged and treated as an
/// empty catalog.
pub fn load(path: &Path) -> Option<TopicsDoc> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(err) => {
            error!(path = %path.display(), %err, "cannot read saved hosts");
            return None;
        }
    };
    match serde_json::from_slice(&contents) {
        Ok(doc) => Some(doc),
        Err(err) => {
            error!(path = %path.display(), %err, "cannot parse saved hosts");
            None
        }
    }
}

/// Serialize the catalog and atomically replace the snapshot file.
pub fn save(catalog: &Catalog, path: &Path) -> Result<()> {
    let json = serde_json::to_vec(&catalog.dump())?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut file = tempfile::NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;
    file.write_all(&json)?;
    file.persist(path)?;
    metrics::SNAPSHOT_SAVE_COUNT.inc();
    Ok(())
}

/// Spawn the periodic saver.
pub fn start_saver(
    catalog: Arc<Catalog>,
    path: PathBuf,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!("snapshot loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match save(&catalog, &path) {
                        Ok(()) => debug!("hosts saved"),
                        Err(err) => error!(path = %path.display(), %err, "cannot save hosts"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyBuffer;
    use crate::testing::MockProber;
    use crate::wire::{self, Defaults};

    const DEFAULTS: Defaults = Defaults {
        probes: 3,
        interval_secs: 120,
    };

    fn catalog() -> Arc<Catalog> {
        Catalog::new(MockProber::alive(), NotifyBuffer::new().unwrap(), DEFAULTS)
    }

    #[tokio::test]
    async fn save_then_load_reproduces_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");

        let original = catalog();
        original.get_or_store(
            wire::decode_topics(
                serde_json::from_str(
                    r#"{"T1": {"Probes": 2, "Interval": 60, "UpdateURL": "http://u/",
                        "Hosts": [{"host": "1.1.1.1", "alive": true},
                                  {"host": "2.2.2.2", "Probes": 5}]}}"#,
                )
                .unwrap(),
                DEFAULTS,
            )
            .unwrap(),
            false,
        );

        save(&original, &path).unwrap();

        let doc = load(&path).unwrap();
        let restored = catalog();
        restored.get_or_store(wire::decode_topics(doc, DEFAULTS).unwrap(), false);

        assert_eq!(restored.dump(), original.dump());
        let hosts = &restored.dump()["T1"].hosts;
        assert!(hosts.iter().any(|h| h.host == "1.1.1.1" && h.alive));
    }

    #[tokio::test]
    async fn save_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        std::fs::write(&path, b"not json").unwrap();

        // a corrupt file loads as empty
        assert!(load(&path).is_none());

        save(&catalog(), &path).unwrap();
        assert!(load(&path).is_some());
    }

    #[test]
    fn missing_file_loads_as_empty() {
        assert!(load(Path::new("/nonexistent/pinger-hosts.json")).is_none());
    }
}
