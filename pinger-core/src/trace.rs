//! tracing configuration

use anyhow::Result;
use tracing_subscriber::{
    filter::EnvFilter, fmt, prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

use std::{fs::OpenOptions, path::Path, sync::Arc};

/// Initialize the global subscriber.
///
/// `directive` is a `RUST_LOG`-style filter; when absent, `log.debug` from
/// the config picks between `debug` and `info`. When `log_path` is set, logs
/// are appended there (without ANSI escapes) in addition to stderr.
pub fn init(directive: Option<&str>, debug: bool, log_path: Option<&Path>) -> Result<()> {
    let filter = match directive {
        Some(directive) => EnvFilter::try_new(directive)?,
        None => EnvFilter::try_new(if debug { "debug" } else { "info" })?,
    }
    .add_directive("hyper=off".parse()?);

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer());
    match log_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .init();
        }
        None => registry.init(),
    }
    Ok(())
}
