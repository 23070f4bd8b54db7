#![allow(clippy::cognitive_complexity)]

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use external_api::ControlApi;
use pinger_core::{Monitor, trace};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// the default path to the config
static DEFAULT_CONFIG_PATH: &str = "/etc/pinger/pinger.toml";
/// tokio worker thread name
static DEFAULT_THREAD_NAME: &str = "pinger-worker";

#[derive(Parser, Debug, Clone)]
#[clap(author, name = "pinger", bin_name = "pinger", about, long_about = None)]
/// parses from cli & environment var
struct Cli {
    /// path to the pinger config
    #[clap(
        short,
        long,
        value_parser,
        env,
        default_value = DEFAULT_CONFIG_PATH
    )]
    config_path: PathBuf,
    /// set the log level; all valid RUST_LOG directives are accepted.
    /// Defaults to `info`, or `debug` when the config enables log.debug
    #[clap(long, env, value_parser)]
    pinger_log: Option<String>,
    /// worker thread name
    #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
    thread_name: String,
    /// number of worker threads; defaults to the number of logical CPUs
    #[clap(long, env, value_parser)]
    threads: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::parse(&cli.config_path)?;
    trace::init(cli.pinger_log.as_deref(), config.log_debug(), config.log_path())?;
    debug!(?cli);

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&cli.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = cli.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start daemon"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: config::Config) -> Result<()> {
    // dependency order: the raw socket first, then the engine around it,
    // then the HTTP front on top
    let monitor = Monitor::new(&config)?;

    let token = CancellationToken::new();
    monitor.start(token.clone());

    info!("listening on http://{}", config.listen());
    let api = ControlApi::new(config.listen(), monitor);
    let api_task = api.start();

    tokio::select! {
        ret = shutdown_signal(token.clone()) => {
            info!("shutting down");
            ret
        }
        ret = flatten(api_task) => {
            token.cancel();
            ret
        }
    }
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
