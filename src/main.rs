use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hostbind::binding::{Header, HostResponse, Namespace};
use hostbind::config::Config;
use hostbind::fs::{EmptyFs, Filesystem, FsResult};
use hostbind::fuse::FuseAttacher;
use hostbind::manager::{drain, metrics, BindingMetrics, HostAttacher, HostTable, Manager};
use hostbind::parse::{parse_requests, MountArgs};

/// Bind filesystem namespaces onto host paths and sockets.
#[derive(Parser, Debug)]
#[command(name = "hostbind", version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "HOSTBIND_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bind namespaces and keep them bound until interrupted
    Mount {
        /// Host API to bind through (fuse or 9p)
        #[arg(long)]
        api: Option<String>,

        /// Comma separated namespaces
        #[arg(long = "namespace")]
        namespaces: Option<String>,

        /// Comma separated targets, one per namespace
        #[arg(long = "target")]
        targets: Option<String>,

        /// Print binding metrics in Prometheus text format on exit
        #[arg(long)]
        metrics: bool,
    },

    /// Print the effective configuration
    Config,
}

fn empty_filesystem(namespace: Namespace) -> FsResult<Arc<dyn Filesystem>> {
    tracing::debug!(%namespace, "serving empty tree");
    Ok(Arc::new(EmptyFs))
}

fn hosts() -> HostTable {
    HostTable {
        fuse: Box::new(
            |_: Header, cancel: CancellationToken, fs: Arc<dyn Filesystem>| -> anyhow::Result<Arc<dyn HostAttacher>> {
                Ok(Arc::new(FuseAttacher::new(cancel, fs)?))
            },
        ),
        ninep: Box::new(
            |header: Header, _: CancellationToken, _: Arc<dyn Filesystem>| -> anyhow::Result<Arc<dyn HostAttacher>> {
                anyhow::bail!("no 9P protocol server linked for {header}")
            },
        ),
    }
}

fn print_outcome(verb: &str, header: Option<Header>, response: &HostResponse) {
    let header = header.map(|h| h.to_string()).unwrap_or_default();
    let target = response.request.as_ref().map(|r| r.to_string()).unwrap_or_default();
    match &response.result {
        Ok(_) => println!("{verb} {header}{target}"),
        Err(err) => println!("failed {header}{target}: {err}"),
    }
}

async fn mount(config: &Config, args: MountArgs, print_metrics: bool) -> anyhow::Result<()> {
    let requests = parse_requests(&args, config)?;

    let registry = prometheus::Registry::new();
    let binding_metrics = BindingMetrics::new(&registry).context("Failed to register metrics")?;
    let manager = Manager::with_metrics(
        CancellationToken::new(),
        Arc::new(empty_filesystem),
        hosts(),
        binding_metrics,
    );

    let mut bound = 0;
    for (header, response) in drain(manager.attach(requests)).await {
        bound += usize::from(response.is_ok());
        print_outcome("bound", header, &response);
    }

    if bound > 0 {
        tracing::info!(bound, "Press Ctrl-C to unmount");
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    }

    for (header, response) in manager.close().await {
        print_outcome("unbound", header, &response);
    }
    if print_metrics {
        print!("{}", metrics::render(&registry).context("Failed to encode metrics")?);
    }
    if bound == 0 {
        anyhow::bail!("nothing was bound");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostbind=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Mount { api, namespaces, targets, metrics } => {
            tracing::info!("Starting hostbind");
            mount(&config, MountArgs { api, namespaces, targets }, metrics).await
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
