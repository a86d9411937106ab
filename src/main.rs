mod cli;
mod kubernetes;
mod manager;
mod mux;
mod reconcile;
mod tail;
mod types;
mod utils;
mod watch;

use anyhow::Context;
use clap::Parser;
use std::io::{self, IsTerminal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cli::{Cli, ColorMode};
use kubernetes::{KubeLogs, KubePods, initialize_client, resolve_namespace};
use manager::TailManager;
use mux::{LINE_BUFFER, LineMultiplexer};
use reconcile::spawn_reconciler;
use watch::{MAX_WATCH_ERRORS, watch_pods};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.color {
        ColorMode::Always => crossterm::style::force_color_output(true),
        ColorMode::Never => crossterm::style::force_color_output(false),
        ColorMode::Auto => {
            if !std::io::stdout().is_terminal() {
                crossterm::style::force_color_output(false);
            }
        }
    }

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let filter = cli.target_filter()?;
    let options = cli.tail_options()?;
    let template = cli.prefix_template()?;

    let client = initialize_client(cli.kubeconfig.as_deref(), cli.context.as_deref()).await?;
    let namespace = resolve_namespace(&client, cli.namespace.as_deref(), cli.all_namespaces);
    debug!(
        "Watching pods in {}",
        namespace.as_deref().unwrap_or("all namespaces")
    );

    let shutdown = CancellationToken::new();
    let pods = KubePods::new(
        client.clone(),
        namespace.as_deref(),
        cli.selector.clone(),
        cli.field_selector.clone(),
    );
    let events = watch_pods(&pods, MAX_WATCH_ERRORS, shutdown.clone())
        .await
        .context("Failed to set up watch")?;
    let targets = spawn_reconciler(filter, events, shutdown.clone());

    let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
    let mux = tokio::spawn(LineMultiplexer::default().run(line_rx, std::io::stdout()));

    let manager = TailManager::new(KubeLogs::new(client), template, options, line_tx, shutdown.clone());
    let manager = tokio::spawn(manager.run(targets));

    supervise(tokio::signal::ctrl_c(), shutdown, manager, mux).await?;
    Ok(())
}

/// Cancel `shutdown` on interrupt, or as soon as the multiplexer stops
/// writing, then wait for the manager and the multiplexer to finish.
async fn supervise<W>(
    interrupt: impl Future<Output = io::Result<()>>,
    shutdown: CancellationToken,
    manager: JoinHandle<()>,
    mut mux: JoinHandle<io::Result<W>>,
) -> anyhow::Result<W> {
    let written = tokio::select! {
        signal = interrupt => {
            if let Err(err) = signal {
                shutdown.cancel();
                return Err(err).context("Failed to listen for Ctrl-C");
            }
            debug!("Interrupted, shutting down");
            None
        }
        written = &mut mux => {
            debug!("Output closed, shutting down");
            Some(written)
        }
    };
    shutdown.cancel();

    manager.await?;
    let written = match written {
        Some(written) => written,
        None => mux.await,
    };
    written?.context("Failed to write log output")
}
