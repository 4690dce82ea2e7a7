use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use craq::{Position, Replica};

/// A single replica of a chain-replicated key-value store.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Comma-separated replica addresses, head first, tail last.
    #[arg(long, env = "CRAQ_CHAIN", value_delimiter = ',', required = true)]
    chain: Vec<SocketAddr>,

    /// This replica's position within --chain.
    #[arg(long, env = "CRAQ_INDEX")]
    index: usize,

    #[command(flatten)]
    log: cli_common::LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli_common::init_logging(&cli.log);

    let Some(&tail) = cli.chain.last() else {
        anyhow::bail!("--chain must name at least one replica");
    };
    anyhow::ensure!(
        cli.index < cli.chain.len(),
        "--index {} is outside the {}-replica chain",
        cli.index,
        cli.chain.len()
    );

    let position = Position {
        prev: cli.index.checked_sub(1).map(|i| cli.chain[i]),
        next: cli.chain.get(cli.index + 1).copied(),
        tail,
    };
    let listen = cli.chain[cli.index];
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind replica port {listen}"))?;

    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c, shutting down");
            ctrl_c.cancel();
        }
    });

    Replica::new(format!("replica-{}", cli.index), position)
        .serve(listener, stop)
        .await
}
