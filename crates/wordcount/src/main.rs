use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use wordcount::broker::MemoryBroker;
use wordcount::{coordinator, mapper, reducer};

/// A fault-tolerant distributed word-count engine.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    #[command(subcommand)]
    role: Role,

    #[command(flatten)]
    log: cli_common::LogArgs,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Map one input partition into word counts.
    Mapper(MapperArgs),
    /// Aggregate counts arriving from every mapper.
    Reducer(ReducerArgs),
    /// Drive checkpoints, liveness, and recovery for a topology.
    Coordinator(CoordinatorArgs),
}

#[derive(Debug, Args)]
struct MapperArgs {
    /// This mapper's position within the topology.
    #[arg(long, env = "WC_INDEX")]
    index: usize,
    /// Address of the control (datagram) socket.
    #[arg(long, env = "WC_LISTEN")]
    listen: SocketAddr,
    /// Comma-separated reducer data addresses.
    #[arg(long, env = "WC_REDUCERS", value_delimiter = ',', required = true)]
    reducers: Vec<SocketAddr>,
    #[arg(long, env = "WC_COORDINATOR", default_value = "127.0.0.1:9700")]
    coordinator: SocketAddr,
    /// Text file backing this mapper's input stream, one record per line.
    #[arg(long)]
    input: PathBuf,
    #[arg(long, env = "WC_CHECKPOINT_DIR", default_value = "checkpoints")]
    checkpoint_dir: PathBuf,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    heartbeat_interval: Duration,
    /// Fault injection: abort the process after mapping N records.
    #[arg(long)]
    crash_after: Option<u64>,
    /// Fault injection: sleep this long per record.
    #[arg(long, value_parser = humantime::parse_duration)]
    slow: Option<Duration>,
}

#[derive(Debug, Args)]
struct ReducerArgs {
    /// This reducer's position within the topology.
    #[arg(long, env = "WC_INDEX")]
    index: usize,
    /// Port serving mapper links (TCP) and coordinator traffic (UDP).
    #[arg(long, env = "WC_LISTEN")]
    listen: SocketAddr,
    #[arg(long, env = "WC_COORDINATOR", default_value = "127.0.0.1:9700")]
    coordinator: SocketAddr,
    /// Number of mappers whose markers must align per checkpoint.
    #[arg(long, env = "WC_NUM_MAPPERS")]
    num_mappers: usize,
    #[arg(long, env = "WC_CHECKPOINT_DIR", default_value = "checkpoints")]
    checkpoint_dir: PathBuf,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    heartbeat_interval: Duration,
}

#[derive(Debug, Args)]
struct CoordinatorArgs {
    #[arg(long, env = "WC_LISTEN", default_value = "127.0.0.1:9700")]
    listen: SocketAddr,
    /// Comma-separated mapper control addresses.
    #[arg(long, value_delimiter = ',', required = true)]
    mappers: Vec<SocketAddr>,
    /// Comma-separated reducer control addresses.
    #[arg(long, value_delimiter = ',', required = true)]
    reducers: Vec<SocketAddr>,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    checkpoint_interval: Duration,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "3s")]
    heartbeat_timeout: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli_common::init_logging(&cli.log);

    match cli.role {
        Role::Mapper(args) => {
            let stream = format!("partition-{}", args.index);
            let text = std::fs::read_to_string(&args.input)
                .with_context(|| format!("reading input {}", args.input.display()))?;
            let mut broker = MemoryBroker::new();
            broker.load_lines(&stream, &text);

            mapper::run(
                mapper::Config {
                    idx: args.index,
                    listen: args.listen,
                    reducers: args.reducers,
                    coordinator: args.coordinator,
                    stream,
                    checkpoint_dir: args.checkpoint_dir,
                    heartbeat_interval: args.heartbeat_interval,
                    crash_after: args.crash_after,
                    slow: args.slow,
                },
                Arc::new(broker),
            )
            .await
        }
        Role::Reducer(args) => {
            reducer::run(reducer::Config {
                idx: args.index,
                listen: args.listen,
                coordinator: args.coordinator,
                num_mappers: args.num_mappers,
                checkpoint_dir: args.checkpoint_dir,
                heartbeat_interval: args.heartbeat_interval,
            })
            .await
        }
        Role::Coordinator(args) => {
            coordinator::run(coordinator::Config {
                listen: args.listen,
                mappers: args.mappers,
                reducers: args.reducers,
                checkpoint_interval: args.checkpoint_interval,
                heartbeat_timeout: args.heartbeat_timeout,
            })
            .await
        }
    }
}
