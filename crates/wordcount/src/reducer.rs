//! The reducer accepts one durable TCP link per mapper, aligns checkpoint
//! markers across all of them, and serially applies commands against its
//! aggregate. Counts tagged with a stale recovery epoch are dropped, which
//! is what makes replay after a failure idempotent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::{checkpoint, net};
use wire::control::ControlMessage;
use wire::stream::DataMessage;
use wire::RecordCodec;

#[derive(Debug, Clone)]
pub struct Config {
    pub idx: usize,
    /// Port serving both the mapper data links (TCP) and coordinator
    /// traffic (UDP).
    pub listen: SocketAddr,
    pub coordinator: SocketAddr,
    pub num_mappers: usize,
    pub checkpoint_dir: PathBuf,
    pub heartbeat_interval: Duration,
}

impl Config {
    pub fn id(&self) -> String {
        format!("reducer_{}", self.idx)
    }
}

#[derive(Debug)]
enum Command {
    WordCount {
        word: String,
        count: u64,
        recovery_id: u64,
    },
    Marker {
        checkpoint_id: i64,
    },
    Recover {
        checkpoint_id: i64,
        recovery_id: u64,
    },
    Exit,
}

/// One recovery epoch's worth of marker-alignment state. Swapped wholesale
/// on recovery: anything parked at a superseded barrier is released
/// through its cancellation token instead.
struct Epoch {
    barrier: tokio::sync::Barrier,
    cancel: CancellationToken,
}

impl Epoch {
    fn new(parties: usize) -> Arc<Self> {
        Arc::new(Self {
            barrier: tokio::sync::Barrier::new(parties),
            cancel: CancellationToken::new(),
        })
    }
}

/// State shared between the acceptor, the per-mapper input handlers, and
/// the command worker.
struct Shared {
    id: String,
    num_mappers: usize,
    /// Most recent marker observed per mapper.
    markers: std::sync::Mutex<Vec<i64>>,
    epoch: std::sync::Mutex<Arc<Epoch>>,
    queue: mpsc::UnboundedSender<Command>,
}

impl Shared {
    /// Record `checkpoint_id` from mapper `source_id`. True when every
    /// mapper's most recent marker equals `checkpoint_id`, i.e. the cut is
    /// aligned.
    fn observe_marker(&self, source_id: usize, checkpoint_id: i64) -> bool {
        let mut markers = self.markers.lock().unwrap();
        match markers.get_mut(source_id) {
            Some(slot) => *slot = checkpoint_id,
            None => {
                tracing::error!(id = %self.id, source_id, "marker from an unknown mapper");
                return false;
            }
        }
        markers.iter().all(|&marker| marker == checkpoint_id)
    }

    fn current_epoch(&self) -> Arc<Epoch> {
        self.epoch.lock().unwrap().clone()
    }

    /// Begin a fresh epoch: cancel live handlers and reset the barrier and
    /// the marker alignment.
    fn begin_epoch(&self) {
        let fresh = Epoch::new(self.num_mappers);
        let stale = std::mem::replace(&mut *self.epoch.lock().unwrap(), fresh);
        stale.cancel.cancel();
        *self.markers.lock().unwrap() = vec![wire::NO_CHECKPOINT; self.num_mappers];
    }
}

struct State {
    id: String,
    wc: HashMap<String, u64>,
    last_recovery_id: u64,
    last_cp_id: i64,
}

/// Serve mapper links and coordinator commands until EXIT arrives. A
/// command-handler failure aborts the reducer (fail-stop): the binary
/// exits non-zero and the coordinator drives recovery.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let id = cfg.id();
    let listener = TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("binding reducer data port {}", cfg.listen))?;
    let control = Arc::new(
        UdpSocket::bind(cfg.listen)
            .await
            .with_context(|| format!("binding reducer control socket {}", cfg.listen))?,
    );
    tracing::info!(id, addr = %cfg.listen, mappers = cfg.num_mappers, "reducer serving");

    let stop = CancellationToken::new();
    let _stop_guard = stop.clone().drop_guard();

    let (queue, commands) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        id: id.clone(),
        num_mappers: cfg.num_mappers,
        markers: std::sync::Mutex::new(vec![wire::NO_CHECKPOINT; cfg.num_mappers]),
        epoch: std::sync::Mutex::new(Epoch::new(cfg.num_mappers)),
        queue: queue.clone(),
    });

    tokio::spawn(listen_for_commands(
        control.clone(),
        queue,
        id.clone(),
        stop.clone(),
    ));
    tokio::spawn(net::heartbeat(
        control.clone(),
        cfg.coordinator,
        id.clone(),
        cfg.heartbeat_interval,
        stop.clone(),
    ));
    tokio::spawn(accept_loop(listener, shared.clone(), stop.clone()));

    let state = State {
        id,
        wc: HashMap::new(),
        last_recovery_id: 0,
        last_cp_id: wire::NO_CHECKPOINT,
    };
    let result = command_worker(commands, state, &shared, &control, &cfg).await;
    shared.current_epoch().cancel.cancel();
    result
}

/// Serially apply queued commands against the aggregate.
async fn command_worker(
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut state: State,
    shared: &Shared,
    control: &UdpSocket,
    cfg: &Config,
) -> anyhow::Result<()> {
    while let Some(command) = commands.recv().await {
        match command {
            Command::WordCount {
                word,
                count,
                recovery_id,
            } => {
                if recovery_id == state.last_recovery_id {
                    *state.wc.entry(word).or_default() += count;
                } else {
                    tracing::warn!(
                        id = %state.id,
                        recovery_id,
                        current = state.last_recovery_id,
                        word,
                        "dropping stale word count"
                    );
                }
            }
            Command::Marker { checkpoint_id } => {
                checkpoint::write_counts(&cfg.checkpoint_dir, &state.id, checkpoint_id, &state.wc)
                    .await?;
                state.last_cp_id = checkpoint_id;
                tracing::info!(id = %state.id, checkpoint_id, words = state.wc.len(), "checkpoint written");

                let ack = if checkpoint_id == wire::LAST_CHECKPOINT_ID {
                    ControlMessage::LastCheckpointAck {
                        source: state.id.clone(),
                        checkpoint_id,
                    }
                } else {
                    ControlMessage::CheckpointAck {
                        source: state.id.clone(),
                        checkpoint_id,
                    }
                };
                net::send_control(control, cfg.coordinator, &ack).await?;
            }
            Command::Recover {
                checkpoint_id,
                recovery_id,
            } => {
                shared.begin_epoch();
                state.wc = if checkpoint_id >= 0 {
                    checkpoint::read_counts(&cfg.checkpoint_dir, &state.id, checkpoint_id).await?
                } else {
                    HashMap::new()
                };
                state.last_recovery_id = recovery_id;
                tracing::info!(id = %state.id, checkpoint_id, recovery_id, "recovered");

                let ack = ControlMessage::RecoveryAck {
                    source: state.id.clone(),
                    recovery_id,
                };
                net::send_control(control, cfg.coordinator, &ack).await?;
            }
            Command::Exit => {
                tracing::info!(id = %state.id, wc = ?state.wc, "exiting");
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, stop: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = stop.cancelled() => return,
        };
        let Ok((socket, addr)) = accepted else {
            continue;
        };
        tracing::info!(id = %shared.id, %addr, "accepted mapper connection");
        tokio::spawn(handle_mapper(socket, shared.clone()));
    }
}

/// Length-framed reads from one mapper. Counts are lifted onto the command
/// queue; an aligned marker enqueues the checkpoint, and the handler then
/// holds its channel at the barrier so no post-marker count is enqueued
/// ahead of the snapshot. The handler outlives recoveries — its link dies
/// only when the mapper hangs up — so the epoch is resolved per marker,
/// never captured at accept time.
async fn handle_mapper(socket: TcpStream, shared: Arc<Shared>) {
    let mut frames = FramedRead::new(socket, RecordCodec);

    loop {
        let Some(frame) = frames.next().await else {
            break; // mapper hung up
        };
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(id = %shared.id, error = %err, "malformed record, skipping");
                continue;
            }
        };

        match message {
            DataMessage::WordCount {
                key,
                value,
                last_recovery_id,
                ..
            } => {
                let command = Command::WordCount {
                    word: key,
                    count: value,
                    recovery_id: last_recovery_id,
                };
                if shared.queue.send(command).is_err() {
                    break;
                }
            }
            DataMessage::ForwardCheckpoint {
                source_id,
                checkpoint_id,
                ..
            } => {
                if checkpoint_id < 0 {
                    continue;
                }
                let epoch = shared.current_epoch();
                if shared.observe_marker(source_id, checkpoint_id) {
                    tracing::info!(id = %shared.id, checkpoint_id, "markers aligned");
                    if shared.queue.send(Command::Marker { checkpoint_id }).is_err() {
                        break;
                    }
                }
                // A recovery that lands while this channel is held here
                // supersedes the barrier; the stale epoch's token releases
                // the handler.
                tokio::select! {
                    _ = epoch.barrier.wait() => (),
                    _ = epoch.cancel.cancelled() => (),
                }
            }
        }
    }
    tracing::debug!(id = %shared.id, "mapper handler exiting");
}

async fn listen_for_commands(
    socket: Arc<UdpSocket>,
    queue: mpsc::UnboundedSender<Command>,
    id: String,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; wire::DATAGRAM_LEN];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = stop.cancelled() => return,
        };
        let (n, from) = match received {
            Ok(received) => received,
            Err(err) => {
                tracing::error!(id, error = %err, "control socket failed");
                continue;
            }
        };
        let message = match ControlMessage::decode(&buf[..n]) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(id, error = %err, "malformed control datagram");
                continue;
            }
        };
        tracing::debug!(id, ?message, %from, "control message");

        let command = match message {
            ControlMessage::Recover {
                checkpoint_id,
                recovery_id,
                ..
            } => Command::Recover {
                checkpoint_id,
                recovery_id,
            },
            ControlMessage::Exit { .. } => Command::Exit,
            other => {
                tracing::warn!(id, ?other, "unexpected control message");
                continue;
            }
        };
        if queue.send(command).is_err() {
            return;
        }
    }
}
