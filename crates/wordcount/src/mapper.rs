//! The mapper owns one input partition. It tokenizes records, partitions
//! words across the reducer links, and participates in checkpointing by
//! persisting its stream cursor and forwarding markers in-band on the
//! same channels as the counts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::SinkExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::{checkpoint, net, partition};
use wire::control::ControlMessage;
use wire::stream::DataMessage;
use wire::RecordCodec;

const CONNECT_RETRY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct Config {
    pub idx: usize,
    /// Datagram socket for coordinator traffic.
    pub listen: SocketAddr,
    pub reducers: Vec<SocketAddr>,
    pub coordinator: SocketAddr,
    /// Name of the input stream this mapper owns.
    pub stream: String,
    pub checkpoint_dir: PathBuf,
    pub heartbeat_interval: Duration,
    /// Fault injection: abort the process after mapping this many records.
    pub crash_after: Option<u64>,
    /// Fault injection: sleep this long per record.
    pub slow: Option<Duration>,
}

impl Config {
    pub fn id(&self) -> String {
        format!("mapper_{}", self.idx)
    }
}

/// Coordinator instructions, lifted off the datagram socket onto the
/// command queue so the mapping loop applies them between records.
#[derive(Debug)]
enum Command {
    Checkpoint { checkpoint_id: i64, recovery_id: u64 },
    Recover { checkpoint_id: i64, recovery_id: u64 },
    Exit,
}

type Link = FramedWrite<TcpStream, RecordCodec>;

struct Mapper {
    cfg: Config,
    id: String,
    control: Arc<UdpSocket>,
    links: Vec<Link>,
    cursor: String,
    last_recovery_id: u64,
    last_cp_id: i64,
    drained: bool,
    records_read: u64,
}

/// Connect to every reducer and run until EXIT arrives.
pub async fn run(cfg: Config, broker: Arc<dyn Broker>) -> anyhow::Result<()> {
    let id = cfg.id();
    let control = Arc::new(
        UdpSocket::bind(cfg.listen)
            .await
            .with_context(|| format!("binding mapper control socket {}", cfg.listen))?,
    );

    // Auxiliary loops die with this future, even if it is dropped mid-run.
    let stop = CancellationToken::new();
    let _stop_guard = stop.clone().drop_guard();

    let (queue, mut commands) = mpsc::unbounded_channel();
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

    tracing::info!(id, reducers = cfg.reducers.len(), "connecting to reducers");
    let links = connect_links(&cfg.reducers).await;

    let mut mapper = Mapper {
        id,
        control,
        links,
        cursor: wire::ORIGIN_CURSOR.to_string(),
        last_recovery_id: 0,
        last_cp_id: wire::NO_CHECKPOINT,
        drained: false,
        records_read: 0,
        cfg,
    };

    loop {
        let command = if mapper.drained {
            // Nothing left to map: block until the coordinator speaks.
            match commands.recv().await {
                Some(command) => Some(command),
                None => return Ok(()),
            }
        } else {
            match commands.try_recv() {
                Ok(command) => Some(command),
                Err(mpsc::error::TryRecvError::Empty) => None,
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
            }
        };

        match command {
            Some(Command::Checkpoint {
                checkpoint_id,
                recovery_id,
            }) => {
                if let Err(err) = mapper.checkpoint(checkpoint_id, recovery_id).await {
                    tracing::error!(id = %mapper.id, checkpoint_id, error = %err, "checkpoint failed");
                }
            }
            Some(Command::Recover {
                checkpoint_id,
                recovery_id,
            }) => {
                if let Err(err) = mapper.recover(checkpoint_id, recovery_id).await {
                    tracing::error!(id = %mapper.id, checkpoint_id, recovery_id, error = %err, "recovery failed");
                }
            }
            Some(Command::Exit) => {
                tracing::info!(id = %mapper.id, "exiting");
                return Ok(());
            }
            None => {
                if let Err(err) = mapper.map_next(broker.as_ref()).await {
                    tracing::error!(id = %mapper.id, error = %err, "mapping a record failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl Mapper {
    /// Map one record: tokenize, count, and ship each distinct word to its
    /// reducer. An empty broker read drains the mapper and reports DONE.
    async fn map_next(&mut self, broker: &dyn Broker) -> anyhow::Result<()> {
        let Some(record) = broker.read_after(&self.cfg.stream, &self.cursor).await? else {
            self.drained = true;
            tracing::info!(id = %self.id, "input stream drained, reporting DONE");
            self.to_coordinator(&ControlMessage::Done {
                source: self.id.clone(),
            })
            .await?;
            return Ok(());
        };

        if let Some(delay) = self.cfg.slow {
            tracing::warn!(id = %self.id, "fault injection: sleeping");
            tokio::time::sleep(delay).await;
        }

        let mut counts: HashMap<&str, u64> = HashMap::new();
        for word in record.text.split_whitespace() {
            *counts.entry(word).or_default() += 1;
        }

        for (word, count) in counts {
            let target = partition::route_word(word, self.links.len());
            let message = DataMessage::WordCount {
                source: self.id.clone(),
                key: word.to_string(),
                value: count,
                last_recovery_id: self.last_recovery_id,
            };
            self.links[target]
                .send(message)
                .await
                .with_context(|| format!("sending WORD_COUNT to reducer {target}"))?;
        }

        self.cursor = record.id;
        self.records_read += 1;

        if self.cfg.crash_after == Some(self.records_read) {
            tracing::error!(id = %self.id, records = self.records_read, "fault injection: crashing");
            std::process::abort();
        }
        Ok(())
    }

    /// Persist the cursor, forward the marker on every data channel, and
    /// ack the coordinator. Sending the marker in-band guarantees every
    /// count mapped before this point is delivered before the marker.
    async fn checkpoint(&mut self, checkpoint_id: i64, recovery_id: u64) -> anyhow::Result<()> {
        checkpoint::write_cursor(&self.cfg.checkpoint_dir, &self.id, checkpoint_id, &self.cursor)
            .await?;
        self.last_cp_id = checkpoint_id;

        let marker = DataMessage::ForwardCheckpoint {
            source: self.id.clone(),
            source_id: self.cfg.idx,
            checkpoint_id,
            recovery_id,
        };
        for (target, link) in self.links.iter_mut().enumerate() {
            if let Err(err) = link.send(marker.clone()).await {
                tracing::error!(id = %self.id, checkpoint_id, target, error = %err, "forwarding checkpoint marker failed");
            }
        }
        tracing::info!(id = %self.id, checkpoint_id, cursor = %self.cursor, "checkpointed");

        let ack = if checkpoint_id == wire::LAST_CHECKPOINT_ID {
            ControlMessage::LastCheckpointAck {
                source: self.id.clone(),
                checkpoint_id,
            }
        } else {
            ControlMessage::CheckpointAck {
                source: self.id.clone(),
                checkpoint_id,
            }
        };
        self.to_coordinator(&ack).await
    }

    /// Reopen the data channels, rewind to the checkpointed cursor (or the
    /// stream origin), and enter the new recovery epoch.
    async fn recover(&mut self, checkpoint_id: i64, recovery_id: u64) -> anyhow::Result<()> {
        tracing::info!(id = %self.id, checkpoint_id, recovery_id, "recovering");
        self.links = connect_links(&self.cfg.reducers).await;

        self.cursor = if checkpoint_id == wire::NO_CHECKPOINT {
            wire::ORIGIN_CURSOR.to_string()
        } else {
            checkpoint::read_cursor(&self.cfg.checkpoint_dir, &self.id, checkpoint_id).await?
        };
        self.last_recovery_id = recovery_id;
        self.drained = false;
        tracing::info!(id = %self.id, cursor = %self.cursor, "recovered");

        self.to_coordinator(&ControlMessage::RecoveryAck {
            source: self.id.clone(),
            recovery_id,
        })
        .await
    }

    async fn to_coordinator(&self, message: &ControlMessage) -> anyhow::Result<()> {
        net::send_control(&self.control, self.cfg.coordinator, message).await
    }
}

/// Dial every reducer, retrying each until it answers: reducers may still
/// be coming up, or re-binding after a recovery.
async fn connect_links(reducers: &[SocketAddr]) -> Vec<Link> {
    let mut links = Vec::with_capacity(reducers.len());
    for &addr in reducers {
        let socket = loop {
            match TcpStream::connect(addr).await {
                Ok(socket) => break socket,
                Err(err) => {
                    tracing::warn!(%addr, error = %err, "reducer not reachable yet, retrying");
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        };
        links.push(FramedWrite::new(socket, RecordCodec));
    }
    links
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
            ControlMessage::Checkpoint {
                checkpoint_id,
                recovery_id,
                ..
            } => Command::Checkpoint {
                checkpoint_id,
                recovery_id,
            },
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
