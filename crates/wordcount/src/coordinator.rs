//! The coordinator drives the job from outside: periodic checkpoint
//! epochs toward the mappers, liveness tracking over worker heartbeats,
//! recovery when a worker goes quiet, and EXIT once every mapper has
//! drained and the final checkpoint is durable.
//!
//! Reducers never hear CHECKPOINT directly; their markers arrive in-band
//! through the mappers. Recovery runs in two phases — reducers first,
//! then mappers — so a recovered mapper can never replay new-epoch counts
//! at a reducer still sitting in the old epoch.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::UdpSocket;

use crate::net;
use wire::control::ControlMessage;

const SOURCE: &str = "coordinator";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// Control addresses of every mapper.
    pub mappers: Vec<SocketAddr>,
    /// Control addresses of every reducer.
    pub reducers: Vec<SocketAddr>,
    pub checkpoint_interval: Duration,
    pub heartbeat_timeout: Duration,
}

/// An operation the coordinator has broadcast and is collecting acks for.
/// Checkpoints and recoveries never overlap; a recovery preempts an
/// incomplete checkpoint.
#[derive(Debug)]
enum Pending {
    Checkpoint { checkpoint_id: i64, acks: HashSet<String> },
    RecoveringReducers { recovery_id: u64, acks: HashSet<String> },
    RecoveringMappers { recovery_id: u64, acks: HashSet<String> },
}

/// Workers are addressed by topology position and named by convention:
/// `mapper_<idx>` / `reducer_<idx>`, matching the workers' own ids.
fn worker_id(kind: &str, idx: usize) -> String {
    format!("{kind}_{idx}")
}

/// Run the job to completion: returns once every worker has been told to
/// EXIT after the final checkpoint became durable.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(cfg.listen)
        .await
        .with_context(|| format!("binding coordinator socket {}", cfg.listen))?;

    let num_workers = cfg.mappers.len() + cfg.reducers.len();
    let workers: Vec<SocketAddr> = cfg
        .reducers
        .iter()
        .chain(cfg.mappers.iter())
        .copied()
        .collect();

    let mut beats: HashMap<String, Instant> = HashMap::new();
    let mut done: HashSet<String> = HashSet::new();
    let mut pending: Option<Pending> = None;
    let mut recovery_id: u64 = 0;
    let mut last_durable: i64 = wire::NO_CHECKPOINT;
    let mut next_checkpoint: i64 = 1;

    // The first checkpoint waits one full interval: workers may still be
    // binding their sockets when the job starts.
    let mut checkpoint_tick = tokio::time::interval_at(
        tokio::time::Instant::now() + cfg.checkpoint_interval,
        cfg.checkpoint_interval,
    );
    checkpoint_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut liveness_tick = tokio::time::interval(cfg.heartbeat_timeout / 2);
    let mut buf = vec![0u8; wire::DATAGRAM_LEN];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, _) = received.context("coordinator socket failed")?;
                let message = match ControlMessage::decode(&buf[..n]) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::error!(error = %err, "malformed datagram");
                        continue;
                    }
                };
                match message {
                    ControlMessage::Heartbeat { source } => {
                        beats.insert(source, Instant::now());
                    }
                    ControlMessage::Done { source } => {
                        tracing::info!(source, "mapper drained");
                        done.insert(source);
                    }
                    ControlMessage::CheckpointAck { source, checkpoint_id }
                    | ControlMessage::LastCheckpointAck { source, checkpoint_id } => {
                        let Some(Pending::Checkpoint { checkpoint_id: want, acks }) = &mut pending else {
                            continue;
                        };
                        if checkpoint_id != *want {
                            continue;
                        }
                        acks.insert(source);
                        if acks.len() == num_workers {
                            last_durable = checkpoint_id;
                            tracing::info!(checkpoint_id, "checkpoint durable");
                            pending = None;

                            if checkpoint_id == wire::LAST_CHECKPOINT_ID {
                                // Job complete: aggregates are on disk.
                                broadcast(&socket, &workers, &ControlMessage::Exit {
                                    source: SOURCE.to_string(),
                                }).await;
                                tracing::info!("job drained, EXIT sent");
                                return Ok(());
                            }
                        }
                    }
                    ControlMessage::RecoveryAck { source, recovery_id: acked } => {
                        match &mut pending {
                            Some(Pending::RecoveringReducers { recovery_id: want, acks })
                                if acked == *want =>
                            {
                                acks.insert(source);
                                if acks.len() == cfg.reducers.len() {
                                    tracing::info!(recovery_id = acked, "reducers recovered, recovering mappers");
                                    broadcast(&socket, &cfg.mappers, &ControlMessage::Recover {
                                        source: SOURCE.to_string(),
                                        checkpoint_id: last_durable,
                                        recovery_id: acked,
                                    }).await;
                                    pending = Some(Pending::RecoveringMappers {
                                        recovery_id: acked,
                                        acks: HashSet::new(),
                                    });
                                }
                            }
                            Some(Pending::RecoveringMappers { recovery_id: want, acks })
                                if acked == *want =>
                            {
                                acks.insert(source);
                                if acks.len() == cfg.mappers.len() {
                                    tracing::info!(recovery_id = acked, "recovery complete");
                                    pending = None;
                                }
                            }
                            _ => (),
                        }
                    }
                    other => tracing::warn!(?other, "unexpected message at coordinator"),
                }
            }
            _ = checkpoint_tick.tick() => {
                match &pending {
                    None if done.len() < cfg.mappers.len() => {
                        let checkpoint_id = next_checkpoint;
                        next_checkpoint += 1;
                        tracing::info!(checkpoint_id, recovery_id, "starting checkpoint");
                        broadcast(&socket, &cfg.mappers, &ControlMessage::Checkpoint {
                            source: SOURCE.to_string(),
                            checkpoint_id,
                            recovery_id,
                        }).await;
                        pending = Some(Pending::Checkpoint { checkpoint_id, acks: HashSet::new() });
                    }
                    // A full interval has passed without completing: the
                    // CHECKPOINT datagram may have been lost. Re-send it to
                    // the mappers that have not acked.
                    Some(Pending::Checkpoint { checkpoint_id, acks }) => {
                        let message = ControlMessage::Checkpoint {
                            source: SOURCE.to_string(),
                            checkpoint_id: *checkpoint_id,
                            recovery_id,
                        };
                        for (idx, &addr) in cfg.mappers.iter().enumerate() {
                            if !acks.contains(&worker_id("mapper", idx)) {
                                tracing::warn!(checkpoint_id, idx, "re-sending CHECKPOINT");
                                if let Err(err) = net::send_control(&socket, addr, &message).await {
                                    tracing::error!(%addr, error = %err, "control send failed");
                                }
                            }
                        }
                    }
                    _ => (),
                }
            }
            _ = liveness_tick.tick() => {
                match &pending {
                    // Workers restarted after a crash may have missed the
                    // broadcast: keep RECOVER flowing until the phase acks.
                    Some(Pending::RecoveringReducers { recovery_id, acks }) => {
                        resend_recover(&socket, &cfg.reducers, "reducer", acks, last_durable, *recovery_id).await;
                    }
                    Some(Pending::RecoveringMappers { recovery_id, acks }) => {
                        resend_recover(&socket, &cfg.mappers, "mapper", acks, last_durable, *recovery_id).await;
                    }
                    _ => {
                        if beats.len() == num_workers
                            && beats.values().any(|at| at.elapsed() > cfg.heartbeat_timeout)
                        {
                            recovery_id += 1;
                            tracing::warn!(recovery_id, checkpoint_id = last_durable, "heartbeat missed, recovering");
                            done.clear();
                            beats.clear();
                            broadcast(&socket, &cfg.reducers, &ControlMessage::Recover {
                                source: SOURCE.to_string(),
                                checkpoint_id: last_durable,
                                recovery_id,
                            }).await;
                            pending = Some(Pending::RecoveringReducers { recovery_id, acks: HashSet::new() });
                        }
                    }
                }
            }
        }

        // Every mapper has drained and nothing is in flight: flush the
        // final checkpoint, whose acks trigger EXIT above.
        if pending.is_none() && !cfg.mappers.is_empty() && done.len() == cfg.mappers.len() {
            tracing::info!(recovery_id, "all mappers done, starting final checkpoint");
            broadcast(&socket, &cfg.mappers, &ControlMessage::Checkpoint {
                source: SOURCE.to_string(),
                checkpoint_id: wire::LAST_CHECKPOINT_ID,
                recovery_id,
            }).await;
            pending = Some(Pending::Checkpoint {
                checkpoint_id: wire::LAST_CHECKPOINT_ID,
                acks: HashSet::new(),
            });
        }
    }
}

async fn resend_recover(
    socket: &UdpSocket,
    addrs: &[SocketAddr],
    kind: &str,
    acks: &HashSet<String>,
    checkpoint_id: i64,
    recovery_id: u64,
) {
    let message = ControlMessage::Recover {
        source: SOURCE.to_string(),
        checkpoint_id,
        recovery_id,
    };
    for (idx, &addr) in addrs.iter().enumerate() {
        if !acks.contains(&worker_id(kind, idx)) {
            tracing::warn!(recovery_id, kind, idx, "re-sending RECOVER");
            if let Err(err) = net::send_control(socket, addr, &message).await {
                tracing::error!(%addr, error = %err, "control send failed");
            }
        }
    }
}

async fn broadcast(socket: &UdpSocket, workers: &[SocketAddr], message: &ControlMessage) {
    for &worker in workers {
        if let Err(err) = net::send_control(socket, worker, message).await {
            tracing::error!(%worker, error = %err, "control send failed");
        }
    }
}
