//! Marker alignment and epoch filtering at a single reducer, driven over
//! raw data links standing in for the mappers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;

use wire::control::ControlMessage;
use wire::stream::DataMessage;
use wire::RecordCodec;
use wordcount::{checkpoint, reducer};

mod support;
use support::Control;

const TIMEOUT: Duration = Duration::from_secs(10);

type Link = FramedWrite<TcpStream, RecordCodec>;

async fn connect(addr: SocketAddr) -> Link {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr).await {
            Ok(socket) => return FramedWrite::new(socket, RecordCodec),
            Err(err) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "reducer never came up: {err}"
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn send_count(link: &mut Link, source_id: usize, word: &str, count: u64, recovery_id: u64) {
    link.send(DataMessage::WordCount {
        source: format!("mapper_{source_id}"),
        key: word.to_string(),
        value: count,
        last_recovery_id: recovery_id,
    })
    .await
    .unwrap();
}

async fn send_marker(link: &mut Link, source_id: usize, checkpoint_id: i64, recovery_id: u64) {
    link.send(DataMessage::ForwardCheckpoint {
        source: format!("mapper_{source_id}"),
        source_id,
        checkpoint_id,
        recovery_id,
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_aligned_checkpoint_and_stale_epoch_filtering() {
    let dir = tempfile::tempdir().unwrap();
    let (control, control_addr) = Control::bind().await;
    let listen = support::local_addr();

    tokio::spawn(reducer::run(reducer::Config {
        idx: 0,
        listen,
        coordinator: control_addr,
        num_mappers: 2,
        checkpoint_dir: dir.path().to_path_buf(),
        heartbeat_interval: Duration::from_secs(30),
    }));

    let mut m0 = connect(listen).await;
    let mut m1 = connect(listen).await;

    send_count(&mut m0, 0, "alpha", 1, 0).await;
    send_count(&mut m0, 0, "beta", 2, 0).await;
    send_count(&mut m1, 1, "zebra", 1, 0).await;

    // Mapper 0's marker arrives first. The checkpoint must not be written
    // until mapper 1's marker aligns with it.
    send_marker(&mut m0, 0, 3, 0).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!checkpoint::file(dir.path(), "reducer_0", 3).exists());

    // Still before mapper 1's marker: these belong in checkpoint 3.
    send_count(&mut m1, 1, "yak", 1, 0).await;
    // After mapper 0's marker: held at the barrier, excluded from the cut.
    send_count(&mut m0, 0, "gamma", 1, 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    send_marker(&mut m1, 1, 3, 0).await;
    control
        .expect(TIMEOUT, |message| {
            matches!(
                message,
                ControlMessage::CheckpointAck {
                    checkpoint_id: 3,
                    ..
                }
            )
        })
        .await;

    let persisted = checkpoint::read_counts(dir.path(), "reducer_0", 3)
        .await
        .unwrap();
    let expected: HashMap<String, u64> = [("alpha", 1), ("beta", 2), ("zebra", 1), ("yak", 1)]
        .into_iter()
        .map(|(word, count)| (word.to_string(), count))
        .collect();
    assert_eq!(persisted, expected);

    // Recover onto epoch 2 from that snapshot. The old links are dead
    // afterwards, exactly as real mappers would reconnect.
    control
        .send(
            listen,
            &ControlMessage::Recover {
                source: "coordinator".to_string(),
                checkpoint_id: 3,
                recovery_id: 2,
            },
        )
        .await;
    control
        .expect(TIMEOUT, |message| {
            matches!(message, ControlMessage::RecoveryAck { recovery_id: 2, .. })
        })
        .await;

    let mut m0 = connect(listen).await;
    let mut m1 = connect(listen).await;

    // A late count from the dead epoch must leave the aggregate unchanged;
    // a current-epoch count lands as usual.
    send_count(&mut m0, 0, "alpha", 5, 0).await;
    send_count(&mut m1, 1, "zebra", 7, 2).await;
    send_marker(&mut m0, 0, 4, 2).await;
    send_marker(&mut m1, 1, 4, 2).await;
    control
        .expect(TIMEOUT, |message| {
            matches!(
                message,
                ControlMessage::CheckpointAck {
                    checkpoint_id: 4,
                    ..
                }
            )
        })
        .await;

    let persisted = checkpoint::read_counts(dir.path(), "reducer_0", 4)
        .await
        .unwrap();
    let expected: HashMap<String, u64> = [("alpha", 1), ("beta", 2), ("zebra", 8), ("yak", 1)]
        .into_iter()
        .map(|(word, count)| (word.to_string(), count))
        .collect();
    assert_eq!(persisted, expected);
}
