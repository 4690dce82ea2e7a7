use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use craq::{Client, Position, Replica};
use wire::chain::{GetResponse, Request};

/// Bind listeners for an n-replica chain, then serve each replica with its
/// position derived from the bound addresses.
async fn spawn_chain(
    n: usize,
    stop: &CancellationToken,
) -> (Vec<SocketAddr>, Vec<Arc<Replica>>) {
    let mut listeners = Vec::new();
    for _ in 0..n {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let addrs: Vec<SocketAddr> = listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap())
        .collect();

    let mut replicas = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let position = Position {
            prev: i.checked_sub(1).map(|p| addrs[p]),
            next: addrs.get(i + 1).copied(),
            tail: *addrs.last().unwrap(),
        };
        let replica = Replica::new(format!("replica-{i}"), position);
        replicas.push(replica.clone());
        tokio::spawn(replica.serve(listener, stop.child_token()));
    }
    (addrs, replicas)
}

/// Issue a GET at one specific replica, bypassing the client router.
async fn get_at(addr: SocketAddr, key: &str) -> GetResponse {
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(socket, wire::chain_codec());
    let request = Request::Get {
        key: key.to_string(),
    };
    framed
        .send(Bytes::from(serde_json::to_vec(&request).unwrap()))
        .await
        .unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    serde_json::from_slice(&frame).unwrap()
}

/// A byte gate between two replicas: request frames pass downstream only
/// when a permit is available, while replies flow back freely. Used to
/// pause a SET mid-chain.
async fn gate_proxy(listener: TcpListener, downstream: SocketAddr, gate: Arc<Semaphore>) {
    let (upstream, _) = listener.accept().await.unwrap();
    let downstream = TcpStream::connect(downstream).await.unwrap();

    let (mut down_sink, mut down_stream) = Framed::new(downstream, wire::chain_codec()).split();
    let (mut up_sink, mut up_stream) = Framed::new(upstream, wire::chain_codec()).split();

    let forward = async move {
        while let Some(Ok(frame)) = up_stream.next().await {
            gate.acquire().await.unwrap().forget();
            down_sink.send(frame.freeze()).await.unwrap();
        }
    };
    let backward = async move {
        while let Some(Ok(frame)) = down_stream.next().await {
            up_sink.send(frame.freeze()).await.unwrap();
        }
    };
    tokio::join!(forward, backward);
}

#[tokio::test]
async fn test_single_replica_chain_serves_both_roles() {
    let stop = CancellationToken::new();
    let (addrs, replicas) = spawn_chain(1, &stop).await;
    let client = Client::new(addrs);

    // One replica is head and tail at once: it assigns the version and
    // commits it in the same step.
    assert_eq!(client.set("k", "v1").await.unwrap(), 1);
    assert_eq!(client.get("k").await.unwrap(), "v1");

    assert_eq!(client.set("k", "v2").await.unwrap(), 2);
    assert_eq!(client.get("k").await.unwrap(), "v2");
    assert_eq!(replicas[0].version_state("k").await, Some((2, false)));

    stop.cancel();
}

#[tokio::test]
async fn test_clean_read_at_a_middle_replica() {
    let stop = CancellationToken::new();
    let (addrs, replicas) = spawn_chain(4, &stop).await;
    let client = Client::new(addrs.clone());

    assert_eq!(client.set("k", "v1").await.unwrap(), 1);

    // Replica c serves the read from local state and stays clean.
    let response = get_at(addrs[2], "k").await;
    assert_eq!(response.val.as_deref(), Some("v1"));
    assert_eq!(replicas[2].version_state("k").await, Some((1, false)));

    stop.cancel();
}

#[tokio::test]
async fn test_dirty_read_consults_the_tail() {
    let stop = CancellationToken::new();

    // Chain a → b → (gate) → c → d, with the tail reachable directly.
    let mut listeners = Vec::new();
    for _ in 0..4 {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let addrs: Vec<SocketAddr> = listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap())
        .collect();
    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    let tail = addrs[3];

    let positions = [
        Position { prev: None, next: Some(addrs[1]), tail },
        Position { prev: Some(addrs[0]), next: Some(proxy_addr), tail },
        Position { prev: Some(addrs[1]), next: Some(addrs[3]), tail },
        Position { prev: Some(addrs[2]), next: None, tail },
    ];
    let mut replicas = Vec::new();
    for (listener, position) in listeners.into_iter().zip(positions) {
        let replica = Replica::new(
            format!("replica-{}", replicas.len()),
            position,
        );
        replicas.push(replica.clone());
        tokio::spawn(replica.serve(listener, stop.child_token()));
    }

    // One permit: the first SET passes the gate, the second is held.
    let gate = Arc::new(Semaphore::new(1));
    tokio::spawn(gate_proxy(proxy_listener, addrs[2], gate.clone()));

    let client = Arc::new(Client::new(addrs.clone()));
    assert_eq!(client.set("k", "v1").await.unwrap(), 1);

    let writer = client.clone();
    let paused_set = tokio::spawn(async move { writer.set("k", "v2").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // b holds an uncommitted v2: it must answer with the tail's committed
    // version, which is still v1.
    assert_eq!(replicas[1].version_state("k").await, Some((2, true)));
    let response = get_at(addrs[1], "k").await;
    assert_eq!(response.val.as_deref(), Some("v1"));
    assert_eq!(replicas[1].version_state("k").await, Some((2, true)));

    // Release the gate; the write commits and every replica converges.
    gate.add_permits(1);
    assert_eq!(paused_set.await.unwrap().unwrap(), 2);

    for &addr in &addrs {
        let response = get_at(addr, "k").await;
        assert_eq!(response.val.as_deref(), Some("v2"));
    }
    assert_eq!(replicas[1].version_state("k").await, Some((2, false)));

    stop.cancel();
}

#[tokio::test]
async fn test_read_your_writes_across_the_chain() {
    let stop = CancellationToken::new();
    let (addrs, _replicas) = spawn_chain(4, &stop).await;
    let client = Client::new(addrs);

    for (i, val) in ["v1", "v2", "v3"].iter().enumerate() {
        assert_eq!(client.set("k", val).await.unwrap(), i as u64 + 1);
    }

    // One GET per replica via the round-robin: all serve the last write.
    for _ in 0..4 {
        assert_eq!(client.get("k").await.unwrap(), "v3");
    }
    assert!(matches!(
        client.get("missing").await,
        Err(craq::Error::Status(_))
    ));

    stop.cancel();
}
