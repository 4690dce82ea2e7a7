use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::{Chains, Store};
use wire::chain::{GetResponse, Request, SetResponse, VerGetResponse};

const VER_GET_RETRY: Duration = Duration::from_millis(50);

/// Where a replica sits in its chain. `prev` is identity only: nothing is
/// ever sent upstream except the reply to a forwarded SET.
#[derive(Debug, Clone)]
pub struct Position {
    pub prev: Option<SocketAddr>,
    pub next: Option<SocketAddr>,
    pub tail: SocketAddr,
}

impl Position {
    pub fn is_head(&self) -> bool {
        self.prev.is_none()
    }

    pub fn is_tail(&self) -> bool {
        self.next.is_none()
    }
}

/// One link of a replication chain. Serves SET, GET, and VER_GET on a
/// single listener; forwards SETs downstream and back-calls the tail for
/// dirty reads.
pub struct Replica {
    name: String,
    position: Position,
    store: tokio::sync::Mutex<Store>,
    chains: Chains,
}

impl Replica {
    pub fn new(name: impl Into<String>, position: Position) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            position,
            store: tokio::sync::Mutex::new(Store::default()),
            chains: Chains::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The newest locally-known `(version, dirty)` state of `key`.
    pub async fn version_state(&self, key: &str) -> Option<(u64, bool)> {
        let store = self.store.lock().await;
        store.get(key).map(|entry| (entry.max_v(), entry.dirty()))
    }

    /// Accept and serve client and inter-replica connections until `stop`
    /// is cancelled.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        stop: CancellationToken,
    ) -> anyhow::Result<()> {
        tracing::info!(name = %self.name, addr = %listener.local_addr()?, "replica serving");
        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let Ok((socket, addr)) = accept else { continue };
                    let replica = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = replica.serve_connection(socket).await {
                            tracing::warn!(name = %replica.name, %addr, error = %err, "connection failed");
                        }
                    });
                }
                _ = stop.cancelled() => return Ok(()),
            }
        }
    }

    async fn serve_connection(&self, socket: TcpStream) -> crate::Result<()> {
        let mut framed = Framed::new(socket, wire::chain_codec());

        while let Some(frame) = framed.next().await {
            let response = match serde_json::from_slice::<Request>(&frame?) {
                Ok(request) => self.dispatch(request).await?,
                Err(err) => {
                    tracing::error!(name = %self.name, error = %err, "unparseable request");
                    serde_json::json!({"status": "Unexpected type"})
                }
            };
            let reply = bytes::Bytes::from(serde_json::to_vec(&response)?);
            framed.send(reply).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> crate::Result<serde_json::Value> {
        let response = match request {
            Request::Set { key, val, ver } => serde_json::to_value(self.set(key, val, ver).await)?,
            Request::Get { key } => serde_json::to_value(self.get(&key).await)?,
            Request::VerGet { key } => serde_json::to_value(self.ver_get(&key).await)?,
        };
        Ok(response)
    }

    /// Apply a SET locally and, unless this is the tail, forward it down
    /// the chain. The forwarding slot on the downstream channel is
    /// reserved while the store is still locked, so SETs leave this
    /// replica in head-assigned version order even though the store lock
    /// is not held across network I/O.
    async fn set(&self, key: String, val: String, ver: Option<u64>) -> SetResponse {
        let mut store = self.store.lock().await;

        let Some(next) = self.position.next else {
            // Tail. A single-replica chain is its own head, so a client
            // SET lands here without a version and this replica assigns it.
            let ver = match ver {
                Some(ver) => ver,
                None if self.position.is_head() => store.apply_head_set(&key, &val),
                None => return SetResponse::error("SET reached the tail without a version"),
            };
            store.apply_tail_set(&key, &val, ver);
            tracing::debug!(name = %self.name, key, ver, "tail committed");
            return SetResponse::ok(ver);
        };

        let ver = match ver {
            // Mid-chain hop: install the head-assigned version.
            Some(ver) => {
                store.apply_chain_set(&key, &val, ver);
                ver
            }
            // Head: this replica assigns the version.
            None => {
                if !self.position.is_head() {
                    return SetResponse::error("SET without a version at a non-head replica");
                }
                store.apply_head_set(&key, &val)
            }
        };
        tracing::debug!(name = %self.name, key, ver, "installed, forwarding");

        let mut connection = self.chains.checkout(next).await;
        drop(store);

        let forward = Request::Set {
            key: key.clone(),
            val,
            ver: Some(ver),
        };
        let response: SetResponse = match connection.round_trip(&forward).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(name = %self.name, key, ver, error = %err, "forwarding SET failed");
                return SetResponse::error(format!("forward failed: {err}"));
            }
        };
        // Release the channel before re-locking the store: the next queued
        // SET holds the store while waiting for this channel, and taking
        // the locks in both orders at once would wedge the pair.
        drop(connection);

        if let Some(acked) = response.ver {
            let mut store = self.store.lock().await;
            store.mark_clean_if(&key, acked);
        }
        response
    }

    /// Serve a read. Clean entries answer from local state; dirty entries
    /// ask the tail which version is committed and answer at that version.
    async fn get(&self, key: &str) -> GetResponse {
        {
            let store = self.store.lock().await;
            match store.get(key) {
                None => return GetResponse::error("Key not found"),
                Some(entry) if !entry.dirty() => {
                    return match entry.latest() {
                        Some(val) => GetResponse::ok(val),
                        None => GetResponse::error("Key not found"),
                    };
                }
                // Dirty: fall through to the tail round-trip, outside the
                // store lock.
                Some(_) => (),
            }
        }

        let ver = self.committed_version(key).await;

        let mut store = self.store.lock().await;
        let response = match store.get(key).and_then(|entry| entry.value_at(ver)) {
            Some(val) => GetResponse::ok(val),
            None => GetResponse::error(format!("version {ver} not present at this replica")),
        };
        // Resample: the entry may have advanced past `ver` while the tail
        // round-trip was in flight, in which case it stays dirty.
        store.mark_clean_if(key, ver);
        response
    }

    /// Ask the tail which version of `key` it has committed. Retried until
    /// it answers: transport failures and a key that has not yet landed at
    /// the tail both clear once the in-flight write arrives.
    async fn committed_version(&self, key: &str) -> u64 {
        let request = Request::VerGet {
            key: key.to_string(),
        };
        loop {
            match self
                .chains
                .request::<VerGetResponse>(self.position.tail, &request)
                .await
            {
                Ok(VerGetResponse::Found { ver, .. }) => return ver,
                Ok(VerGetResponse::Missing { message, .. }) => {
                    tracing::debug!(name = %self.name, key, message, "tail has not committed this key yet");
                }
                Err(err) => {
                    tracing::warn!(name = %self.name, key, error = %err, "VER_GET failed, retrying");
                }
            }
            tokio::time::sleep(VER_GET_RETRY).await;
        }
    }

    /// Report the newest locally-known version. Authoritative at the tail;
    /// legal at any replica for keys it has seen.
    async fn ver_get(&self, key: &str) -> VerGetResponse {
        let store = self.store.lock().await;
        match store.get(key) {
            Some(entry) => VerGetResponse::Found {
                key: key.to_string(),
                ver: entry.max_v(),
            },
            None => VerGetResponse::missing("Key not found"),
        }
    }
}
