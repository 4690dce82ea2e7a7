use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use wire::chain::Request;

type Channel = Framed<TcpStream, LengthDelimitedCodec>;

// A peer channel may be ready (if Some), mid-request (if locked), or not
// yet dialed (None and unlocked).
type DialState = Arc<tokio::sync::Mutex<Option<Channel>>>;

/// Lazily-dialed, re-used framed channels to chain peers. One request is
/// in flight per channel at a time; a channel that fails transport is
/// dropped and re-dialed by the next request.
#[derive(Debug, Default)]
pub struct Chains {
    states: std::sync::Mutex<HashMap<SocketAddr, DialState>>,
}

/// Exclusive use of one peer channel, checked out ahead of time so a
/// caller can reserve its forwarding slot before releasing other locks.
pub struct Connection {
    peer: SocketAddr,
    state: tokio::sync::OwnedMutexGuard<Option<Channel>>,
}

impl Chains {
    /// Acquire the channel to `peer`, dialing nothing yet. Requests issued
    /// on the returned connection go out in checkout order.
    pub async fn checkout(&self, peer: SocketAddr) -> Connection {
        let state = self.state(peer);
        Connection {
            peer,
            state: state.lock_owned().await,
        }
    }

    /// Send `request` to `peer` and await its reply.
    pub async fn request<R: serde::de::DeserializeOwned>(
        &self,
        peer: SocketAddr,
        request: &Request,
    ) -> crate::Result<R> {
        self.checkout(peer).await.round_trip(request).await
    }

    fn state(&self, peer: SocketAddr) -> DialState {
        // Non-async lock; never held across an await point.
        let mut states = self.states.lock().unwrap();
        states.entry(peer).or_default().clone()
    }
}

impl Connection {
    /// Send `request` and await the reply, dialing the peer first if no
    /// ready channel exists.
    pub async fn round_trip<R: serde::de::DeserializeOwned>(
        &mut self,
        request: &Request,
    ) -> crate::Result<R> {
        if self.state.is_none() {
            let socket = TcpStream::connect(self.peer).await?;
            *self.state = Some(Framed::new(socket, wire::chain_codec()));
        }
        let channel = self.state.as_mut().expect("channel was just dialed");

        let result = Self::exchange(channel, request).await;
        if result.is_err() {
            // Drop the broken channel; the next request re-dials.
            *self.state = None;
        }
        result
    }

    async fn exchange<R: serde::de::DeserializeOwned>(
        channel: &mut Channel,
        request: &Request,
    ) -> crate::Result<R> {
        let frame = bytes::Bytes::from(serde_json::to_vec(request)?);
        channel.send(frame).await?;

        let reply = channel.next().await.ok_or(crate::Error::UnexpectedEof)??;
        Ok(serde_json::from_slice(&reply)?)
    }
}
