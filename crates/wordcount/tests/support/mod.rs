//! Harness shared by the engine's integration tests: an ephemeral-port
//! helper and a bare control socket standing in for (or observing) the
//! coordinator.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use wire::control::ControlMessage;

pub fn local_addr() -> SocketAddr {
    let port = portpicker::pick_unused_port().expect("no free ports");
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// A bare control socket: sends coordinator-protocol datagrams and
/// observes worker traffic.
pub struct Control {
    socket: UdpSocket,
}

impl Control {
    pub async fn bind() -> (Self, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (Self { socket }, addr)
    }

    pub async fn send(&self, to: SocketAddr, message: &ControlMessage) {
        self.socket
            .send_to(&message.encode().unwrap(), to)
            .await
            .unwrap();
    }

    /// Receive the next decodable control message. Panics past `timeout`.
    pub async fn recv(&self, timeout: Duration) -> ControlMessage {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = vec![0u8; wire::DATAGRAM_LEN];
        loop {
            let (n, _) = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf))
                .await
                .expect("timed out waiting for a control message")
                .unwrap();
            if let Ok(message) = ControlMessage::decode(&buf[..n]) {
                return message;
            }
        }
    }

    /// Receive until `matches` accepts a message, skipping everything else
    /// (heartbeats in particular).
    pub async fn expect(
        &self,
        timeout: Duration,
        matches: impl Fn(&ControlMessage) -> bool,
    ) -> ControlMessage {
        loop {
            let message = self.recv(timeout).await;
            if matches(&message) {
                return message;
            }
        }
    }

    /// Receive until one message accepted by `matches` has arrived from
    /// every listed source.
    pub async fn expect_from_each(
        &self,
        timeout: Duration,
        sources: &[&str],
        matches: impl Fn(&ControlMessage) -> bool,
    ) {
        let mut outstanding: std::collections::HashSet<&str> = sources.iter().copied().collect();
        while !outstanding.is_empty() {
            let message = self.expect(timeout, &matches).await;
            outstanding.remove(message.source());
        }
    }

    /// Discard buffered datagrams until the socket has been quiet for
    /// `window`.
    pub async fn drain(&self, window: Duration) {
        let mut buf = vec![0u8; wire::DATAGRAM_LEN];
        while tokio::time::timeout(window, self.socket.recv_from(&mut buf))
            .await
            .is_ok()
        {}
    }
}
