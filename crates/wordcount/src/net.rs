use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use wire::control::ControlMessage;

/// Send one control datagram.
pub(crate) async fn send_control(
    socket: &UdpSocket,
    to: SocketAddr,
    message: &ControlMessage,
) -> anyhow::Result<()> {
    let buf = message.encode()?;
    socket.send_to(&buf, to).await?;
    Ok(())
}

/// Send HEARTBEAT datagrams to the coordinator until stopped.
pub(crate) async fn heartbeat(
    socket: Arc<UdpSocket>,
    coordinator: SocketAddr,
    source: String,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let beat = ControlMessage::Heartbeat { source: source.clone() };
                if let Err(err) = send_control(&socket, coordinator, &beat).await {
                    tracing::warn!(source, error = %err, "heartbeat send failed");
                }
            }
            _ = stop.cancelled() => return,
        }
    }
}
