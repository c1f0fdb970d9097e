use crate::error::TransportError;
use cellsync_protocol::{Envelope, Message};
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Best-effort JSON-over-UDP messaging between cells addressed by port.
///
/// Nothing is acknowledged, ordered or retried. Send failures are logged
/// and swallowed because unreachable peers are routine here.
pub struct UdpTransport {
    socket: UdpSocket,
    host: IpAddr,
    port: u16,
    max_datagram: usize,
    closed: watch::Sender<bool>,
}

impl UdpTransport {
    /// Binds `host:port`; port 0 picks a free port, see [`UdpTransport::port`].
    pub async fn bind(host: IpAddr, port: u16, max_datagram: usize) -> Result<Self, TransportError> {
        let addr = SocketAddr::new(host, port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let port = socket.local_addr()?.port();
        let (closed, _) = watch::channel(false);
        Ok(Self {
            socket,
            host,
            port,
            max_datagram,
            closed,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn try_send(&self, target: u16, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = Envelope::new(self.port, message.clone()).encode()?;
        self.send_frame(target, &frame).await
    }

    pub async fn send(&self, target: u16, message: &Message) {
        if let Err(e) = self.try_send(target, message).await {
            warn!(port = self.port, peer = target, kind = %message.kind(), error = %e, "Send failed");
        }
    }

    /// Sends to every target except ourselves, in list order. Partial
    /// delivery is possible.
    pub async fn broadcast(&self, targets: &[u16], message: &Message) {
        if self.is_closed() {
            debug!(port = self.port, kind = %message.kind(), "Broadcast on closed transport dropped");
            return;
        }
        let frame = match Envelope::new(self.port, message.clone()).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(port = self.port, kind = %message.kind(), error = %e, "Broadcast encode failed");
                return;
            }
        };
        for target in targets.iter().copied().filter(|t| *t != self.port) {
            if let Err(e) = self.send_frame(target, &frame).await {
                warn!(port = self.port, peer = target, kind = %message.kind(), error = %e, "Send failed");
            }
        }
    }

    /// Waits for the next datagram. Returns `None` once the transport is
    /// closed, and also for a frame that could not be read or decoded.
    pub async fn receive(&self) -> Option<(Envelope, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut buf = vec![0u8; self.max_datagram];
        tokio::select! {
            _ = closed.changed() => None,
            received = self.socket.recv_from(&mut buf) => match received {
                Ok((len, origin)) => match Envelope::decode(&buf[..len]) {
                    Ok(envelope) => Some((envelope, origin)),
                    Err(e) => {
                        warn!(port = self.port, origin = %origin, error = %e, "Dropping malformed frame");
                        None
                    }
                },
                Err(e) => {
                    debug!(port = self.port, error = %e, "Receive failed");
                    None
                }
            },
        }
    }

    /// Idempotent. Wakes a pending [`UdpTransport::receive`].
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    async fn send_frame(&self, target: u16, frame: &[u8]) -> Result<(), TransportError> {
        let addr = SocketAddr::new(self.host, target);
        self.socket.send_to(frame, addr).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_DATAGRAM;
    use cellsync_protocol::{AlertNotice, ChunkRecord};
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    async fn bind_local() -> UdpTransport {
        UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, MAX_DATAGRAM)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn send_and_receive_store() {
        let a = bind_local().await;
        let b = bind_local().await;
        let record = ChunkRecord::new("f.txt", 0, 1, vec![1u8; 1024]);

        a.send(b.port(), &Message::Store(record.clone())).await;
        let (envelope, origin) = b.receive().await.unwrap();

        assert_eq!(envelope.sender_port, a.port());
        assert_eq!(origin.port(), a.port());
        assert_eq!(envelope.message, Message::Store(record));
    }

    #[tokio::test]
    async fn broadcast_skips_own_port() {
        let a = bind_local().await;
        let b = bind_local().await;
        let alert = Message::Alert(AlertNotice {
            culprit: 4999,
            chunk: "f_0".into(),
        });

        a.broadcast(&[a.port(), b.port()], &alert).await;
        let (envelope, _) = b.receive().await.unwrap();
        assert_eq!(envelope.message, alert);

        let nothing = tokio::time::timeout(Duration::from_millis(100), a.receive()).await;
        assert!(nothing.is_err(), "sender must not receive its own broadcast");
    }

    #[tokio::test]
    async fn malformed_frame_yields_none() {
        let b = bind_local().await;
        let raw = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        raw.send_to(b"garbage", (Ipv4Addr::LOCALHOST, b.port())).unwrap();

        assert!(b.receive().await.is_none());
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn close_unblocks_pending_receive() {
        let transport = Arc::new(bind_local().await);
        let waiter = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.close();
        transport.close();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("receive should be unblocked")
            .unwrap();
        assert!(result.is_none());
        assert!(matches!(
            transport.try_send(1, &Message::Heartbeat).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn unreachable_target_is_not_fatal() {
        let a = bind_local().await;
        let ghost = bind_local().await;
        let ghost_port = ghost.port();
        drop(ghost);

        a.send(ghost_port, &Message::Heartbeat).await;
        a.broadcast(&[ghost_port], &Message::Replicate).await;
        assert!(!a.is_closed());
    }
}
