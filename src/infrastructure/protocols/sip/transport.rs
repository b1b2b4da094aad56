//! SIP transport layer - datagram delivery over UDP, or in memory for tests

use super::message::{SipError, SipMessage, SipRequest, SipResponse};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Raw datagram received from the network
#[derive(Debug, Clone)]
pub struct InboundDatagram {
    pub data: Bytes,
    pub source: SocketAddr,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// Transport layer trait
///
/// The receiver can be taken once; the session engine is its only consumer.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Bind and start receiving; returns the bound local address
    async fn open(&mut self) -> Result<SocketAddr, SipError>;

    /// Stop receiving and release the socket. Calling it twice is harmless.
    async fn close(&mut self) -> Result<(), SipError>;

    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Take the stream of inbound datagrams
    fn take_receiver(&mut self) -> Option<mpsc::Receiver<InboundDatagram>>;
}

/// UDP transport implementation
pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<InboundDatagram>,
    rx: Option<mpsc::Receiver<InboundDatagram>>,
    recv_task: Option<JoinHandle<()>>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            socket: None,
            tx,
            rx: Some(rx),
            recv_task: None,
        }
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<InboundDatagram>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    let datagram = InboundDatagram {
                        data: Bytes::copy_from_slice(&buf[..size]),
                        source,
                    };
                    if tx.send(datagram).await.is_err() {
                        debug!("Inbound channel closed, stopping UDP receive loop");
                        break;
                    }
                }
                // ICMP errors from an earlier send surface here on some platforms
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!("UDP peer unreachable: {}", e);
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn open(&mut self) -> Result<SocketAddr, SipError> {
        if let Some(socket) = &self.socket {
            return socket
                .local_addr()
                .map_err(|e| SipError::TransportError(format!("Socket has no local address: {}", e)));
        }

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(format!("Socket has no local address: {}", e)))?;

        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        let tx = self.tx.clone();
        self.recv_task = Some(tokio::spawn(async move {
            Self::receive_loop(socket, tx).await;
        }));

        Ok(local_addr)
    }

    async fn close(&mut self) -> Result<(), SipError> {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        if self.socket.take().is_some() {
            info!("UDP transport closed");
        }
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SipError::TransportError("Socket not initialized".to_string()))?;

        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<InboundDatagram>> {
        self.rx.take()
    }
}

/// Local address the OS would route from when talking to `remote`.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub async fn route_local_ip(remote: SocketAddr) -> Result<IpAddr, SipError> {
    let unspecified: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let router = UdpSocket::bind(unspecified)
        .await
        .map_err(|e| SipError::TransportError(format!("Failed to bind routing socket: {}", e)))?;
    router
        .connect(remote)
        .await
        .map_err(|e| SipError::TransportError(format!("No route to {}: {}", remote, e)))?;
    router
        .local_addr()
        .map(|addr| addr.ip())
        .map_err(|e| SipError::TransportError(format!("Routing socket has no address: {}", e)))
}

/// In-process transport; the other end is a [`MemoryPeer`]
pub struct MemoryTransport {
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<OutgoingMessage>,
    rx: Option<mpsc::Receiver<InboundDatagram>>,
    open: Arc<AtomicBool>,
}

/// The far side of a [`MemoryTransport`], usually playing the trunk
pub struct MemoryPeer {
    addr: SocketAddr,
    sent: mpsc::UnboundedReceiver<OutgoingMessage>,
    inbound: mpsc::Sender<InboundDatagram>,
    open: Arc<AtomicBool>,
}

/// Create a connected transport/peer pair
pub fn memory_pair(local_addr: SocketAddr, peer_addr: SocketAddr) -> (MemoryTransport, MemoryPeer) {
    let (outbound, sent) = mpsc::unbounded_channel();
    let (inbound, rx) = mpsc::channel(1000);
    let open = Arc::new(AtomicBool::new(false));
    (
        MemoryTransport {
            local_addr,
            outbound,
            rx: Some(rx),
            open: open.clone(),
        },
        MemoryPeer {
            addr: peer_addr,
            sent,
            inbound,
            open,
        },
    )
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self) -> Result<SocketAddr, SipError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(self.local_addr)
    }

    async fn close(&mut self) -> Result<(), SipError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SipError::TransportError("Transport is closed".to_string()));
        }
        self.outbound
            .send(message)
            .map_err(|_| SipError::TransportError("Peer is gone".to_string()))
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<InboundDatagram>> {
        self.rx.take()
    }
}

impl MemoryPeer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the engine side currently has the transport open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Next datagram sent by the engine
    pub async fn recv(&mut self) -> Option<OutgoingMessage> {
        self.sent.recv().await
    }

    /// Next datagram sent by the engine, parsed as a request
    pub async fn recv_request(&mut self) -> Option<SipRequest> {
        let message = self.sent.recv().await?;
        match SipMessage::parse(&message.data).ok()? {
            SipMessage::Request(req) => Some(req),
            SipMessage::Response(_) => None,
        }
    }

    /// Next datagram sent by the engine, parsed as a response
    pub async fn recv_response(&mut self) -> Option<SipResponse> {
        let message = self.sent.recv().await?;
        match SipMessage::parse(&message.data).ok()? {
            SipMessage::Response(resp) => Some(resp),
            SipMessage::Request(_) => None,
        }
    }

    /// Datagram already queued by the engine, without waiting
    pub fn try_recv(&mut self) -> Option<OutgoingMessage> {
        self.sent.try_recv().ok()
    }

    /// Deliver raw bytes to the engine as if sent by this peer
    pub async fn deliver(&self, data: impl Into<Bytes>) -> Result<(), SipError> {
        self.inbound
            .send(InboundDatagram {
                data: data.into(),
                source: self.addr,
            })
            .await
            .map_err(|_| SipError::TransportError("Engine is gone".to_string()))
    }

    pub async fn send_response(&self, response: &SipResponse) -> Result<(), SipError> {
        self.deliver(response.to_bytes()).await
    }

    pub async fn send_request(&self, request: &SipRequest) -> Result<(), SipError> {
        self.deliver(request.to_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_transport_open_and_exchange() {
        let mut a = UdpTransport::new("127.0.0.1:0".parse().unwrap());
        let mut b = UdpTransport::new("127.0.0.1:0".parse().unwrap());
        let addr_a = a.open().await.unwrap();
        let addr_b = b.open().await.unwrap();
        assert_ne!(addr_a.port(), 0);

        let mut rx_b = b.take_receiver().unwrap();
        assert!(b.take_receiver().is_none());

        a.send(OutgoingMessage {
            data: Bytes::from_static(b"OPTIONS sip:x SIP/2.0\r\n\r\n"),
            destination: addr_b,
        })
        .await
        .unwrap();

        let datagram = rx_b.recv().await.unwrap();
        assert_eq!(datagram.source, addr_a);
        assert!(datagram.data.starts_with(b"OPTIONS"));

        a.close().await.unwrap();
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_send_before_open_fails() {
        let transport = UdpTransport::new("127.0.0.1:0".parse().unwrap());
        let result = transport
            .send(OutgoingMessage {
                data: Bytes::from_static(b"x"),
                destination: "127.0.0.1:5060".parse().unwrap(),
            })
            .await;
        assert!(matches!(result, Err(SipError::TransportError(_))));
    }

    #[tokio::test]
    async fn test_route_local_ip_loopback() {
        let ip = route_local_ip("127.0.0.1:5060".parse().unwrap()).await.unwrap();
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn test_memory_pair() {
        let local: SocketAddr = "127.0.0.1:5070".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let (mut transport, mut peer) = memory_pair(local, remote);

        let message = OutgoingMessage {
            data: Bytes::from_static(b"hello"),
            destination: remote,
        };
        assert!(transport.send(message.clone()).await.is_err());

        assert_eq!(transport.open().await.unwrap(), local);
        assert!(peer.is_open());
        transport.send(message).await.unwrap();
        assert_eq!(peer.recv().await.unwrap().data, Bytes::from_static(b"hello"));

        let mut rx = transport.take_receiver().unwrap();
        peer.deliver(Bytes::from_static(b"world")).await.unwrap();
        let datagram = rx.recv().await.unwrap();
        assert_eq!(datagram.source, remote);

        transport.close().await.unwrap();
        assert!(!peer.is_open());
    }
}
