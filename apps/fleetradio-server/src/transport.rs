//! Concrete I/O for the control-plane traits: UDP sockets for HELLO and the
//! internal peer protocol, a ZMQ REQ/PUSH pair for the collaboration bus,
//! and the TCP remote-control listener's read/dispatch loop.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use fleetradio_core::collab::{CollabTransport, PerformanceSnapshotSource, SpectrumUsageSource};
use fleetradio_core::controller::{ClockProbeTransport, ControlPlaneController, InternalTransport};
use fleetradio_core::discovery::{Hello, HelloTransport, NeighborDiscovery};
use fleetradio_core::error::{CollabError, ControlPlaneError};
use fleetradio_core::neighborhood::NodeId;
use fleetradio_core::protocol::collab::{CilVoxel, FlowPerformanceSummary, PeerMessage, RegistrationMessage};
use fleetradio_core::protocol::internal::InternalMessage;
use fleetradio_core::protocol::{framing, ProtocolError};
use fleetradio_core::runtime::TaskSpawner;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Sends HELLO broadcasts over a UDP socket, and reads broadcast HELLOs into
/// a [`NeighborDiscovery`] in a background task.
pub struct UdpHelloTransport {
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
}

impl UdpHelloTransport {
    /// Binds a UDP socket for HELLO traffic. Must be created with
    /// `SO_BROADCAST` enabled if `broadcast_addr` is a broadcast address.
    pub async fn bind(bind_addr: SocketAddr, broadcast_addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket: Arc::new(socket),
            broadcast_addr,
        })
    }

    /// Returns the underlying socket, for feeding [`Self::run_receive_loop`].
    #[must_use]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Runs a read loop feeding received HELLOs into `discovery` until
    /// `cancel` fires.
    pub async fn run_receive_loop(
        socket: Arc<UdpSocket>,
        discovery: Arc<NeighborDiscovery>,
        time: Arc<fleetradio_core::time::TimeSource>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, _addr)) => {
                            if let Ok(hello) = serde_json::from_slice::<Hello>(&buf[..len]) {
                                discovery.on_hello(hello, time.now());
                            }
                        }
                        Err(err) => log::warn!("hello socket read failed: {err}"),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl HelloTransport for UdpHelloTransport {
    async fn broadcast(&self, hello: Hello) {
        let Ok(payload) = serde_json::to_vec(&hello) else {
            log::warn!("failed to encode hello");
            return;
        };
        if let Err(err) = self.socket.send_to(&payload, self.broadcast_addr).await {
            log::warn!("hello broadcast failed: {err}");
        }
    }
}

/// Sends and receives the internal peer protocol (length-prefixed binary
/// framing, one message per UDP datagram) over a fixed `NodeId -> SocketAddr`
/// table.
pub struct UdpInternalTransport {
    socket: Arc<UdpSocket>,
    peers: BTreeMap<NodeId, SocketAddr>,
}

impl UdpInternalTransport {
    /// Binds a UDP socket for the internal peer protocol.
    pub async fn bind(
        bind_addr: SocketAddr,
        peers: BTreeMap<NodeId, SocketAddr>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            peers,
        })
    }

    /// Returns the underlying socket, for feeding [`Self::run_receive_loop`].
    #[must_use]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Runs a read loop dispatching received messages into `controller`
    /// until `cancel` fires.
    pub async fn run_receive_loop(
        socket: Arc<UdpSocket>,
        controller: Arc<ControlPlaneController>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, _addr)) => match framing::decode::<InternalMessage>(&buf[..len]) {
                            Ok(msg) => controller.on_internal_message(msg),
                            Err(err) => log::warn!("malformed internal message: {err}"),
                        },
                        Err(err) => log::warn!("internal socket read failed: {err}"),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl InternalTransport for UdpInternalTransport {
    async fn unicast(&self, to: NodeId, msg: InternalMessage) -> Result<(), ProtocolError> {
        let Some(&addr) = self.peers.get(&to) else {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address known for node {to}"),
            )));
        };
        let frame = framing::encode(&msg)?;
        self.socket.send_to(&frame, addr).await?;
        Ok(())
    }

    async fn broadcast(&self, msg: InternalMessage) {
        let frame = match framing::encode(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("failed to encode broadcast message: {err}");
                return;
            }
        };
        for &addr in self.peers.values() {
            if let Err(err) = self.socket.send_to(&frame, addr).await {
                log::warn!("internal broadcast to {addr} failed: {err}");
            }
        }
    }
}

/// Exchanges clock-sync probes with the time master over the same internal
/// UDP socket used for peer messages.
pub struct UdpClockProbeTransport {
    internal: Arc<UdpInternalTransport>,
}

impl UdpClockProbeTransport {
    /// Wraps an existing internal transport for clock-probe use.
    #[must_use]
    pub fn new(internal: Arc<UdpInternalTransport>) -> Self {
        Self { internal }
    }
}

#[async_trait]
impl ClockProbeTransport for UdpClockProbeTransport {
    async fn exchange(&self, _master: NodeId) -> Option<(Vec<(f64, f64)>, Vec<(f64, f64)>)> {
        // The actual over-the-air timestamped exchange happens at the DSP
        // layer; this control-plane transport has no probe samples of its
        // own to offer without that integration.
        let _ = &self.internal;
        None
    }
}

/// Collaboration-bus transport: a ZMQ REQ socket for registration and a ZMQ
/// PUSH socket for peer reports. ZMQ calls block, so each call runs on a
/// blocking-pool thread.
pub struct ZmqCollabTransport {
    register: Arc<StdMutex<zmq::Socket>>,
    push: Arc<StdMutex<zmq::Socket>>,
}

impl ZmqCollabTransport {
    /// Connects the REQ and PUSH sockets to the collaboration server.
    pub fn connect(register_addr: &str, push_addr: &str) -> Result<Self, CollabError> {
        let ctx = zmq::Context::new();
        let register = ctx.socket(zmq::REQ)?;
        register.connect(register_addr)?;
        let push = ctx.socket(zmq::PUSH)?;
        push.connect(push_addr)?;
        Ok(Self {
            register: Arc::new(StdMutex::new(register)),
            push: Arc::new(StdMutex::new(push)),
        })
    }
}

#[async_trait]
impl CollabTransport for ZmqCollabTransport {
    async fn register(&self, msg: RegistrationMessage) -> Result<RegistrationMessage, CollabError> {
        let socket = Arc::clone(&self.register);
        tokio::task::spawn_blocking(move || -> Result<RegistrationMessage, CollabError> {
            let payload = framing::encode(&msg).map_err(CollabError::from)?;
            let socket = socket.lock().expect("zmq register socket poisoned");
            socket.send(&payload[..], 0)?;
            let reply = socket.recv_bytes(0)?;
            Ok(framing::decode(&reply).map_err(CollabError::from)?)
        })
        .await
        .expect("zmq register task panicked")
    }

    async fn push(&self, msg: PeerMessage) -> Result<(), CollabError> {
        let socket = Arc::clone(&self.push);
        tokio::task::spawn_blocking(move || -> Result<(), CollabError> {
            let payload = framing::encode(&msg).map_err(CollabError::from)?;
            socket.lock().expect("zmq push socket poisoned").send(&payload[..], 0)?;
            Ok(())
        })
        .await
        .expect("zmq push task panicked")
    }
}

/// Spectrum/performance sources with no DSP feed wired up yet: every
/// collaboration report they back is sent with empty voxel/flow lists.
pub struct NoDspSource;

impl SpectrumUsageSource for NoDspSource {
    fn historical_voxels(&self) -> Vec<CilVoxel> {
        Vec::new()
    }

    fn predicted_voxels(&self, _horizon: std::time::Duration) -> Vec<CilVoxel> {
        Vec::new()
    }
}

impl PerformanceSnapshotSource for NoDspSource {
    fn flow_summaries(&self) -> Vec<FlowPerformanceSummary> {
        Vec::new()
    }
}

/// Runs the TCP remote-control listener until `cancel` fires, dispatching
/// each connection's request to `controller` and writing back the response.
pub async fn run_control_listener(
    bind_addr: SocketAddr,
    controller: Arc<ControlPlaneController>,
    spawner: impl TaskSpawner + Clone + 'static,
    cancel: CancellationToken,
) -> Result<(), ControlPlaneError> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    log::info!("remote-control listener bound on {bind_addr}");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let controller = Arc::clone(&controller);
                let conn_cancel = cancel.child_token();
                spawner.spawn(async move {
                    if let Err(err) = handle_control_connection(stream, controller, conn_cancel).await {
                        log::warn!("control connection from {peer} ended with error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_control_connection(
    mut stream: tokio::net::TcpStream,
    controller: Arc<ControlPlaneController>,
    cancel: CancellationToken,
) -> Result<(), ProtocolError> {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            request = framing::read_frame(&mut stream) => request?,
        };
        let response = controller.handle_request(request).await;
        framing::write_frame(&mut stream, &response).await?;
    }
}
