use crate::config::LinkConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{LinkError, LinkEvent};
use crate::frame_codec::FrameCodec;
use crate::qos::QosProfile;
use crate::seq::SequenceNumber;
use crate::simulator::NetworkSimulator;
use crate::stats::LinkStats;
use crate::substrate::{open_substrate, SubstrateKind, WireTransport};
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, span, trace, warn, Level};
use uuid::Uuid;

/// Stable handle to a connection in the endpoint's arena. Everything outside the
///  arena holds ids, never references into it.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionId(u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct ConnectionArena {
    connections: FxHashMap<u64, Connection>,
    by_addr: FxHashMap<SocketAddr, u64>,
    next_id: u64,
}

impl ConnectionArena {
    fn insert(&mut self, connection: Connection) -> ConnectionId {
        let id = self.next_id;
        self.next_id += 1;
        self.by_addr.insert(connection.remote(), id);
        self.connections.insert(id, connection);
        ConnectionId(id)
    }
}

/// Endpoint is the place where all other parts of the protocol come together: it
///  drives every connection's tick on a fixed cadence, routes inbound datagrams to
///  their connection (creating one on first sight of a new peer), and has the API
///  for application code to open connections and send messages.
///
/// `send` and `receive` never block beyond taking the arena lock; no lock is held
///  across a socket operation.
#[derive(Clone)]
pub struct Endpoint {
    config: Arc<LinkConfig>,
    codec: Arc<FrameCodec>,
    transport: Arc<dyn WireTransport>,
    arena: Arc<RwLock<ConnectionArena>>,
}

/// cadence of the driver loop
const TICK_INTERVAL: Duration = Duration::from_millis(1);

impl Endpoint {
    pub async fn new(
        config: LinkConfig,
        kind: SubstrateKind,
        bind: SocketAddr,
        stream_peer: Option<SocketAddr>,
    ) -> anyhow::Result<Endpoint> {
        // configuration errors surface here, before any connection exists
        config.validate()?;

        let transport = open_substrate(kind, bind, stream_peer).await?;
        info!("endpoint listening on {:?}", transport.local_addr());
        Ok(Self::with_transport(config, transport))
    }

    /// wire the endpoint onto an externally created transport (tests, custom substrates)
    pub fn with_transport(config: LinkConfig, transport: Arc<dyn WireTransport>) -> Endpoint {
        let config = Arc::new(config);
        Endpoint {
            codec: Arc::new(FrameCodec::new(&config)),
            config,
            transport,
            arena: Arc::new(RwLock::new(ConnectionArena {
                connections: FxHashMap::default(),
                by_addr: FxHashMap::default(),
                next_id: 0,
            })),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// open a connection to a peer and start its handshake
    pub async fn connect(&self, remote: SocketAddr) -> anyhow::Result<ConnectionId> {
        let mut arena = self.arena.write().await;
        if arena.by_addr.contains_key(&remote) {
            bail!("a connection to {:?} already exists", remote);
        }

        let mut connection = Connection::new(remote, self.config.clone(), self.codec.clone(), Instant::now());
        connection.connect(Instant::now());
        let id = arena.insert(connection);
        debug!("{} connecting to {:?}", id, remote);
        Ok(id)
    }

    pub async fn disconnect(&self, id: ConnectionId) {
        if let Some(connection) = self.arena.write().await.connections.get_mut(&id.0) {
            connection.disconnect(Instant::now());
        }
    }

    /// drop a connection whose lifetime has ended; pending buffers are cancelled
    pub async fn remove(&self, id: ConnectionId) {
        let mut arena = self.arena.write().await;
        if let Some(connection) = arena.connections.remove(&id.0) {
            arena.by_addr.remove(&connection.remote());
        }
    }

    /// send with the endpoint's default QoS profile
    pub async fn send(&self, id: ConnectionId, payload: &[u8]) -> Result<SequenceNumber, LinkError> {
        let qos = self.config.default_qos.clone();
        self.send_with(id, payload, &qos).await
    }

    /// send with a configured profile, falling back to the default for unknown ids
    pub async fn send_profile(
        &self,
        id: ConnectionId,
        payload: &[u8],
        profile_id: u8,
    ) -> Result<SequenceNumber, LinkError> {
        let qos = self.config.qos(profile_id).clone();
        self.send_with(id, payload, &qos).await
    }

    /// send with an explicit per-message profile
    pub async fn send_with(
        &self,
        id: ConnectionId,
        payload: &[u8],
        qos: &QosProfile,
    ) -> Result<SequenceNumber, LinkError> {
        match self.arena.write().await.connections.get_mut(&id.0) {
            Some(connection) => connection.send(payload, qos, Instant::now()),
            None => Err(LinkError::ConnectionClosed("removed")),
        }
    }

    /// next ready message, or `None`; never blocks on the network
    pub async fn receive(&self, id: ConnectionId) -> Option<Vec<u8>> {
        self.arena.write().await.connections.get_mut(&id.0)?.receive()
    }

    pub async fn poll_event(&self, id: ConnectionId) -> Option<LinkEvent> {
        self.arena.write().await.connections.get_mut(&id.0)?.poll_event()
    }

    pub async fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        Some(self.arena.read().await.connections.get(&id.0)?.state())
    }

    pub async fn connection_stats(&self, id: ConnectionId) -> Option<Arc<LinkStats>> {
        Some(self.arena.read().await.connections.get(&id.0)?.stats())
    }

    /// attach a network-condition simulator to one connection's outbound path
    pub async fn set_simulator(&self, id: ConnectionId, simulator: Option<NetworkSimulator>) {
        if let Some(connection) = self.arena.write().await.connections.get_mut(&id.0) {
            connection.set_simulator(simulator);
        }
    }

    /// mean RTT across all live connections with an estimate
    pub async fn average_rtt(&self) -> Option<Duration> {
        let arena = self.arena.read().await;
        let samples: Vec<Duration> = arena
            .connections
            .values()
            .filter_map(|c| c.rtt())
            .collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    }

    /// mean loss ratio across all live connections
    pub async fn average_loss(&self) -> f64 {
        let now = Instant::now();
        let mut arena = self.arena.write().await;
        let connections = &mut arena.connections;
        if connections.is_empty() {
            return 0.0;
        }
        let total: f64 = connections.values_mut().map(|c| c.loss_ratio(now)).sum();
        total / connections.len() as f64
    }

    /// total bytes sent and received across the arena
    pub async fn total_bytes(&self) -> (u64, u64) {
        let arena = self.arena.read().await;
        arena.connections.values().fold((0, 0), |(sent, received), c| {
            let snapshot = c.stats().snapshot();
            (sent + snapshot.bytes_sent, received + snapshot.bytes_received)
        })
    }

    /// spawn the driver task: ticks every connection on a 1 kHz cadence and moves
    ///  the produced datagrams to the wire
    pub fn spawn_driver(&self) -> JoinHandle<()> {
        let endpoint = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                endpoint.tick_all().await;
            }
        })
    }

    /// one driver pass over all connections
    pub async fn tick_all(&self) {
        let now = Instant::now();

        // collect outbound traffic under the lock, send after releasing it
        let mut outbound: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        {
            let mut arena = self.arena.write().await;
            for connection in arena.connections.values_mut() {
                let remote = connection.remote();
                for datagram in connection.tick(now) {
                    outbound.push((remote, datagram));
                }
            }
        }

        for (remote, datagram) in outbound {
            self.transport.send_frame(remote, &datagram).await;
        }
    }

    /// Receive loop: runs until the transport fails permanently. Inbound datagrams
    ///  from unknown peers create a connection on the fly (the protocol has no
    ///  explicit handshake, so the first packet of a new peer is regular traffic).
    pub async fn recv_loop(&self) {
        info!("starting receive loop");
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let (len, from) = match self.transport.recv_frame(&mut buf).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("transport receive error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
            let _entered = span.enter();

            self.on_wire_datagram(from, &buf[..len]).await;
        }
    }

    /// route one inbound datagram to its connection, creating a passive connection
    ///  for a previously unknown peer
    pub async fn on_wire_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        trace!("received {} bytes from {:?}", datagram.len(), from);
        let now = Instant::now();
        let mut arena = self.arena.write().await;

        let id = match arena.by_addr.get(&from) {
            Some(&id) => ConnectionId(id),
            None => {
                debug!("first packet from {:?}, accepting new connection", from);
                let connection = Connection::accept(from, self.config.clone(), self.codec.clone(), now);
                arena.insert(connection)
            }
        };

        let connection = arena
            .connections
            .get_mut(&id.0)
            .expect("the arena entry was just resolved or inserted");
        if let Err(e) = connection.on_datagram(datagram, now) {
            debug!("{}: dropped inbound datagram: {}", id, e);
        }
    }
}
