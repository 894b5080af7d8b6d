use crate::config::LinkConfig;
use crate::error::{LinkError, LinkEvent};
use crate::fragment::{Fragmenter, Reassembler};
use crate::frame_codec::FrameCodec;
use crate::packet_header::{FragmentHeader, PacketHeader};
use crate::qos::{Priority, QosProfile, Reliability};
use crate::reliability::{InboundFrame, ReceiveVerdict, ReliabilityEngine};
use crate::scheduler::{PacketScheduler, QueuedPacket};
use crate::seq::{MessageIdAllocator, SequenceNumber};
use crate::simulator::NetworkSimulator;
use crate::stats::{BandwidthWindow, LatencyWindow, LinkStats};
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Failed => "Failed",
        }
    }

    fn accepts_sends(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    fn accepts_inbound(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }
}

/// One peer-to-peer channel: the packet engine of a single connection.
///
/// All logic is synchronous and driven by explicit `now` instants; the surrounding
///  endpoint calls [Connection::tick] on a fixed cadence and moves the returned
///  datagrams to the wire. `send` and `receive` never block: the first enqueues,
///  the second polls the ready queue.
///
/// The protocol has no explicit handshake packets: an initiator enqueues a
///  zero-payload reliable hello, and the first inbound packet of any kind
///  completes the handshake. A passive connection (created on first sight of a
///  new peer) starts out Connected.
pub struct Connection {
    remote: SocketAddr,
    state: ConnectionState,
    config: Arc<LinkConfig>,
    codec: Arc<FrameCodec>,

    reliability: ReliabilityEngine,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    scheduler: PacketScheduler,
    simulator: Option<NetworkSimulator>,

    stats: Arc<LinkStats>,
    bandwidth: BandwidthWindow,
    latency: LatencyWindow<128>,

    inbound_ready: VecDeque<Vec<u8>>,
    events: VecDeque<LinkEvent>,

    created_at: Instant,
    last_outbound: Instant,
    last_inbound: Instant,
    drain_deadline: Option<Instant>,
}

impl Connection {
    /// create a connection in Disconnected; call [Connection::connect] to start the
    ///  handshake
    pub fn new(
        remote: SocketAddr,
        config: Arc<LinkConfig>,
        codec: Arc<FrameCodec>,
        now: Instant,
    ) -> Connection {
        Connection {
            remote,
            state: ConnectionState::Disconnected,
            reliability: ReliabilityEngine::new(config.ordered_buffer_cap),
            fragmenter: Fragmenter::new(),
            reassembler: Reassembler::new(config.fragment_timeout),
            scheduler: PacketScheduler::new(&config),
            simulator: None,
            stats: Arc::new(LinkStats::default()),
            bandwidth: BandwidthWindow::new(Duration::from_secs(1)),
            latency: LatencyWindow::new(),
            inbound_ready: VecDeque::new(),
            events: VecDeque::new(),
            created_at: now,
            last_outbound: now,
            last_inbound: now,
            drain_deadline: None,
            config,
            codec,
        }
    }

    /// create a connection for a peer that initiated contact; it is Connected from
    ///  the start
    pub fn accept(
        remote: SocketAddr,
        config: Arc<LinkConfig>,
        codec: Arc<FrameCodec>,
        now: Instant,
    ) -> Connection {
        let mut connection = Connection::new(remote, config, codec, now);
        connection.state = ConnectionState::Connected;
        connection
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> Arc<LinkStats> {
        self.stats.clone()
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.reliability.rtt()
    }

    pub fn loss_ratio(&mut self, now: Instant) -> f64 {
        self.reliability.loss_ratio(now)
    }

    /// bytes released to the wire within the trailing second
    pub fn current_bandwidth(&mut self, now: Instant) -> u64 {
        self.bandwidth.bytes_in_window(now)
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        self.latency.mean_ms()
    }

    /// attach a network-condition simulator to the outbound path (testing and
    ///  development builds)
    pub fn set_simulator(&mut self, simulator: Option<NetworkSimulator>) {
        self.simulator = simulator;
    }

    /// number of fragment groups currently awaiting completion
    pub fn pending_fragment_groups(&self) -> usize {
        self.reassembler.group_count()
    }

    pub fn connect(&mut self, now: Instant) {
        if self.state != ConnectionState::Disconnected {
            warn!("connect() on {:?} connection to {:?} - ignoring", self.state, self.remote);
            return;
        }
        debug!("connecting to {:?}", self.remote);
        self.state = ConnectionState::Connecting;
        self.last_inbound = now;

        // the hello is a plain zero-payload reliable packet; any response (its ack,
        //  or traffic the peer initiated on its own) completes the handshake
        if let Err(e) = self.send(&[], &self.config.control_qos(), now) {
            warn!("failed to enqueue handshake packet: {}", e);
        }
    }

    pub fn disconnect(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("disconnecting from {:?}", self.remote);
                self.state = ConnectionState::Disconnecting;
                self.drain_deadline = Some(now + self.config.drain_timeout);
            }
            ConnectionState::Disconnected => {
                self.events.push_back(LinkEvent::Disconnected);
            }
            _ => {}
        }
    }

    /// Frame, fragment, sequence and enqueue one message. Returns the sequence
    ///  number of its first packet. Never blocks; a full scheduler queue rejects
    ///  the whole message.
    pub fn send(
        &mut self,
        payload: &[u8],
        qos: &QosProfile,
        now: Instant,
    ) -> Result<SequenceNumber, LinkError> {
        if !self.state.accepts_sends() {
            return Err(LinkError::ConnectionClosed(self.state.name()));
        }

        let frame = self.codec.seal(payload, qos);

        let pieces: Vec<(u32, Option<FragmentHeader>, Vec<u8>)> = if frame.len() > self.config.mtu {
            self.fragmenter
                .split(&frame, self.config.fragment_size)?
                .into_iter()
                .map(|f| (f.message_id, Some(f.header), f.data))
                .collect()
        } else {
            vec![(MessageIdAllocator::UNFRAGMENTED, None, frame)]
        };

        if !self.scheduler.has_capacity(qos.priority, pieces.len()) {
            return Err(LinkError::QueueFull);
        }

        let mut first_sequence = None;
        for (message_id, fragment, data) in pieces {
            let sequence = self.reliability.assign_sequence();
            first_sequence.get_or_insert(sequence);

            let wire = self.serialize_packet(sequence, message_id, fragment, qos.reliability, qos.priority, &data, now);

            if qos.reliability.is_reliable() {
                self.reliability.track(
                    sequence,
                    wire.clone(),
                    qos.priority,
                    qos.reliability,
                    qos.timeout,
                    qos.max_retries,
                    now,
                );
            }

            self.scheduler
                .enqueue(QueuedPacket {
                    sequence,
                    priority: qos.priority,
                    reliability: qos.reliability,
                    deadline: now + qos.timeout,
                    wire,
                })
                .expect("capacity was checked before enqueueing");
        }

        Ok(first_sequence.expect("a message always has at least one piece"))
    }

    /// next message ready for the application, if any; never blocks
    pub fn receive(&mut self) -> Option<Vec<u8>> {
        self.inbound_ready.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    fn serialize_packet(
        &self,
        sequence: SequenceNumber,
        message_id: u32,
        fragment: Option<FragmentHeader>,
        reliability: Reliability,
        priority: Priority,
        data: &[u8],
        now: Instant,
    ) -> Vec<u8> {
        let header = PacketHeader {
            sequence,
            timestamp_ms: self.elapsed_ms(now),
            message_id,
            fragment,
            reliability,
            priority,
        };
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + data.len());
        header.ser(&mut buf);
        buf.put_slice(data);
        buf.to_vec()
    }

    fn elapsed_ms(&self, now: Instant) -> u32 {
        now.duration_since(self.created_at).as_millis() as u32
    }

    /// Process one datagram from the wire. Reception errors are counted and
    ///  returned for logging; they never terminate the connection, with the
    ///  exception of [LinkError::FlowBroken].
    pub fn on_datagram(&mut self, datagram: &[u8], now: Instant) -> Result<(), LinkError> {
        if !self.state.accepts_inbound() {
            trace!("datagram on {:?} connection to {:?} - ignoring", self.state, self.remote);
            return Ok(());
        }

        let mut buf = datagram;
        let header = match PacketHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                self.stats.record_corrupted();
                return Err(e);
            }
        };
        let payload = buf;

        self.stats.record_received(datagram.len());
        self.last_inbound = now;

        if self.state == ConnectionState::Connecting {
            debug!("handshake with {:?} complete", self.remote);
            self.state = ConnectionState::Connected;
            self.events.push_back(LinkEvent::Connected);
        }

        if Self::is_ack(&header, payload) {
            let acked = SequenceNumber::from_raw(u32::from_be_bytes(
                payload.try_into().expect("ack payload is exactly four bytes"),
            ));
            if let Some(sample) = self.reliability.on_ack(acked, now) {
                self.stats.record_acknowledgment();
                self.latency.add_sample(sample);
            }
            return Ok(());
        }

        let verdict = self.reliability.on_receive(header.sequence);

        // every reliable inbound packet is acked, duplicates included - the peer
        //  keeps resending until an ack gets through
        if header.reliability.is_reliable() {
            self.enqueue_ack(header.sequence, now);
        }

        match verdict {
            ReceiveVerdict::Duplicate => return Ok(()),
            ReceiveVerdict::Fresh { reordered } => {
                if reordered {
                    self.stats.record_reordered();
                }
            }
        }

        let deliverable = match self.reliability.apply_ordering(
            header.sequence,
            header.reliability,
            InboundFrame {
                message_id: header.message_id,
                fragment: header.fragment,
                payload: payload.to_vec(),
            },
            now,
        ) {
            Ok(deliverable) => deliverable,
            Err(e) => {
                // the ordered buffer overflowed; this breaks the connection
                self.fail(LinkEvent::FlowBroken);
                return Err(e);
            }
        };

        let mut first_error = None;
        for frame in deliverable {
            if let Err(e) = self.deliver_frame(frame, now) {
                self.stats.record_corrupted();
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_ack(header: &PacketHeader, payload: &[u8]) -> bool {
        payload.len() == 4
            && header.reliability == Reliability::Unreliable
            && header.priority == Priority::Immediate
            && header.message_id == MessageIdAllocator::UNFRAGMENTED
            && header.fragment.is_none()
    }

    fn enqueue_ack(&mut self, received: SequenceNumber, now: Instant) {
        // acks live outside the sequenced space: the peer identifies them by shape
        //  and never inspects their sequence field
        let sequence = self.reliability.peek_sequence();
        let wire = self.serialize_packet(
            sequence,
            MessageIdAllocator::UNFRAGMENTED,
            None,
            Reliability::Unreliable,
            Priority::Immediate,
            &received.to_raw().to_be_bytes(),
            now,
        );
        let ack = QueuedPacket {
            sequence,
            priority: Priority::Immediate,
            reliability: Reliability::Unreliable,
            deadline: now + self.config.keep_alive_interval,
            wire,
        };
        if self.scheduler.enqueue(ack).is_err() {
            // the peer will resend and trigger another ack attempt
            debug!("dropping ack for #{}: scheduler queue full", received);
        }
    }

    fn deliver_frame(&mut self, frame: InboundFrame, now: Instant) -> Result<(), LinkError> {
        let sealed = match frame.fragment {
            None => Some(frame.payload),
            Some(header) => {
                self.reassembler
                    .on_fragment(frame.message_id, header, &frame.payload, now)?
            }
        };

        let Some(sealed) = sealed else {
            return Ok(()); // fragment group still incomplete
        };

        let open_qos = QosProfile {
            compression: self.config.compression,
            encryption: self.codec.has_cipher(),
            ..QosProfile::default()
        };
        let message = self.codec.open(&sealed, &open_qos)?;

        // zero-payload messages are keep-alives / handshake hellos, not application data
        if !message.is_empty() {
            self.inbound_ready.push_back(message);
        }
        Ok(())
    }

    fn fail(&mut self, event: LinkEvent) {
        warn!("connection to {:?} failed: {:?}", self.remote, event);
        self.state = ConnectionState::Failed;
        self.events.push_back(event);
        self.drain_owned_buffers();
    }

    fn drain_owned_buffers(&mut self) {
        self.scheduler.clear();
        for sequence in self.reliability.cancel_all_pending() {
            self.stats.record_lost();
            self.events.push_back(LinkEvent::DeliveryFailed(sequence));
        }
        self.reassembler = Reassembler::new(self.config.fragment_timeout);
        self.drain_deadline = None;
    }

    /// Advance timers and produce the datagrams to put on the wire: keep-alives,
    ///  retransmissions, scheduler releases, teardown progress. Called on a fixed
    ///  cadence by the endpoint's driver.
    pub fn tick(&mut self, now: Instant) -> Vec<Vec<u8>> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => return Vec::new(),

            ConnectionState::Connecting | ConnectionState::Connected => {
                if now.duration_since(self.last_inbound) >= self.config.connection_timeout {
                    self.fail(LinkEvent::PeerTimeout);
                    return Vec::new();
                }
                if self.state == ConnectionState::Connected
                    && now.duration_since(self.last_outbound) >= self.config.keep_alive_interval
                    && self.scheduler.is_empty()
                {
                    trace!("sending keep-alive to {:?}", self.remote);
                    if let Err(e) = self.send(&[], &self.config.control_qos(), now) {
                        debug!("failed to enqueue keep-alive: {}", e);
                    }
                }
            }

            ConnectionState::Disconnecting => {
                let deadline_passed = self.drain_deadline.is_some_and(|deadline| now >= deadline);
                if self.scheduler.is_empty() || deadline_passed {
                    if deadline_passed && !self.scheduler.is_empty() {
                        debug!("drain window for {:?} elapsed, discarding {} queued packets", self.remote, self.scheduler.len());
                    }
                    // pending reliable sends are cancelled and reported as failed
                    self.drain_owned_buffers();
                    self.state = ConnectionState::Disconnected;
                    self.events.push_back(LinkEvent::Disconnected);
                    return Vec::new();
                }
            }
        }

        // retransmissions re-enter the scheduler with refreshed deadlines
        let retransmit = self.reliability.tick(now);
        let had_failures = !retransmit.failed.is_empty();
        for sequence in retransmit.failed {
            self.stats.record_lost();
            self.events.push_back(LinkEvent::DeliveryFailed(sequence));
        }
        for packet in retransmit.resend {
            self.stats.record_retransmission();
            let sequence = packet.sequence;
            if self.scheduler.enqueue(packet).is_err() {
                debug!("dropping retransmission of #{}: scheduler queue full", sequence);
            }
        }
        if had_failures && self.state == ConnectionState::Connecting {
            // the handshake hello exhausted its retries
            self.fail(LinkEvent::PeerTimeout);
            return Vec::new();
        }

        self.reassembler.expire(now);

        // ordered frames stuck behind a slot that can never resolve (a lost
        //  unreliable packet) are released once the stall horizon passes
        for frame in self.reliability.release_stalled(now, self.config.fragment_timeout) {
            if let Err(e) = self.deliver_frame(frame, now) {
                debug!("failed to deliver a stall-released frame: {}", e);
                self.stats.record_corrupted();
            }
        }

        let outcome = self.scheduler.drain(now);
        for packet in outcome.expired {
            debug!("packet #{} missed its deadline in the send queue", packet.sequence);
            if packet.reliability.is_reliable() {
                self.reliability.untrack(packet.sequence);
            }
            self.events.push_back(LinkEvent::DeadlineMissed(packet.sequence));
        }

        let mut outbound = Vec::with_capacity(outcome.released.len());
        for packet in outcome.released {
            self.stats.record_sent(packet.wire.len(), packet.priority, packet.reliability);
            self.bandwidth.record(now, packet.wire.len() as u64);
            if packet.reliability.is_reliable() {
                self.reliability.note_sent(now);
            }
            self.last_outbound = now;
            outbound.push(packet.wire);
        }

        match &mut self.simulator {
            None => outbound,
            Some(simulator) => {
                for packet in outbound {
                    simulator.submit(packet, now);
                }
                simulator.take_due(now)
            }
        }
    }
}
