//! End-to-end scenarios: two connections wired back to back through the
//!  network-condition simulator, driven by virtual time. Everything here is
//!  deterministic - the simulators run on fixed seeds and all timing is explicit.

use gamelink::connection::Connection;
use gamelink::frame_codec::FrameCodec;
use gamelink::scheduler::{PacketScheduler, QueuedPacket};
use gamelink::seq::SequenceNumber;
use gamelink::simulator::{NetworkCondition, NetworkSimulator};
use gamelink::{LinkConfig, LinkEvent, Priority, QosProfile, Reliability};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Loopback {
    a: Connection,
    b: Connection,
    now: Instant,
}

impl Loopback {
    /// an initiator and a passive peer, with the handshake already completed
    fn new(config: LinkConfig) -> Loopback {
        let t0 = Instant::now();
        let config = Arc::new(config);
        let codec = Arc::new(FrameCodec::new(&config));

        let a = Connection::new("10.0.0.1:7000".parse().unwrap(), config.clone(), codec.clone(), t0);
        let b = Connection::accept("10.0.0.2:7000".parse().unwrap(), config, codec, t0);

        let mut this = Loopback { a, b, now: t0 };
        this.a.connect(this.now);
        this.step();
        this.step();
        this
    }

    /// advance virtual time by one millisecond and exchange all due datagrams
    fn step(&mut self) {
        self.now += Duration::from_millis(1);
        for datagram in self.a.tick(self.now) {
            let _ = self.b.on_datagram(&datagram, self.now);
        }
        for datagram in self.b.tick(self.now) {
            let _ = self.a.on_datagram(&datagram, self.now);
        }
    }

    fn drain_events(connection: &mut Connection) -> Vec<LinkEvent> {
        std::iter::from_fn(|| connection.poll_event()).collect()
    }
}

fn qos(reliability: Reliability) -> QosProfile {
    QosProfile {
        reliability,
        max_retries: 10,
        timeout: Duration::from_secs(5),
        ..QosProfile::default()
    }
}

/// 1000 reliable payloads through 30% loss in both directions: every payload
///  arrives exactly once and no delivery fails.
#[test]
fn test_lossy_reliable_delivers_everything_exactly_once() {
    let mut loopback = Loopback::new(LinkConfig::default_game());
    loopback.a.set_simulator(Some(NetworkSimulator::new(
        NetworkCondition { loss: 0.3, ..Default::default() },
        1,
    )));

    const COUNT: usize = 1000;
    let profile = qos(Reliability::Reliable);
    for i in 0..COUNT {
        let mut payload = vec![0u8; 64];
        payload[..2].copy_from_slice(&(i as u16).to_be_bytes());
        loopback.a.send(&payload, &profile, loopback.now).unwrap();
    }

    let mut deliveries = vec![0u32; COUNT];
    for _ in 0..20_000 {
        loopback.step();
        while let Some(message) = loopback.b.receive() {
            assert_eq!(message.len(), 64);
            let index = u16::from_be_bytes([message[0], message[1]]) as usize;
            deliveries[index] += 1;
        }
        if deliveries.iter().all(|&count| count == 1) {
            break;
        }
    }

    assert!(deliveries.iter().all(|&count| count == 1), "some payloads were lost or duplicated");
    let events = Loopback::drain_events(&mut loopback.a);
    assert!(
        !events.iter().any(|e| matches!(e, LinkEvent::DeliveryFailed(_))),
        "unexpected delivery failures: {:?}",
        events
    );
}

/// 50 ordered payloads through heavy reordering: the application observes them in
///  exactly the order they were sent.
#[test]
fn test_ordered_delivery_under_reorder() {
    let mut loopback = Loopback::new(LinkConfig::default_game());
    loopback.a.set_simulator(Some(NetworkSimulator::new(
        NetworkCondition { reorder: 0.5, ..Default::default() },
        3,
    )));

    let profile = qos(Reliability::ReliableOrdered);
    for i in 0..50u8 {
        loopback.a.send(&[i], &profile, loopback.now).unwrap();
    }

    let mut observed = Vec::new();
    for _ in 0..5_000 {
        loopback.step();
        while let Some(message) = loopback.b.receive() {
            observed.push(message[0]);
        }
        if observed.len() == 50 {
            break;
        }
    }

    assert_eq!(observed, (0..50).collect::<Vec<u8>>());
}

/// one 64 KiB reliable payload at fragment size 1024: fragments on the wire, one
///  byte-for-byte reassembled payload at the peer
#[test]
fn test_large_payload_fragments_and_round_trips() {
    let mut loopback = Loopback::new(LinkConfig::default_game());

    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect();
    loopback
        .a
        .send(&payload, &qos(Reliability::Reliable), loopback.now)
        .unwrap();

    // count the wire packets of the next tick: the framed payload is one byte
    //  larger than the message, so it spans 65 fragments of 1024 bytes
    loopback.now += Duration::from_millis(1);
    let datagrams = loopback.a.tick(loopback.now);
    assert_eq!(datagrams.len(), 65);

    loopback.now += Duration::from_millis(1);
    for datagram in datagrams {
        loopback.b.on_datagram(&datagram, loopback.now).unwrap();
    }

    assert_eq!(loopback.b.receive(), Some(payload));
    assert_eq!(loopback.b.receive(), None);
}

/// an Immediate packet enqueued into a backlog of Low traffic is the very next
///  packet the scheduler releases
#[test]
fn test_priority_preemption_under_bandwidth_pressure() {
    let t0 = Instant::now();
    let mut config = LinkConfig::default_game();
    config.bandwidth_bytes_per_sec = 1000;
    let mut scheduler = PacketScheduler::new(&config);

    let deadline = t0 + Duration::from_secs(600);
    let packet = |seq: u32, priority: Priority| QueuedPacket {
        sequence: SequenceNumber::from_raw(seq),
        priority,
        reliability: Reliability::Unreliable,
        deadline,
        wire: vec![0; 100],
    };

    for seq in 0..100 {
        scheduler.enqueue(packet(seq, Priority::Low)).unwrap();
    }

    // flush 50 Low packets at 10 packets per second
    let mut now = t0;
    let mut flushed = Vec::new();
    while flushed.len() < 50 {
        now += Duration::from_millis(100);
        flushed.extend(scheduler.drain(now).released);
    }
    assert_eq!(flushed.len(), 50);

    scheduler.enqueue(packet(1000, Priority::Immediate)).unwrap();

    let mut next = None;
    while next.is_none() {
        now += Duration::from_millis(100);
        next = scheduler.drain(now).released.into_iter().next();
    }
    assert_eq!(next.unwrap().sequence.to_raw(), 1000);
}

/// a fragment group whose middle fragment never arrives is reclaimed after the
///  fragment timeout, and nothing reaches the application
#[test]
fn test_incomplete_fragment_group_times_out() {
    let mut config = LinkConfig::default_game();
    config.fragment_timeout = Duration::from_millis(200);
    let mut loopback = Loopback::new(config);

    // three fragments of unreliable traffic, so nothing is retransmitted
    let mut profile = qos(Reliability::Unreliable);
    profile.timeout = Duration::from_secs(60);
    let payload = vec![7u8; 3000];
    loopback.a.send(&payload, &profile, loopback.now).unwrap();

    loopback.now += Duration::from_millis(1);
    let datagrams = loopback.a.tick(loopback.now);
    assert_eq!(datagrams.len(), 3);

    // fragment 1 is lost forever
    loopback.now += Duration::from_millis(1);
    loopback.b.on_datagram(&datagrams[0], loopback.now).unwrap();
    loopback.b.on_datagram(&datagrams[2], loopback.now).unwrap();
    assert_eq!(loopback.b.pending_fragment_groups(), 1);

    let reclaimed_by = loopback.now + Duration::from_millis(250);
    while loopback.now < reclaimed_by {
        loopback.step();
    }

    assert_eq!(loopback.b.pending_fragment_groups(), 0);
    assert_eq!(loopback.b.receive(), None);
}

/// exactly-once in the face of a hostile amount of duplication on the wire
#[test]
fn test_duplication_on_the_wire_never_duplicates_delivery() {
    let mut loopback = Loopback::new(LinkConfig::default_game());

    let profile = qos(Reliability::Reliable);
    loopback.a.send(b"solo", &profile, loopback.now).unwrap();

    loopback.now += Duration::from_millis(1);
    let datagrams = loopback.a.tick(loopback.now);

    loopback.now += Duration::from_millis(1);
    for _ in 0..10 {
        for datagram in &datagrams {
            let _ = loopback.b.on_datagram(datagram, loopback.now);
        }
    }

    assert_eq!(loopback.b.receive(), Some(b"solo".to_vec()));
    assert_eq!(loopback.b.receive(), None);
}

/// compression and encryption enabled end to end: payloads round-trip and the
///  wire bytes are not the plaintext
#[test]
fn test_sealed_connection_round_trip() {
    let mut config = LinkConfig::default_game();
    config.compression = true;
    config.encryption_key = Some([0x5a; 32]);
    config.default_qos.compression = true;
    config.default_qos.encryption = true;
    config.validate().unwrap();
    let mut loopback = Loopback::new(config);

    let payload = b"state snapshot ".repeat(40);
    let profile = QosProfile {
        reliability: Reliability::Reliable,
        compression: true,
        encryption: true,
        ..QosProfile::default()
    };
    loopback.a.send(&payload, &profile, loopback.now).unwrap();

    loopback.now += Duration::from_millis(1);
    let datagrams = loopback.a.tick(loopback.now);
    assert_eq!(datagrams.len(), 1);
    let haystack = &datagrams[0];
    let needle = b"state snapshot";
    assert!(
        !haystack.windows(needle.len()).any(|w| w == needle),
        "plaintext visible on the wire"
    );

    loopback.now += Duration::from_millis(1);
    loopback.b.on_datagram(&datagrams[0], loopback.now).unwrap();
    assert_eq!(loopback.b.receive(), Some(payload));
}

/// both peers talking at once, mixed reliability modes, moderate loss and jitter:
///  all reliable traffic arrives, nothing arrives twice
#[test]
fn test_bidirectional_mixed_traffic_under_impairment() {
    let mut loopback = Loopback::new(LinkConfig::default_game());
    let condition = NetworkCondition {
        loss: 0.15,
        latency: Duration::from_millis(20),
        jitter: Duration::from_millis(10),
        reorder: 0.2,
        ..Default::default()
    };
    loopback.a.set_simulator(Some(NetworkSimulator::new(condition.clone(), 11)));
    loopback.b.set_simulator(Some(NetworkSimulator::new(condition, 12)));

    let reliable = qos(Reliability::Reliable);
    for i in 0..100u8 {
        loopback.a.send(&[b'a', i], &reliable, loopback.now).unwrap();
        loopback.b.send(&[b'b', i], &reliable, loopback.now).unwrap();
    }

    let mut at_a = vec![0u32; 100];
    let mut at_b = vec![0u32; 100];
    for _ in 0..20_000 {
        loopback.step();
        while let Some(message) = loopback.b.receive() {
            assert_eq!(message[0], b'a');
            at_b[message[1] as usize] += 1;
        }
        while let Some(message) = loopback.a.receive() {
            assert_eq!(message[0], b'b');
            at_a[message[1] as usize] += 1;
        }
        if at_a.iter().all(|&c| c == 1) && at_b.iter().all(|&c| c == 1) {
            break;
        }
    }

    assert!(at_a.iter().all(|&c| c == 1), "b->a traffic incomplete or duplicated");
    assert!(at_b.iter().all(|&c| c == 1), "a->b traffic incomplete or duplicated");
}
