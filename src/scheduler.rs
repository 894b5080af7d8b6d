use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::qos::{Priority, Reliability};
use crate::seq::SequenceNumber;
use std::collections::VecDeque;
use std::time::Instant;

/// A serialized packet waiting for release to the wire.
pub struct QueuedPacket {
    pub sequence: SequenceNumber,
    pub priority: Priority,
    pub reliability: Reliability,
    /// once this instant has passed, the packet is dropped instead of released
    pub deadline: Instant,
    pub wire: Vec<u8>,
}

/// Outcome of one scheduler pass: packets released to the wire, and packets whose
///  deadline passed while they were queued.
pub struct DrainOutcome {
    pub released: Vec<QueuedPacket>,
    pub expired: Vec<QueuedPacket>,
}

/// Outbound scheduler: one FIFO per priority class, drained strictly from Immediate
///  down to Lowest, gated by a token-bucket bandwidth governor.
///
/// Deadlines never reorder packets within a class; they only decide between release
///  and drop at the moment a packet reaches the head of the drain.
pub struct PacketScheduler {
    queues: [VecDeque<QueuedPacket>; Priority::NUM_CLASSES],
    queue_capacity: usize,
    bucket: TokenBucket,
}

impl PacketScheduler {
    pub fn new(config: &LinkConfig) -> PacketScheduler {
        PacketScheduler {
            queues: Default::default(),
            queue_capacity: config.send_queue_capacity,
            bucket: TokenBucket::new(config.bandwidth_bytes_per_sec, config.mtu),
        }
    }

    /// whether `count` more packets fit the class's queue, used to reject a
    ///  multi-fragment message atomically before any fragment is queued
    pub fn has_capacity(&self, priority: Priority, count: usize) -> bool {
        self.queues[priority.index()].len() + count <= self.queue_capacity
    }

    pub fn enqueue(&mut self, packet: QueuedPacket) -> Result<(), LinkError> {
        let queue = &mut self.queues[packet.priority.index()];
        if queue.len() >= self.queue_capacity {
            return Err(LinkError::QueueFull);
        }
        queue.push_back(packet);
        Ok(())
    }

    /// Release everything the bandwidth governor permits, in priority order. Stops at
    ///  the first packet the governor refuses: lower classes must not overtake it.
    pub fn drain(&mut self, now: Instant) -> DrainOutcome {
        self.bucket.refill(now);

        let mut released = Vec::new();
        let mut expired = Vec::new();

        'classes: for queue in &mut self.queues {
            while let Some(front) = queue.front() {
                if front.deadline < now {
                    expired.push(queue.pop_front().expect("front was just inspected"));
                    continue;
                }
                if !self.bucket.try_consume(front.wire.len()) {
                    break 'classes;
                }
                released.push(queue.pop_front().expect("front was just inspected"));
            }
        }

        DrainOutcome { released, expired }
    }

    /// discard all queued packets, returning them so the caller can cancel reliable
    ///  tracking and raise events
    pub fn clear(&mut self) -> Vec<QueuedPacket> {
        let mut remaining = Vec::new();
        for queue in &mut self.queues {
            remaining.extend(queue.drain(..));
        }
        remaining
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }
}

/// Byte-denominated token bucket. Tokens accrue at the configured rate and are
///  capped at `max(rate, 2 * mtu)`; a rate of 0 disables the governor entirely.
struct TokenBucket {
    rate: u64,
    tokens: f64,
    cap: f64,
    last_refill: Option<Instant>,
}

impl TokenBucket {
    fn new(rate: u64, mtu: usize) -> TokenBucket {
        TokenBucket {
            rate,
            tokens: 0.0,
            cap: (rate as f64).max(2.0 * mtu as f64),
            last_refill: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.rate == 0 {
            return;
        }
        if let Some(last) = self.last_refill {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.cap);
        }
        self.last_refill = Some(now);
    }

    fn try_consume(&mut self, bytes: usize) -> bool {
        if self.rate == 0 {
            return true;
        }
        if self.tokens < bytes as f64 {
            return false;
        }
        self.tokens -= bytes as f64;
        true
    }
}
