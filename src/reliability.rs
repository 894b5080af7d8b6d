use crate::error::LinkError;
use crate::packet_header::FragmentHeader;
use crate::qos::{Priority, Reliability};
use crate::scheduler::QueuedPacket;
use crate::seq::{SequenceAllocator, SequenceNumber};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// floor for the retransmission interval, used until RTT samples exist or when the
///  link is faster than this
pub const MIN_RESEND_INTERVAL: Duration = Duration::from_millis(100);

const RTT_ALPHA: f64 = 0.125;
const LOSS_WINDOW: Duration = Duration::from_secs(1);

/// width of the duplicate-detection bitfield behind the highest received sequence
const ACK_WINDOW: i32 = 32;

struct UnackedPacket {
    wire: Vec<u8>,
    priority: Priority,
    reliability: Reliability,
    /// deadline budget a resend gets when it is re-queued
    timeout: Duration,
    max_retries: u32,
    retry_count: u32,
    last_send: Instant,
}

/// Classification of an inbound sequence number against the receive window.
#[derive(Debug, PartialEq, Eq)]
pub enum ReceiveVerdict {
    /// first sighting; `reordered` is set when the packet arrived behind the
    ///  highest sequence seen so far
    Fresh { reordered: bool },
    /// already seen (or too old to tell) - drop silently
    Duplicate,
}

/// An inbound packet body after dedupe, on its way through the ordering policy
///  towards reassembly. Fragment coordinates travel with the payload because the
///  ordered policy may buffer frames and release them much later.
#[derive(Debug, PartialEq, Eq)]
pub struct InboundFrame {
    pub message_id: u32,
    pub fragment: Option<FragmentHeader>,
    pub payload: Vec<u8>,
}

/// State of one sequence slot in the ordered gap buffer.
#[derive(Debug)]
enum OrderedSlot {
    /// an ordered frame waiting for the gap below it to close
    Frame(InboundFrame),
    /// a packet of another reliability mode was observed with this sequence, so no
    ///  ordered frame will ever occupy the slot
    Resolved,
}

/// Retransmissions and failures produced by one engine tick.
pub struct RetransmitOutcome {
    /// packets to re-enter the scheduler, deadlines refreshed
    pub resend: Vec<QueuedPacket>,
    /// packets whose retry budget is exhausted
    pub failed: Vec<SequenceNumber>,
}

/// Per-connection reliability state: the unacked table on the send side, the
///  duplicate-detection bitfield and the ordering policies on the receive side,
///  and the RTT / loss estimators.
pub struct ReliabilityEngine {
    sequences: SequenceAllocator,

    unacked: FxHashMap<u32, UnackedPacket>,

    highest_received: Option<SequenceNumber>,
    /// bit i set means `highest_received - 1 - i` was received
    ack_bits: u32,

    /// newest sequence delivered for UnreliableSequenced traffic
    last_unreliable_sequenced: Option<SequenceNumber>,
    /// newest sequence delivered for ReliableSequenced traffic
    last_reliable_sequenced: Option<SequenceNumber>,

    /// The ordered stream's cursor over the shared sequence space, unwrapped to u64
    ///  so the gap buffer's ordering survives 32 bit wrap.
    ///
    /// Sequence numbers are shared between all reliability modes, so the cursor can
    ///  only advance past a slot once that slot is *resolved*: either an ordered
    ///  frame was delivered from it, or a packet of another mode was observed
    ///  carrying its sequence. Lost unreliable packets leave slots that can never
    ///  resolve; those gaps are eventually skipped via the stall horizon
    ///  (see [ReliabilityEngine::release_stalled]).
    ordered_next: u64,
    ordered_buffer: BTreeMap<u64, OrderedSlot>,
    /// number of actual frames (not resolution markers) in the ordered buffer
    ordered_frames: usize,
    ordered_cap: usize,
    /// since when the ordered stream has been waiting on an unresolved slot
    ordered_stalled_since: Option<Instant>,

    srtt: Option<Duration>,
    /// send/loss observations within the sliding loss window; `true` entries are
    ///  losses
    loss_events: VecDeque<(Instant, bool)>,
}

impl ReliabilityEngine {
    pub fn new(ordered_cap: usize) -> ReliabilityEngine {
        ReliabilityEngine {
            sequences: SequenceAllocator::new(),
            unacked: FxHashMap::default(),
            highest_received: None,
            ack_bits: 0,
            last_unreliable_sequenced: None,
            last_reliable_sequenced: None,
            ordered_next: 0,
            ordered_buffer: BTreeMap::new(),
            ordered_frames: 0,
            ordered_cap,
            ordered_stalled_since: None,
            srtt: None,
            loss_events: VecDeque::new(),
        }
    }

    pub fn assign_sequence(&mut self) -> SequenceNumber {
        self.sequences.next()
    }

    /// sequence value stamped on packets outside the sequenced space (acks); the
    ///  peer never inspects it
    pub fn peek_sequence(&self) -> SequenceNumber {
        self.sequences.peek()
    }

    /// register a reliable packet as awaiting acknowledgement
    pub fn track(
        &mut self,
        sequence: SequenceNumber,
        wire: Vec<u8>,
        priority: Priority,
        reliability: Reliability,
        timeout: Duration,
        max_retries: u32,
        now: Instant,
    ) {
        let previous = self.unacked.insert(
            sequence.to_raw(),
            UnackedPacket {
                wire,
                priority,
                reliability,
                timeout,
                max_retries,
                retry_count: 0,
                last_send: now,
            },
        );
        debug_assert!(previous.is_none(), "sequence numbers are never reused");
    }

    /// drop tracking without an ack, e.g. when the scheduler discarded the packet
    pub fn untrack(&mut self, sequence: SequenceNumber) {
        self.unacked.remove(&sequence.to_raw());
    }

    pub fn is_tracked(&self, sequence: SequenceNumber) -> bool {
        self.unacked.contains_key(&sequence.to_raw())
    }

    /// record that a tracked packet actually left for the wire (sent observation
    ///  for the loss estimate)
    pub fn note_sent(&mut self, now: Instant) {
        self.loss_events.push_back((now, false));
    }

    /// Process an acknowledgement. Returns the RTT sample when the sequence was
    ///  still tracked, `None` for duplicate or late acks.
    pub fn on_ack(&mut self, acked: SequenceNumber, now: Instant) -> Option<Duration> {
        let packet = self.unacked.remove(&acked.to_raw())?;
        trace!("ack for packet #{} after {} retries", acked, packet.retry_count);

        let sample = now.saturating_duration_since(packet.last_send);
        let srtt = match self.srtt {
            None => sample,
            Some(srtt) => srtt.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA),
        };
        self.srtt = Some(srtt);
        Some(sample)
    }

    /// smoothed RTT estimate, if any samples exist
    pub fn rtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// `lost / (sent + lost)` over the trailing one second window
    pub fn loss_ratio(&mut self, now: Instant) -> f64 {
        while let Some(&(at, _)) = self.loss_events.front() {
            if now.duration_since(at) <= LOSS_WINDOW {
                break;
            }
            self.loss_events.pop_front();
        }
        let lost = self.loss_events.iter().filter(|(_, lost)| *lost).count();
        if self.loss_events.is_empty() {
            return 0.0;
        }
        lost as f64 / self.loss_events.len() as f64
    }

    fn resend_interval(&self) -> Duration {
        match self.srtt {
            Some(srtt) => MIN_RESEND_INTERVAL.max(2 * srtt),
            None => MIN_RESEND_INTERVAL,
        }
    }

    /// Walk the unacked table: packets idle past `max(100ms, 2 * RTT)` are either
    ///  handed back for retransmission or, with their retry budget exhausted,
    ///  removed and reported as failed.
    pub fn tick(&mut self, now: Instant) -> RetransmitOutcome {
        let interval = self.resend_interval();
        let mut resend = Vec::new();
        let mut failed = Vec::new();

        for (&raw, packet) in &mut self.unacked {
            if now.saturating_duration_since(packet.last_send) < interval {
                continue;
            }
            if packet.retry_count >= packet.max_retries {
                failed.push(SequenceNumber::from_raw(raw));
                continue;
            }
            packet.retry_count += 1;
            packet.last_send = now;
            resend.push(QueuedPacket {
                sequence: SequenceNumber::from_raw(raw),
                priority: packet.priority,
                reliability: packet.reliability,
                deadline: now + packet.timeout,
                wire: packet.wire.clone(),
            });
        }

        failed.sort_by_key(|s| s.to_raw());
        for sequence in &failed {
            debug!("packet #{} exhausted its retry budget", sequence);
            self.unacked.remove(&sequence.to_raw());
            self.loss_events.push_back((now, true));
        }

        // the unacked table iterates in hash order - make the resend order deterministic
        resend.sort_by_key(|p| p.sequence.to_raw());
        RetransmitOutcome { resend, failed }
    }

    /// drop all pending reliable packets, e.g. on connection close; the caller
    ///  reports each as failed delivery
    pub fn cancel_all_pending(&mut self) -> Vec<SequenceNumber> {
        let mut pending: Vec<SequenceNumber> = self
            .unacked
            .drain()
            .map(|(raw, _)| SequenceNumber::from_raw(raw))
            .collect();
        pending.sort_by_key(|s| s.to_raw());
        pending
    }

    /// Update the receive window with an inbound sequence number and classify it.
    ///  Duplicates within the 32 packet window are detected exactly; anything older
    ///  than the window is treated as a duplicate.
    pub fn on_receive(&mut self, sequence: SequenceNumber) -> ReceiveVerdict {
        let highest = match self.highest_received {
            None => {
                self.highest_received = Some(sequence);
                self.ack_bits = 0;
                return ReceiveVerdict::Fresh { reordered: false };
            }
            Some(highest) => highest,
        };

        let d = sequence.diff(highest);
        if d > 0 {
            // ahead of the window: shift, marking the previous highest as received
            self.ack_bits = if d >= ACK_WINDOW {
                0
            } else {
                (self.ack_bits << d) | (1 << (d - 1))
            };
            self.highest_received = Some(sequence);
            ReceiveVerdict::Fresh { reordered: false }
        } else if d == 0 {
            ReceiveVerdict::Duplicate
        } else if -d > ACK_WINDOW {
            trace!("packet #{} is older than the dedupe window - dropping", sequence);
            ReceiveVerdict::Duplicate
        } else {
            let bit = 1u32 << (-d - 1);
            if self.ack_bits & bit != 0 {
                ReceiveVerdict::Duplicate
            } else {
                self.ack_bits |= bit;
                ReceiveVerdict::Fresh { reordered: true }
            }
        }
    }

    /// Apply the ordering policy of the packet's reliability mode. Returns the
    ///  frames that become deliverable - possibly several when a gap in the ordered
    ///  stream closes, possibly none when the frame is buffered or stale.
    ///
    /// Non-ordered packets resolve their sequence slot for the ordered stream on
    ///  the way through, which is what lets the ordered cursor advance across
    ///  interleaved traffic of other modes.
    pub fn apply_ordering(
        &mut self,
        sequence: SequenceNumber,
        reliability: Reliability,
        frame: InboundFrame,
        now: Instant,
    ) -> Result<Vec<InboundFrame>, LinkError> {
        match reliability {
            Reliability::ReliableOrdered => self.deliver_ordered(sequence, frame, now),

            Reliability::Unreliable | Reliability::Reliable => {
                let mut deliverable = self.note_unordered(sequence, now);
                deliverable.push(frame);
                Ok(deliverable)
            }

            Reliability::UnreliableSequenced => {
                let mut deliverable = self.note_unordered(sequence, now);
                deliverable.extend(Self::deliver_if_newer(
                    &mut self.last_unreliable_sequenced,
                    sequence,
                    frame,
                ));
                Ok(deliverable)
            }
            Reliability::ReliableSequenced => {
                let mut deliverable = self.note_unordered(sequence, now);
                deliverable.extend(Self::deliver_if_newer(
                    &mut self.last_reliable_sequenced,
                    sequence,
                    frame,
                ));
                Ok(deliverable)
            }
        }
    }

    fn deliver_if_newer(
        newest: &mut Option<SequenceNumber>,
        sequence: SequenceNumber,
        frame: InboundFrame,
    ) -> Vec<InboundFrame> {
        match newest {
            Some(n) if !sequence.is_after(*n) => {
                trace!("sequenced packet #{} is not newer than #{} - discarding", sequence, n);
                vec![]
            }
            _ => {
                *newest = Some(sequence);
                vec![frame]
            }
        }
    }

    /// signed distance of `sequence` ahead of the ordered cursor
    fn ordered_distance(&self, sequence: SequenceNumber) -> i32 {
        sequence.to_raw().wrapping_sub(self.ordered_next as u32) as i32
    }

    fn deliver_ordered(
        &mut self,
        sequence: SequenceNumber,
        frame: InboundFrame,
        now: Instant,
    ) -> Result<Vec<InboundFrame>, LinkError> {
        let d = self.ordered_distance(sequence);

        if d < 0 {
            trace!("ordered packet #{} was already delivered or skipped - discarding", sequence);
            return Ok(vec![]);
        }
        if d == 0 {
            let mut deliverable = vec![frame];
            self.ordered_next += 1;
            deliverable.extend(self.drain_ordered(now));
            return Ok(deliverable);
        }

        if self.ordered_frames >= self.ordered_cap {
            warn!(
                "ordered buffer exceeded its cap of {} while waiting for slot #{}",
                self.ordered_cap, self.ordered_next as u32
            );
            return Err(LinkError::FlowBroken);
        }
        self.ordered_buffer
            .insert(self.ordered_next + d as u64, OrderedSlot::Frame(frame));
        self.ordered_frames += 1;
        self.ordered_stalled_since.get_or_insert(now);
        Ok(vec![])
    }

    /// mark a sequence slot as carrying a non-ordered packet; this can close a gap
    ///  and release buffered ordered frames
    fn note_unordered(&mut self, sequence: SequenceNumber, now: Instant) -> Vec<InboundFrame> {
        let d = self.ordered_distance(sequence);

        if d < 0 {
            return vec![];
        }
        if d == 0 {
            self.ordered_next += 1;
            return self.drain_ordered(now);
        }

        // markers are memory-bounded separately from the frame cap: with far too
        //  many unresolved slots the stream is skipped forward instead of broken
        if self.ordered_buffer.len() >= 4 * self.ordered_cap {
            debug!("ordered resolution markers piled up - skipping the stream forward");
            return self.skip_to_first_buffered(now);
        }
        self.ordered_buffer
            .entry(self.ordered_next + d as u64)
            .or_insert(OrderedSlot::Resolved);
        self.ordered_stalled_since.get_or_insert(now);
        vec![]
    }

    /// advance the cursor over resolved slots, collecting deliverable frames
    fn drain_ordered(&mut self, now: Instant) -> Vec<InboundFrame> {
        let mut deliverable = Vec::new();
        while let Some(slot) = self.ordered_buffer.remove(&self.ordered_next) {
            if let OrderedSlot::Frame(frame) = slot {
                self.ordered_frames -= 1;
                deliverable.push(frame);
            }
            self.ordered_next += 1;
        }
        self.ordered_stalled_since = if self.ordered_buffer.is_empty() {
            None
        } else {
            Some(now)
        };
        deliverable
    }

    fn skip_to_first_buffered(&mut self, now: Instant) -> Vec<InboundFrame> {
        match self.ordered_buffer.keys().next() {
            Some(&first) => {
                self.ordered_next = first;
                self.drain_ordered(now)
            }
            None => vec![],
        }
    }

    /// Escape hatch for gaps that can never close: a sequence slot whose packet was
    ///  unreliable and lost is never resolved, and would stall the ordered stream
    ///  forever. Once the stream has been stalled for the given horizon, the cursor
    ///  jumps to the first buffered slot. Reliable traffic is unaffected - its
    ///  retransmissions resolve slots long before the horizon.
    pub fn release_stalled(&mut self, now: Instant, horizon: Duration) -> Vec<InboundFrame> {
        match self.ordered_stalled_since {
            Some(since) if now.duration_since(since) >= horizon => {
                debug!(
                    "ordered stream stalled for {:?} waiting on slot #{} - skipping ahead",
                    horizon, self.ordered_next as u32
                );
                self.skip_to_first_buffered(now)
            }
            _ => vec![],
        }
    }

    #[cfg(test)]
    fn with_ordered_next(ordered_next: u64, ordered_cap: usize) -> ReliabilityEngine {
        let mut engine = ReliabilityEngine::new(ordered_cap);
        engine.ordered_next = ordered_next;
        engine
    }
}
