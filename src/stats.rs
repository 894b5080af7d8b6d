use crate::qos::{Priority, Reliability};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Running per-connection counters.
///
/// All counters are relaxed atomics: they are written from the connection's tick path
///  and read from arbitrary application threads, and readers tolerate slight skew.
#[derive(Default)]
pub struct LinkStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_lost: AtomicU64,
    packets_corrupted: AtomicU64,
    packets_reordered: AtomicU64,
    retransmissions: AtomicU64,
    acknowledgments: AtomicU64,
    packets_by_priority: [AtomicU64; Priority::NUM_CLASSES],
    packets_by_reliability: [AtomicU64; Reliability::NUM_MODES],
}

/// Point-in-time copy of [LinkStats], plus the derived windowed values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_corrupted: u64,
    pub packets_reordered: u64,
    pub retransmissions: u64,
    pub acknowledgments: u64,
    pub packets_by_priority: [u64; Priority::NUM_CLASSES],
    pub packets_by_reliability: [u64; Reliability::NUM_MODES],
}

impl LinkStats {
    pub fn record_sent(&self, bytes: usize, priority: Priority, reliability: Reliability) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.packets_by_priority[priority.index()].fetch_add(1, Ordering::Relaxed);
        self.packets_by_reliability[reliability.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self) {
        self.packets_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupted(&self) {
        self.packets_corrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reordered(&self) {
        self.packets_reordered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledgment(&self) {
        self.acknowledgments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            packets_corrupted: self.packets_corrupted.load(Ordering::Relaxed),
            packets_reordered: self.packets_reordered.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            acknowledgments: self.acknowledgments.load(Ordering::Relaxed),
            packets_by_priority: std::array::from_fn(|i| {
                self.packets_by_priority[i].load(Ordering::Relaxed)
            }),
            packets_by_reliability: std::array::from_fn(|i| {
                self.packets_by_reliability[i].load(Ordering::Relaxed)
            }),
        }
    }

    pub fn reset(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_received.store(0, Ordering::Relaxed);
        self.packets_lost.store(0, Ordering::Relaxed);
        self.packets_corrupted.store(0, Ordering::Relaxed);
        self.packets_reordered.store(0, Ordering::Relaxed);
        self.retransmissions.store(0, Ordering::Relaxed);
        self.acknowledgments.store(0, Ordering::Relaxed);
        for counter in &self.packets_by_priority {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in &self.packets_by_reliability {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Bytes released to the wire within a sliding window, used for the "current
///  bandwidth" statistic.
pub struct BandwidthWindow {
    window: Duration,
    entries: VecDeque<(Instant, u64)>,
    cached_sum: u64,
}

impl BandwidthWindow {
    pub fn new(window: Duration) -> BandwidthWindow {
        BandwidthWindow {
            window,
            entries: VecDeque::new(),
            cached_sum: 0,
        }
    }

    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.prune(now);
        self.entries.push_back((now, bytes));
        self.cached_sum += bytes;
    }

    pub fn bytes_in_window(&mut self, now: Instant) -> u64 {
        self.prune(now);
        self.cached_sum
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.entries.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.cached_sum -= bytes;
            self.entries.pop_front();
        }
    }
}

/// Sliding window over the most recent latency samples, providing the mean in an
///  efficient way. The generic parameter is the window size.
pub struct LatencyWindow<const N: usize> {
    samples: Vec<f64>,
    next: usize,
    cached_sum: f64,
}

impl<const N: usize> LatencyWindow<N> {
    pub fn new() -> LatencyWindow<N> {
        LatencyWindow {
            samples: Vec::new(),
            next: 0,
            cached_sum: 0.0,
        }
    }

    pub fn add_sample(&mut self, rtt: Duration) {
        let value = rtt.as_secs_f64() * 1000.0;
        if self.samples.len() < N {
            self.samples.push(value);
        } else {
            self.cached_sum -= self.samples[self.next];
            self.samples[self.next] = value;
            self.next = (self.next + 1) % N;
        }
        self.cached_sum += value;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn mean_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.cached_sum / self.samples.len() as f64)
    }
}
