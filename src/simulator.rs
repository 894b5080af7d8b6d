use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use tracing::trace;

/// Impairments applied to outbound packets when the simulator is enabled.
///  Probabilities are in `0.0..=1.0`; a bandwidth of 0 means uncapped.
#[derive(Clone, Debug)]
pub struct NetworkCondition {
    pub loss: f64,
    pub latency: Duration,
    pub jitter: Duration,
    pub corruption: f64,
    pub reorder: f64,
    pub bandwidth_bytes_per_sec: u64,
}

impl Default for NetworkCondition {
    fn default() -> NetworkCondition {
        NetworkCondition {
            loss: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            corruption: 0.0,
            reorder: 0.0,
            bandwidth_bytes_per_sec: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub submitted: u64,
    pub dropped: u64,
    pub corrupted: u64,
    pub reordered: u64,
    pub delayed_by_bandwidth: u64,
}

/// Development / test tool that injects loss, corruption, latency, reordering and a
///  bandwidth cap between the scheduler and the wire.
///
/// Latency and the bandwidth cap delay a packet's *effective send instant*; the
///  timestamps inside the packet are untouched, so RTT measurement at the peers is
///  not skewed by simulated delay. All randomness comes from a seedable PRNG, so a
///  fixed seed gives a reproducible schedule.
pub struct NetworkSimulator {
    condition: NetworkCondition,
    rng: StdRng,
    /// (release instant, submission counter, packet), unordered until drained
    in_flight: Vec<(Instant, u64, Vec<u8>)>,
    submission_counter: u64,
    /// virtual clock of the capped link: when the previous transmission finishes
    link_free_at: Option<Instant>,
    stats: SimulatorStats,
}

impl NetworkSimulator {
    pub fn new(condition: NetworkCondition, seed: u64) -> NetworkSimulator {
        NetworkSimulator {
            condition,
            rng: StdRng::seed_from_u64(seed),
            in_flight: Vec::new(),
            submission_counter: 0,
            link_free_at: None,
            stats: SimulatorStats::default(),
        }
    }

    /// Run one packet through the impairment chain: drop, corrupt, delay, reorder,
    ///  bandwidth cap. Surviving packets are queued until their release instant.
    pub fn submit(&mut self, mut packet: Vec<u8>, now: Instant) {
        self.stats.submitted += 1;

        if self.condition.loss > 0.0 && self.rng.gen::<f64>() < self.condition.loss {
            trace!("simulator: dropping packet of {} bytes", packet.len());
            self.stats.dropped += 1;
            return;
        }

        if self.condition.corruption > 0.0
            && !packet.is_empty()
            && self.rng.gen::<f64>() < self.condition.corruption
        {
            let index = self.rng.gen_range(0..packet.len());
            packet[index] ^= 1 << self.rng.gen_range(0..8);
            self.stats.corrupted += 1;
        }

        let mut delay = self.condition.latency.as_secs_f64();
        let jitter = self.condition.jitter.as_secs_f64();
        if jitter > 0.0 {
            delay += self.rng.gen_range(-jitter..=jitter);
        }
        let mut release = now + Duration::from_secs_f64(delay.max(0.0));

        if self.condition.bandwidth_bytes_per_sec > 0 {
            let transmission = Duration::from_secs_f64(
                packet.len() as f64 / self.condition.bandwidth_bytes_per_sec as f64,
            );
            let start = self.link_free_at.map_or(now, |free| free.max(now));
            if start > now {
                self.stats.delayed_by_bandwidth += 1;
            }
            self.link_free_at = Some(start + transmission);
            release = release.max(start + transmission);
        }

        self.in_flight.push((release, self.submission_counter, packet));
        self.submission_counter += 1;

        if self.condition.reorder > 0.0
            && self.in_flight.len() >= 2
            && self.rng.gen::<f64>() < self.condition.reorder
        {
            // pairwise swap at the tail: the two newest packets trade places
            let len = self.in_flight.len();
            let (left, right) = self.in_flight.split_at_mut(len - 1);
            let a = left.last_mut().expect("len was checked");
            let b = &mut right[0];
            std::mem::swap(&mut a.0, &mut b.0);
            std::mem::swap(&mut a.1, &mut b.1);
            self.stats.reordered += 1;
        }
    }

    /// remove and return all packets whose release instant has been reached, in
    ///  release order
    pub fn take_due(&mut self, now: Instant) -> Vec<Vec<u8>> {
        self.in_flight.sort_by_key(|(release, counter, _)| (*release, *counter));

        let due = self.in_flight.iter().take_while(|(release, _, _)| *release <= now).count();
        self.in_flight
            .drain(..due)
            .map(|(_, _, packet)| packet)
            .collect()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &SimulatorStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn simulator(condition: NetworkCondition) -> NetworkSimulator {
        NetworkSimulator::new(condition, 42)
    }

    #[test]
    fn test_clean_condition_passes_everything_through_immediately() {
        let t0 = Instant::now();
        let mut sim = simulator(NetworkCondition::default());

        sim.submit(vec![1], t0);
        sim.submit(vec![2], t0);
        assert_eq!(sim.take_due(t0), vec![vec![1], vec![2]]);
        assert_eq!(sim.stats().dropped, 0);
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let t0 = Instant::now();
        let mut sim = simulator(NetworkCondition { loss: 1.0, ..Default::default() });

        for i in 0..10u8 {
            sim.submit(vec![i], t0);
        }
        assert!(sim.take_due(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(sim.stats().dropped, 10);
    }

    #[test]
    fn test_partial_loss_is_deterministic_under_a_fixed_seed() {
        let t0 = Instant::now();
        let run = || {
            let mut sim = simulator(NetworkCondition { loss: 0.5, ..Default::default() });
            for i in 0..100u8 {
                sim.submit(vec![i], t0);
            }
            sim.take_due(t0)
        };

        let first = run();
        assert_eq!(first, run());
        assert!(!first.is_empty() && first.len() < 100);
    }

    #[test]
    fn test_corruption_flips_exactly_one_bit() {
        let t0 = Instant::now();
        let mut sim = simulator(NetworkCondition { corruption: 1.0, ..Default::default() });

        let original = vec![0u8; 32];
        sim.submit(original.clone(), t0);
        let delivered = sim.take_due(t0).remove(0);

        let flipped_bits: u32 = original
            .iter()
            .zip(&delivered)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        assert_eq!(flipped_bits, 1);
        assert_eq!(sim.stats().corrupted, 1);
    }

    #[rstest]
    #[case::base_only(Duration::from_millis(50), Duration::ZERO)]
    #[case::with_jitter(Duration::from_millis(50), Duration::from_millis(20))]
    fn test_latency_delays_release(#[case] latency: Duration, #[case] jitter: Duration) {
        let t0 = Instant::now();
        let mut sim = simulator(NetworkCondition { latency, jitter, ..Default::default() });

        sim.submit(vec![1], t0);
        assert!(sim.take_due(t0 + Duration::from_millis(29)).is_empty());
        assert_eq!(sim.take_due(t0 + Duration::from_millis(71)).len(), 1);
    }

    #[test]
    fn test_certain_reorder_swaps_adjacent_packets() {
        let t0 = Instant::now();
        let mut sim = simulator(NetworkCondition { reorder: 1.0, ..Default::default() });

        sim.submit(vec![1], t0);
        sim.submit(vec![2], t0);
        assert_eq!(sim.take_due(t0), vec![vec![2], vec![1]]);
        assert_eq!(sim.stats().reordered, 1);
    }

    #[test]
    fn test_bandwidth_cap_spaces_out_transmissions() {
        let t0 = Instant::now();
        let mut sim = simulator(NetworkCondition {
            bandwidth_bytes_per_sec: 1000,
            ..Default::default()
        });

        // two 500 byte packets over a 1000 B/s link: 0.5s and 1.0s transmission ends
        sim.submit(vec![0; 500], t0);
        sim.submit(vec![0; 500], t0);

        assert!(sim.take_due(t0 + Duration::from_millis(499)).is_empty());
        assert_eq!(sim.take_due(t0 + Duration::from_millis(500)).len(), 1);
        assert!(sim.take_due(t0 + Duration::from_millis(999)).is_empty());
        assert_eq!(sim.take_due(t0 + Duration::from_millis(1000)).len(), 1);
        assert_eq!(sim.stats().delayed_by_bandwidth, 1);
    }
}
