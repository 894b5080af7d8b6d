use crate::qos::{Priority, QosProfile, Reliability};
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::time::Duration;

/// Configuration of one endpoint and all connections it opens.
///
/// Validation happens once, up front: [LinkConfig::validate] is called before any
///  connection enters Connecting, and a rejected configuration never produces
///  network traffic.
#[derive(Clone)]
pub struct LinkConfig {
    /// Maximum payload size of a single wire packet. Messages whose framed size
    ///  exceeds this are fragmented.
    ///
    /// This is the payload budget *inside* the datagram substrate. There is no MTU
    ///  discovery; picking a value the network path cannot carry causes silent
    ///  drops at the IP layer, picking it too small wastes bandwidth on headers.
    pub mtu: usize,

    /// payload bytes per fragment, at most [LinkConfig::mtu]
    pub fragment_size: usize,

    /// lifetime of an incomplete fragment group before its storage is reclaimed
    pub fragment_timeout: Duration,

    /// interval after which a keep-alive is emitted on an outbound-idle Connected
    ///  connection
    pub keep_alive_interval: Duration,

    /// inbound silence after which a connection is considered dead
    pub connection_timeout: Duration,

    /// default per-packet retry budget, used by profiles that don't override it
    pub max_retries: u32,

    /// connection-wide compression switch; the algorithm is fixed per connection,
    ///  profiles can opt out per message
    pub compression: bool,

    /// 256 bit key for authenticated encryption; `None` disables encryption for
    ///  the whole connection
    pub encryption_key: Option<[u8; 32]>,

    /// scheduler token bucket rate in bytes per second; 0 means unlimited
    pub bandwidth_bytes_per_sec: u64,

    /// cap of the ordered-delivery gap buffer; exceeding it breaks the connection
    pub ordered_buffer_cap: usize,

    /// capacity of each of the five scheduler queues
    pub send_queue_capacity: usize,

    /// how long a disconnecting connection keeps draining its queues before the
    ///  remainder is discarded
    pub drain_timeout: Duration,

    pub default_qos: QosProfile,
    pub qos_profiles: FxHashMap<u8, QosProfile>,
}

impl LinkConfig {
    pub fn default_game() -> LinkConfig {
        LinkConfig {
            mtu: 1200,
            fragment_size: 1024,
            fragment_timeout: Duration::from_secs(2),
            keep_alive_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(5),
            max_retries: 5,
            compression: false,
            encryption_key: None,
            bandwidth_bytes_per_sec: 0,
            ordered_buffer_cap: 1024,
            send_queue_capacity: 4096,
            drain_timeout: Duration::from_millis(500),
            default_qos: QosProfile::default(),
            qos_profiles: FxHashMap::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 64 {
            bail!("mtu of {} is too small to be useful", self.mtu);
        }
        if self.fragment_size == 0 || self.fragment_size > self.mtu {
            bail!(
                "fragment size must be in 1..={}, was {}",
                self.mtu,
                self.fragment_size
            );
        }
        if self.fragment_timeout.is_zero() {
            bail!("fragment timeout must be non-zero");
        }
        if self.connection_timeout.is_zero() {
            bail!("connection timeout must be non-zero");
        }
        if self.keep_alive_interval >= self.connection_timeout {
            bail!("keep-alive interval must be shorter than the connection timeout");
        }
        if self.ordered_buffer_cap == 0 {
            bail!("ordered buffer cap must be non-zero");
        }
        if self.send_queue_capacity == 0 {
            bail!("send queue capacity must be non-zero");
        }

        for (id, profile) in self
            .qos_profiles
            .iter()
            .map(|(id, p)| (Some(*id), p))
            .chain(std::iter::once((None, &self.default_qos)))
        {
            if profile.encryption && self.encryption_key.is_none() {
                match id {
                    Some(id) => bail!("qos profile {} requires encryption but no key is configured", id),
                    None => bail!("default qos profile requires encryption but no key is configured"),
                }
            }
            if profile.timeout.is_zero() {
                match id {
                    Some(id) => bail!("qos profile {} has a zero timeout", id),
                    None => bail!("default qos profile has a zero timeout"),
                }
            }
        }

        Ok(())
    }

    /// look up a configured profile by id, falling back to the default profile
    pub fn qos(&self, profile_id: u8) -> &QosProfile {
        self.qos_profiles.get(&profile_id).unwrap_or(&self.default_qos)
    }

    /// profile used for keep-alives and the connect handshake
    pub fn control_qos(&self) -> QosProfile {
        QosProfile {
            priority: Priority::Immediate,
            reliability: Reliability::Reliable,
            max_retries: self.max_retries,
            timeout: self.keep_alive_interval,
            compression: false,
            encryption: self.encryption_key.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn valid() -> LinkConfig {
        LinkConfig::default_game()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[rstest]
    #[case::tiny_mtu(|c: &mut LinkConfig| c.mtu = 32)]
    #[case::zero_fragment_size(|c: &mut LinkConfig| c.fragment_size = 0)]
    #[case::fragment_size_above_mtu(|c: &mut LinkConfig| c.fragment_size = c.mtu + 1)]
    #[case::zero_fragment_timeout(|c: &mut LinkConfig| c.fragment_timeout = Duration::ZERO)]
    #[case::zero_connection_timeout(|c: &mut LinkConfig| c.connection_timeout = Duration::ZERO)]
    #[case::keep_alive_above_timeout(|c: &mut LinkConfig| c.keep_alive_interval = c.connection_timeout)]
    #[case::zero_ordered_cap(|c: &mut LinkConfig| c.ordered_buffer_cap = 0)]
    #[case::zero_queue_capacity(|c: &mut LinkConfig| c.send_queue_capacity = 0)]
    #[case::encryption_without_key(|c: &mut LinkConfig| c.default_qos.encryption = true)]
    #[case::zero_profile_timeout(|c: &mut LinkConfig| c.default_qos.timeout = Duration::ZERO)]
    fn test_invalid_configs_are_rejected(#[case] break_it: fn(&mut LinkConfig)) {
        let mut config = valid();
        break_it(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_named_profile_lookup_falls_back_to_default() {
        let mut config = valid();
        let mut bulk = QosProfile::default();
        bulk.priority = Priority::Lowest;
        config.qos_profiles.insert(7, bulk.clone());

        assert_eq!(config.qos(7), &bulk);
        assert_eq!(config.qos(8), &config.default_qos);
    }

    #[test]
    fn test_encrypting_profile_with_key_is_accepted() {
        let mut config = valid();
        config.encryption_key = Some([0x42; 32]);
        config.default_qos.encryption = true;
        assert!(config.validate().is_ok());
    }
}
