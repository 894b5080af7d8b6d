use crate::error::LinkError;
use crate::packet_header::{FragmentHeader, PacketHeader};
use crate::seq::MessageIdAllocator;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One slice of an oversized message, ready to be sequenced and queued like any
///  other packet. All fragments of a message share its id and inherit its QoS.
pub struct Fragment {
    pub message_id: u32,
    pub header: FragmentHeader,
    pub data: Vec<u8>,
}

/// Splits framed messages that exceed the MTU into fragment-sized slices.
pub struct Fragmenter {
    message_ids: MessageIdAllocator,
}

impl Fragmenter {
    pub fn new() -> Fragmenter {
        Fragmenter {
            message_ids: MessageIdAllocator::new(),
        }
    }

    pub fn split(&mut self, frame: &[u8], fragment_size: usize) -> Result<Vec<Fragment>, LinkError> {
        let total = frame.len().div_ceil(fragment_size);
        if total > PacketHeader::MAX_FRAGMENTS {
            return Err(LinkError::MessageTooLarge {
                size: frame.len(),
                max: PacketHeader::MAX_FRAGMENTS * fragment_size,
            });
        }

        let message_id = self.message_ids.next();
        Ok(frame
            .chunks(fragment_size)
            .enumerate()
            .map(|(index, chunk)| Fragment {
                message_id,
                header: FragmentHeader {
                    index: index as u16,
                    total: total as u8,
                },
                data: chunk.to_vec(),
            })
            .collect())
    }
}

struct FragmentGroup {
    total: u8,
    received: u8,
    fragments: Vec<Option<Vec<u8>>>,
    first_seen: Instant,
}

/// Buffers inbound fragments by message id until a group is complete, then
///  reconstructs the framed message.
///
/// An incomplete group is reclaimed after the configured timeout without surfacing
///  an error: for reliable traffic the per-fragment reliability layer has already
///  reported the failure by then, for unreliable traffic the loss is expected.
pub struct Reassembler {
    groups: FxHashMap<u32, FragmentGroup>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Reassembler {
        Reassembler {
            groups: FxHashMap::default(),
            timeout,
        }
    }

    /// Store one fragment, returning the reassembled message once all indices are
    ///  present. Duplicates overwrite the identically-positioned fragment.
    pub fn on_fragment(
        &mut self,
        message_id: u32,
        header: FragmentHeader,
        data: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, LinkError> {
        let group = self.groups.entry(message_id).or_insert_with(|| FragmentGroup {
            total: header.total,
            received: 0,
            fragments: vec![None; header.total as usize],
            first_seen: now,
        });

        if group.total != header.total {
            warn!(
                "fragment for message {} declares {} total fragments, group was created with {}",
                message_id, header.total, group.total
            );
            return Err(LinkError::Malformed("fragment total mismatch"));
        }

        let slot = &mut group.fragments[header.index as usize];
        if slot.is_none() {
            group.received += 1;
        }
        *slot = Some(data.to_vec());

        if group.received < group.total {
            return Ok(None);
        }

        let group = self
            .groups
            .remove(&message_id)
            .expect("group was just inspected");
        let mut frame = Vec::with_capacity(group.fragments.iter().map(|f| f.as_ref().map_or(0, |d| d.len())).sum());
        for fragment in group.fragments {
            frame.extend_from_slice(&fragment.expect("complete group has all fragments"));
        }
        Ok(Some(frame))
    }

    /// reclaim groups that have not completed within the timeout
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.groups.len();
        let timeout = self.timeout;
        self.groups.retain(|message_id, group| {
            let keep = now.duration_since(group.first_seen) < timeout;
            if !keep {
                debug!(
                    "fragment group {} incomplete after {:?} ({}/{} fragments) - reclaiming",
                    message_id, timeout, group.received, group.total
                );
            }
            keep
        });
        before - self.groups.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn reassembler() -> Reassembler {
        Reassembler::new(Duration::from_secs(2))
    }

    #[rstest]
    #[case::single_full_fragment(1024, 1024, 1)]
    #[case::just_over_one_fragment(1025, 1024, 2)]
    #[case::many(10_000, 1024, 10)]
    #[case::tiny_fragments(100, 16, 7)]
    fn test_split_produces_dense_indices(
        #[case] frame_len: usize,
        #[case] fragment_size: usize,
        #[case] expected_total: usize,
    ) {
        let frame: Vec<u8> = (0..frame_len).map(|i| i as u8).collect();
        let fragments = Fragmenter::new().split(&frame, fragment_size).unwrap();

        assert_eq!(fragments.len(), expected_total);
        for (i, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment.header.index as usize, i);
            assert_eq!(fragment.header.total as usize, expected_total);
            assert_eq!(fragment.message_id, fragments[0].message_id);
        }
        assert_eq!(
            fragments.iter().flat_map(|f| f.data.iter().copied()).collect::<Vec<u8>>(),
            frame
        );
    }

    #[test]
    fn test_distinct_messages_get_distinct_ids() {
        let mut fragmenter = Fragmenter::new();
        let a = fragmenter.split(&[0; 100], 16).unwrap();
        let b = fragmenter.split(&[0; 100], 16).unwrap();
        assert_ne!(a[0].message_id, b[0].message_id);
        assert_ne!(a[0].message_id, 0);
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let frame = vec![0u8; 128 * 1024];
        assert!(matches!(
            Fragmenter::new().split(&frame, 1024),
            Err(LinkError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let frame: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let mut fragments = Fragmenter::new().split(&frame, 1024).unwrap();
        fragments.reverse();

        let t0 = Instant::now();
        let mut reassembler = reassembler();
        let mut result = None;
        for fragment in &fragments {
            result = reassembler
                .on_fragment(fragment.message_id, fragment.header, &fragment.data, t0)
                .unwrap();
        }
        assert_eq!(result.unwrap(), frame);
        assert_eq!(reassembler.group_count(), 0);
    }

    #[test]
    fn test_duplicate_fragment_overwrites_in_place() {
        let t0 = Instant::now();
        let mut reassembler = reassembler();

        let header0 = FragmentHeader { index: 0, total: 2 };
        assert_eq!(reassembler.on_fragment(5, header0, b"aa", t0).unwrap(), None);
        assert_eq!(reassembler.on_fragment(5, header0, b"aa", t0).unwrap(), None);
        assert_eq!(reassembler.group_count(), 1);

        let header1 = FragmentHeader { index: 1, total: 2 };
        let frame = reassembler.on_fragment(5, header1, b"bb", t0).unwrap();
        assert_eq!(frame.unwrap(), b"aabb");
    }

    #[test]
    fn test_total_mismatch_is_malformed() {
        let t0 = Instant::now();
        let mut reassembler = reassembler();

        reassembler.on_fragment(5, FragmentHeader { index: 0, total: 3 }, b"aa", t0).unwrap();
        assert!(matches!(
            reassembler.on_fragment(5, FragmentHeader { index: 1, total: 4 }, b"bb", t0),
            Err(LinkError::Malformed(_))
        ));
    }

    #[test]
    fn test_incomplete_group_expires_and_is_reclaimed() {
        let t0 = Instant::now();
        let mut reassembler = reassembler();

        reassembler.on_fragment(5, FragmentHeader { index: 0, total: 3 }, b"aa", t0).unwrap();
        reassembler.on_fragment(5, FragmentHeader { index: 2, total: 3 }, b"cc", t0).unwrap();

        assert_eq!(reassembler.expire(t0 + Duration::from_millis(1999)), 0);
        assert_eq!(reassembler.group_count(), 1);

        assert_eq!(reassembler.expire(t0 + Duration::from_millis(2000)), 1);
        assert_eq!(reassembler.group_count(), 0);

        // a late fragment simply starts a fresh group
        reassembler
            .on_fragment(5, FragmentHeader { index: 1, total: 3 }, b"bb", t0 + Duration::from_secs(3))
            .unwrap();
        assert_eq!(reassembler.group_count(), 1);
    }
}
