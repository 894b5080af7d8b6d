use crate::error::LinkError;
use crate::qos::{Priority, Reliability};
use crate::seq::SequenceNumber;
use bytes::{Buf, BufMut, BytesMut};

/// Fragment coordinates carried by a packet that is part of an oversized message.
///  Indices are dense in `0..total`; the whole set shares one message id.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub index: u16,
    pub total: u8,
}

/// The fixed 17 byte packet header, all fields in network byte order:
///
/// ```ascii
/// 0:  protocol version (u8), currently 1
/// 1:  sequence number (u32), connection scoped, strictly increasing
/// 5:  sender timestamp (u32), milliseconds, sender-local, only used for RTT
/// 9:  message id (u32), 0 for unfragmented packets
/// 13: fragment index (u16), 0 when not fragmented
/// 15: low 7 bits: total fragments (0 or 1 if not fragmented), top bit: is_fragment
/// 16: low 3 bits: reliability mode, next 3 bits: priority, top 2 bits reserved
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: SequenceNumber,
    pub timestamp_ms: u32,
    pub message_id: u32,
    pub fragment: Option<FragmentHeader>,
    pub reliability: Reliability,
    pub priority: Priority,
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;
    pub const SERIALIZED_LEN: usize = 17;

    const FRAGMENT_FLAG: u8 = 0x80;
    const FRAGMENT_TOTAL_MASK: u8 = 0x7f;

    /// largest fragment count that fits the 7 bit total field
    pub const MAX_FRAGMENTS: usize = Self::FRAGMENT_TOTAL_MASK as usize;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u32(self.sequence.to_raw());
        buf.put_u32(self.timestamp_ms);
        buf.put_u32(self.message_id);
        match self.fragment {
            Some(fragment) => {
                buf.put_u16(fragment.index);
                buf.put_u8((fragment.total & Self::FRAGMENT_TOTAL_MASK) | Self::FRAGMENT_FLAG);
            }
            None => {
                buf.put_u16(0);
                buf.put_u8(0);
            }
        }
        buf.put_u8(self.reliability.to_wire() | (self.priority.to_wire() << 3));
    }

    pub fn deser(buf: &mut impl Buf) -> Result<PacketHeader, LinkError> {
        let version = buf.try_get_u8().map_err(|_| LinkError::Malformed("truncated header"))?;
        if version != Self::PROTOCOL_VERSION_1 {
            return Err(LinkError::Malformed("unsupported protocol version"));
        }

        let sequence = buf.try_get_u32().map_err(|_| LinkError::Malformed("truncated header"))?;
        let timestamp_ms = buf.try_get_u32().map_err(|_| LinkError::Malformed("truncated header"))?;
        let message_id = buf.try_get_u32().map_err(|_| LinkError::Malformed("truncated header"))?;
        let fragment_index = buf.try_get_u16().map_err(|_| LinkError::Malformed("truncated header"))?;
        let fragment_raw = buf.try_get_u8().map_err(|_| LinkError::Malformed("truncated header"))?;
        let rel_prio = buf.try_get_u8().map_err(|_| LinkError::Malformed("truncated header"))?;

        let fragment = if fragment_raw & Self::FRAGMENT_FLAG != 0 {
            let total = fragment_raw & Self::FRAGMENT_TOTAL_MASK;
            if total == 0 {
                return Err(LinkError::Malformed("fragment with zero total"));
            }
            if fragment_index >= total as u16 {
                return Err(LinkError::Malformed("fragment index out of range"));
            }
            if message_id == 0 {
                return Err(LinkError::Malformed("fragment without message id"));
            }
            Some(FragmentHeader {
                index: fragment_index,
                total,
            })
        } else {
            None
        };

        let reliability = Reliability::from_wire(rel_prio & 0x07)
            .ok_or(LinkError::Malformed("invalid reliability mode"))?;
        let priority = Priority::from_wire((rel_prio >> 3) & 0x07)
            .ok_or(LinkError::Malformed("invalid priority"))?;

        Ok(PacketHeader {
            sequence: SequenceNumber::from_raw(sequence),
            timestamp_ms,
            message_id,
            fragment,
            reliability,
            priority,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn header(fragment: Option<FragmentHeader>) -> PacketHeader {
        PacketHeader {
            sequence: SequenceNumber::from_raw(0x01020304),
            timestamp_ms: 0x0a0b0c0d,
            message_id: if fragment.is_some() { 9 } else { 0 },
            fragment,
            reliability: Reliability::ReliableOrdered,
            priority: Priority::High,
        }
    }

    #[rstest]
    #[case::unfragmented(header(None))]
    #[case::first_fragment(header(Some(FragmentHeader { index: 0, total: 3 })))]
    #[case::last_fragment(header(Some(FragmentHeader { index: 2, total: 3 })))]
    #[case::max_fragments(header(Some(FragmentHeader { index: 126, total: 127 })))]
    fn test_round_trip(#[case] original: PacketHeader) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_exact_wire_layout() {
        let original = PacketHeader {
            sequence: SequenceNumber::from_raw(0x01020304),
            timestamp_ms: 0x05060708,
            message_id: 0x090a0b0c,
            fragment: Some(FragmentHeader { index: 0x0102, total: 5 }),
            reliability: Reliability::Reliable,
            priority: Priority::Lowest,
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(
            buf.as_ref(),
            &[
                1, // version
                1, 2, 3, 4, // sequence
                5, 6, 7, 8, // timestamp
                9, 10, 11, 12, // message id
                1, 2, // fragment index
                0x85, // fragment flag | total 5
                0x22, // priority 4 << 3 | reliability 2
            ]
        );
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated(vec![1, 0, 0, 0])]
    #[case::wrong_version(vec![2, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0, 0, 0])]
    #[case::zero_fragment_total(vec![1, 0,0,0,0, 0,0,0,0, 0,0,0,1, 0,0, 0x80, 0])]
    #[case::index_out_of_range(vec![1, 0,0,0,0, 0,0,0,0, 0,0,0,1, 0,3, 0x83, 0])]
    #[case::fragment_without_message_id(vec![1, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0, 0x81, 0])]
    #[case::invalid_reliability(vec![1, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0, 0, 0x07])]
    #[case::invalid_priority(vec![1, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0, 0, 0x38])]
    fn test_malformed_headers_are_rejected(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(matches!(PacketHeader::deser(&mut b), Err(LinkError::Malformed(_))));
    }
}
