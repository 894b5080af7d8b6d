use std::time::Duration;

/// Scheduling class of a packet. The scheduler drains classes strictly from
///  [Priority::Immediate] down to [Priority::Lowest].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Priority {
    Immediate,
    High,
    Medium,
    Low,
    Lowest,
}

impl Priority {
    pub const NUM_CLASSES: usize = 5;

    /// all classes, in drain order
    pub const ALL: [Priority; Self::NUM_CLASSES] = [
        Priority::Immediate,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Lowest,
    ];

    pub fn index(&self) -> usize {
        match self {
            Priority::Immediate => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
            Priority::Lowest => 4,
        }
    }

    pub fn to_wire(&self) -> u8 {
        self.index() as u8
    }

    pub fn from_wire(raw: u8) -> Option<Priority> {
        match raw {
            0 => Some(Priority::Immediate),
            1 => Some(Priority::High),
            2 => Some(Priority::Medium),
            3 => Some(Priority::Low),
            4 => Some(Priority::Lowest),
            _ => None,
        }
    }
}

/// Delivery guarantee of a packet. Scheduling class and reliability are independent
///  axes: any combination is valid.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Reliability {
    /// fire and forget
    Unreliable,
    /// no retransmission, dropped on arrival if older than the newest seen
    UnreliableSequenced,
    /// retransmitted until acked, delivery order not guaranteed
    Reliable,
    /// retransmitted, delivered only if newer than the last delivered
    ReliableSequenced,
    /// retransmitted, delivered strictly in sequence with gaps buffered
    ReliableOrdered,
}

impl Reliability {
    pub const NUM_MODES: usize = 5;

    pub fn is_reliable(&self) -> bool {
        matches!(
            self,
            Reliability::Reliable | Reliability::ReliableSequenced | Reliability::ReliableOrdered
        )
    }

    pub fn index(&self) -> usize {
        match self {
            Reliability::Unreliable => 0,
            Reliability::UnreliableSequenced => 1,
            Reliability::Reliable => 2,
            Reliability::ReliableSequenced => 3,
            Reliability::ReliableOrdered => 4,
        }
    }

    pub fn to_wire(&self) -> u8 {
        self.index() as u8
    }

    pub fn from_wire(raw: u8) -> Option<Reliability> {
        match raw {
            0 => Some(Reliability::Unreliable),
            1 => Some(Reliability::UnreliableSequenced),
            2 => Some(Reliability::Reliable),
            3 => Some(Reliability::ReliableSequenced),
            4 => Some(Reliability::ReliableOrdered),
            _ => None,
        }
    }
}

/// Per-send quality of service: scheduling class, delivery guarantee, retry budget,
///  deadline, and the framing toggles. Profiles can be configured by id and reused,
///  or passed explicitly per message.
#[derive(Clone, Debug, PartialEq)]
pub struct QosProfile {
    pub priority: Priority,
    pub reliability: Reliability,
    /// retransmission budget for a single packet before delivery is reported as failed
    pub max_retries: u32,
    /// deadline for a queued packet, measured from enqueue
    pub timeout: Duration,
    pub compression: bool,
    pub encryption: bool,
}

impl Default for QosProfile {
    fn default() -> QosProfile {
        QosProfile {
            priority: Priority::Medium,
            reliability: Reliability::Reliable,
            max_retries: 5,
            timeout: Duration::from_secs(1),
            compression: false,
            encryption: false,
        }
    }
}
