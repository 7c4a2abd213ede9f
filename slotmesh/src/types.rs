//! Core types and constants for the slotmesh MAC.

use alloc::vec::Vec;
use core::fmt;
use core::ops::{BitOr, BitOrAssign};

use crate::time::Asn;

// Autonomous slotframe handles
pub const EB_SF_HANDLE: u16 = 0;
pub const UNICAST_SF_HANDLE: u16 = 1;
pub const COMMON_SF_HANDLE: u16 = 2;

// Channel offsets of the autonomous slotframes
pub const EB_CHANNEL_OFFSET: u16 = 0;
pub const UNICAST_CHANNEL_OFFSET: u16 = 1;
pub const COMMON_CHANNEL_OFFSET: u16 = 2;

// Piggyback field values
pub const PIGGYBACK_NONE: u16 = 0xffff;
pub const NO_MATCHING_SLOT: u16 = 0xffff;

// Adaptive slotframe version counter wraps back to this value
pub const SF_VERSION_FIRST: u8 = 1;

/// Maximum frame size accepted from the radio.
pub const MAX_FRAME_SIZE: usize = 127;

/// Small integer id of a node, derived once from its link address.
pub type NodeId = u16;

/// Received payload bytes.
pub type Payload = Vec<u8>;

/// 8-byte link-layer address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LinkAddr(pub [u8; 8]);

impl LinkAddr {
    /// Destination of data broadcasts.
    pub const BROADCAST: LinkAddr = LinkAddr([0xff; 8]);

    /// Pseudo-address of the enhanced-beacon queue.
    pub const EB: LinkAddr = LinkAddr([0; 8]);

    /// Address whose last two bytes carry `id`.
    pub const fn from_node_id(id: NodeId) -> Self {
        let [hi, lo] = id.to_be_bytes();
        LinkAddr([0x02, 0, 0, 0, 0, 0, hi, lo])
    }

    /// Node id carried in the last two bytes.
    pub const fn node_id(&self) -> NodeId {
        u16::from_be_bytes([self.0[6], self.0[7]])
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_eb(&self) -> bool {
        *self == Self::EB
    }
}

impl fmt::Debug for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "LinkAddr(bcast)")
        } else if self.is_eb() {
            write!(f, "LinkAddr(eb)")
        } else {
            write!(f, "LinkAddr({})", self.node_id())
        }
    }
}

/// Link option flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LinkOptions(u8);

impl LinkOptions {
    pub const NONE: LinkOptions = LinkOptions(0);
    pub const TX: LinkOptions = LinkOptions(1);
    pub const RX: LinkOptions = LinkOptions(2);
    pub const SHARED: LinkOptions = LinkOptions(4);
    pub const TIME_KEEPING: LinkOptions = LinkOptions(8);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        LinkOptions(bits & 0x0f)
    }

    pub const fn contains(self, other: LinkOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: LinkOptions) -> Self {
        LinkOptions(self.0 | other.0)
    }

    pub const fn is_tx(self) -> bool {
        self.contains(Self::TX)
    }

    pub const fn is_rx(self) -> bool {
        self.contains(Self::RX)
    }

    pub const fn is_shared(self) -> bool {
        self.contains(Self::SHARED)
    }
}

impl BitOr for LinkOptions {
    type Output = LinkOptions;

    fn bitor(self, rhs: LinkOptions) -> LinkOptions {
        self.union(rhs)
    }
}

impl BitOrAssign for LinkOptions {
    fn bitor_assign(&mut self, rhs: LinkOptions) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for LinkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.is_tx() { "T" } else { "-" },
            if self.is_rx() { "R" } else { "-" },
            if self.is_shared() { "S" } else { "-" },
            if self.contains(Self::TIME_KEEPING) { "K" } else { "-" },
        )
    }
}

/// Kind of traffic a link is scheduled for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LinkType {
    #[default]
    Normal,
    Advertising,
    AdvertisingOnly,
}

/// Outcome of a transmission attempt, and final status handed to callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxResult {
    Ok,
    NoAck,
    RadioError,
    FatalError,
    Collision,
}

impl TxResult {
    pub fn is_ok(self) -> bool {
        self == TxResult::Ok
    }
}

impl fmt::Display for TxResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxResult::Ok => write!(f, "ok"),
            TxResult::NoAck => write!(f, "no ack"),
            TxResult::RadioError => write!(f, "radio error"),
            TxResult::FatalError => write!(f, "fatal error"),
            TxResult::Collision => write!(f, "collision"),
        }
    }
}

/// Schedule store errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    /// A slotframe with this handle is already installed.
    AlreadyExists,
    /// Slotframes must have at least one timeslot.
    ZeroSize,
    /// The slotframe still holds links.
    StillReferenced,
    /// No slotframe or link matched.
    NotFound,
    /// Timeslot is not below the slotframe size.
    TimeslotOutOfRange,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::AlreadyExists => write!(f, "slotframe already exists"),
            ScheduleError::ZeroSize => write!(f, "slotframe size is zero"),
            ScheduleError::StillReferenced => write!(f, "slotframe still has links"),
            ScheduleError::NotFound => write!(f, "not found"),
            ScheduleError::TimeslotOutOfRange => write!(f, "timeslot out of range"),
        }
    }
}

/// Neighbor queue errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// Queue or table has no room.
    Full,
    /// A slot is executing; the neighbor table cannot be restructured.
    Locked,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full => write!(f, "queue full"),
            QueueError::Locked => write!(f, "neighbor table locked"),
        }
    }
}

/// Bandwidth negotiation failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationError {
    /// No free offset for the requested exponent.
    AllocationFailed,
    /// Too many urgent requests in a row.
    ConsecutiveRequestIgnored,
    /// The granted offset collides with the local schedule.
    Uninstallable,
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::AllocationFailed => write!(f, "allocation failed"),
            NegotiationError::ConsecutiveRequestIgnored => {
                write!(f, "consecutive request ignored")
            }
            NegotiationError::Uninstallable => write!(f, "grant not installable"),
        }
    }
}

/// Slot timing errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimingError {
    /// The wake-up time had already passed when it was scheduled.
    DeadlineMissed,
}

impl fmt::Display for TimingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimingError::DeadlineMissed => write!(f, "deadline missed"),
        }
    }
}

/// Error type for MAC operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacError {
    Schedule(ScheduleError),
    Queue(QueueError),
    Negotiation(NegotiationError),
    Timing(TimingError),
    /// The engine is not associated to a network.
    NotAssociated,
}

impl fmt::Display for MacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacError::Schedule(e) => write!(f, "schedule: {}", e),
            MacError::Queue(e) => write!(f, "queue: {}", e),
            MacError::Negotiation(e) => write!(f, "negotiation: {}", e),
            MacError::Timing(e) => write!(f, "timing: {}", e),
            MacError::NotAssociated => write!(f, "not associated"),
        }
    }
}

impl From<ScheduleError> for MacError {
    fn from(e: ScheduleError) -> Self {
        MacError::Schedule(e)
    }
}

impl From<QueueError> for MacError {
    fn from(e: QueueError) -> Self {
        MacError::Queue(e)
    }
}

impl From<NegotiationError> for MacError {
    fn from(e: NegotiationError) -> Self {
        MacError::Negotiation(e)
    }
}

impl From<TimingError> for MacError {
    fn from(e: TimingError) -> Self {
        MacError::Timing(e)
    }
}

/// Frame delivered to the upper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub src: LinkAddr,
    pub dst: LinkAddr,
    pub payload: Payload,
    pub asn: Asn,
    pub channel: u8,
    pub rssi: i16,
}

/// Events reported to the upper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacEvent {
    /// The slot engine started at `asn`.
    Associated { asn: Asn },
    /// Synchronization was lost; all queues were flushed.
    Disassociated { asn: Asn },
    /// The time source changed.
    TimeSourceChanged {
        old: Option<LinkAddr>,
        new: Option<LinkAddr>,
    },
    /// The own reception slotframe was resized; neighbors must be told.
    SlotframeSizeChanged { size: u16, version: u8 },
    /// A dedicated allocation towards `peer` was installed or changed.
    AllocationChanged { peer: NodeId, n: u16, t_offset: u16 },
    /// A dedicated allocation towards `peer` could not be obtained.
    AllocationFailed { peer: NodeId, reason: NegotiationError },
}
