//! Messages into and results out of the scheduler context.
//!
//! The `Mac` owns the schedule exclusively. Everything that wants to change it
//! from outside a slot (routing layer, application, tests) posts a
//! `ScheduleRequest`; the requests are drained between slots, never while a
//! slot is executing.

use crate::time::{Asn, Instant};
use crate::types::{LinkAddr, LinkOptions, LinkType, TxResult};

/// Schedule or neighbor mutation posted to the scheduler context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleRequest {
    AddSlotframe {
        handle: u16,
        size: u16,
    },
    RemoveSlotframe {
        handle: u16,
    },
    AddLink {
        slotframe: u16,
        options: LinkOptions,
        link_type: LinkType,
        addr: LinkAddr,
        timeslot: u16,
        channel_offset: u16,
    },
    RemoveLinkByTimeslot {
        slotframe: u16,
        timeslot: u16,
    },
    /// The routing layer gained a child.
    ChildAdded(LinkAddr),
    /// The routing layer lost a child.
    ChildRemoved(LinkAddr),
    /// The preferred parent (and time source) changed.
    TimeSourceChanged(Option<LinkAddr>),
    /// Drop every packet queued towards a neighbor.
    FlushNeighbor(LinkAddr),
    /// A neighbor announced the size of its reception slotframe.
    NeighborSlotframeSize {
        addr: LinkAddr,
        size: u16,
        version: u8,
    },
}

/// What a slot will do, computed without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPlan {
    /// Transmit on `channel`.
    Transmit { channel: u8, dest: LinkAddr },
    /// Listen on `channel`.
    Listen { channel: u8 },
    /// The slot is skipped or the radio stays off.
    Sleep,
}

/// What a slot actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    Transmitted { dest: LinkAddr, result: TxResult },
    /// A frame was received; `acked` if an acknowledgment went out.
    Received { src: LinkAddr, acked: bool },
    /// Energy was detected but no valid frame decoded.
    Garbled,
    /// Listened without hearing anything.
    Idle,
    /// No link, or the schedule changed under the slot.
    Skipped,
}

/// Result of `Mac::run_slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotOutcome {
    /// ASN of the slot that just ran.
    pub asn: Asn,
    pub action: SlotAction,
    /// Start of the next active slot.
    pub next_start: Instant,
    /// ASN of the next active slot.
    pub next_asn: Asn,
}
