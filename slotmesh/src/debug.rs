//! Debug events for protocol tracing.
//!
//! Enabled with the `debug` feature. These events trace scheduling decisions
//! (grants, installs, resizes, backoff) during simulation and testing; without
//! the feature `emit_debug!` expands to nothing.

use crate::time::Asn;
use crate::types::{NegotiationError, NodeId};

/// Trait for receiving debug events from a MAC.
/// Implemented by test harnesses to collect/print events.
pub trait DebugEmitter {
    /// Called when a debug event is emitted.
    fn emit(&mut self, event: DebugEvent);
}

/// Debug events emitted by the MAC for protocol tracing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// A slotframe was installed.
    SlotframeAdded { handle: u16, size: u16 },
    /// A slotframe was removed.
    SlotframeRemoved { handle: u16 },
    /// A bandwidth request arrived from a neighbor.
    RequestReceived {
        asn: Asn,
        from: NodeId,
        n: u16,
        urgent: bool,
    },
    /// An offset was granted to a neighbor.
    OffsetGranted { to: NodeId, n: u16, t_offset: u16 },
    /// Placement or installation failed.
    NegotiationFailed {
        peer: NodeId,
        reason: NegotiationError,
    },
    /// The periodic load estimate picked a new exponent.
    ExponentSelected { peer: NodeId, n: u16 },
    /// Queued packets were re-pinned to another slot.
    QueueRestamped {
        peer: NodeId,
        slotframe: u16,
        timeslot: u16,
    },
    /// A one-shot matching slot was reserved.
    MatchingSlotReserved { asn: Asn, peer: NodeId, is_tx: bool },
    /// Backoff exponent changed after a shared-slot failure.
    BackoffIncreased { peer: NodeId, exponent: u8, window: u16 },
    /// The own reception slotframe was resized.
    SlotframeResized { old: u16, new: u16, version: u8 },
    /// The per-neighbor TX slotframe followed a neighbor's new size.
    TxSlotframeAdjusted { peer: NodeId, size: u16 },
    /// A delayed task fired.
    TaskFired { name: &'static str },
}

/// Emit a debug event when the `debug` feature is enabled.
///
/// The receiver must have a `debug_emitter: Option<Box<dyn DebugEmitter>>`
/// field. The event expression is not evaluated without the feature.
#[macro_export]
macro_rules! emit_debug {
    ($self:expr, $event:expr) => {{
        #[cfg(feature = "debug")]
        {
            if let Some(emitter) = $self.debug_emitter.as_mut() {
                emitter.emit($event);
            }
        }
    }};
}
