#![forbid(unsafe_code)]
//! slotmesh - Time-slotted channel hopping MAC for low-power mesh networks
//!
//! A TSCH medium access layer: nodes share a network-wide slot counter (the
//! ASN), wake up only in scheduled timeslots and hop channels from slot to
//! slot. On top of the slot engine sit three scheduling policies that decide
//! which cells exist:
//!
//! - **Static hash slots**: every node listens in a timeslot derived from its
//!   address and transmits in the timeslots of its routing neighbors.
//! - **Adaptive slotframe**: the reception slotframe length follows observed
//!   contention, announced in enhanced beacons so senders can follow.
//! - **Negotiated residual allocation**: senders piggyback bandwidth requests
//!   on data frames; receivers place power-of-two slotframes on a slot tree
//!   and grant an offset in the acknowledgment. Burst traffic additionally
//!   reserves one-shot matching slots.
//!
//! This crate is `no_std` but **requires the `alloc` crate**. Collections are
//! heap-allocated with capacity limits taken from [`MacConfig`].
//!
//! # Platform Requirements
//!
//! - **Radio**: IEEE 802.15.4 class transceiver with CCA and RX timestamps
//! - **Timer**: microsecond resolution; busy-waits of a few milliseconds per slot
//! - **Embassy**: Compatible with embassy async runtime
//!
//! # Example (integration pattern)
//!
//! ```text
//! use slotmesh::{Mac, DefaultConfig, CompactCodec, SchedulingPolicy, ScheduleRequest};
//!
//! // Implement Radio, Clock, Random and RoutingView for your platform...
//!
//! let mut mac = Mac::<_, _, _, _, _, DefaultConfig>::new(
//!     radio, clock, random, routing, CompactCodec, addr,
//!     SchedulingPolicy::NegotiatedResidualAllocation,
//! );
//! mac.associate(asn_from_beacon, beacon_slot_start, Some(parent))?;
//!
//! // Spawn the MAC's run loop
//! // spawn(async move {
//! //     mac.run().await;
//! // });
//!
//! // Routing layer keeps the schedule in step
//! // mac.requests().send(ScheduleRequest::ChildAdded(child)).await;
//!
//! // Frames for the upper layer
//! // let frame = mac.received().receive().await;
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Addresses, link options, results and errors
//! - [`time`] - Instant, Duration and the absolute slot number
//! - [`schedule`] - Slotframes, links and next-active-link selection
//! - [`queue`] - Per-neighbor packet queues with CSMA backoff
//! - [`matching`] - One-shot matching-slot reservations
//! - [`negotiation`] - Slot-tree placement and request/grant handling
//! - [`adaptive`] - Contention-driven reception slotframe sizing
//! - [`policy`] - Scheduling policies and their schedule updates
//! - [`mac`] - The MAC state, public API and between-slot processing
//! - [`engine`] - Slot execution
//! - [`wire`] - Compact frame codec
//! - [`log`] - Structured slot log
//! - [`config`] - Compile-time bounds, timing and tuning

#![no_std]

// Prevent test/debug features from being used in release builds.
#[cfg(all(feature = "test-support", not(test), not(debug_assertions)))]
compile_error!(
    "The `test-support` feature must not be enabled in release builds. \
     It includes a scripted radio and a clock that never sleeps."
);

#[cfg(all(feature = "debug", not(test), not(debug_assertions)))]
compile_error!(
    "The `debug` feature must not be enabled in release builds. \
     It adds protocol tracing overhead intended only for development and simulation."
);

extern crate alloc;

pub mod adaptive;
pub mod collections;
pub mod config;
pub mod context;
#[macro_use]
pub mod debug;
pub mod engine;
pub mod log;
pub mod mac;
pub mod matching;
pub mod negotiation;
pub mod policy;
pub mod queue;
pub mod schedule;
pub mod tasks;
pub mod time;
pub mod traits;
pub mod types;
pub mod wire;

// Re-export main types at crate root
pub use config::{DefaultConfig, MacConfig, SmallConfig, TieBreakRule, TimeslotTiming};
pub use context::{ScheduleRequest, SlotAction, SlotOutcome, SlotPlan};
pub use log::{FacadeSink, LogKind, LogRecord, LogSink};
pub use mac::Mac;
pub use policy::SchedulingPolicy;
pub use schedule::{Link, Schedule, Slotframe};
pub use time::{Asn, Duration, Instant};
pub use traits::{Clock, FrameCodec, Radio, RadioTx, Random, RoutingView};
pub use types::{
    LinkAddr, LinkOptions, LinkType, MacError, MacEvent, NegotiationError, NodeId, Payload,
    QueueError, ReceivedFrame, ScheduleError, TimingError, TxResult,
};
pub use wire::{CompactCodec, DecodeError, Eack, Frame, FrameHeader, FrameType};

// Re-export constants
pub use types::{
    COMMON_SF_HANDLE, EB_SF_HANDLE, MAX_FRAME_SIZE, NO_MATCHING_SLOT, PIGGYBACK_NONE,
    UNICAST_SF_HANDLE,
};
