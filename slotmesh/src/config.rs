//! Compile-time configuration for timing, memory bounds and protocol tuning.
//!
//! The `MacConfig` trait carries every constant the MAC consults. Memory bounds
//! have no defaults and must be chosen per target; protocol tunables default
//! to the values the negotiation and adaptive-sizing logic were tuned with.
//! Use `DefaultConfig` for 64KB+ RAM parts, `SmallConfig` for 16-32KB parts.
//!
//! # Memory Footprint
//!
//! | Config | Neighbor queues | Suitable MCUs |
//! |--------|----------------:|---------------|
//! | `DefaultConfig` | 32 x 16 packets | nRF52840, CC2652, STM32WB |
//! | `SmallConfig` | 8 x 4 packets | CC2538, nRF52810 |
//!
//! Memory formula (rough estimate):
//! - `MAX_NEIGHBORS * QUEUE_CAPACITY * 140` bytes (queued frames)
//! - `MAX_INCOMING_PACKETS * 140` bytes (received frames awaiting the upper layer)
//! - `LOG_CAPACITY * 40` bytes (structured log records)
//!
//! # Example
//!
//! ```ignore
//! use slotmesh::{Mac, DefaultConfig, SmallConfig};
//!
//! let mac = Mac::<_, _, _, _, _, DefaultConfig>::new(radio, clock, random, routing, codec, addr, policy);
//!
//! // Custom configuration
//! struct MyConfig;
//! impl MacConfig for MyConfig {
//!     const MAX_NEIGHBORS: usize = 16;
//!     // ... other bounds
//! }
//! ```

use crate::time::Duration;

/// Per-timeslot timing template, all offsets relative to slot start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeslotTiming {
    pub cca_offset: Duration,
    pub cca: Duration,
    pub tx_offset: Duration,
    pub rx_offset: Duration,
    pub rx_ack_delay: Duration,
    pub tx_ack_delay: Duration,
    pub rx_wait: Duration,
    pub ack_wait: Duration,
    pub rx_tx: Duration,
    pub max_ack: Duration,
    pub max_tx: Duration,
    pub timeslot_length: Duration,
}

impl TimeslotTiming {
    /// 10 ms template.
    pub const DEFAULT_10MS: TimeslotTiming = TimeslotTiming {
        cca_offset: Duration::from_micros(1800),
        cca: Duration::from_micros(128),
        tx_offset: Duration::from_micros(2120),
        rx_offset: Duration::from_micros(2120 - 800 / 2),
        rx_ack_delay: Duration::from_micros(800),
        tx_ack_delay: Duration::from_micros(1000),
        rx_wait: Duration::from_micros(800),
        ack_wait: Duration::from_micros(400),
        rx_tx: Duration::from_micros(192),
        max_ack: Duration::from_micros(2400),
        max_tx: Duration::from_micros(4256),
        timeslot_length: Duration::from_micros(10_000),
    };

    /// 15 ms template with the longer ACK turnaround needed to build
    /// negotiation fields into the acknowledgment.
    pub const EXTENDED_15MS: TimeslotTiming = TimeslotTiming {
        cca_offset: Duration::from_micros(1800),
        cca: Duration::from_micros(128),
        tx_offset: Duration::from_micros(2120),
        rx_offset: Duration::from_micros(2120 - 800 / 2),
        rx_ack_delay: Duration::from_micros(1300),
        tx_ack_delay: Duration::from_micros(1500),
        rx_wait: Duration::from_micros(800),
        ack_wait: Duration::from_micros(400),
        rx_tx: Duration::from_micros(192),
        max_ack: Duration::from_micros(2400),
        max_tx: Duration::from_micros(4256),
        timeslot_length: Duration::from_micros(15_000),
    };
}

/// Rule consulted when two links fall on the same next timeslot.
///
/// Rules are evaluated in `MacConfig::TIE_BREAK_ORDER`; the first rule that
/// distinguishes the two links decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreakRule {
    /// The advertising slotframe (handle 0) wins outright.
    Advertising,
    /// A TX-capable link beats an RX-only one.
    TxOverRx,
    /// The common shared slotframe beats an autonomous unicast TX link.
    BroadcastOverAutonomousUnicast,
    /// Between two negotiated dedicated TX links, the longer queue wins.
    LargerDedicatedQueue,
    /// Lower slotframe handle wins.
    LowerHandle,
}

/// Configuration trait for the MAC.
///
/// Implement this trait to define custom bounds for your target platform.
/// All memory bounds must be non-zero and queue capacities powers of two.
pub trait MacConfig {
    // --- Memory bounds ---

    /// Maximum neighbors with their own packet queue (excluding sentinels).
    const MAX_NEIGHBORS: usize;

    /// Packets per neighbor queue. Power of two.
    const QUEUE_CAPACITY: usize;

    /// Received frames buffered until the upper layer drains them. Power of two.
    const MAX_INCOMING_PACKETS: usize;

    /// Sent packets awaiting callback processing. Power of two.
    const DEQUEUED_CAPACITY: usize;

    /// Structured log records buffered between drains. Power of two.
    const LOG_CAPACITY: usize;

    /// Largest node id used to derive per-neighbor slotframe handles. Must
    /// stay below 16383 so reservation handles fit in `u16`.
    const MAX_NODE_ID: u16;

    // --- Timing ---

    /// Timeslot template.
    const TIMING: TimeslotTiming = TimeslotTiming::EXTENDED_15MS;

    /// Timer guard subtracted from every scheduled wake-up.
    const TIMER_GUARD: Duration = Duration::from_micros(100);

    /// Loss of sync with the time source beyond this disassociates.
    const DESYNC_THRESHOLD: Duration = Duration::from_secs(60);

    /// Slots the engine may busy-wait to catch up after a missed deadline.
    const MAX_CATCH_UP_SLOTS: u64 = 4;

    /// Channel hopping sequence.
    const HOPPING_SEQUENCE: &'static [u8] = &[15, 25, 26, 20];

    /// Perform clear-channel assessment before transmitting.
    const CCA_ENABLED: bool = true;

    // --- CSMA ---

    /// Minimum backoff exponent.
    const MIN_BE: u8 = 1;

    /// Maximum backoff exponent.
    const MAX_BE: u8 = 5;

    /// Retransmissions after the first attempt before a packet is dropped.
    const MAX_FRAME_RETRIES: u8 = 7;

    // --- Autonomous slotframes ---

    /// Period of the advertising slotframe (handle 0).
    const EB_PERIOD: u16 = 397;

    /// Period of the autonomous unicast slotframe (handle 1).
    const UNICAST_PERIOD: u16 = 47;

    /// Period of the common shared slotframe (handle 2).
    const COMMON_SHARED_PERIOD: u16 = 41;

    /// Interval between enhanced beacons while associated.
    const EB_SEND_INTERVAL: Duration = Duration::from_secs(16);

    /// Channel offset of negotiated and reserved slots.
    const DEDICATED_CHANNEL_OFFSET: u16 = 3;

    /// Tie-break order for links landing on the same timeslot.
    const TIE_BREAK_ORDER: &'static [TieBreakRule] = &[
        TieBreakRule::Advertising,
        TieBreakRule::TxOverRx,
        TieBreakRule::BroadcastOverAutonomousUnicast,
        TieBreakRule::LargerDedicatedQueue,
        TieBreakRule::LowerHandle,
    ];

    /// A matching-slot reservation also wins when it ties with a periodic link.
    const RESERVATION_WINS_TIES: bool = false;

    // --- Bandwidth negotiation ---

    /// Deepest level of the slot tree (largest dedicated slotframe is 2^N_MAX).
    const N_MAX: u16 = 8;

    /// Exponent requested for a new neighbor.
    const DEFAULT_N: u16 = 5;

    /// Period between load-driven exponent selections.
    const N_SELECTION_PERIOD: Duration = Duration::from_secs(15);

    /// Extra slots granted on top of the estimated load (as an exponent step).
    const MORE_UNDER_PROVISION: u16 = 1;

    /// Added to a requested exponent to flag an urgent request.
    const URGENT_N_OFFSET: u16 = 100;

    /// MAC-level PRR (percent) at or below which the dedicated slot is renegotiated.
    const PRR_THRES_TX_CHANGE: u32 = 70;

    /// Minimum dedicated-slot attempts before the PRR check applies.
    const NUM_TX_MAC_THRES_TX_CHANGE: u32 = 20;

    /// Consecutive dedicated-slot failures before falling back to shared slots.
    const NUM_TX_FAIL_THRES: u32 = 5;

    /// Consecutive selections asking for a larger exponent before it is applied.
    const THRES_CONSECUTIVE_N_INC: u8 = 3;

    /// Consecutive urgent requests answered with the consecutive-request sentinel.
    const THRES_CONSECUTIVE_NEW_TX_REQUEST: u8 = 3;

    /// Slots ahead covered by the occupancy bitmap and by reservations.
    const MATCHING_HORIZON: u16 = 16;

    /// Outstanding one-shot reservations.
    const MAX_RESERVATIONS: usize = 16;

    // --- Adaptive slotframe sizing ---

    /// Candidate sizes for the autonomous reception slotframe.
    const SF_PRIMES: &'static [u16] = &[
        2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83,
        89, 97,
    ];

    /// Initial size of the autonomous reception slotframe.
    const ADAPTIVE_INITIAL_SIZE: u16 = 7;

    /// Handle that parks the old-size reception slotframe during the grace period.
    const TEMP_SF_HANDLE: u16 = 3;

    /// Period of the resize check.
    const SF_SIZE_CHECK_PERIOD: Duration = Duration::from_secs(15);

    /// Grace period for the old-size reception slotframe.
    const RETAIN_RX_SF_DURATION: Duration = Duration::from_secs(10);

    /// Period after which per-neighbor reception counters restart.
    const NBR_COUNTER_RENEW_PERIOD: Duration = Duration::from_secs(60);

    /// Growth limit per step as numerator/denominator of the current size.
    const SF_INC_LIMIT: (u16, u16) = (3, 2);

    /// Receptions needed in a check period before resizing is considered.
    const W_TH: u32 = 50;

    /// Contention PRR (percent) below which the slotframe shrinks.
    const PRR_LOWER: u32 = 80;

    /// Contention PRR (percent) every neighbor must exceed before growing.
    const PRR_UPPER: u32 = 90;

    /// Offered load (percent of slots) above which the slotframe shrinks.
    const LOAD_UPPER: u32 = 50;

    /// Consecutive favorable checks before growing.
    const THRES_CONSECUTIVE_INC_DECISION: u8 = 3;

    /// Weight of collisions when computing the busy ratio.
    const COLLISION_WEIGHT: u32 = 1;
}

/// Default configuration for 64KB+ RAM devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;

impl MacConfig for DefaultConfig {
    const MAX_NEIGHBORS: usize = 32;
    const QUEUE_CAPACITY: usize = 16;
    const MAX_INCOMING_PACKETS: usize = 8;
    const DEQUEUED_CAPACITY: usize = 16;
    const LOG_CAPACITY: usize = 32;
    const MAX_NODE_ID: u16 = 64;
}

/// Configuration for constrained devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallConfig;

impl MacConfig for SmallConfig {
    const MAX_NEIGHBORS: usize = 8;
    const QUEUE_CAPACITY: usize = 4;
    const MAX_INCOMING_PACKETS: usize = 4;
    const DEQUEUED_CAPACITY: usize = 8;
    const LOG_CAPACITY: usize = 8;
    const MAX_NODE_ID: u16 = 16;
    const TIMING: TimeslotTiming = TimeslotTiming::DEFAULT_10MS;
    const MATCHING_HORIZON: u16 = 8;
    const MAX_RESERVATIONS: usize = 8;
}

/// Handle offset above which slotframe handles denote one-shot reservations.
pub const fn ssq_handle_offset<C: MacConfig>() -> u16 {
    2 * C::MAX_NODE_ID + 2
}

/// EACK sentinel: no offset could be allocated for the requested exponent.
pub const fn t_offset_allocation_fail<C: MacConfig>() -> u16 {
    (1 << C::N_MAX) + 1
}

/// EACK sentinel: urgent requests arrived too often and were ignored.
pub const fn t_offset_consecutive_request<C: MacConfig>() -> u16 {
    (1 << C::N_MAX) + 2
}
