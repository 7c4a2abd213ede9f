//! Collaborator traits for radio, time, randomness, routing and frame coding.
//!
//! These traits allow the MAC to be used with different:
//! - Radio drivers (802.15.4 transceivers, simulated medium)
//! - Time sources (hardware timers, simulated time)
//! - Routing layers (RPL-style DODAG, static trees, tests)
//! - Frame layouts (802.15.4 headers with IEs, the compact reference codec)

use alloc::vec::Vec;
use core::future::Future;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::context::ScheduleRequest;
use crate::time::Instant;
use crate::types::{LinkAddr, MacEvent, ReceivedFrame};
use crate::wire::{DecodeError, Eack, Frame};

/// Queue size for the schedule request channel.
pub(crate) const REQUEST_QUEUE_SIZE: usize = 16;

/// Queue size for the event channel.
pub(crate) const EVENT_QUEUE_SIZE: usize = 16;

/// Queue size for the received-frame channel.
pub(crate) const RX_QUEUE_SIZE: usize = 8;

/// Mutex type used for channels.
pub(crate) type ChannelMutex = CriticalSectionRawMutex;

/// Schedule mutation requests, drained between slots.
pub type RequestChannel = Channel<ChannelMutex, ScheduleRequest, REQUEST_QUEUE_SIZE>;

/// MAC event channel.
pub type EventChannel = Channel<ChannelMutex, MacEvent, EVENT_QUEUE_SIZE>;

/// Frames received for the upper layer.
pub type RxChannel = Channel<ChannelMutex, ReceivedFrame, RX_QUEUE_SIZE>;

/// Radio-level outcome of a transmission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioTx {
    Ok,
    Collision,
    Err,
}

/// Radio driver primitives used by the slot engine.
///
/// All calls happen from the slot execution context and must not block
/// beyond the duration of the radio operation itself.
pub trait Radio {
    /// Load a frame into the transmit buffer.
    fn prepare(&mut self, frame: &[u8]) -> RadioTx;

    /// Transmit the prepared frame.
    fn transmit(&mut self) -> RadioTx;

    /// Copy a received frame into `buf`, returning its length (0 if none).
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Clear-channel assessment.
    fn channel_clear(&mut self) -> bool;

    /// A frame is currently being received.
    fn receiving_packet(&mut self) -> bool;

    /// A complete frame is waiting to be read.
    fn pending_packet(&mut self) -> bool;

    /// Tune to an IEEE 802.15.4 channel.
    fn set_channel(&mut self, channel: u8);

    fn on(&mut self);

    fn off(&mut self);

    /// RSSI of the last received frame.
    fn last_rssi(&self) -> i16 {
        0
    }

    /// Start-of-frame time of the last received frame, if the driver
    /// timestamps receptions.
    fn last_rx_timestamp(&self) -> Option<Instant> {
        None
    }
}

/// Time source trait for real or simulated time.
///
/// # Example (testing with MockClock)
///
/// ```
/// use slotmesh::traits::test_impls::MockClock;
/// use slotmesh::{Clock, Duration, Instant};
///
/// let clock = MockClock::new();
/// assert_eq!(clock.now(), Instant::ZERO);
///
/// clock.advance(Duration::from_millis(15));
/// assert_eq!(clock.now(), Instant::from_micros(15_000));
///
/// // Busy-waits jump straight to the deadline when the condition never holds
/// let hit = clock.busy_wait_until(Instant::from_millis(20), &mut || false);
/// assert!(!hit);
/// assert_eq!(clock.now(), Instant::from_millis(20));
/// ```
pub trait Clock {
    /// Future type returned by sleep_until.
    type SleepFuture<'a>: Future<Output = ()>
    where
        Self: 'a;

    /// Current time.
    fn now(&self) -> Instant;

    /// Sleep until the given instant.
    fn sleep_until(&self, time: Instant) -> Self::SleepFuture<'_>;

    /// Spin until `deadline` or until `until` returns true.
    ///
    /// Returns whether the condition held before the deadline.
    fn busy_wait_until(&self, deadline: Instant, until: &mut dyn FnMut() -> bool) -> bool;
}

/// Random number generator trait.
///
/// Used for:
/// - Backoff windows
/// - Offset selection start points
pub trait Random {
    /// Generate a random u64 in the range [min, max).
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    /// Generate a random u32.
    fn gen_u32(&mut self) -> u32 {
        self.gen_range(0, u32::MAX as u64 + 1) as u32
    }
}

/// The routing layer's view of the neighborhood.
pub trait RoutingView {
    /// Current preferred parent.
    fn preferred_parent(&self) -> Option<LinkAddr>;

    /// `addr` is a next hop for some downward route.
    fn is_routing_child(&self, addr: &LinkAddr) -> bool;

    /// `addr` announced it has no path through us.
    fn has_no_path(&self, addr: &LinkAddr) -> bool {
        let _ = addr;
        false
    }

    fn is_parent(&self, addr: &LinkAddr) -> bool {
        self.preferred_parent().as_ref() == Some(addr)
    }

    /// Parent or routing child.
    fn is_routing_neighbor(&self, addr: &LinkAddr) -> bool {
        self.is_parent(addr) || self.is_routing_child(addr)
    }

    /// All routing children.
    fn routing_children(&self) -> Vec<LinkAddr>;
}

/// Frame encoder/decoder.
pub trait FrameCodec {
    fn encode_frame(&self, frame: &Frame) -> Vec<u8>;

    fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, DecodeError>;

    fn encode_eack(&self, eack: &Eack) -> Vec<u8>;

    fn decode_eack(&self, bytes: &[u8]) -> Result<Eack, DecodeError>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock implementations of traits for unit testing and doc tests.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use alloc::collections::VecDeque;
    use core::cell::Cell;
    use core::future::{ready, Ready};

    use super::*;
    use crate::time::Duration;

    /// Scripted radio.
    ///
    /// Frames queued with `inject_rx` are heard by the next listen; replies
    /// queued with `script_ack` answer the next transmission of a frame that
    /// requests an acknowledgment. Frames are inspected with `CompactCodec`.
    #[derive(Default)]
    pub struct MockRadio {
        pub channel: u8,
        pub is_on: bool,
        pub cca_busy: bool,
        pub tx_status: Option<RadioTx>,
        /// Every transmitted frame with the channel it went out on.
        pub sent: Vec<(u8, Vec<u8>)>,
        rx_script: VecDeque<Vec<u8>>,
        ack_script: VecDeque<Option<Vec<u8>>>,
        prepared: Vec<u8>,
        incoming: Option<Vec<u8>>,
        waiting_for_ack: bool,
    }

    impl MockRadio {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a frame to be heard by the next listen.
        pub fn inject_rx(&mut self, frame: Vec<u8>) {
            self.rx_script.push_back(frame);
        }

        /// Queue the reply to the next transmission expecting an ACK.
        pub fn script_ack(&mut self, ack: Option<Vec<u8>>) {
            self.ack_script.push_back(ack);
        }

        /// Take all transmitted frames.
        pub fn take_sent(&mut self) -> Vec<(u8, Vec<u8>)> {
            core::mem::take(&mut self.sent)
        }

        pub fn pending_rx(&self) -> usize {
            self.rx_script.len()
        }

        pub fn pending_acks(&self) -> usize {
            self.ack_script.len()
        }
    }

    impl Radio for MockRadio {
        fn prepare(&mut self, frame: &[u8]) -> RadioTx {
            self.prepared = frame.to_vec();
            RadioTx::Ok
        }

        fn transmit(&mut self) -> RadioTx {
            let status = self.tx_status.unwrap_or(RadioTx::Ok);
            if status != RadioTx::Ok {
                return status;
            }
            let frame = core::mem::take(&mut self.prepared);
            let wants_ack = crate::wire::CompactCodec
                .decode_frame(&frame)
                .map(|f| f.header.ack_required)
                .unwrap_or(false);
            self.sent.push((self.channel, frame));
            if wants_ack {
                self.waiting_for_ack = true;
                self.incoming = self.ack_script.pop_front().flatten();
            }
            status
        }

        fn read(&mut self, buf: &mut [u8]) -> usize {
            self.waiting_for_ack = false;
            match self.incoming.take() {
                Some(frame) => {
                    let len = frame.len().min(buf.len());
                    buf[..len].copy_from_slice(&frame[..len]);
                    len
                }
                None => 0,
            }
        }

        fn channel_clear(&mut self) -> bool {
            !self.cca_busy
        }

        fn receiving_packet(&mut self) -> bool {
            if self.incoming.is_none() && !self.waiting_for_ack {
                self.incoming = self.rx_script.pop_front();
            }
            self.incoming.is_some()
        }

        fn pending_packet(&mut self) -> bool {
            self.incoming.is_some()
        }

        fn set_channel(&mut self, channel: u8) {
            self.channel = channel;
        }

        fn on(&mut self) {
            self.is_on = true;
        }

        fn off(&mut self) {
            self.is_on = false;
            self.waiting_for_ack = false;
        }
    }

    /// Mock clock for testing (synchronous, time advances manually).
    pub struct MockClock {
        current: Cell<Instant>,
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self {
                current: Cell::new(Instant::ZERO),
            }
        }
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn at(time: Instant) -> Self {
            Self {
                current: Cell::new(time),
            }
        }

        pub fn set(&self, time: Instant) {
            self.current.set(time);
        }

        pub fn advance(&self, duration: Duration) {
            self.current.set(self.current.get() + duration);
        }
    }

    impl Clock for MockClock {
        type SleepFuture<'a> = Ready<()>;

        fn now(&self) -> Instant {
            self.current.get()
        }

        fn sleep_until(&self, time: Instant) -> Self::SleepFuture<'_> {
            if time > self.current.get() {
                self.current.set(time);
            }
            ready(())
        }

        fn busy_wait_until(&self, deadline: Instant, until: &mut dyn FnMut() -> bool) -> bool {
            if until() {
                return true;
            }
            if deadline > self.current.get() {
                self.current.set(deadline);
            }
            until()
        }
    }

    /// Mock random for testing (deterministic).
    pub struct MockRandom {
        pub state: u64,
    }

    impl Default for MockRandom {
        fn default() -> Self {
            Self { state: 12345 }
        }
    }

    impl MockRandom {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_seed(seed: u64) -> Self {
            Self { state: seed }
        }
    }

    impl Random for MockRandom {
        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            // Simple LCG
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let range = max.saturating_sub(min);
            if range == 0 {
                return min;
            }
            min + ((self.state >> 33) % range)
        }
    }

    /// Routing view with settable parent and children.
    #[derive(Default, Clone)]
    pub struct MockRouting {
        pub parent: Option<LinkAddr>,
        pub children: Vec<LinkAddr>,
        pub no_path: Vec<LinkAddr>,
    }

    impl MockRouting {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_parent(parent: LinkAddr) -> Self {
            Self {
                parent: Some(parent),
                ..Self::default()
            }
        }

        pub fn add_child(&mut self, child: LinkAddr) {
            if !self.children.contains(&child) {
                self.children.push(child);
            }
        }

        pub fn remove_child(&mut self, child: &LinkAddr) {
            self.children.retain(|c| c != child);
        }
    }

    impl RoutingView for MockRouting {
        fn preferred_parent(&self) -> Option<LinkAddr> {
            self.parent
        }

        fn is_routing_child(&self, addr: &LinkAddr) -> bool {
            self.children.contains(addr)
        }

        fn has_no_path(&self, addr: &LinkAddr) -> bool {
            self.no_path.contains(addr)
        }

        fn routing_children(&self) -> Vec<LinkAddr> {
            self.children.clone()
        }
    }
}
