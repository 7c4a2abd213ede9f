//! One-shot matching-slot reservations for burst traffic.
//!
//! A sender with more than one packet queued for a neighbor sets the
//! frame-pending bit and piggybacks an occupancy bitmap of its next 16 slots.
//! The receiver intersects that bitmap with its own occupancy and grants the
//! earliest slot free on both sides. Both ends then hold an ASN-anchored
//! reservation instead of a permanent slotframe entry; it disappears once the
//! ASN passes or a transmission consumes it.

use alloc::vec::Vec;

use crate::schedule::Link;
use crate::time::Asn;

/// A link template pinned to one absolute slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub asn: Asn,
    pub link: Link,
}

/// Bounded set of pending reservations, at most one per ASN.
#[derive(Debug, Clone)]
pub struct Reservations {
    entries: Vec<Reservation>,
    capacity: usize,
}

impl Reservations {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Reserve `asn`. Fails if full or if the ASN is already reserved.
    pub fn reserve(&mut self, asn: Asn, link: Link) -> bool {
        if self.entries.len() >= self.capacity || self.is_reserved(asn) {
            return false;
        }
        self.entries.push(Reservation { asn, link });
        true
    }

    pub fn is_reserved(&self, asn: Asn) -> bool {
        self.entries.iter().any(|r| r.asn == asn)
    }

    pub fn at(&self, asn: Asn) -> Option<&Reservation> {
        self.entries.iter().find(|r| r.asn == asn)
    }

    /// Earliest reservation strictly after `asn`.
    pub fn earliest_after(&self, asn: Asn) -> Option<&Reservation> {
        self.entries
            .iter()
            .filter(|r| r.asn > asn)
            .min_by_key(|r| r.asn)
    }

    /// Remove and return the reservation at `asn`.
    pub fn take_at(&mut self, asn: Asn) -> Option<Reservation> {
        let pos = self.entries.iter().position(|r| r.asn == asn)?;
        Some(self.entries.swap_remove(pos))
    }

    /// Drop reservations whose ASN is before `asn`. Returns how many.
    pub fn clear_before(&mut self, asn: Asn) -> usize {
        let before = self.entries.len();
        self.entries.retain(|r| r.asn >= asn);
        before - self.entries.len()
    }

    /// Drop every reservation using slotframe `handle`.
    pub fn remove_handle(&mut self, handle: u16) -> usize {
        let before = self.entries.len();
        self.entries.retain(|r| r.link.slotframe_handle != handle);
        before - self.entries.len()
    }

    pub fn has_handle(&self, handle: u16) -> bool {
        self.entries
            .iter()
            .any(|r| r.link.slotframe_handle == handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Bitmap a sender piggybacks: its own occupancy plus every slot from its
/// next regular transmission opportunity onwards.
pub fn request_bitmap(occupancy: u16, time_to_tx: Option<u64>, horizon: u16) -> u16 {
    let horizon = horizon.min(16);
    let mut bitmap = occupancy;
    if let Some(t) = time_to_tx {
        let from = t.saturating_sub(1);
        for i in from..horizon as u64 {
            bitmap |= 1 << i;
        }
    }
    if horizon < 16 {
        bitmap |= !((1u16 << horizon) - 1);
    }
    bitmap
}

/// Earliest slot (1..=horizon ahead) free in both bitmaps.
pub fn select_matching_slot(sender: u16, own: u16, horizon: u16) -> Option<u16> {
    let busy = sender | own;
    (0..horizon.min(16))
        .find(|i| busy & (1 << i) == 0)
        .map(|i| i + 1)
}
