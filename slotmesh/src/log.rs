//! Structured slot log.
//!
//! The slot engine never formats text. It pushes compact `LogRecord`s into a
//! bounded ring; the records are drained between slots into a `LogSink`.
//! When the ring is full new records are counted as dropped instead of
//! blocking the slot.

use alloc::vec::Vec;
use core::fmt;

use crate::collections::Ring;
use crate::time::Asn;
use crate::types::{LinkAddr, MacError, TxResult};

/// Where a record happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLink {
    pub slotframe: u16,
    pub timeslot: u16,
    pub channel_offset: u16,
    pub channel: u8,
}

/// Record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Tx {
        dest: LinkAddr,
        result: TxResult,
        transmissions: u8,
        seqno: u8,
        datalen: u16,
        /// Drift correction taken from the acknowledgment.
        drift: Option<i32>,
    },
    Rx {
        src: LinkAddr,
        seqno: u8,
        datalen: u16,
        /// Drift measured against the time source.
        drift: Option<i32>,
        acked: bool,
    },
    Message(&'static str),
    /// A wake-up was scheduled after its deadline.
    MissedSlot { late_us: u64 },
    /// No sync with the time source for this many slots.
    Desync { slots_since_sync: u64 },
    /// A between-slot operation failed.
    Error(MacError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub asn: Asn,
    pub link: Option<LogLink>,
    pub kind: LogKind,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[asn {}", self.asn)?;
        if let Some(l) = &self.link {
            write!(
                f,
                " sf {} ts {} ch {} ({})",
                l.slotframe, l.timeslot, l.channel_offset, l.channel
            )?;
        }
        write!(f, "] ")?;
        match &self.kind {
            LogKind::Tx {
                dest,
                result,
                transmissions,
                seqno,
                datalen,
                drift,
            } => {
                write!(
                    f,
                    "tx to {:?} seq {} len {}: {} after {}",
                    dest, seqno, datalen, result, transmissions
                )?;
                if let Some(d) = drift {
                    write!(f, ", drift {}us", d)?;
                }
                Ok(())
            }
            LogKind::Rx {
                src,
                seqno,
                datalen,
                drift,
                acked,
            } => {
                write!(f, "rx from {:?} seq {} len {}", src, seqno, datalen)?;
                if *acked {
                    write!(f, ", acked")?;
                }
                if let Some(d) = drift {
                    write!(f, ", drift {}us", d)?;
                }
                Ok(())
            }
            LogKind::Message(text) => write!(f, "{}", text),
            LogKind::MissedSlot { late_us } => write!(f, "missed slot, {}us late", late_us),
            LogKind::Desync { slots_since_sync } => {
                write!(f, "desynchronized, {} slots since sync", slots_since_sync)
            }
            LogKind::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Consumer of drained records.
pub trait LogSink {
    fn record(&mut self, record: &LogRecord);
}

impl LogSink for Vec<LogRecord> {
    fn record(&mut self, record: &LogRecord) {
        self.push(*record);
    }
}

/// Forwards records to the `log` facade.
///
/// Failed transmissions and sync problems go out at `warn`, successful
/// exchanges at `debug`, free-text messages at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeSink;

impl LogSink for FacadeSink {
    fn record(&mut self, record: &LogRecord) {
        match record.kind {
            LogKind::Tx { result, .. } if !result.is_ok() => log::warn!("{}", record),
            LogKind::Tx { .. } | LogKind::Rx { .. } => log::debug!("{}", record),
            LogKind::Message(_) => log::info!("{}", record),
            LogKind::MissedSlot { .. } | LogKind::Desync { .. } | LogKind::Error(_) => {
                log::warn!("{}", record)
            }
        }
    }
}

/// Bounded record buffer filled by the slot engine.
pub struct LogBuffer {
    ring: Ring<LogRecord>,
    dropped: u32,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Ring::with_capacity(capacity),
            dropped: 0,
        }
    }

    pub fn push(&mut self, record: LogRecord) {
        if self.ring.push(record).is_err() {
            self.dropped = self.dropped.saturating_add(1);
        }
    }

    /// Hand every buffered record to `sink`. Returns how many were drained.
    pub fn drain(&mut self, sink: &mut dyn LogSink) -> usize {
        let mut n = 0;
        while let Some(record) = self.ring.pop() {
            sink.record(&record);
            n += 1;
        }
        n
    }

    /// Records lost to overflow since the last call.
    pub fn take_dropped(&mut self) -> u32 {
        core::mem::take(&mut self.dropped)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
