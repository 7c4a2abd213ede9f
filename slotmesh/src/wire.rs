//! Frame model and the compact reference codec.
//!
//! The slot engine only reads and writes the fields modeled by `FrameHeader`
//! and `Eack`; the byte layout belongs to the `FrameCodec` implementation.
//! `CompactCodec` is a small fixed layout used by tests and the simulator.
//!
//! ## Frame Wire Format
//!
//! ```text
//! flags (1) || security_level (1) || seqno (1) || dst (8) || src (8)
//! || pigg1 (2) || pigg2 (2) || [asn (5) || join_priority (1)]
//! || [sf_size (2) || sf_version (1)] || payload
//!
//! Flags byte:
//! - bits 0-1: frame type (0 beacon, 1 data, 2 ack, 3 command)
//! - bit 2: ack_required
//! - bit 3: frame_pending
//! - bit 4: has_asn (sync IE)
//! - bit 5: has_sf_size (slotframe size announcement)
//! ```
//!
//! ## EACK Wire Format
//!
//! ```text
//! flags (1) || seqno (1) || dst (8) || src (8)
//! || time_correction (2, signed) || pigg1 (2) || pigg2 (2)
//!
//! Flags byte:
//! - bits 0-1: frame type (always ack)
//! - bit 6: nack
//! ```

use alloc::vec::Vec;

use crate::time::Asn;
use crate::traits::FrameCodec;
use crate::types::{LinkAddr, PIGGYBACK_NONE};

/// Decoding error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of buffer.
    UnexpectedEof,
    /// Frame type field does not match what was expected.
    InvalidFrameType,
    /// Reserved flag bits set.
    InvalidFlags,
}

const FLAG_TYPE_MASK: u8 = 0x03;
const FLAG_ACK_REQUIRED: u8 = 1 << 2;
const FLAG_FRAME_PENDING: u8 = 1 << 3;
const FLAG_HAS_ASN: u8 = 1 << 4;
const FLAG_HAS_SF_SIZE: u8 = 1 << 5;
const FLAG_NACK: u8 = 1 << 6;
const FLAG_RESERVED: u8 = 1 << 7;

/// Frame type carried in the flags byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    Beacon = 0,
    Data = 1,
    Ack = 2,
    Command = 3,
}

impl FrameType {
    fn from_bits(bits: u8) -> FrameType {
        match bits & FLAG_TYPE_MASK {
            0 => FrameType::Beacon,
            1 => FrameType::Data,
            2 => FrameType::Ack,
            _ => FrameType::Command,
        }
    }
}

/// Header fields the scheduler reads or writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub seqno: u8,
    pub src: LinkAddr,
    pub dst: LinkAddr,
    pub ack_required: bool,
    pub frame_pending: bool,
    pub security_level: u8,
    /// Requested exponent on data frames.
    pub pigg1: u16,
    /// Occupancy bitmap of the sender's next slots on data frames.
    pub pigg2: u16,
    /// Sync IE of enhanced beacons.
    pub asn: Option<Asn>,
    pub join_priority: u8,
    /// Size and version of the sender's reception slotframe.
    pub sf_size: Option<(u16, u8)>,
}

impl FrameHeader {
    /// Data frame header with empty piggyback fields.
    pub fn data(src: LinkAddr, dst: LinkAddr) -> Self {
        Self {
            frame_type: FrameType::Data,
            seqno: 0,
            src,
            dst,
            ack_required: !dst.is_broadcast() && !dst.is_eb(),
            frame_pending: false,
            security_level: 0,
            pigg1: PIGGYBACK_NONE,
            pigg2: PIGGYBACK_NONE,
            asn: None,
            join_priority: 0,
            sf_size: None,
        }
    }

    /// Enhanced beacon header; the sync IE is filled at transmission time.
    pub fn beacon(src: LinkAddr) -> Self {
        Self {
            frame_type: FrameType::Beacon,
            ack_required: false,
            asn: Some(Asn::ZERO),
            ..Self::data(src, LinkAddr::EB)
        }
    }
}

/// A frame: header plus opaque upper-layer payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// Enhanced acknowledgment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Eack {
    pub seqno: u8,
    /// Node that sent the acknowledged frame.
    pub dst: LinkAddr,
    /// Node that acknowledges.
    pub src: LinkAddr,
    /// Receiver's estimate of the sender's drift, in microseconds.
    pub time_correction: i16,
    pub nack: bool,
    /// Granted offset or failure sentinel.
    pub pigg1: u16,
    /// Granted matching slot.
    pub pigg2: u16,
}

/// Zero-copy reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let v = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, DecodeError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_addr(&mut self) -> Result<LinkAddr, DecodeError> {
        let b = self.read_bytes(8)?;
        let mut addr = [0u8; 8];
        addr.copy_from_slice(b);
        Ok(LinkAddr(addr))
    }

    /// Everything not yet read.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        slice
    }
}

/// Writer for encoding frames.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn write_u16_be(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u32_be(&mut self, v: u32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_addr(&mut self, addr: &LinkAddr) {
        self.write_bytes(&addr.0);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Fixed-layout codec described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactCodec;

impl CompactCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for CompactCodec {
    fn encode_frame(&self, frame: &Frame) -> Vec<u8> {
        let h = &frame.header;
        let mut flags = h.frame_type as u8;
        if h.ack_required {
            flags |= FLAG_ACK_REQUIRED;
        }
        if h.frame_pending {
            flags |= FLAG_FRAME_PENDING;
        }
        if h.asn.is_some() {
            flags |= FLAG_HAS_ASN;
        }
        if h.sf_size.is_some() {
            flags |= FLAG_HAS_SF_SIZE;
        }

        let mut w = Writer::new();
        w.write_u8(flags);
        w.write_u8(h.security_level);
        w.write_u8(h.seqno);
        w.write_addr(&h.dst);
        w.write_addr(&h.src);
        w.write_u16_be(h.pigg1);
        w.write_u16_be(h.pigg2);
        if let Some(asn) = h.asn {
            w.write_u8(asn.ms1b());
            w.write_u32_be(asn.ls4b());
            w.write_u8(h.join_priority);
        }
        if let Some((size, version)) = h.sf_size {
            w.write_u16_be(size);
            w.write_u8(version);
        }
        w.write_bytes(&frame.payload);
        w.finish()
    }

    fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, DecodeError> {
        let mut r = Reader::new(bytes);
        let flags = r.read_u8()?;
        if flags & (FLAG_RESERVED | FLAG_NACK) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let frame_type = FrameType::from_bits(flags);
        if frame_type == FrameType::Ack {
            return Err(DecodeError::InvalidFrameType);
        }
        let security_level = r.read_u8()?;
        let seqno = r.read_u8()?;
        let dst = r.read_addr()?;
        let src = r.read_addr()?;
        let pigg1 = r.read_u16_be()?;
        let pigg2 = r.read_u16_be()?;
        let (asn, join_priority) = if flags & FLAG_HAS_ASN != 0 {
            let ms1b = r.read_u8()?;
            let ls4b = r.read_u32_be()?;
            (Some(Asn::from_parts(ms1b, ls4b)), r.read_u8()?)
        } else {
            (None, 0)
        };
        let sf_size = if flags & FLAG_HAS_SF_SIZE != 0 {
            Some((r.read_u16_be()?, r.read_u8()?))
        } else {
            None
        };
        let payload = r.rest().to_vec();

        Ok(Frame {
            header: FrameHeader {
                frame_type,
                seqno,
                src,
                dst,
                ack_required: flags & FLAG_ACK_REQUIRED != 0,
                frame_pending: flags & FLAG_FRAME_PENDING != 0,
                security_level,
                pigg1,
                pigg2,
                asn,
                join_priority,
                sf_size,
            },
            payload,
        })
    }

    fn encode_eack(&self, eack: &Eack) -> Vec<u8> {
        let mut flags = FrameType::Ack as u8;
        if eack.nack {
            flags |= FLAG_NACK;
        }
        let mut w = Writer::new();
        w.write_u8(flags);
        w.write_u8(eack.seqno);
        w.write_addr(&eack.dst);
        w.write_addr(&eack.src);
        w.write_u16_be(eack.time_correction as u16);
        w.write_u16_be(eack.pigg1);
        w.write_u16_be(eack.pigg2);
        w.finish()
    }

    fn decode_eack(&self, bytes: &[u8]) -> Result<Eack, DecodeError> {
        let mut r = Reader::new(bytes);
        let flags = r.read_u8()?;
        if FrameType::from_bits(flags) != FrameType::Ack {
            return Err(DecodeError::InvalidFrameType);
        }
        if flags & !(FLAG_TYPE_MASK | FLAG_NACK) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        Ok(Eack {
            seqno: r.read_u8()?,
            dst: r.read_addr()?,
            src: r.read_addr()?,
            time_correction: r.read_u16_be()? as i16,
            nack: flags & FLAG_NACK != 0,
            pigg1: r.read_u16_be()?,
            pigg2: r.read_u16_be()?,
        })
    }
}
