//! XTC datagram header decoding.
//!
//! The event builder never interprets datagram payloads. It only needs the
//! fixed 24-byte header at the front of every record:
//!
//! ```text
//! offset  field            meaning
//!  0      u32 fraction     sub-second part of the timestamp (nanoseconds)
//!  4      u32 seconds      seconds part of the timestamp
//!  8      u32 env          service (transition id) in bits 24..28
//! 12      u32 src          source id of the payload tree
//! 16      u32 type/damage  payload tree type and damage bits
//! 20      u32 extent       payload tree size, including its 12-byte header
//! ```
//!
//! All fields are little endian. A datagram occupies `12 + extent` bytes.

use crate::error::{EbError, EbResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the transition part of the header (timestamp + env).
pub const TRANSITION_HEADER_SIZE: usize = 12;

/// Size of the payload tree (Xtc) header.
pub const XTC_HEADER_SIZE: usize = 12;

/// Smallest possible datagram: transition header plus an empty payload tree.
pub const DGRAM_HEADER_SIZE: usize = TRANSITION_HEADER_SIZE + XTC_HEADER_SIZE;

/// Sub-second ticks per second in the low timestamp word.
pub const FRACTION_PER_SECOND: u32 = 1_000_000_000;

const SERVICE_SHIFT: u32 = 24;
const SERVICE_MASK: u32 = 0x0f;

/// Transition kind carried in the service field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TransitionId {
    /// Clear readout buffers.
    ClearReadout = 0,
    /// Reset the readout.
    Reset = 1,
    /// Configure; carries the detector configuration tree.
    Configure = 2,
    /// Undo Configure.
    Unconfigure = 3,
    /// Start of a run.
    BeginRun = 4,
    /// End of a run.
    EndRun = 5,
    /// Start of a calibration/scan step.
    BeginStep = 6,
    /// End of a step.
    EndStep = 7,
    /// Triggers enabled.
    Enable = 8,
    /// Triggers disabled.
    Disable = 9,
    /// Periodic slow-data update.
    SlowUpdate = 10,
    /// Reserved.
    Unused11 = 11,
    /// Ordinary triggered data.
    L1Accept = 12,
}

impl TransitionId {
    /// Decode the 4-bit service value.
    #[must_use]
    pub fn from_service(value: u8) -> Option<Self> {
        use TransitionId::*;
        Some(match value {
            0 => ClearReadout,
            1 => Reset,
            2 => Configure,
            3 => Unconfigure,
            4 => BeginRun,
            5 => EndRun,
            6 => BeginStep,
            7 => EndStep,
            8 => Enable,
            9 => Disable,
            10 => SlowUpdate,
            11 => Unused11,
            12 => L1Accept,
            _ => return None,
        })
    }

    /// Everything except L1Accept is a control transition.
    #[must_use]
    pub fn is_transition(self) -> bool {
        self != TransitionId::L1Accept
    }

    /// Display name.
    #[must_use]
    pub fn name(self) -> &'static str {
        use TransitionId::*;
        match self {
            ClearReadout => "ClearReadout",
            Reset => "Reset",
            Configure => "Configure",
            Unconfigure => "Unconfigure",
            BeginRun => "BeginRun",
            EndRun => "EndRun",
            BeginStep => "BeginStep",
            EndStep => "EndStep",
            Enable => "Enable",
            Disable => "Disable",
            SlowUpdate => "SlowUpdate",
            Unused11 => "Unused_11",
            L1Accept => "L1Accept",
        }
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Packed timestamp: seconds in the high word, fraction in the low word.
///
/// The packed value sorts in time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Pack seconds and fraction.
    #[must_use]
    pub fn from_parts(seconds: u32, fraction: u32) -> Self {
        Timestamp((u64::from(seconds) << 32) | u64::from(fraction))
    }

    /// Seconds part.
    #[must_use]
    pub fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Sub-second part.
    #[must_use]
    pub fn fraction(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// Timestamp `micros` microseconds later, carrying into the seconds word.
    #[must_use]
    pub fn add_micros(self, micros: u32) -> Self {
        let total = u64::from(self.fraction()) + u64::from(micros) * 1_000;
        let carry = total / u64::from(FRACTION_PER_SECOND);
        let fraction = (total % u64::from(FRACTION_PER_SECOND)) as u32;
        let seconds = u64::from(self.seconds()) + carry;
        Timestamp((seconds << 32) | u64::from(fraction))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds(), self.fraction())
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DgramHeader {
    /// Event timestamp.
    pub timestamp: Timestamp,
    /// Transition kind.
    pub service: TransitionId,
    /// Source id of the payload tree.
    pub src: u32,
    /// Total size in bytes, header included.
    pub size: usize,
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(word)
}

impl DgramHeader {
    /// Decode the header at the start of `buf`.
    ///
    /// Returns `Ok(None)` when fewer than [`DGRAM_HEADER_SIZE`] bytes are
    /// available. The datagram body may extend past the end of `buf`; callers
    /// compare `size` against what they hold.
    pub fn peek(buf: &[u8]) -> EbResult<Option<Self>> {
        if buf.len() < DGRAM_HEADER_SIZE {
            return Ok(None);
        }
        let fraction = read_u32(buf, 0);
        let seconds = read_u32(buf, 4);
        let env = read_u32(buf, 8);
        let src = read_u32(buf, 12);
        let extent = read_u32(buf, 20) as usize;

        let raw_service = ((env >> SERVICE_SHIFT) & SERVICE_MASK) as u8;
        let service = TransitionId::from_service(raw_service)
            .ok_or_else(|| EbError::format(format!("unknown service id {raw_service}")))?;
        if extent < XTC_HEADER_SIZE {
            return Err(EbError::format(format!(
                "datagram extent {extent} smaller than payload header"
            )));
        }

        Ok(Some(Self {
            timestamp: Timestamp::from_parts(seconds, fraction),
            service,
            src,
            size: TRANSITION_HEADER_SIZE + extent,
        }))
    }
}

/// One datagram: decoded header plus a zero-copy view of its bytes.
///
/// The view keeps the underlying chunk buffer alive, so a `Dgram` can never
/// outlive the bytes it points into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dgram {
    header: DgramHeader,
    bytes: Bytes,
}

impl Dgram {
    /// Wrap a buffer holding exactly one datagram.
    pub fn from_bytes(bytes: Bytes) -> EbResult<Self> {
        let header = DgramHeader::peek(&bytes)?
            .ok_or_else(|| EbError::format(format!("{} bytes is too short for a datagram", bytes.len())))?;
        if header.size != bytes.len() {
            return Err(EbError::format(format!(
                "datagram claims {} bytes but view holds {}",
                header.size,
                bytes.len()
            )));
        }
        Ok(Self { header, bytes })
    }

    /// Build a datagram from its parts.
    ///
    /// Used for synthesized transitions and by tests to fabricate streams.
    #[must_use]
    pub fn encode(timestamp: Timestamp, service: TransitionId, src: u32, payload: &[u8]) -> Bytes {
        let extent = XTC_HEADER_SIZE + payload.len();
        let mut buf = BytesMut::with_capacity(TRANSITION_HEADER_SIZE + extent);
        buf.put_u32_le(timestamp.fraction());
        buf.put_u32_le(timestamp.seconds());
        buf.put_u32_le(u32::from(service as u8) << SERVICE_SHIFT);
        buf.put_u32_le(src);
        buf.put_u32_le(0);
        buf.put_u32_le(extent as u32);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Fabricate an EndRun with an empty payload tree.
    #[must_use]
    pub fn fake_endrun(timestamp: Timestamp, src: u32) -> Self {
        let bytes = Self::encode(timestamp, TransitionId::EndRun, src, &[]);
        Self {
            header: DgramHeader {
                timestamp,
                service: TransitionId::EndRun,
                src,
                size: bytes.len(),
            },
            bytes,
        }
    }

    /// Header fields.
    #[must_use]
    pub fn header(&self) -> &DgramHeader {
        &self.header
    }

    /// Timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.header.timestamp
    }

    /// Transition kind.
    #[must_use]
    pub fn service(&self) -> TransitionId {
        self.header.service
    }

    /// Size in bytes, header included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.header.size
    }

    /// Whether this is a control transition.
    #[must_use]
    pub fn is_transition(&self) -> bool {
        self.header.service.is_transition()
    }

    /// Raw bytes of the whole datagram.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Payload tree bytes after the fixed header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[DGRAM_HEADER_SIZE..]
    }
}

/// Length of the longest prefix of `buf` made only of complete datagrams.
///
/// Fails if a header in the prefix is corrupt.
pub fn complete_prefix_len(buf: &[u8]) -> EbResult<usize> {
    complete_prefix(buf, None).map(|prefix| prefix.len)
}

/// Complete datagrams at the start of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletePrefix {
    /// Bytes taken by the datagrams.
    pub len: usize,
    /// Timestamp of the last datagram, `None` when there is none.
    pub last_timestamp: Option<Timestamp>,
}

/// Longest prefix of complete datagrams, stopping before the first datagram
/// stamped later than `through` when a limit is given.
pub fn complete_prefix(buf: &[u8], through: Option<Timestamp>) -> EbResult<CompletePrefix> {
    let mut prefix = CompletePrefix::default();
    while let Some(header) = DgramHeader::peek(&buf[prefix.len..])? {
        if prefix.len + header.size > buf.len() {
            break;
        }
        if through.is_some_and(|limit| header.timestamp > limit) {
            break;
        }
        prefix.len += header.size;
        prefix.last_timestamp = Some(header.timestamp);
    }
    Ok(prefix)
}

/// Split a view holding whole datagrams into individual `Dgram`s.
///
/// Trailing bytes that do not form a complete datagram are a format error:
/// views handed to the builder must never contain partial records.
pub fn decode_all(view: &Bytes) -> EbResult<Vec<Dgram>> {
    let mut dgrams = Vec::new();
    let mut offset = 0;
    while offset < view.len() {
        let header = DgramHeader::peek(&view[offset..])?.ok_or_else(|| {
            EbError::format(format!(
                "truncated datagram header at offset {offset} of {}",
                view.len()
            ))
        })?;
        let end = offset + header.size;
        if end > view.len() {
            return Err(EbError::format(format!(
                "truncated datagram at offset {offset}: needs {} bytes, {} available",
                header.size,
                view.len() - offset
            )));
        }
        dgrams.push(Dgram {
            header,
            bytes: view.slice(offset..end),
        });
        offset = end;
    }
    Ok(dgrams)
}
