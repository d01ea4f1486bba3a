//! Packet footer framing.
//!
//! A framed buffer holds `N` packets back to back, followed by `N` little
//! endian `u64` packet sizes and a `u64` packet count:
//!
//! ```text
//! | packet 0 | packet 1 | ... | size 0 | size 1 | ... | N |
//! ```
//!
//! The footer is read from the tail, so a buffer can be split without any
//! out-of-band length information. Every batch and chunk that crosses a
//! component boundary is framed this way, one packet per source.

use crate::error::{EbError, EbResult};
use bytes::{BufMut, Bytes, BytesMut};

const WORD: usize = std::mem::size_of::<u64>();

/// Decoded footer of a framed buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketFooter {
    sizes: Vec<usize>,
}

fn read_word(buf: &[u8], end: usize) -> u64 {
    let mut word = [0u8; WORD];
    word.copy_from_slice(&buf[end - WORD..end]);
    u64::from_le_bytes(word)
}

impl PacketFooter {
    /// Footer describing packets of the given sizes.
    #[must_use]
    pub fn new(sizes: Vec<usize>) -> Self {
        Self { sizes }
    }

    /// Number of packets.
    #[must_use]
    pub fn n_packets(&self) -> usize {
        self.sizes.len()
    }

    /// Packet sizes in order.
    #[must_use]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Bytes taken by the footer itself.
    #[must_use]
    pub fn footer_size(&self) -> usize {
        (self.sizes.len() + 1) * WORD
    }

    /// Bytes taken by the whole framed buffer.
    #[must_use]
    pub fn framed_size(&self) -> usize {
        self.sizes.iter().sum::<usize>() + self.footer_size()
    }

    /// Decode the footer at the tail of `buf[..end]`.
    ///
    /// Packet sizes must fit in the bytes in front of the footer.
    fn read_at(buf: &[u8], end: usize) -> EbResult<Self> {
        if end < WORD {
            return Err(EbError::format(format!(
                "{end} bytes is too short for a packet footer"
            )));
        }
        let count = read_word(buf, end);
        let max_count = (end / WORD - 1) as u64;
        if count > max_count {
            return Err(EbError::format(format!(
                "packet count {count} does not fit in {end} bytes"
            )));
        }
        let count = count as usize;
        let sizes_start = end - (count + 1) * WORD;
        let mut sizes = Vec::with_capacity(count);
        let mut total = 0usize;
        for i in 0..count {
            let raw = read_word(buf, sizes_start + (i + 1) * WORD);
            let size = usize::try_from(raw)
                .ok()
                .filter(|&size| total.checked_add(size).is_some_and(|t| t <= sizes_start))
                .ok_or_else(|| {
                    EbError::format(format!(
                        "packet {i} of {raw} bytes overruns the {} bytes left before the footer",
                        sizes_start - total
                    ))
                })?;
            total += size;
            sizes.push(size);
        }
        Ok(Self { sizes })
    }

    /// Decode the footer of a buffer that must be exactly one framed group.
    pub fn parse(buf: &[u8]) -> EbResult<Self> {
        let footer = Self::read_at(buf, buf.len())?;
        if footer.framed_size() != buf.len() {
            return Err(EbError::format(format!(
                "packet sizes sum to {} but buffer holds {} bytes of packets",
                footer.sizes.iter().sum::<usize>(),
                buf.len() - footer.footer_size()
            )));
        }
        Ok(footer)
    }

    /// Append the encoded footer to `out`.
    pub fn write_to(&self, out: &mut BytesMut) {
        for &size in &self.sizes {
            out.put_u64_le(size as u64);
        }
        out.put_u64_le(self.sizes.len() as u64);
    }

    /// Split one framed group into zero-copy packet views.
    ///
    /// An empty buffer is an empty batch with no packets.
    pub fn split(buf: &Bytes) -> EbResult<Vec<Bytes>> {
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        let footer = Self::parse(buf)?;
        Ok(footer.views(buf, 0))
    }

    fn views(&self, buf: &Bytes, start: usize) -> Vec<Bytes> {
        let mut offset = start;
        self.sizes
            .iter()
            .map(|&size| {
                let view = buf.slice(offset..offset + size);
                offset += size;
                view
            })
            .collect()
    }

    /// Split a buffer holding `repeats` framed groups back to back.
    ///
    /// Groups are located from the tail, so the result is returned in buffer
    /// order after being collected in reverse.
    pub fn split_multiple(buf: &Bytes, repeats: usize) -> EbResult<Vec<Vec<Bytes>>> {
        let mut groups = Vec::with_capacity(repeats);
        let mut end = buf.len();
        for _ in 0..repeats {
            let footer = Self::read_at(buf, end)?;
            let framed = footer.framed_size();
            if framed > end {
                return Err(EbError::format(format!(
                    "framed group of {framed} bytes overruns the {end} bytes left"
                )));
            }
            let start = end - framed;
            groups.push(footer.views(buf, start));
            end = start;
        }
        if end != 0 {
            return Err(EbError::format(format!(
                "{end} unframed bytes before {repeats} packet groups"
            )));
        }
        groups.reverse();
        Ok(groups)
    }

    /// Frame `parts` into one buffer.
    #[must_use]
    pub fn pack<B: AsRef<[u8]>>(parts: &[B]) -> Bytes {
        let footer = Self::new(parts.iter().map(|p| p.as_ref().len()).collect());
        let mut out = BytesMut::with_capacity(footer.framed_size());
        for part in parts {
            out.put_slice(part.as_ref());
        }
        footer.write_to(&mut out);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_split_preserves_parts() {
        let parts: Vec<&[u8]> = vec![b"abc", b"", b"defgh"];
        let packed = PacketFooter::pack(&parts);
        assert_eq!(packed.len(), 8 + 4 * 8);
        let views = PacketFooter::split(&packed).unwrap();
        assert_eq!(views, vec![&b"abc"[..], &b""[..], &b"defgh"[..]]);
    }

    #[test]
    fn test_split_is_idempotent() {
        let packed = PacketFooter::pack(&[b"xy".as_slice(), b"z".as_slice()]);
        let first = PacketFooter::split(&packed).unwrap();
        let second = PacketFooter::split(&packed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_buffers() {
        assert!(PacketFooter::split(&Bytes::new()).unwrap().is_empty());
        let zero: [&[u8]; 0] = [];
        let packed = PacketFooter::pack(&zero);
        assert_eq!(packed.len(), 8);
        assert!(PacketFooter::split(&packed).unwrap().is_empty());
    }

    #[test]
    fn test_size_mismatch_is_format_error() {
        let mut raw = PacketFooter::pack(&[b"abcd".as_slice()]).to_vec();
        raw.insert(0, 0xff);
        assert!(matches!(
            PacketFooter::split(&Bytes::from(raw)),
            Err(EbError::Format(_))
        ));
    }

    #[test]
    fn test_absurd_count_is_format_error() {
        let raw = Bytes::from(1_000u64.to_le_bytes().to_vec());
        assert!(matches!(PacketFooter::split(&raw), Err(EbError::Format(_))));
    }

    fn footer_only(words: &[u64]) -> Bytes {
        let mut buf = BytesMut::new();
        for &w in words {
            buf.put_u64_le(w);
        }
        buf.freeze()
    }

    #[test]
    fn test_oversized_packet_is_format_error() {
        let raw = footer_only(&[u64::MAX, 25, 2]);
        assert!(matches!(PacketFooter::split(&raw), Err(EbError::Format(_))));

        // sizes whose sum would wrap around
        let mut buf = BytesMut::from(&b"abcd"[..]);
        buf.put_slice(&footer_only(&[u64::MAX, 5, 2]));
        let buf = buf.freeze();
        assert!(matches!(PacketFooter::split(&buf), Err(EbError::Format(_))));
        assert!(matches!(
            PacketFooter::split_multiple(&buf, 1),
            Err(EbError::Format(_))
        ));
    }

    #[test]
    fn test_split_multiple_rejects_overrun_in_earlier_group() {
        let mut buf = BytesMut::new();
        buf.put_slice(&footer_only(&[1 << 40, 1]));
        buf.put_slice(&PacketFooter::pack(&[b"ok".as_slice()]));
        assert!(matches!(
            PacketFooter::split_multiple(&buf.freeze(), 2),
            Err(EbError::Format(_))
        ));
    }

    #[test]
    fn test_split_multiple() {
        let mut buf = BytesMut::new();
        buf.put_slice(&PacketFooter::pack(&[b"a1".as_slice(), b"b1".as_slice()]));
        buf.put_slice(&PacketFooter::pack(&[b"a2".as_slice(), b"".as_slice()]));
        let buf = buf.freeze();

        let groups = PacketFooter::split_multiple(&buf, 2).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![&b"a1"[..], &b"b1"[..]]);
        assert_eq!(groups[1], vec![&b"a2"[..], &b""[..]]);

        assert!(PacketFooter::split_multiple(&buf, 1).is_err());
    }
}
