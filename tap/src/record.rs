// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Capture record layout.
//!
//! A capture buffer holds a sequence of records, each starting at a 4 byte aligned offset. A
//! record is a header padded to `hdrlen` bytes, followed by the captured bytes. The padding is
//! chosen so that the network header that follows a link header lands on a 4 byte boundary.
//! All multi-byte fields are little-endian.
//!
//! Plain header (18 bytes):
//!
//! | offset | field   | size |
//! |--------|---------|------|
//! | 0      | ts_sec  | 4    |
//! | 4      | ts_usec | 4    |
//! | 8      | caplen  | 4    |
//! | 12     | datalen | 4    |
//! | 16     | hdrlen  | 2    |
//!
//! The compressed header (20 bytes) appends `complen` (2 bytes): the number of leading bytes the
//! record shares with the previous record of the same buffer, which are not stored.
//!
//! The extended header (40 bytes) appends to the plain header: flags (2), service class (4),
//! packet hints (4), flow id (4), pid (4), complen (2) and 2 reserved bytes.

use crate::frame::PacketHints;
use crate::link::Direction;
use thiserror::Error;

pub const RECORD_ALIGNMENT: usize = 4;
pub const PLAIN_HEADER_LEN: usize = 18;
pub const COMPRESSED_HEADER_LEN: usize = 20;
pub const EXTENDED_HEADER_LEN: usize = 40;

const EXT_FLAG_OUTBOUND: u16 = 0x0001;
const EXT_FLAG_PID_VALID: u16 = 0x0002;

/// Round up to the record alignment.
#[must_use]
pub const fn word_align(len: usize) -> usize {
    (len + (RECORD_ALIGNMENT - 1)) & !(RECORD_ALIGNMENT - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFormat {
    Plain,
    Compressed,
    Extended,
}

impl HeaderFormat {
    /// Size of the fixed part of the header, before padding.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            HeaderFormat::Plain => PLAIN_HEADER_LEN,
            HeaderFormat::Compressed => COMPRESSED_HEADER_LEN,
            HeaderFormat::Extended => EXTENDED_HEADER_LEN,
        }
    }

    /// Tell if records of this format may omit a prefix shared with the previous record.
    #[must_use]
    pub const fn compressible(self) -> bool {
        !matches!(self, HeaderFormat::Plain)
    }
}

/// Padded header lengths for the three formats, for a given link header length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSizes {
    pub plain: u16,
    pub compressed: u16,
    pub extended: u16,
}

impl HeaderSizes {
    #[must_use]
    pub fn for_link_header(link_header_len: u32) -> Self {
        // link headers are tiny: reduce modulo the alignment to keep everything in range
        let l = link_header_len as usize % RECORD_ALIGNMENT;
        #[allow(clippy::cast_possible_truncation)]
        let pad = |size: usize| (word_align(size + l) - l) as u16;
        Self {
            plain: pad(PLAIN_HEADER_LEN),
            compressed: pad(COMPRESSED_HEADER_LEN),
            extended: pad(EXTENDED_HEADER_LEN),
        }
    }

    #[must_use]
    pub fn get(&self, format: HeaderFormat) -> u16 {
        match format {
            HeaderFormat::Plain => self.plain,
            HeaderFormat::Compressed => self.compressed,
            HeaderFormat::Extended => self.extended,
        }
    }
}

/// Fields only present in extended headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedFields {
    pub direction: Direction,
    pub service_class: u32,
    pub hints: PacketHints,
    pub flow_id: u32,
    pub pid: Option<u32>,
}

/// A decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub ts_sec: u32,
    pub ts_usec: u32,
    /// Number of bytes captured, including any prefix omitted by compression.
    pub caplen: u32,
    /// Length of the packet on the wire.
    pub datalen: u32,
    /// Length of the header including padding. The captured bytes start at this offset.
    pub hdrlen: u16,
    /// Number of leading captured bytes omitted because they equal the previous record's.
    pub complen: u16,
    pub ext: Option<ExtendedFields>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("Record at offset {0} is truncated")]
    Truncated(usize),
    #[error("Record at offset {0} has an invalid header length")]
    BadHeaderLength(usize),
    #[error("Record at offset {0} is compressed beyond its length or the previous record")]
    BadCompression(usize),
}

fn put_u16(out: &mut [u8], off: usize, v: u16) {
    out[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut [u8], off: usize, v: u32) {
    out[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

impl RecordHeader {
    /// Number of captured bytes actually stored in the record.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        (self.caplen as usize).saturating_sub(usize::from(self.complen))
    }

    /// Encode in `out`, which must be at least `hdrlen` bytes long. The padding is zeroed.
    ///
    /// # Panics
    ///
    /// If `out` is shorter than `hdrlen` or `hdrlen` is smaller than the format's header size.
    pub fn encode(&self, format: HeaderFormat, out: &mut [u8]) {
        let out = &mut out[..usize::from(self.hdrlen)];
        out.fill(0);
        put_u32(out, 0, self.ts_sec);
        put_u32(out, 4, self.ts_usec);
        put_u32(out, 8, self.caplen);
        put_u32(out, 12, self.datalen);
        put_u16(out, 16, self.hdrlen);
        match format {
            HeaderFormat::Plain => {}
            HeaderFormat::Compressed => put_u16(out, 18, self.complen),
            HeaderFormat::Extended => {
                let ext = self.ext.unwrap_or(ExtendedFields {
                    direction: Direction::In,
                    service_class: 0,
                    hints: PacketHints::empty(),
                    flow_id: 0,
                    pid: None,
                });
                let mut flags = 0;
                if ext.direction == Direction::Out {
                    flags |= EXT_FLAG_OUTBOUND;
                }
                if ext.pid.is_some() {
                    flags |= EXT_FLAG_PID_VALID;
                }
                put_u16(out, 18, flags);
                put_u32(out, 20, ext.service_class);
                put_u32(out, 24, ext.hints.bits());
                put_u32(out, 28, ext.flow_id);
                put_u32(out, 32, ext.pid.unwrap_or(0));
                put_u16(out, 36, self.complen);
            }
        }
    }

    /// Decode a header of the given format found at the start of `buf`.
    pub fn decode(format: HeaderFormat, buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() < format.size() {
            return Err(RecordError::Truncated(0));
        }
        let hdrlen = get_u16(buf, 16);
        if usize::from(hdrlen) < format.size() {
            return Err(RecordError::BadHeaderLength(0));
        }
        let mut header = RecordHeader {
            ts_sec: get_u32(buf, 0),
            ts_usec: get_u32(buf, 4),
            caplen: get_u32(buf, 8),
            datalen: get_u32(buf, 12),
            hdrlen,
            complen: 0,
            ext: None,
        };
        match format {
            HeaderFormat::Plain => {}
            HeaderFormat::Compressed => header.complen = get_u16(buf, 18),
            HeaderFormat::Extended => {
                let flags = get_u16(buf, 18);
                header.ext = Some(ExtendedFields {
                    direction: if flags & EXT_FLAG_OUTBOUND == 0 {
                        Direction::In
                    } else {
                        Direction::Out
                    },
                    service_class: get_u32(buf, 20),
                    hints: PacketHints::from_bits_retain(get_u32(buf, 24)),
                    flow_id: get_u32(buf, 28),
                    pid: (flags & EXT_FLAG_PID_VALID != 0).then(|| get_u32(buf, 32)),
                });
                header.complen = get_u16(buf, 36);
            }
        }
        if usize::from(header.complen) > header.caplen as usize {
            return Err(RecordError::BadCompression(0));
        }
        Ok(header)
    }
}

/// A record waiting to be appended to a capture buffer.
#[derive(Debug)]
pub struct PendingRecord<'a> {
    /// Header of the record. `complen` is decided when the record is appended.
    pub header: RecordHeader,
    pub format: HeaderFormat,
    /// The captured bytes, `header.caplen` long.
    pub payload: &'a [u8],
}

impl PendingRecord<'_> {
    /// Unpadded size of the record if `complen` leading bytes are omitted.
    #[must_use]
    pub fn len(&self, complen: u16) -> usize {
        usize::from(self.header.hdrlen) + self.payload.len() - usize::from(complen)
    }

    /// Size of the record, including trailing alignment padding.
    #[must_use]
    pub fn size(&self, complen: u16) -> usize {
        word_align(self.len(complen))
    }

    /// Write the record at the start of `out`, which must hold at least `self.len(complen)`
    /// bytes.
    pub fn write(&self, out: &mut [u8], complen: u16) {
        let hdrlen = usize::from(self.header.hdrlen);
        let header = RecordHeader {
            complen,
            ..self.header
        };
        header.encode(self.format, out);
        let stored = &self.payload[usize::from(complen)..];
        out[hdrlen..hdrlen + stored.len()].copy_from_slice(stored);
    }
}

/// A record found in a capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    /// Offset of the record in the buffer.
    pub offset: usize,
    pub header: RecordHeader,
    /// The stored captured bytes. For compressed records the first `header.complen` bytes of
    /// the capture are those of the previous record and are not included.
    pub data: &'a [u8],
}

/// Iterator over the records of a buffer returned by a read.
#[derive(Debug, Clone)]
pub struct Records<'a> {
    buf: &'a [u8],
    format: HeaderFormat,
    offset: usize,
}

impl<'a> Records<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8], format: HeaderFormat) -> Self {
        Self {
            buf,
            format,
            offset: 0,
        }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buf.len() {
            return None;
        }
        let offset = self.offset;
        let rest = &self.buf[offset..];
        let header = match RecordHeader::decode(self.format, rest) {
            Ok(header) => header,
            Err(e) => {
                self.offset = self.buf.len();
                return Some(Err(match e {
                    RecordError::Truncated(_) => RecordError::Truncated(offset),
                    RecordError::BadHeaderLength(_) => RecordError::BadHeaderLength(offset),
                    RecordError::BadCompression(_) => RecordError::BadCompression(offset),
                }));
            }
        };
        let start = usize::from(header.hdrlen);
        let end = start + header.stored_len();
        if end > rest.len() {
            self.offset = self.buf.len();
            return Some(Err(RecordError::Truncated(offset)));
        }
        self.offset = (offset + word_align(end)).min(self.buf.len());
        Some(Ok(Record {
            offset,
            header,
            data: &rest[start..end],
        }))
    }
}

/// Rebuilds the full captured bytes of compressed records.
///
/// Compression never spans buffers, so a new reassembler is needed for each read.
#[derive(Debug, Default)]
pub struct Reassembler {
    previous: Vec<u8>,
}

impl Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The full captured bytes of `record`, which must follow the previously pushed record of
    /// the same buffer.
    pub fn push(&mut self, record: &Record<'_>) -> Result<&[u8], RecordError> {
        let complen = usize::from(record.header.complen);
        if complen > self.previous.len() {
            return Err(RecordError::BadCompression(record.offset));
        }
        self.previous.truncate(complen);
        self.previous.extend_from_slice(record.data);
        Ok(&self.previous)
    }
}

/// Completes extended record headers at the time they are read.
///
/// Some metadata, like the process a packet belongs to, may not be known when the packet is
/// captured. A finalizer gets to update the extended fields of every record right before it is
/// handed to a reader.
pub trait RecordFinalizer: Send + Sync {
    /// Update the header of an extended record. Only `ext` is written back.
    fn finalize(&self, header: &mut RecordHeader, data: &[u8]);
}

/// Run `finalizer` over the extended records of `buf`, rewriting their headers in place.
pub(crate) fn finalize_records(buf: &mut [u8], finalizer: &dyn RecordFinalizer) {
    let mut offset = 0;
    while offset < buf.len() {
        let Ok(mut header) = RecordHeader::decode(HeaderFormat::Extended, &buf[offset..]) else {
            return;
        };
        let start = offset + usize::from(header.hdrlen);
        let end = start + header.stored_len();
        if end > buf.len() {
            return;
        }
        let before = header;
        finalizer.finalize(&mut header, &buf[start..end]);
        let header = RecordHeader {
            ext: header.ext,
            ..before
        };
        header.encode(HeaderFormat::Extended, &mut buf[offset..]);
        offset += word_align(end - offset);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header(caplen: u32, hdrlen: u16) -> RecordHeader {
        RecordHeader {
            ts_sec: 1,
            ts_usec: 2,
            caplen,
            datalen: caplen + 10,
            hdrlen,
            complen: 0,
            ext: None,
        }
    }

    #[test]
    fn padded_header_sizes() {
        let eth = HeaderSizes::for_link_header(14);
        assert_eq!(eth.plain, 18);
        assert_eq!(eth.compressed, 22);
        assert_eq!(eth.extended, 42);
        let raw = HeaderSizes::for_link_header(0);
        assert_eq!(raw.plain, 20);
        assert_eq!(raw.compressed, 20);
        assert_eq!(raw.extended, 40);
        // network header lands on a word boundary
        for l in 0..32 {
            let sizes = HeaderSizes::for_link_header(l);
            for format in [
                HeaderFormat::Plain,
                HeaderFormat::Compressed,
                HeaderFormat::Extended,
            ] {
                let hdrlen = usize::from(sizes.get(format));
                assert!(hdrlen >= format.size());
                assert_eq!((hdrlen + l as usize) % RECORD_ALIGNMENT, 0);
            }
        }
    }

    #[test]
    fn plain_header_layout() {
        let mut out = [0xffu8; 20];
        header(0x0102_0304, 20).encode(HeaderFormat::Plain, &mut out);
        assert_eq!(&out[8..12], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&out[16..18], &[20, 0]);
        assert_eq!(&out[18..20], &[0, 0]);
    }

    #[test]
    fn extended_header_fields() {
        let mut h = header(64, 40);
        h.complen = 12;
        h.ext = Some(ExtendedFields {
            direction: Direction::Out,
            service_class: 700,
            hints: PacketHints::NEW_FLOW | PacketHints::WAKE,
            flow_id: 0xdead_beef,
            pid: Some(4242),
        });
        let mut out = [0u8; 40];
        h.encode(HeaderFormat::Extended, &mut out);
        assert_eq!(&out[18..20], &[0x03, 0x00]);
        assert_eq!(RecordHeader::decode(HeaderFormat::Extended, &out), Ok(h));
    }

    #[test]
    fn records_walk_and_reassemble() {
        let mut buf = vec![0u8; 128];
        let first = PendingRecord {
            header: header(6, 20),
            format: HeaderFormat::Compressed,
            payload: b"abcdef",
        };
        let second = PendingRecord {
            header: header(7, 20),
            format: HeaderFormat::Compressed,
            payload: b"abcdxyz",
        };
        first.write(&mut buf, 0);
        let off = first.size(0);
        assert_eq!(off, 28);
        second.write(&mut buf[off..], 4);
        let len = off + second.len(4);
        let mut reassembler = Reassembler::new();
        let records: Vec<_> = Records::new(&buf[..len], HeaderFormat::Compressed)
            .map(Result::unwrap)
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].data, b"xyz");
        assert_eq!(reassembler.push(&records[0]).unwrap(), b"abcdef");
        assert_eq!(reassembler.push(&records[1]).unwrap(), b"abcdxyz");
    }

    #[test]
    fn truncated_records_are_reported() {
        let mut buf = vec![0u8; 64];
        let record = PendingRecord {
            header: header(30, 18),
            format: HeaderFormat::Plain,
            payload: &[7u8; 30],
        };
        record.write(&mut buf, 0);
        let mut records = Records::new(&buf[..40], HeaderFormat::Plain);
        assert_eq!(records.next(), Some(Err(RecordError::Truncated(0))));
        assert_eq!(records.next(), None);
    }

    struct StampPid;
    impl RecordFinalizer for StampPid {
        fn finalize(&self, header: &mut RecordHeader, _: &[u8]) {
            if let Some(ext) = header.ext.as_mut() {
                ext.pid = Some(77);
            }
            header.caplen = 0;
        }
    }

    #[test]
    fn finalizer_only_updates_extended_fields() {
        let mut h = header(4, 40);
        h.ext = Some(ExtendedFields {
            direction: Direction::In,
            service_class: 0,
            hints: PacketHints::empty(),
            flow_id: 1,
            pid: None,
        });
        let record = PendingRecord {
            header: h,
            format: HeaderFormat::Extended,
            payload: b"data",
        };
        let mut buf = vec![0u8; record.size(0) * 2];
        record.write(&mut buf, 0);
        record.write(&mut buf[record.size(0)..], 0);
        finalize_records(&mut buf, &StampPid);
        for r in Records::new(&buf, HeaderFormat::Extended) {
            let r = r.unwrap();
            assert_eq!(r.header.caplen, 4);
            assert_eq!(r.header.ext.unwrap().pid, Some(77));
            assert_eq!(r.data, b"data");
        }
    }
}
