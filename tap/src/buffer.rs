// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Capture buffers and their rotation.
//!
//! A descriptor owns two equally sized buffers. One is always the store buffer, where the
//! capture path appends records. The other one is free, holds records waiting to be read, or is
//! lent to a read that is copying it out. Rotation swaps roles by updating the store index;
//! record bytes are never moved between buffers.

use crate::error::TapError;
use crate::record::{PendingRecord, word_align};

/// A fixed capacity buffer of records.
#[derive(Debug, Default)]
pub(crate) struct CaptureBuffer {
    data: Vec<u8>,
    len: usize,
    records: u64,
}

impl CaptureBuffer {
    fn new(size: usize) -> Result<Self, TapError> {
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| TapError::NoMemory)?;
        data.resize(size, 0);
        Ok(Self {
            data,
            len: 0,
            records: 0,
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn records(&self) -> u64 {
        self.records
    }

    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    fn clear(&mut self) {
        self.len = 0;
        self.records = 0;
    }

    fn fits(&self, len: usize) -> bool {
        self.len + len <= self.data.len()
    }

    fn push(&mut self, record: &PendingRecord<'_>, complen: u16) {
        let len = record.len(complen);
        record.write(&mut self.data[self.len..self.len + len], complen);
        // the padding of the last record may not fit
        self.len = (self.len + word_align(len)).min(self.data.len());
        self.records += 1;
    }
}

/// Role of the buffer that is not the store buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpareRole {
    Free,
    Hold,
    /// Taken by a read. Comes back as free.
    Lent,
}

/// Keeps the leading bytes of the last stored record for header compression.
#[derive(Debug)]
struct PrefixHistory {
    previous: [Vec<u8>; 2],
    current: usize,
    valid: bool,
    max: usize,
}

impl PrefixHistory {
    fn new(max: u16) -> Self {
        let max = usize::from(max);
        Self {
            previous: [Vec::with_capacity(max), Vec::with_capacity(max)],
            current: 0,
            valid: false,
            max,
        }
    }

    fn common_prefix(&self, payload: &[u8]) -> u16 {
        if !self.valid {
            return 0;
        }
        let shared = self.previous[self.current]
            .iter()
            .zip(payload)
            .take_while(|(a, b)| a == b)
            .count();
        u16::try_from(shared).unwrap_or(u16::MAX)
    }

    fn record(&mut self, payload: &[u8]) {
        let next = 1 - self.current;
        let keep = payload.len().min(self.max);
        self.previous[next].clear();
        self.previous[next].extend_from_slice(&payload[..keep]);
        self.current = next;
        self.valid = true;
    }

    fn reset(&mut self) {
        self.valid = false;
    }
}

/// What happened to a record handed to [`BufferRing::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct AppendOutcome {
    pub(crate) stored: bool,
    /// The store buffer was rotated into the hold position.
    pub(crate) rotated: bool,
    /// Records thrown away from the hold buffer to make room (head drop).
    pub(crate) discarded: u64,
    pub(crate) complen: u16,
}

/// The two capture buffers of a descriptor.
#[derive(Debug)]
pub(crate) struct BufferRing {
    slots: [CaptureBuffer; 2],
    store: usize,
    spare: SpareRole,
    history: Option<PrefixHistory>,
}

impl BufferRing {
    /// Allocate two buffers of `size` bytes. Compression is used if `max_prefix` is given.
    pub(crate) fn new(size: usize, max_prefix: Option<u16>) -> Result<Self, TapError> {
        Ok(Self {
            slots: [CaptureBuffer::new(size)?, CaptureBuffer::new(size)?],
            store: 0,
            spare: SpareRole::Free,
            history: max_prefix.map(PrefixHistory::new),
        })
    }

    fn spare_index(&self) -> usize {
        1 - self.store
    }

    pub(crate) fn size(&self) -> usize {
        self.slots[self.store].capacity()
    }

    pub(crate) fn compression(&self) -> bool {
        self.history.is_some()
    }

    pub(crate) fn spare(&self) -> SpareRole {
        self.spare
    }

    pub(crate) fn store(&self) -> &CaptureBuffer {
        &self.slots[self.store]
    }

    pub(crate) fn has_hold(&self) -> bool {
        self.spare == SpareRole::Hold
    }

    /// Bytes waiting to be read, in the hold and store buffers.
    pub(crate) fn available(&self) -> usize {
        let hold = match self.spare {
            SpareRole::Hold => self.slots[self.spare_index()].len(),
            SpareRole::Free | SpareRole::Lent => 0,
        };
        hold + self.store().len()
    }

    fn complen_for(&self, record: &PendingRecord<'_>) -> u16 {
        match &self.history {
            Some(history) if record.format.compressible() && !self.store().is_empty() => {
                history.common_prefix(record.payload)
            }
            _ => 0,
        }
    }

    fn store_record(&mut self, record: &PendingRecord<'_>, complen: u16) {
        self.slots[self.store].push(record, complen);
        if let Some(history) = &mut self.history {
            history.record(record.payload);
        }
    }

    /// Append a record, rotating or dropping as needed.
    ///
    /// If the record does not fit in the store buffer: it is dropped while the hold buffer is
    /// lent to a read, or while it holds records and `head_drop` is not set. With `head_drop`,
    /// the held records are discarded instead. Otherwise the store buffer is rotated into the
    /// hold position and the record goes to the fresh store buffer.
    pub(crate) fn append(
        &mut self,
        record: &PendingRecord<'_>,
        head_drop: bool,
    ) -> AppendOutcome {
        let complen = self.complen_for(record);
        if self.store().fits(record.len(complen)) {
            self.store_record(record, complen);
            return AppendOutcome {
                stored: true,
                complen,
                ..AppendOutcome::default()
            };
        }

        // would never fit
        if self.store().is_empty() {
            return AppendOutcome::default();
        }

        let mut discarded = 0;
        match self.spare {
            SpareRole::Lent => return AppendOutcome::default(),
            SpareRole::Hold if !head_drop => return AppendOutcome::default(),
            SpareRole::Hold => {
                let hold = self.spare_index();
                discarded = self.slots[hold].records();
                self.slots[hold].clear();
                self.spare = SpareRole::Free;
            }
            SpareRole::Free => {}
        }

        self.rotate();
        let mut outcome = AppendOutcome {
            rotated: true,
            discarded,
            ..AppendOutcome::default()
        };
        if self.store().fits(record.len(0)) {
            self.store_record(record, 0);
            outcome.stored = true;
        }
        outcome
    }

    /// Move the store buffer into the hold position. Only possible if the spare buffer is free
    /// and the store buffer is not empty.
    pub(crate) fn rotate(&mut self) -> bool {
        if self.spare != SpareRole::Free || self.store().is_empty() {
            return false;
        }
        let next = self.spare_index();
        self.slots[next].clear();
        self.spare = SpareRole::Hold;
        self.store = next;
        if let Some(history) = &mut self.history {
            history.reset();
        }
        true
    }

    /// Take the hold buffer out of the ring, for a read to copy out without locks.
    pub(crate) fn lend_hold(&mut self) -> Option<CaptureBuffer> {
        if self.spare != SpareRole::Hold {
            return None;
        }
        self.spare = SpareRole::Lent;
        let index = self.spare_index();
        Some(std::mem::take(&mut self.slots[index]))
    }

    /// Give back a buffer previously lent. It becomes the free buffer.
    pub(crate) fn restore_free(&mut self, mut buffer: CaptureBuffer) {
        if self.spare != SpareRole::Lent {
            return;
        }
        buffer.clear();
        let index = self.spare_index();
        self.slots[index] = buffer;
        self.spare = SpareRole::Free;
    }

    /// Discard all buffered records. A lent buffer stays lent.
    pub(crate) fn reset(&mut self) {
        self.slots[self.store].clear();
        if self.spare == SpareRole::Hold {
            let index = self.spare_index();
            self.slots[index].clear();
            self.spare = SpareRole::Free;
        }
        if let Some(history) = &mut self.history {
            history.reset();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test {
    use super::*;
    use crate::record::{HeaderFormat, RecordHeader, Reassembler, Records};
    use pretty_assertions::assert_eq;

    fn pending(payload: &[u8], format: HeaderFormat) -> PendingRecord<'_> {
        let hdrlen = u16::try_from(word_align(format.size())).unwrap();
        PendingRecord {
            header: RecordHeader {
                ts_sec: 0,
                ts_usec: 0,
                caplen: u32::try_from(payload.len()).unwrap(),
                datalen: u32::try_from(payload.len()).unwrap(),
                hdrlen,
                complen: 0,
                ext: None,
            },
            format,
            payload,
        }
    }

    // 20 byte header + 76 bytes = 96 bytes per record: two records per 200 byte buffer
    const PAYLOAD: [u8; 76] = [0xaa; 76];

    #[test]
    fn fills_then_rotates() {
        let mut ring = BufferRing::new(200, None).unwrap();
        let rec = pending(&PAYLOAD, HeaderFormat::Plain);
        assert!(ring.append(&rec, false).stored);
        assert!(ring.append(&rec, false).stored);
        assert_eq!(ring.store().len(), 192);
        assert_eq!(ring.store().records(), 2);

        let outcome = ring.append(&rec, false);
        assert!(outcome.stored && outcome.rotated);
        assert!(ring.has_hold());
        assert_eq!(ring.available(), 192 + 96);
    }

    #[test]
    fn rotation_moves_store_bytes_to_hold() {
        let mut ring = BufferRing::new(200, None).unwrap();
        let first = [0x11; 76];
        let second = [0x22; 76];
        ring.append(&pending(&first, HeaderFormat::Plain), false);
        ring.append(&pending(&second, HeaderFormat::Plain), false);
        let stored = ring.store().bytes().to_vec();
        assert_eq!(stored.len(), 192);

        assert!(ring.rotate());
        assert_eq!(ring.store().len(), 0);
        assert_eq!(ring.store().records(), 0);
        // nothing to rotate while held
        assert!(!ring.rotate());

        let hold = ring.lend_hold().unwrap();
        assert_eq!(hold.bytes(), stored.as_slice());
        assert_eq!(hold.records(), 2);
        ring.restore_free(hold);
        assert!(!ring.has_hold());
    }

    #[test]
    fn tail_drop_keeps_hold() {
        let mut ring = BufferRing::new(200, None).unwrap();
        let rec = pending(&PAYLOAD, HeaderFormat::Plain);
        for _ in 0..4 {
            assert!(ring.append(&rec, false).stored);
        }
        let outcome = ring.append(&rec, false);
        assert_eq!(outcome, AppendOutcome::default());
        assert_eq!(ring.available(), 384);
    }

    #[test]
    fn head_drop_discards_hold() {
        let mut ring = BufferRing::new(200, None).unwrap();
        let rec = pending(&PAYLOAD, HeaderFormat::Plain);
        for _ in 0..4 {
            ring.append(&rec, true);
        }
        let outcome = ring.append(&rec, true);
        assert!(outcome.stored && outcome.rotated);
        assert_eq!(outcome.discarded, 2);
        assert_eq!(ring.available(), 192 + 96);
    }

    #[test]
    fn lent_hold_drops_even_with_head_drop() {
        let mut ring = BufferRing::new(200, None).unwrap();
        let rec = pending(&PAYLOAD, HeaderFormat::Plain);
        for _ in 0..3 {
            ring.append(&rec, true);
        }
        let lent = ring.lend_hold().unwrap();
        assert_eq!(lent.records(), 2);
        ring.append(&rec, true);
        assert_eq!(ring.append(&rec, true), AppendOutcome::default());
        assert_eq!(ring.spare(), SpareRole::Lent);
        ring.restore_free(lent);
        assert_eq!(ring.spare(), SpareRole::Free);
        assert!(ring.append(&rec, true).rotated);
    }

    #[test]
    fn oversized_records_are_dropped() {
        let mut ring = BufferRing::new(64, None).unwrap();
        let rec = pending(&PAYLOAD, HeaderFormat::Plain);
        assert_eq!(ring.append(&rec, true), AppendOutcome::default());
        assert_eq!(ring.available(), 0);
        assert!(!ring.rotate());
    }

    #[test]
    fn allocation_failure_is_reported() {
        assert_eq!(
            BufferRing::new(usize::MAX, None).map(|_| ()),
            Err(TapError::NoMemory)
        );
    }

    #[test]
    fn compression_restarts_after_rotation() {
        let mut ring = BufferRing::new(128, Some(256)).unwrap();
        let first = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let second = [1u8, 2, 3, 4, 9, 9, 9, 9];
        let rec1 = pending(&first, HeaderFormat::Compressed);
        let rec2 = pending(&second, HeaderFormat::Compressed);
        assert_eq!(ring.append(&rec1, false).complen, 0);
        assert_eq!(ring.append(&rec2, false).complen, 4);
        assert!(ring.rotate());
        assert_eq!(ring.append(&rec2, false).complen, 0);
        // plain records never get compressed
        let rec3 = pending(&second, HeaderFormat::Plain);
        assert_eq!(ring.append(&rec3, false).complen, 0);
    }

    #[test]
    fn occupancy_is_bounded() {
        bolero::check!()
            .with_type::<Vec<(u8, bool, bool)>>()
            .for_each(|ops| {
                let mut ring = BufferRing::new(300, Some(64)).unwrap();
                let payload = [0x5au8; 255];
                let mut offered = 0u64;
                let mut accounted = 0u64;
                let mut read = 0u64;
                for &(len, head_drop, drain) in ops {
                    if drain {
                        if let Some(buffer) = ring.lend_hold() {
                            read += buffer.records();
                            ring.restore_free(buffer);
                        }
                    }
                    let rec = pending(&payload[..usize::from(len)], HeaderFormat::Compressed);
                    offered += 1;
                    let outcome = ring.append(&rec, head_drop);
                    accounted += outcome.discarded;
                    if !outcome.stored {
                        accounted += 1;
                    }
                    assert!(ring.store().len() <= ring.size());
                    assert!(ring.available() <= 2 * ring.size());
                }
                let mut buffered = ring.store().records();
                if let Some(buffer) = ring.lend_hold() {
                    buffered += buffer.records();
                }
                assert_eq!(offered, accounted + read + buffered);
            });
    }

    #[test]
    fn compressed_records_reconstruct() {
        bolero::check!()
            .with_type::<Vec<Vec<u8>>>()
            .for_each(|payloads| {
                let mut ring = BufferRing::new(64 * 1024, Some(256)).unwrap();
                let mut stored = Vec::new();
                for payload in payloads.iter().filter(|p| p.len() <= 1024) {
                    let rec = pending(payload, HeaderFormat::Compressed);
                    let outcome = ring.append(&rec, false);
                    if outcome.rotated || !outcome.stored {
                        break;
                    }
                    stored.push(payload.clone());
                }
                let mut reassembler = Reassembler::new();
                let records: Vec<_> = Records::new(ring.store().bytes(), HeaderFormat::Compressed)
                    .map(Result::unwrap)
                    .collect();
                assert_eq!(records.len(), stored.len());
                for (record, expected) in records.iter().zip(&stored) {
                    assert_eq!(reassembler.push(record).unwrap(), expected.as_slice());
                }
            });
    }
}
