// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! The VHDX write-ahead log: a ring of 4 KiB sectors inside the log
//! region. Every entry is one header sector, descriptor sectors holding
//! 32-byte descriptors (the first shares space with the 64-byte header),
//! and one data sector per data descriptor. BAT and bitmap updates are
//! made durable by writing an entry, flushing, replaying it into the file
//! and resetting the log through a header update.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use byteorder::{ByteOrder, LittleEndian};
use disk_util::checksum::crc32c_single;
use disk_util::{round_down, round_up, MIB};
use log::{debug, warn};
use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

use crate::vhdx_header::{HeaderSection, VhdxHeaderError, LOG_REGION_START};

const ENTRY_SIGNATURE: &[u8; 4] = b"loge";
const ZERO_SIGNATURE: &[u8; 4] = b"zero";
const DESC_SIGNATURE: &[u8; 4] = b"desc";
const DATA_SIGNATURE: &[u8; 4] = b"data";

pub const LOG_SECTOR_SIZE: u32 = 4 * 1024;
const LOG_MIN_SIZE: u64 = MIB;

const ENTRY_HEADER_SIZE: usize = 64;
const DESCRIPTOR_SIZE: usize = 32;
const DATA_SECTOR_PAYLOAD: usize = 4084;

const SEQ_NUM_FOR_CREATE: u64 = 10;

#[sorted]
#[derive(Error, Debug)]
pub enum VhdxLogError {
    #[error("data sector sequence {0} doesn't match descriptor sequence {1}")]
    DataSectorSeqMismatch(u64, u64),
    #[error("log flushed file offset {0} exceeds file length {1}")]
    FileTooSmall(u64, u64),
    #[error("log sequence vanished while being replayed")]
    InvalidSequence,
    #[error("log is full")]
    LogFull,
    #[error("log length {0} invalid")]
    LogLengthInvalid(u32),
    #[error("log must be flushed after every write")]
    LogNotFlushed,
    #[error("log offset {0} invalid")]
    LogOffsetInvalid(u64),
    #[error("failed to read log: {0}")]
    ReadLog(#[source] io::Error),
    #[error("file is read-only but contains a log that needs to be replayed")]
    ReplayOnReadOnly,
    #[error("failed changing file length: {0}")]
    ResizeFile(#[source] io::Error),
    #[error("log version must be zero, found {0}")]
    UnsupportedLogVersion(u16),
    #[error("failed to update header: {0}")]
    UpdateHeader(#[source] VhdxHeaderError),
    #[error("failed to write log: {0}")]
    WriteLog(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VhdxLogError>;

/// Sectors needed for a header plus `desc_count` descriptors: the header
/// occupies two descriptor slots of the first sector, later sectors carry
/// 128 descriptors each. Never returns 0.
fn calc_desc_sectors(desc_count: u32) -> u32 {
    let slots = desc_count + 2;
    slots / 128 + u32::from(slots % 128 != 0)
}

#[derive(Clone, Copy, Debug)]
pub struct EntryHeader {
    pub checksum: u32,
    pub entry_length: u32,
    pub tail: u32,
    pub seq_num: u64,
    pub desc_count: u64,
    pub guid: Uuid,
    pub flushed_file_offset: u64,
    pub last_file_offset: u64,
}

impl EntryHeader {
    fn read_from(buf: &[u8]) -> Option<EntryHeader> {
        if &buf[0..4] != ENTRY_SIGNATURE {
            return None;
        }

        Some(EntryHeader {
            checksum: LittleEndian::read_u32(&buf[4..8]),
            entry_length: LittleEndian::read_u32(&buf[8..12]),
            tail: LittleEndian::read_u32(&buf[12..16]),
            seq_num: LittleEndian::read_u64(&buf[16..24]),
            desc_count: LittleEndian::read_u64(&buf[24..32]),
            guid: disk_util::guid::from_le_bytes(buf[32..48].try_into().unwrap()),
            flushed_file_offset: LittleEndian::read_u64(&buf[48..56]),
            last_file_offset: LittleEndian::read_u64(&buf[56..64]),
        })
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(ENTRY_SIGNATURE);
        LittleEndian::write_u32(&mut buf[4..8], self.checksum);
        LittleEndian::write_u32(&mut buf[8..12], self.entry_length);
        LittleEndian::write_u32(&mut buf[12..16], self.tail);
        LittleEndian::write_u64(&mut buf[16..24], self.seq_num);
        LittleEndian::write_u64(&mut buf[24..32], self.desc_count);
        buf[32..48].copy_from_slice(&disk_util::guid::to_le_bytes(&self.guid));
        LittleEndian::write_u64(&mut buf[48..56], self.flushed_file_offset);
        LittleEndian::write_u64(&mut buf[56..64], self.last_file_offset);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Data {
        trailing_bytes: u32,
        leading_bytes: u64,
        file_offset: u64,
        seq_num: u64,
    },
    Zero {
        zero_length: u64,
        file_offset: u64,
        seq_num: u64,
    },
}

impl Descriptor {
    fn read_from(buf: &[u8]) -> Option<Descriptor> {
        let file_offset = LittleEndian::read_u64(&buf[16..24]);
        let seq_num = LittleEndian::read_u64(&buf[24..32]);

        if &buf[0..4] == DESC_SIGNATURE {
            Some(Descriptor::Data {
                trailing_bytes: LittleEndian::read_u32(&buf[4..8]),
                leading_bytes: LittleEndian::read_u64(&buf[8..16]),
                file_offset,
                seq_num,
            })
        } else if &buf[0..4] == ZERO_SIGNATURE {
            Some(Descriptor::Zero {
                zero_length: LittleEndian::read_u64(&buf[8..16]),
                file_offset,
                seq_num,
            })
        } else {
            None
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        match self {
            Descriptor::Data {
                trailing_bytes,
                leading_bytes,
                file_offset,
                seq_num,
            } => {
                buf[0..4].copy_from_slice(DESC_SIGNATURE);
                LittleEndian::write_u32(&mut buf[4..8], *trailing_bytes);
                LittleEndian::write_u64(&mut buf[8..16], *leading_bytes);
                LittleEndian::write_u64(&mut buf[16..24], *file_offset);
                LittleEndian::write_u64(&mut buf[24..32], *seq_num);
            }
            Descriptor::Zero {
                zero_length,
                file_offset,
                seq_num,
            } => {
                buf[0..4].copy_from_slice(ZERO_SIGNATURE);
                LittleEndian::write_u64(&mut buf[8..16], *zero_length);
                LittleEndian::write_u64(&mut buf[16..24], *file_offset);
                LittleEndian::write_u64(&mut buf[24..32], *seq_num);
            }
        }
    }

    fn is_valid(&self, entry: &EntryHeader) -> bool {
        match self {
            Descriptor::Data {
                file_offset,
                seq_num,
                ..
            } => *seq_num == entry.seq_num && *file_offset % LOG_SECTOR_SIZE as u64 == 0,
            Descriptor::Zero {
                zero_length,
                file_offset,
                seq_num,
            } => {
                *seq_num == entry.seq_num
                    && *file_offset % LOG_SECTOR_SIZE as u64 == 0
                    && *zero_length % LOG_SECTOR_SIZE as u64 == 0
            }
        }
    }
}

/// A fully validated entry pulled out of the ring.
struct ValidEntry {
    header: EntryHeader,
    descriptors: Vec<Descriptor>,
    /// The data sectors of the entry, in descriptor order.
    data: Vec<u8>,
}

/// A contiguous run of entries whose sequence numbers increment by one.
pub(crate) struct LogSequence {
    count: u32,
    head_seq: u64,
    last_seq: u64,
    tail_offset: u32,
    end_offset: u32,
}

/// Ring-buffer state over the on-disk log region.
#[derive(Debug)]
pub struct LogSection {
    offset: u64,
    length: u32,
    read: u32,
    write: u32,
    seq: u64,
}

impl LogSection {
    pub fn new(offset: u64, length: u32) -> LogSection {
        LogSection {
            offset,
            length,
            read: 0,
            write: 0,
            seq: SEQ_NUM_FOR_CREATE,
        }
    }

    /// Write the scaffolding entry header of a freshly created file. Its
    /// GUID never matches a header log GUID, so it is never replayed.
    pub fn write_initial_entry(f: &File, file_payload_mb: u64) -> Result<()> {
        let flushed = (3 + file_payload_mb) << disk_util::MIB_SHIFT;
        let header = EntryHeader {
            checksum: 0,
            entry_length: LOG_SECTOR_SIZE,
            tail: 0,
            seq_num: SEQ_NUM_FOR_CREATE,
            desc_count: 0,
            guid: Uuid::new_v4(),
            flushed_file_offset: flushed,
            last_file_offset: flushed,
        };

        let mut buf = vec![0u8; LOG_SECTOR_SIZE as usize];
        header.write_to(&mut buf);
        let checksum = crc32c_single(&buf);
        LittleEndian::write_u32(&mut buf[4..8], checksum);

        f.write_all_at(&buf, LOG_REGION_START)
            .map_err(VhdxLogError::WriteLog)
    }

    /// Log recovery on open: find the active sequence, replay it into the
    /// file, reset the log. Nothing to do when the log GUID is zero or the
    /// log is empty.
    pub fn parse(&mut self, f: &File, hdr: &mut HeaderSection, read_only: bool) -> Result<()> {
        if self.offset < LOG_MIN_SIZE || self.offset % LOG_MIN_SIZE != 0 {
            return Err(VhdxLogError::LogOffsetInvalid(self.offset));
        }

        if hdr.log_version() != 0 {
            return Err(VhdxLogError::UnsupportedLogVersion(hdr.log_version()));
        }

        // If either the log guid or the log length is zero, then a replay
        // log is not present.
        if hdr.log_guid().is_nil() || self.length == 0 {
            return Ok(());
        }

        if self.length as u64 % LOG_MIN_SIZE != 0 {
            return Err(VhdxLogError::LogLengthInvalid(self.length));
        }

        if let Some(logs) = self.search(f, hdr)? {
            if read_only {
                return Err(VhdxLogError::ReplayOnReadOnly);
            }
            self.replay(f, hdr, &logs)?;
        }

        Ok(())
    }

    fn wrap(&self, idx: u32) -> u32 {
        idx % self.length
    }

    fn read_ring_sectors(&self, f: &File, start: u32, count: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; (count * LOG_SECTOR_SIZE) as usize];
        let mut idx = start;
        for sector in 0..count as usize {
            let chunk =
                &mut buf[sector * LOG_SECTOR_SIZE as usize..(sector + 1) * LOG_SECTOR_SIZE as usize];
            f.read_exact_at(chunk, self.offset + idx as u64)
                .map_err(VhdxLogError::ReadLog)?;
            idx = self.wrap(idx + LOG_SECTOR_SIZE);
        }
        Ok(buf)
    }

    /// Validate the entry starting at ring offset `start`: header fields,
    /// GUID, optional expected sequence, descriptors, and the CRC-32C over
    /// the whole entry with the checksum field zeroed.
    fn validate_entry(
        &self,
        f: &File,
        hdr: &HeaderSection,
        start: u32,
        expected_seq: Option<u64>,
    ) -> Result<Option<ValidEntry>> {
        let first = self.read_ring_sectors(f, start, 1)?;
        let Some(entry) = EntryHeader::read_from(&first[..ENTRY_HEADER_SIZE]) else {
            return Ok(None);
        };

        if entry.entry_length == 0
            || entry.entry_length % LOG_SECTOR_SIZE != 0
            || entry.entry_length > self.length
        {
            return Ok(None);
        }
        // Sequence numbers must be greater than zero.
        if entry.seq_num == 0 {
            return Ok(None);
        }
        if let Some(expected) = expected_seq {
            if entry.seq_num != expected {
                return Ok(None);
            }
        }
        // Entries are only valid if they match the file-wide log GUID in
        // the active header.
        if entry.guid != hdr.log_guid() {
            debug!("log entry guid mismatch at ring offset {}", start);
            return Ok(None);
        }
        if entry
            .desc_count
            .checked_mul(DESCRIPTOR_SIZE as u64)
            .map_or(true, |bytes| bytes > entry.entry_length as u64)
        {
            return Ok(None);
        }

        let total_sectors = entry.entry_length / LOG_SECTOR_SIZE;
        let desc_sectors = calc_desc_sectors(entry.desc_count as u32);
        if desc_sectors > total_sectors {
            return Ok(None);
        }

        let entry_buf = self.read_ring_sectors(f, start, total_sectors)?;

        let mut crc_buf = entry_buf.clone();
        crc_buf[4..8].fill(0);
        let crc = crc32c_single(&crc_buf);
        if crc != entry.checksum {
            warn!(
                "log checksum[{:#010X}|{:#010X}] mismatch at ring offset {}",
                entry.checksum, crc, start
            );
            return Ok(None);
        }

        // Descriptors run contiguously from the end of the header; 126 fit
        // the first sector, 128 each sector after that.
        let mut descriptors = Vec::with_capacity(entry.desc_count as usize);
        for i in 0..entry.desc_count as usize {
            let base = ENTRY_HEADER_SIZE + i * DESCRIPTOR_SIZE;
            let Some(desc) = Descriptor::read_from(&entry_buf[base..base + DESCRIPTOR_SIZE]) else {
                return Ok(None);
            };
            if !desc.is_valid(&entry) {
                return Ok(None);
            }
            descriptors.push(desc);
        }

        // Every data descriptor owns exactly one data sector.
        let data_desc_count = descriptors
            .iter()
            .filter(|desc| matches!(desc, Descriptor::Data { .. }))
            .count();
        if data_desc_count != (total_sectors - desc_sectors) as usize {
            return Ok(None);
        }

        let data = entry_buf[(desc_sectors * LOG_SECTOR_SIZE) as usize..].to_vec();

        Ok(Some(ValidEntry {
            header: entry,
            descriptors,
            data,
        }))
    }

    /// Scan the whole ring for the active sequence: the candidate with the
    /// greatest starting sequence number wins.
    fn search(&mut self, f: &File, hdr: &HeaderSection) -> Result<Option<LogSequence>> {
        let mut candidate: Option<LogSequence> = None;

        for sector in 0..self.length / LOG_SECTOR_SIZE {
            let start = sector * LOG_SECTOR_SIZE;
            let Some(head) = self.validate_entry(f, hdr, start, None)? else {
                continue;
            };

            let mut count = 1;
            let mut last = head.header;
            let mut cursor = start;
            loop {
                let next = self.wrap(cursor + last.entry_length);
                if next == start {
                    // Wrapped all the way around.
                    break;
                }
                match self.validate_entry(f, hdr, next, Some(last.seq_num + 1))? {
                    Some(entry) => {
                        count += 1;
                        cursor = next;
                        last = entry.header;
                    }
                    None => break,
                }
            }

            let current = LogSequence {
                count,
                head_seq: head.header.seq_num,
                last_seq: last.seq_num,
                tail_offset: start,
                end_offset: self.wrap(cursor + last.entry_length),
            };

            if candidate
                .as_ref()
                .map_or(true, |best| current.head_seq > best.head_seq)
            {
                candidate = Some(current);
            }
        }

        if let Some(logs) = &candidate {
            // The next sequence number, for writes.
            self.seq = logs.last_seq + 1;
            self.read = logs.tail_offset;
            self.write = logs.end_offset;
        }

        Ok(candidate)
    }

    /// Apply a validated sequence to the file, then flush and reset the
    /// log by clearing the header's log GUID.
    fn replay(&mut self, f: &File, hdr: &mut HeaderSection, logs: &LogSequence) -> Result<()> {
        hdr.user_visible_write(f).map_err(VhdxLogError::UpdateHeader)?;

        let mut cursor = logs.tail_offset;
        for _ in 0..logs.count {
            let entry = self
                .validate_entry(f, hdr, cursor, None)?
                .ok_or(VhdxLogError::InvalidSequence)?;

            let file_len = f.metadata().map_err(VhdxLogError::ReadLog)?.len();
            // A FlushedFileOffset larger than the current file size means
            // the file has been truncated and must not be used.
            if entry.header.flushed_file_offset > file_len {
                return Err(VhdxLogError::FileTooSmall(
                    entry.header.flushed_file_offset,
                    file_len,
                ));
            }

            self.flush_descriptors(f, &entry)?;

            if file_len < entry.header.last_file_offset {
                let new_len = round_up(entry.header.last_file_offset, MIB);
                f.set_len(new_len).map_err(VhdxLogError::ResizeFile)?;
            }

            cursor = self.wrap(cursor + entry.header.entry_length);
        }
        self.read = logs.end_offset;

        f.sync_all().map_err(VhdxLogError::WriteLog)?;

        // Reset the log only after the replay has fully landed.
        hdr.update_log_guid(f, Uuid::nil())
            .map_err(VhdxLogError::UpdateHeader)
    }

    fn flush_descriptors(&self, f: &File, entry: &ValidEntry) -> Result<()> {
        let mut data_idx = 0usize;
        let mut sector_buf = vec![0u8; LOG_SECTOR_SIZE as usize];

        for desc in &entry.descriptors {
            match desc {
                Descriptor::Data {
                    trailing_bytes,
                    leading_bytes,
                    file_offset,
                    seq_num,
                } => {
                    let base = data_idx * LOG_SECTOR_SIZE as usize;
                    let data_sector = &entry.data[base..base + LOG_SECTOR_SIZE as usize];
                    data_idx += 1;

                    let seq_high = LittleEndian::read_u32(&data_sector[4..8]) as u64;
                    let seq_low = LittleEndian::read_u32(&data_sector[4092..4096]) as u64;
                    let sector_seq = (seq_high << 32) | seq_low;
                    if sector_seq != *seq_num {
                        return Err(VhdxLogError::DataSectorSeqMismatch(sector_seq, *seq_num));
                    }

                    // Reassemble the original 4 KiB update: the first 8 and
                    // last 4 bytes live in the descriptor.
                    LittleEndian::write_u64(&mut sector_buf[0..8], *leading_bytes);
                    sector_buf[8..8 + DATA_SECTOR_PAYLOAD]
                        .copy_from_slice(&data_sector[8..8 + DATA_SECTOR_PAYLOAD]);
                    LittleEndian::write_u32(&mut sector_buf[4092..4096], *trailing_bytes);

                    f.write_all_at(&sector_buf, *file_offset)
                        .map_err(VhdxLogError::WriteLog)?;
                }
                Descriptor::Zero {
                    zero_length,
                    file_offset,
                    ..
                } => {
                    sector_buf.fill(0);
                    let mut offset = *file_offset;
                    for _ in 0..zero_length / LOG_SECTOR_SIZE as u64 {
                        f.write_all_at(&sector_buf, offset)
                            .map_err(VhdxLogError::WriteLog)?;
                        offset += LOG_SECTOR_SIZE as u64;
                    }
                }
            }
        }

        Ok(())
    }

    /// Make one (offset, data) update durable: flush the payload, write a
    /// log entry, flush the log, replay it and reset the log.
    pub fn write_entry_and_flush(
        &mut self,
        f: &File,
        hdr: &mut HeaderSection,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        // Make sure data written (new and/or changed blocks) is stable on
        // disk before creating the log entry.
        f.sync_all().map_err(VhdxLogError::WriteLog)?;

        let logs = self.write_entry(f, hdr, offset, data)?;

        // Make sure the log is stable on disk before applying it.
        f.sync_all().map_err(VhdxLogError::WriteLog)?;

        self.replay(f, hdr, &logs)
    }

    pub(crate) fn write_entry(
        &mut self,
        f: &File,
        hdr: &mut HeaderSection,
        offset: u64,
        data: &[u8],
    ) -> Result<LogSequence> {
        if hdr.log_length() == 0 {
            return Err(VhdxLogError::LogLengthInvalid(0));
        }

        if hdr.log_guid().is_nil() {
            hdr.update_log_guid(f, Uuid::new_v4())
                .map_err(VhdxLogError::UpdateHeader)?;
        } else {
            // The log is required to be flushed after every write.
            return Err(VhdxLogError::LogNotFlushed);
        }
        let log_guid = hdr.log_guid();

        let sector_offset = (offset % LOG_SECTOR_SIZE as u64) as u32;
        let mut file_offset = round_down(offset, LOG_SECTOR_SIZE as u64);
        let length = data.len() as u32;

        // Split off the unaligned head and tail of the update.
        let mut aligned_length = length;
        let mut partial_sectors = 0;
        let mut leading_length = 0;
        if sector_offset != 0 {
            leading_length = (LOG_SECTOR_SIZE - sector_offset).min(length);
            aligned_length -= leading_length;
            partial_sectors += 1;
        }
        let trailing_length = aligned_length % LOG_SECTOR_SIZE;
        if trailing_length != 0 {
            partial_sectors += 1;
        }
        let sectors = aligned_length / LOG_SECTOR_SIZE + partial_sectors;

        let desc_sectors = calc_desc_sectors(sectors);
        let total_sectors = desc_sectors + sectors;
        let total_length = total_sectors * LOG_SECTOR_SIZE;

        // read == write means empty; never fill the ring completely or the
        // two become indistinguishable.
        let ring_used = ((self.write as u64 + self.length as u64 - self.read as u64)
            % self.length as u64) as u32;
        if total_length >= self.length - ring_used {
            return Err(VhdxLogError::LogFull);
        }

        let file_len = f.metadata().map_err(VhdxLogError::ReadLog)?.len();
        let entry_start = self.write;

        let mut header = EntryHeader {
            checksum: 0,
            entry_length: total_length,
            tail: entry_start,
            seq_num: self.seq,
            desc_count: sectors as u64,
            guid: log_guid,
            flushed_file_offset: file_len,
            last_file_offset: file_len,
        };

        let mut buf = vec![0u8; total_length as usize];
        let mut consumed = 0usize;
        let mut sector_image = vec![0u8; LOG_SECTOR_SIZE as usize];

        for i in 0..sectors {
            let take;
            if i == 0 && leading_length > 0 {
                // Partial sector at the front: merge with on-disk content.
                f.read_exact_at(&mut sector_image, file_offset)
                    .map_err(VhdxLogError::ReadLog)?;
                take = leading_length as usize;
                sector_image[sector_offset as usize..sector_offset as usize + take]
                    .copy_from_slice(&data[..take]);
            } else if i == sectors - 1 && trailing_length > 0 {
                // Partial sector at the end: merge with on-disk content.
                let tail = trailing_length as usize;
                f.read_exact_at(&mut sector_image[tail..], file_offset + tail as u64)
                    .map_err(VhdxLogError::ReadLog)?;
                take = tail;
                sector_image[..take].copy_from_slice(&data[consumed..consumed + take]);
            } else {
                take = LOG_SECTOR_SIZE as usize;
                sector_image.copy_from_slice(&data[consumed..consumed + take]);
            }

            let desc = Descriptor::Data {
                trailing_bytes: LittleEndian::read_u32(&sector_image[4092..4096]),
                leading_bytes: LittleEndian::read_u64(&sector_image[0..8]),
                file_offset,
                seq_num: self.seq,
            };
            let desc_base = ENTRY_HEADER_SIZE + (i as usize) * DESCRIPTOR_SIZE;
            desc.write_to(&mut buf[desc_base..desc_base + DESCRIPTOR_SIZE]);

            let ds_base = ((desc_sectors + i) * LOG_SECTOR_SIZE) as usize;
            buf[ds_base..ds_base + 4].copy_from_slice(DATA_SIGNATURE);
            LittleEndian::write_u32(&mut buf[ds_base + 4..ds_base + 8], (self.seq >> 32) as u32);
            buf[ds_base + 8..ds_base + 8 + DATA_SECTOR_PAYLOAD]
                .copy_from_slice(&sector_image[8..8 + DATA_SECTOR_PAYLOAD]);
            LittleEndian::write_u32(
                &mut buf[ds_base + 4092..ds_base + 4096],
                (self.seq & 0xFFFF_FFFF) as u32,
            );

            consumed += take;
            file_offset += LOG_SECTOR_SIZE as u64;
        }

        // The CRC covers the whole entry with the checksum field zeroed.
        header.write_to(&mut buf[..ENTRY_HEADER_SIZE]);
        LittleEndian::write_u32(&mut buf[4..8], 0);
        header.checksum = crc32c_single(&buf);
        LittleEndian::write_u32(&mut buf[4..8], header.checksum);

        self.write_ring_sectors(f, &buf)?;
        self.seq += 1;

        Ok(LogSequence {
            count: 1,
            head_seq: header.seq_num,
            last_seq: header.seq_num,
            tail_offset: entry_start,
            end_offset: self.write,
        })
    }

    fn write_ring_sectors(&mut self, f: &File, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(LOG_SECTOR_SIZE as usize) {
            f.write_all_at(chunk, self.offset + self.write as u64)
                .map_err(VhdxLogError::WriteLog)?;
            self.write = self.wrap(self.write + LOG_SECTOR_SIZE);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_desc_sectors() {
        assert_eq!(calc_desc_sectors(0), 1);
        assert_eq!(calc_desc_sectors(1), 1);
        assert_eq!(calc_desc_sectors(126), 1);
        assert_eq!(calc_desc_sectors(127), 2);
        assert_eq!(calc_desc_sectors(254), 2);
        assert_eq!(calc_desc_sectors(255), 3);
    }

    #[test]
    fn test_entry_header_round_trip() {
        let header = EntryHeader {
            checksum: 0xDEAD_BEEF,
            entry_length: 2 * LOG_SECTOR_SIZE,
            tail: LOG_SECTOR_SIZE,
            seq_num: 11,
            desc_count: 1,
            guid: Uuid::new_v4(),
            flushed_file_offset: 4 * MIB,
            last_file_offset: 4 * MIB,
        };

        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        header.write_to(&mut buf);
        let parsed = EntryHeader::read_from(&buf).unwrap();
        assert_eq!(parsed.checksum, header.checksum);
        assert_eq!(parsed.entry_length, header.entry_length);
        assert_eq!(parsed.tail, header.tail);
        assert_eq!(parsed.seq_num, header.seq_num);
        assert_eq!(parsed.desc_count, header.desc_count);
        assert_eq!(parsed.guid, header.guid);
        assert_eq!(parsed.flushed_file_offset, header.flushed_file_offset);

        assert!(EntryHeader::read_from(&[0u8; ENTRY_HEADER_SIZE]).is_none());
    }

    #[test]
    fn test_descriptor_round_trips() {
        let mut buf = [0u8; DESCRIPTOR_SIZE];

        let data = Descriptor::Data {
            trailing_bytes: 0xABCD,
            leading_bytes: 0x0102_0304_0506_0708,
            file_offset: 3 * MIB,
            seq_num: 11,
        };
        data.write_to(&mut buf);
        assert_eq!(Descriptor::read_from(&buf).unwrap(), data);

        let zero = Descriptor::Zero {
            zero_length: 8 * LOG_SECTOR_SIZE as u64,
            file_offset: 4 * MIB,
            seq_num: 11,
        };
        zero.write_to(&mut buf);
        assert_eq!(Descriptor::read_from(&buf).unwrap(), zero);

        buf[0..4].copy_from_slice(b"zzzz");
        assert!(Descriptor::read_from(&buf).is_none());
    }

    #[test]
    fn test_descriptor_validation() {
        let entry = EntryHeader {
            checksum: 0,
            entry_length: 2 * LOG_SECTOR_SIZE,
            tail: 0,
            seq_num: 11,
            desc_count: 1,
            guid: Uuid::new_v4(),
            flushed_file_offset: 4 * MIB,
            last_file_offset: 4 * MIB,
        };

        let aligned = Descriptor::Data {
            trailing_bytes: 0,
            leading_bytes: 0,
            file_offset: 3 * MIB,
            seq_num: 11,
        };
        assert!(aligned.is_valid(&entry));

        let misaligned = Descriptor::Data {
            trailing_bytes: 0,
            leading_bytes: 0,
            file_offset: 3 * MIB + 17,
            seq_num: 11,
        };
        assert!(!misaligned.is_valid(&entry));

        let wrong_seq = Descriptor::Zero {
            zero_length: LOG_SECTOR_SIZE as u64,
            file_offset: 3 * MIB,
            seq_num: 12,
        };
        assert!(!wrong_seq.is_valid(&entry));

        let bad_zero_len = Descriptor::Zero {
            zero_length: 100,
            file_offset: 3 * MIB,
            seq_num: 11,
        };
        assert!(!bad_zero_len.is_valid(&entry));
    }

    #[test]
    fn test_ring_wrap() {
        let log = LogSection::new(MIB, MIB as u32);
        assert_eq!(log.wrap(0), 0);
        assert_eq!(log.wrap(MIB as u32 - LOG_SECTOR_SIZE), MIB as u32 - LOG_SECTOR_SIZE);
        assert_eq!(log.wrap(MIB as u32), 0);
        assert_eq!(log.wrap(MIB as u32 + LOG_SECTOR_SIZE), LOG_SECTOR_SIZE);
    }
}
