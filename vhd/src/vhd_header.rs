// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use byteorder::{BigEndian, ByteOrder};
use disk_util::checksum::ones_complement_sum;
use disk_util::utf16;
use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

pub const SPARSE_HEADER_SIZE: usize = 1024;

const HEADER_COOKIE: &[u8; 8] = b"cxsparse";
const HEADER_VERSION: u32 = 0x0001_0000;
// The sparse header's own data offset field is reserved as all-ones.
const HEADER_DATA_OFFSET: u64 = 0xFFFF_FFFF_FFFF_FFFF;

pub const PARENT_LOCATOR_COUNT: usize = 8;
const PARENT_LOCATOR_ENTRY_SIZE: usize = 24;
const PARENT_NAME_SIZE: usize = 512;

/// Parent locator platform codes of interest: relative and absolute paths,
/// both UTF-16LE on disk.
pub const PLATFORM_CODE_W2RU: [u8; 4] = *b"W2ru";
pub const PLATFORM_CODE_W2KU: [u8; 4] = *b"W2ku";
pub const PLATFORM_CODE_NONE: [u8; 4] = [0; 4];

#[sorted]
#[derive(Error, Debug)]
pub enum VhdHeaderError {
    #[error("sparse header checksum[{0:#010X}|{1:#010X}] mismatch")]
    InvalidChecksum(u32, u32),
    #[error("sparse header cookie mismatch")]
    InvalidCookie,
}

pub type Result<T> = std::result::Result<T, VhdHeaderError>;

#[derive(Clone, Copy, Debug, Default)]
pub struct ParentLocatorEntry {
    pub platform_code: [u8; 4],
    pub data_space: u32,
    pub data_length: u32,
    pub data_offset: u64,
}

impl ParentLocatorEntry {
    pub fn is_populated(&self) -> bool {
        self.platform_code != PLATFORM_CODE_NONE
    }
}

/// The 1024-byte dynamic disk header, pointed at by the footer's data
/// offset for dynamic and differencing disks.
#[derive(Clone, Debug)]
pub struct SparseHeader {
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_unique_id: Uuid,
    pub parent_timestamp: u32,
    pub parent_unicode_name: [u8; PARENT_NAME_SIZE],
    pub parent_locator_entries: [ParentLocatorEntry; PARENT_LOCATOR_COUNT],
}

impl SparseHeader {
    pub fn new(table_offset: u64, max_table_entries: u32, block_size: u32) -> SparseHeader {
        SparseHeader {
            data_offset: HEADER_DATA_OFFSET,
            table_offset,
            header_version: HEADER_VERSION,
            max_table_entries,
            block_size,
            checksum: 0,
            parent_unique_id: Uuid::nil(),
            parent_timestamp: 0,
            parent_unicode_name: [0; PARENT_NAME_SIZE],
            parent_locator_entries: [ParentLocatorEntry::default(); PARENT_LOCATOR_COUNT],
        }
    }

    /// Record the parent linkage of a differencing disk: the parent's
    /// unique ID, its footer timestamp and its basename as UTF-16BE.
    pub fn set_parent(&mut self, unique_id: Uuid, timestamp: u32, name: &str) {
        self.parent_unique_id = unique_id;
        self.parent_timestamp = timestamp;
        self.parent_unicode_name = [0; PARENT_NAME_SIZE];
        let encoded = utf16::utf8_to_utf16be(name);
        let len = encoded.len().min(PARENT_NAME_SIZE);
        self.parent_unicode_name[..len].copy_from_slice(&encoded[..len]);
    }

    pub fn parent_name(&self) -> String {
        utf16::utf16be_to_utf8(&self.parent_unicode_name)
    }

    pub fn read_from(buf: &[u8; SPARSE_HEADER_SIZE]) -> Result<SparseHeader> {
        if &buf[0..8] != HEADER_COOKIE {
            return Err(VhdHeaderError::InvalidCookie);
        }

        let stored_checksum = BigEndian::read_u32(&buf[36..40]);
        let mut scratch = *buf;
        scratch[36..40].fill(0);
        let computed = ones_complement_sum(&scratch);
        if stored_checksum != computed {
            return Err(VhdHeaderError::InvalidChecksum(stored_checksum, computed));
        }

        let mut entries = [ParentLocatorEntry::default(); PARENT_LOCATOR_COUNT];
        for (i, entry) in entries.iter_mut().enumerate() {
            let base = 576 + i * PARENT_LOCATOR_ENTRY_SIZE;
            entry.platform_code = buf[base..base + 4].try_into().unwrap();
            entry.data_space = BigEndian::read_u32(&buf[base + 4..base + 8]);
            entry.data_length = BigEndian::read_u32(&buf[base + 8..base + 12]);
            entry.data_offset = BigEndian::read_u64(&buf[base + 16..base + 24]);
        }

        Ok(SparseHeader {
            data_offset: BigEndian::read_u64(&buf[8..16]),
            table_offset: BigEndian::read_u64(&buf[16..24]),
            header_version: BigEndian::read_u32(&buf[24..28]),
            max_table_entries: BigEndian::read_u32(&buf[28..32]),
            block_size: BigEndian::read_u32(&buf[32..36]),
            checksum: stored_checksum,
            parent_unique_id: Uuid::from_bytes(buf[40..56].try_into().unwrap()),
            parent_timestamp: BigEndian::read_u32(&buf[56..60]),
            parent_unicode_name: buf[64..64 + PARENT_NAME_SIZE].try_into().unwrap(),
            parent_locator_entries: entries,
        })
    }

    /// Serialize the sparse header, recomputing its checksum.
    pub fn write_to(&mut self, buf: &mut [u8; SPARSE_HEADER_SIZE]) {
        buf.fill(0);
        buf[0..8].copy_from_slice(HEADER_COOKIE);
        BigEndian::write_u64(&mut buf[8..16], self.data_offset);
        BigEndian::write_u64(&mut buf[16..24], self.table_offset);
        BigEndian::write_u32(&mut buf[24..28], self.header_version);
        BigEndian::write_u32(&mut buf[28..32], self.max_table_entries);
        BigEndian::write_u32(&mut buf[32..36], self.block_size);
        buf[40..56].copy_from_slice(self.parent_unique_id.as_bytes());
        BigEndian::write_u32(&mut buf[56..60], self.parent_timestamp);
        buf[64..64 + PARENT_NAME_SIZE].copy_from_slice(&self.parent_unicode_name);

        for (i, entry) in self.parent_locator_entries.iter().enumerate() {
            let base = 576 + i * PARENT_LOCATOR_ENTRY_SIZE;
            buf[base..base + 4].copy_from_slice(&entry.platform_code);
            BigEndian::write_u32(&mut buf[base + 4..base + 8], entry.data_space);
            BigEndian::write_u32(&mut buf[base + 8..base + 12], entry.data_length);
            BigEndian::write_u64(&mut buf[base + 16..base + 24], entry.data_offset);
        }

        self.checksum = ones_complement_sum(buf);
        BigEndian::write_u32(&mut buf[36..40], self.checksum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut header = SparseHeader::new(1536, 16, crate::BLOCK_SIZE);
        let mut buf = [0u8; SPARSE_HEADER_SIZE];
        header.write_to(&mut buf);

        let parsed = SparseHeader::read_from(&buf).unwrap();
        assert_eq!(parsed.data_offset, HEADER_DATA_OFFSET);
        assert_eq!(parsed.table_offset, 1536);
        assert_eq!(parsed.max_table_entries, 16);
        assert_eq!(parsed.block_size, crate::BLOCK_SIZE);
        assert_eq!(parsed.checksum, header.checksum);
    }

    #[test]
    fn test_parent_fields_round_trip() {
        let parent_id = Uuid::new_v4();
        let mut header = SparseHeader::new(2560, 16, crate::BLOCK_SIZE);
        header.set_parent(parent_id, 0x1234_5678, "parent.vhd");
        header.parent_locator_entries[0] = ParentLocatorEntry {
            platform_code: PLATFORM_CODE_W2RU,
            data_space: crate::SECTOR_SIZE,
            data_length: 20,
            data_offset: 1536,
        };

        let mut buf = [0u8; SPARSE_HEADER_SIZE];
        header.write_to(&mut buf);
        let parsed = SparseHeader::read_from(&buf).unwrap();

        assert_eq!(parsed.parent_unique_id, parent_id);
        assert_eq!(parsed.parent_timestamp, 0x1234_5678);
        assert_eq!(parsed.parent_name(), "parent.vhd");
        assert!(parsed.parent_locator_entries[0].is_populated());
        assert_eq!(parsed.parent_locator_entries[0].data_offset, 1536);
        assert!(!parsed.parent_locator_entries[2].is_populated());
    }

    #[test]
    fn test_header_rejects_corruption() {
        let mut header = SparseHeader::new(1536, 16, crate::BLOCK_SIZE);
        let mut buf = [0u8; SPARSE_HEADER_SIZE];
        header.write_to(&mut buf);
        buf[30] ^= 0x01;
        assert!(matches!(
            SparseHeader::read_from(&buf),
            Err(VhdHeaderError::InvalidChecksum(..))
        ));
    }
}
