// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use byteorder::{BigEndian, ByteOrder};
use remain::sorted;
use thiserror::Error;

/// A BAT slot whose block has never been allocated.
pub const BAT_ENTRY_UNUSED: u32 = 0xFFFF_FFFF;

#[sorted]
#[derive(Error, Debug)]
pub enum VhdBatError {
    #[error("invalid BAT index")]
    InvalidBatIndex,
    #[error("failed to read BAT: {0}")]
    ReadBat(#[source] io::Error),
    #[error("failed to write BAT: {0}")]
    WriteBat(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VhdBatError>;

/// One 32-bit big-endian BAT entry: the sector number of the block's
/// bitmap, or `BAT_ENTRY_UNUSED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatEntry(pub u32);

impl BatEntry {
    /// On-disk size of the table: entries padded up to a sector boundary.
    pub fn table_bytes(max_table_entries: u32) -> u64 {
        disk_util::round_up(
            (max_table_entries as u64) * 4,
            crate::SECTOR_SIZE as u64,
        )
    }

    /// Read all BAT entries from the table at `table_offset`.
    pub fn collect_bat_entries(
        f: &File,
        table_offset: u64,
        max_table_entries: u32,
    ) -> Result<Vec<BatEntry>> {
        let mut buf = vec![0u8; (max_table_entries as usize) * 4];
        f.read_exact_at(&mut buf, table_offset)
            .map_err(VhdBatError::ReadBat)?;

        Ok(buf
            .chunks_exact(4)
            .map(|chunk| BatEntry(BigEndian::read_u32(chunk)))
            .collect())
    }

    /// Write the whole table, padding the trailing sector with unused
    /// entries the way the format expects.
    pub fn write_bat_entries(f: &File, table_offset: u64, entries: &[BatEntry]) -> Result<()> {
        let table_bytes = BatEntry::table_bytes(entries.len() as u32) as usize;
        let mut buf = vec![0xFFu8; table_bytes];
        for (i, entry) in entries.iter().enumerate() {
            BigEndian::write_u32(&mut buf[i * 4..i * 4 + 4], entry.0);
        }

        f.write_all_at(&buf, table_offset)
            .map_err(VhdBatError::WriteBat)
    }

    /// Persist a single entry in place.
    pub fn write_bat_entry(
        f: &File,
        table_offset: u64,
        index: usize,
        entry: BatEntry,
    ) -> Result<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, entry.0);
        f.write_all_at(&buf, table_offset + (index as u64) * 4)
            .map_err(VhdBatError::WriteBat)
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_table_bytes_rounds_to_sector() {
        assert_eq!(BatEntry::table_bytes(1), 512);
        assert_eq!(BatEntry::table_bytes(128), 512);
        assert_eq!(BatEntry::table_bytes(129), 1024);
    }

    #[test]
    fn test_bat_round_trip() {
        let file = TempFile::new().unwrap().into_file();
        let entries = vec![BatEntry(3), BatEntry(BAT_ENTRY_UNUSED), BatEntry(0x1000)];

        BatEntry::write_bat_entries(&file, 1536, &entries).unwrap();
        let read = BatEntry::collect_bat_entries(&file, 1536, 3).unwrap();
        assert_eq!(read, entries);

        // Padding past the entries is all ones.
        let mut pad = [0u8; 4];
        file.read_exact_at(&mut pad, 1536 + 12).unwrap();
        assert_eq!(pad, [0xFF; 4]);
    }

    #[test]
    fn test_single_entry_update() {
        let file = TempFile::new().unwrap().into_file();
        let entries = vec![BatEntry(BAT_ENTRY_UNUSED); 4];
        BatEntry::write_bat_entries(&file, 0, &entries).unwrap();

        BatEntry::write_bat_entry(&file, 0, 2, BatEntry(42)).unwrap();
        let read = BatEntry::collect_bat_entries(&file, 0, 4).unwrap();
        assert_eq!(read[2], BatEntry(42));
        assert_eq!(read[3], BatEntry(BAT_ENTRY_UNUSED));
    }
}
