// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use byteorder::{ByteOrder, LittleEndian};
use remain::sorted;
use thiserror::Error;

use crate::vhdx_header::RegionTableEntry;
use crate::vhdx_metadata::DiskSpec;

// Mask for the BAT state
pub const BAT_STATE_BIT_MASK: u64 = 0x07;
// Mask for the offset within the file in units of 1 MB
pub const BAT_FILE_OFF_MASK: u64 = 0xFFFF_FFFF_FFF0_0000;

#[sorted]
#[derive(Error, Debug)]
pub enum VhdxBatError {
    #[error("invalid BAT entry state {0}")]
    InvalidBatEntryState(u64),
    #[error("BAT index out of range")]
    InvalidBatIndex,
    #[error("invalid BAT entry count")]
    InvalidEntryCount,
    #[error("failed to read BAT entry: {0}")]
    ReadBat(#[source] io::Error),
    #[error("failed to write BAT entry: {0}")]
    WriteBat(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VhdxBatError>;

/// Payload BAT entry states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadStatus {
    NotPresent = 0,
    Undefined = 1,
    Zero = 2,
    Unmapped = 3,
    FullPresent = 6,
    PartiallyPresent = 7,
}

impl PayloadStatus {
    pub fn from_entry(entry: u64) -> Result<PayloadStatus> {
        match entry & BAT_STATE_BIT_MASK {
            0 => Ok(PayloadStatus::NotPresent),
            1 => Ok(PayloadStatus::Undefined),
            2 => Ok(PayloadStatus::Zero),
            3 => Ok(PayloadStatus::Unmapped),
            6 => Ok(PayloadStatus::FullPresent),
            7 => Ok(PayloadStatus::PartiallyPresent),
            state => Err(VhdxBatError::InvalidBatEntryState(state)),
        }
    }
}

impl fmt::Display for PayloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PayloadStatus::NotPresent => "Block not present",
            PayloadStatus::Undefined => "Block undefined",
            PayloadStatus::Zero => "Block zero",
            PayloadStatus::Unmapped => "Block unmapped",
            PayloadStatus::FullPresent => "Block full present",
            PayloadStatus::PartiallyPresent => "Block partially present",
        };
        f.write_str(s)
    }
}

/// Sector bitmap BAT entry states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitmapStatus {
    NotPresent = 0,
    Present = 6,
}

impl BitmapStatus {
    pub fn from_entry(entry: u64) -> Result<BitmapStatus> {
        match entry & BAT_STATE_BIT_MASK {
            0 => Ok(BitmapStatus::NotPresent),
            6 => Ok(BitmapStatus::Present),
            state => Err(VhdxBatError::InvalidBatEntryState(state)),
        }
    }
}

impl fmt::Display for BitmapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BitmapStatus::NotPresent => "Block not present",
            BitmapStatus::Present => "Block present",
        };
        f.write_str(s)
    }
}

/// One 64-bit BAT entry: bits 0..2 the state, bits 20..63 a 1 MiB-aligned
/// file offset.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatEntry(pub u64);

impl BatEntry {
    pub fn new_payload(status: PayloadStatus, offset: u64) -> BatEntry {
        debug_assert_eq!(offset & !BAT_FILE_OFF_MASK, 0);
        BatEntry(offset | status as u64)
    }

    pub fn new_bitmap(status: BitmapStatus, offset: u64) -> BatEntry {
        debug_assert_eq!(offset & !BAT_FILE_OFF_MASK, 0);
        BatEntry(offset | status as u64)
    }

    pub fn file_offset(&self) -> u64 {
        self.0 & BAT_FILE_OFF_MASK
    }

    pub fn payload_status(&self) -> Result<PayloadStatus> {
        PayloadStatus::from_entry(self.0)
    }

    pub fn bitmap_status(&self) -> Result<BitmapStatus> {
        BitmapStatus::from_entry(self.0)
    }

    /// Read all BAT entries present on the disk into a vector.
    pub fn collect_bat_entries(
        f: &File,
        disk_spec: &DiskSpec,
        bat_entry: &RegionTableEntry,
    ) -> Result<Vec<BatEntry>> {
        let entry_count = disk_spec.total_bat_count as usize;
        if entry_count > (bat_entry.length as usize / std::mem::size_of::<u64>()) {
            return Err(VhdxBatError::InvalidEntryCount);
        }

        let mut buf = vec![0u8; entry_count * std::mem::size_of::<u64>()];
        f.read_exact_at(&mut buf, bat_entry.file_offset)
            .map_err(VhdxBatError::ReadBat)?;

        Ok(buf
            .chunks_exact(8)
            .map(|chunk| BatEntry(LittleEndian::read_u64(chunk)))
            .collect())
    }

    /// Routine for writing the full BAT to the disk.
    pub fn write_bat_entries(f: &File, bat_offset: u64, bat_entries: &[BatEntry]) -> Result<()> {
        let mut buf = vec![0u8; bat_entries.len() * std::mem::size_of::<u64>()];
        for (i, entry) in bat_entries.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[i * 8..i * 8 + 8], entry.0);
        }

        f.write_all_at(&buf, bat_offset)
            .map_err(VhdxBatError::WriteBat)
    }

    /// Byte offset of entry `index` within the BAT region.
    pub fn entry_offset(bat_region_offset: u64, index: usize) -> u64 {
        bat_region_offset + (index as u64) * std::mem::size_of::<u64>() as u64
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_encoding() {
        let entry = BatEntry::new_payload(PayloadStatus::FullPresent, 4 << 20);
        assert_eq!(entry.0, (4 << 20) | 6);
        assert_eq!(entry.file_offset(), 4 << 20);
        assert_eq!(entry.payload_status().unwrap(), PayloadStatus::FullPresent);

        let bitmap = BatEntry::new_bitmap(BitmapStatus::Present, 7 << 20);
        assert_eq!(bitmap.bitmap_status().unwrap(), BitmapStatus::Present);
        assert_eq!(bitmap.file_offset(), 7 << 20);
    }

    #[test]
    fn test_invalid_states() {
        assert!(BatEntry(4).payload_status().is_err());
        assert!(BatEntry(5).payload_status().is_err());
        assert!(BatEntry(7).bitmap_status().is_err());
        assert_eq!(
            BatEntry(0).payload_status().unwrap(),
            PayloadStatus::NotPresent
        );
    }

    #[test]
    fn test_entry_offset() {
        assert_eq!(BatEntry::entry_offset(3 << 20, 0), 3 << 20);
        assert_eq!(BatEntry::entry_offset(3 << 20, 5), (3 << 20) + 40);
    }
}
