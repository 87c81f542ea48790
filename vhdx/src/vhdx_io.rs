// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use crate::vhdx_bat::BatEntry;
use crate::vhdx_metadata::DiskSpec;

/// Logical sectors covered by one 1 MiB sector bitmap: 8 * 1 MiB bits.
pub const SECTORS_PER_BITMAP: u64 = 8 * (1 << 20);

const BIT_MASK: u8 = 0x80;

// Sector bitmaps address sectors MSB first: bit 7 of byte i is sector 8*i.
pub fn test_bit(buf: &[u8], nr: usize) -> bool {
    (buf[nr >> 3] << (nr & 7)) & BIT_MASK != 0
}

pub fn set_bit(buf: &mut [u8], nr: usize) {
    buf[nr >> 3] |= BIT_MASK >> (nr & 7);
}

/// The byte range of a sector bitmap needed to cover `nb_sectors` sectors
/// starting at `sector`: (byte offset into the bitmap region, index of the
/// first sector's bit within that first byte, bytes needed).
pub fn bitmap_byte_range(sector: u64, nb_sectors: u32) -> (u64, usize, usize) {
    let bit_index = sector % SECTORS_PER_BITMAP;
    let byte_index = bit_index / 8;
    let first_bit = (bit_index % 8) as usize;
    let bytes = div_round_up!(first_bit + nb_sectors as usize, 8);
    (byte_index, first_bit, bytes)
}

/// Per-cycle translation of (sector, count) into BAT indices and file
/// offsets; each cycle covers at most one payload block.
#[derive(Default, Debug)]
pub struct SectorInfo {
    /// BAT entry index, after stepping over interleaved bitmap entries.
    pub bat_idx: usize,
    /// Sectors that can be served from this payload block.
    pub sectors_avail: u32,
    /// `sectors_avail` in bytes.
    pub bytes_avail: usize,
    /// Absolute byte offset of the data in the file; 0 when no payload.
    pub file_offset: u64,
    /// Byte offset of the data inside the payload block.
    pub block_offset: u64,
    /// BAT index of the sector bitmap entry covering this block.
    pub bitmap_idx: usize,
}

impl SectorInfo {
    /// Translate a sector index and count into offsets and BAT indices.
    pub fn new(disk_spec: &DiskSpec, bat: &[BatEntry], sector: u64, nb_sectors: u32) -> SectorInfo {
        let mut si = SectorInfo::default();

        let mut bat_idx = sector >> disk_spec.sectors_per_block_bits;
        // Effectively a modulo: the offset into the block, in sectors.
        let block_offset = (sector - (bat_idx << disk_spec.sectors_per_block_bits)) as u32;

        // The chunk ratio gives the interleaving of the sector bitmaps, so
        // the payload index advances by one for every chunk of payload
        // entries already passed.
        bat_idx += bat_idx >> disk_spec.chunk_ratio_bits;
        si.bat_idx = bat_idx as usize;

        si.sectors_avail = (disk_spec.sectors_per_block - block_offset).min(nb_sectors);
        si.bytes_avail = (si.sectors_avail as usize) << disk_spec.logical_sector_size_bits;
        si.block_offset = (block_offset as u64) << disk_spec.logical_sector_size_bits;

        let bat_idx_in_chunk = bat_idx >> disk_spec.chunk_ratio_bits;
        si.bitmap_idx =
            (((bat_idx_in_chunk + 1) << disk_spec.chunk_ratio_bits) + bat_idx_in_chunk) as usize;

        si.file_offset = bat
            .get(si.bat_idx)
            .map(|entry| entry.file_offset())
            .unwrap_or(0);
        // The payload must live past the header section, so 0 means "no
        // payload allocated".
        if si.file_offset != 0 {
            si.file_offset += si.block_offset;
        }

        si
    }
}
