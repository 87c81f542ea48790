// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! Read/write access to VHD (VirtualPC) disk images: fixed, dynamic and
//! differencing. All multi-byte on-disk fields are big-endian.

pub mod vhd;
mod vhd_bat;
mod vhd_footer;
mod vhd_header;

pub use vhd::{Vhd, VhdError};
pub use vhd_bat::{BatEntry, BAT_ENTRY_UNUSED};
pub use vhd_footer::{DiskGeometry, DiskType, Footer};
pub use vhd_header::{ParentLocatorEntry, SparseHeader, PLATFORM_CODE_W2KU, PLATFORM_CODE_W2RU};

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u32 = 1 << SECTOR_SHIFT;

pub const BLOCK_SHIFT: u32 = 21;
pub const BLOCK_SIZE: u32 = 1 << BLOCK_SHIFT; // 2 MiB

pub const BITMAP_SIZE: u32 = SECTOR_SIZE;
// One bit per sector, so a 512-byte bitmap covers exactly one 2 MiB block.
pub const SECTORS_PER_BITMAP: u32 = BITMAP_SIZE * 8;
