// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use disk_util::checksum::ones_complement_sum;
use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

pub const FOOTER_SIZE: usize = 512;

const FOOTER_COOKIE: &[u8; 8] = b"conectix";
const FOOTER_FEATURES: u32 = 0x0000_0002;
const FILE_FORMAT_VERSION: u32 = 0x0001_0000;
const CREATOR_APP: &[u8; 4] = b"vdsk";
const CREATOR_VERSION: u32 = 0x0000_0001;
const CREATOR_HOST_OS: &[u8; 4] = b"WORL";

/// Fixed disks carry no sparse header, flagged by an all-ones data offset.
pub const FIXED_DATA_OFFSET: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Seconds from the Unix epoch to the VHD epoch, 2000-01-01 00:00:00 UTC.
pub const VHD_EPOCH_START: u64 = 946_684_800;

#[sorted]
#[derive(Error, Debug)]
pub enum VhdFooterError {
    #[error("footer checksum[{0:#010X}|{1:#010X}] mismatch")]
    InvalidChecksum(u32, u32),
    #[error("footer cookie mismatch")]
    InvalidCookie,
    #[error("unknown disk type {0}")]
    UnknownDiskType(u32),
}

pub type Result<T> = std::result::Result<T, VhdFooterError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskType {
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
}

impl DiskType {
    fn from_u32(value: u32) -> Result<DiskType> {
        match value {
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Differencing),
            other => Err(VhdFooterError::UnknownDiskType(other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::Fixed => "Fixed",
            DiskType::Dynamic => "Dynamic",
            DiskType::Differencing => "Differencing",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl DiskGeometry {
    /// The classical CHS derivation used by the format: cap at
    /// 65535x16x255, then try 17, 31 and 63 sectors per track before
    /// forcing 255.
    pub fn from_total_sectors(total_sectors: u64) -> DiskGeometry {
        let total_sectors = total_sectors.min(65535 * 16 * 255);

        let sectors_per_track;
        let heads;
        let cylinder_times_heads;

        if total_sectors >= 65535 * 16 * 63 {
            sectors_per_track = 255u8;
            heads = 16u8;
            cylinder_times_heads = total_sectors / sectors_per_track as u64;
        } else {
            let mut spt = 17u8;
            let mut cth = total_sectors / spt as u64;
            let mut h = ((cth + 1023) / 1024).clamp(4, u8::MAX as u64) as u8;

            if cth >= (h as u64) * 1024 || h > 16 {
                spt = 31;
                h = 16;
                cth = total_sectors / spt as u64;
            }
            if cth >= (h as u64) * 1024 {
                spt = 63;
                h = 16;
                cth = total_sectors / spt as u64;
            }

            sectors_per_track = spt;
            heads = h;
            cylinder_times_heads = cth;
        }

        DiskGeometry {
            cylinders: (cylinder_times_heads / heads as u64) as u16,
            heads,
            sectors_per_track,
        }
    }
}

/// The 512-byte hard disk footer, stored at the end of every image and
/// mirrored at offset 0 for dynamic and differencing disks.
#[derive(Clone, Debug)]
pub struct Footer {
    pub features: u32,
    pub file_format_version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_host_os: [u8; 4],
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: DiskGeometry,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub unique_id: Uuid,
    pub saved_state: u8,
}

impl Footer {
    pub fn new(disk_type: DiskType, size: u64, data_offset: u64) -> Footer {
        Footer {
            features: FOOTER_FEATURES,
            file_format_version: FILE_FORMAT_VERSION,
            data_offset,
            timestamp: timestamp_now(),
            creator_app: *CREATOR_APP,
            creator_version: CREATOR_VERSION,
            creator_host_os: *CREATOR_HOST_OS,
            original_size: size,
            current_size: size,
            geometry: DiskGeometry::from_total_sectors(size >> crate::SECTOR_SHIFT),
            disk_type,
            checksum: 0,
            unique_id: Uuid::new_v4(),
            saved_state: 0,
        }
    }

    pub fn read_from(buf: &[u8; FOOTER_SIZE]) -> Result<Footer> {
        if &buf[0..8] != FOOTER_COOKIE {
            return Err(VhdFooterError::InvalidCookie);
        }

        let stored_checksum = BigEndian::read_u32(&buf[64..68]);
        let mut scratch = *buf;
        scratch[64..68].fill(0);
        let computed = ones_complement_sum(&scratch);
        if stored_checksum != computed {
            return Err(VhdFooterError::InvalidChecksum(stored_checksum, computed));
        }

        Ok(Footer {
            features: BigEndian::read_u32(&buf[8..12]),
            file_format_version: BigEndian::read_u32(&buf[12..16]),
            data_offset: BigEndian::read_u64(&buf[16..24]),
            timestamp: BigEndian::read_u32(&buf[24..28]),
            creator_app: buf[28..32].try_into().unwrap(),
            creator_version: BigEndian::read_u32(&buf[32..36]),
            creator_host_os: buf[36..40].try_into().unwrap(),
            original_size: BigEndian::read_u64(&buf[40..48]),
            current_size: BigEndian::read_u64(&buf[48..56]),
            geometry: DiskGeometry {
                cylinders: BigEndian::read_u16(&buf[56..58]),
                heads: buf[58],
                sectors_per_track: buf[59],
            },
            disk_type: DiskType::from_u32(BigEndian::read_u32(&buf[60..64]))?,
            checksum: stored_checksum,
            unique_id: Uuid::from_bytes(buf[68..84].try_into().unwrap()),
            saved_state: buf[84],
        })
    }

    /// Serialize the footer, recomputing its checksum.
    pub fn write_to(&mut self, buf: &mut [u8; FOOTER_SIZE]) {
        buf.fill(0);
        buf[0..8].copy_from_slice(FOOTER_COOKIE);
        BigEndian::write_u32(&mut buf[8..12], self.features);
        BigEndian::write_u32(&mut buf[12..16], self.file_format_version);
        BigEndian::write_u64(&mut buf[16..24], self.data_offset);
        BigEndian::write_u32(&mut buf[24..28], self.timestamp);
        buf[28..32].copy_from_slice(&self.creator_app);
        BigEndian::write_u32(&mut buf[32..36], self.creator_version);
        buf[36..40].copy_from_slice(&self.creator_host_os);
        BigEndian::write_u64(&mut buf[40..48], self.original_size);
        BigEndian::write_u64(&mut buf[48..56], self.current_size);
        BigEndian::write_u16(&mut buf[56..58], self.geometry.cylinders);
        buf[58] = self.geometry.heads;
        buf[59] = self.geometry.sectors_per_track;
        BigEndian::write_u32(&mut buf[60..64], self.disk_type as u32);
        buf[68..84].copy_from_slice(self.unique_id.as_bytes());
        buf[84] = self.saved_state;

        self.checksum = ones_complement_sum(buf);
        BigEndian::write_u32(&mut buf[64..68], self.checksum);
    }
}

fn timestamp_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().saturating_sub(VHD_EPOCH_START))
        .unwrap_or(0) as u32
}
