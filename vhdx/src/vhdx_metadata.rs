// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use byteorder::{ByteOrder, LittleEndian};
use disk_util::{guid, utf16, GIB, MIB, TIB};
use log::warn;
use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

use crate::vhdx_header::RegionTableEntry;

const METADATA_SIGNATURE: &[u8; 8] = b"metadata";
const METADATA_TABLE_HEADER_SIZE: usize = 32;
const METADATA_ENTRY_SIZE: usize = 32;
const METADATA_MAX_ENTRIES: u16 = 2047;
const METADATA_LENGTH_MAX: u32 = 1 << 20; // 1 MiB

// Metadata values live one 64 KiB block past the table header.
pub const METADATA_VALUE_OFFSET: u32 = 64 * 1024;

const METADATA_FLAGS_IS_VIRTUAL_DISK: u32 = 0x02;
const METADATA_FLAGS_IS_REQUIRED: u32 = 0x04;

pub const BLOCK_SIZE_MIN: u32 = 1 << 20; // 1 MiB
const BLOCK_SIZE_MAX: u32 = 256 << 20; // 256 MiB
const MAX_SECTORS_PER_BLOCK: u64 = 1 << 23;

const FILE_PARAM_LEAVE_BLOCK_ALLOCATED: u32 = 0x01;
const FILE_PARAM_HAS_PARENT: u32 = 0x02;

const DEFAULT_LOGICAL_SECTOR_SIZE: u32 = 512;
const DEFAULT_PHYSICAL_SECTOR_SIZE: u32 = 4096;

// GUIDs for known metadata items
const METADATA_FILE_PARAMETER: &str = "CAA16737-FA36-4D43-B3B6-33F0AA44E76B";
const METADATA_VIRTUAL_DISK_SIZE: &str = "2FA54224-CD1B-4876-B211-5DBED83BF4B8";
const METADATA_VIRTUAL_DISK_ID: &str = "BECA12AB-B2E6-4523-93EF-C309E000C746";
const METADATA_LOGICAL_SECTOR_SIZE: &str = "8141BF1D-A96F-4709-BA47-F233A8FAAB5F";
const METADATA_PHYSICAL_SECTOR_SIZE: &str = "CDA348C7-445D-4471-9CC9-E9885251C556";
const METADATA_PARENT_LOCATOR: &str = "A8D35F2D-B30B-454D-ABF7-D3D84834AB0C";

const LOCATOR_TYPE_GUID: &str = "B04AEFB7-D19E-4A81-B789-25B8E9445913";
const LOCATOR_HEADER_SIZE: usize = 20;
const LOCATOR_ENTRY_SIZE: usize = 12;

pub const KEY_PARENT_LINKAGE: &str = "parent_linkage";
pub const KEY_PARENT_LINKAGE2: &str = "parent_linkage2";
pub const KEY_RELATIVE_PATH: &str = "relative_path";
pub const KEY_VOLUME_PATH: &str = "volume_path";
pub const KEY_ABSOLUTE_WIN32_PATH: &str = "absolute_win32_path";

const METADATA_FILE_PARAMETER_PRESENT: u16 = 0x01;
const METADATA_VIRTUAL_DISK_SIZE_PRESENT: u16 = 0x02;
const METADATA_VIRTUAL_DISK_ID_PRESENT: u16 = 0x04;
const METADATA_LOGICAL_SECTOR_SIZE_PRESENT: u16 = 0x08;
const METADATA_PHYSICAL_SECTOR_SIZE_PRESENT: u16 = 0x10;
const METADATA_PARENT_LOCATOR_PRESENT: u16 = 0x20;

const METADATA_ALL_PRESENT: u16 = METADATA_FILE_PARAMETER_PRESENT
    | METADATA_VIRTUAL_DISK_SIZE_PRESENT
    | METADATA_VIRTUAL_DISK_ID_PRESENT
    | METADATA_LOGICAL_SECTOR_SIZE_PRESENT
    | METADATA_PHYSICAL_SECTOR_SIZE_PRESENT;

#[sorted]
#[derive(Error, Debug)]
pub enum VhdxMetadataError {
    #[error("invalid block size")]
    InvalidBlockSize,
    #[error("invalid metadata entry count")]
    InvalidEntryCount,
    #[error("invalid logical sector size")]
    InvalidLogicalSectorSize,
    #[error("invalid metadata ID")]
    InvalidMetadataItem,
    #[error("invalid metadata length")]
    InvalidMetadataLength,
    #[error("metadata signature doesn't match")]
    InvalidMetadataSign,
    #[error("invalid parent locator")]
    InvalidParentLocator,
    #[error("invalid physical sector size")]
    InvalidPhysicalSectorSize,
    #[error("invalid UUID: {0}")]
    InvalidUuid(#[source] uuid::Error),
    #[error("invalid value")]
    InvalidValue,
    #[error("not all required metadata found")]
    MissingMetadata,
    #[error("differencing disk carries no parent locator")]
    MissingParentLocator,
    #[error("failed to read metadata: {0}")]
    ReadMetadata(#[source] io::Error),
    #[error("reserved region has non-zero value")]
    ReservedIsNonZero,
    #[error("this implementation doesn't support this metadata flag")]
    UnsupportedFlag,
    #[error("failed to write metadata: {0}")]
    WriteMetadata(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VhdxMetadataError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskType {
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::Fixed => "Fixed",
            DiskType::Dynamic => "Dynamic",
            DiskType::Differencing => "Differencing",
        }
    }
}

/// The parent locator metadata item: an ordered list of key/value string
/// pairs, UTF-16LE on disk, offsets relative to the locator header.
#[derive(Clone, Debug, Default)]
pub struct ParentLocator {
    pub entries: Vec<(String, String)>,
}

impl ParentLocator {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, key: &str, value: String) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    fn parse(buf: &[u8]) -> Result<ParentLocator> {
        if buf.len() < LOCATOR_HEADER_SIZE {
            return Err(VhdxMetadataError::InvalidParentLocator);
        }

        let locator_type = guid::from_le_bytes(buf[0..16].try_into().unwrap());
        if locator_type
            != Uuid::parse_str(LOCATOR_TYPE_GUID).map_err(VhdxMetadataError::InvalidUuid)?
        {
            return Err(VhdxMetadataError::InvalidParentLocator);
        }

        let count = LittleEndian::read_u16(&buf[18..20]) as usize;
        if buf.len() < LOCATOR_HEADER_SIZE + count * LOCATOR_ENTRY_SIZE {
            return Err(VhdxMetadataError::InvalidParentLocator);
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let base = LOCATOR_HEADER_SIZE + i * LOCATOR_ENTRY_SIZE;
            let key_offset = LittleEndian::read_u32(&buf[base..base + 4]) as usize;
            let value_offset = LittleEndian::read_u32(&buf[base + 4..base + 8]) as usize;
            let key_length = LittleEndian::read_u16(&buf[base + 8..base + 10]) as usize;
            let value_length = LittleEndian::read_u16(&buf[base + 10..base + 12]) as usize;

            if key_offset + key_length > buf.len() || value_offset + value_length > buf.len() {
                return Err(VhdxMetadataError::InvalidParentLocator);
            }

            let key = utf16::utf16le_to_utf8(&buf[key_offset..key_offset + key_length]);
            let value = utf16::utf16le_to_utf8(&buf[value_offset..value_offset + value_length]);
            entries.push((key, value));
        }

        Ok(ParentLocator { entries })
    }

    /// Serialize the locator: header, entry table, then the concatenated
    /// UTF-16LE key/value pairs.
    fn value_bytes(&self) -> Vec<u8> {
        let populated: Vec<(&String, &String)> = self
            .entries
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k, v))
            .collect();

        let table_size = LOCATOR_HEADER_SIZE + populated.len() * LOCATOR_ENTRY_SIZE;
        let mut kv_buf = Vec::new();
        let mut buf = vec![0u8; table_size];

        buf[0..16].copy_from_slice(&guid::to_le_bytes(
            &Uuid::parse_str(LOCATOR_TYPE_GUID).unwrap(),
        ));
        LittleEndian::write_u16(&mut buf[18..20], populated.len() as u16);

        let mut kv_offset = table_size;
        for (i, (key, value)) in populated.iter().enumerate() {
            let key_bytes = utf16::utf8_to_utf16le(key);
            let value_bytes = utf16::utf8_to_utf16le(value);
            let base = LOCATOR_HEADER_SIZE + i * LOCATOR_ENTRY_SIZE;

            LittleEndian::write_u32(&mut buf[base..base + 4], kv_offset as u32);
            LittleEndian::write_u32(
                &mut buf[base + 4..base + 8],
                (kv_offset + key_bytes.len()) as u32,
            );
            LittleEndian::write_u16(&mut buf[base + 8..base + 10], key_bytes.len() as u16);
            LittleEndian::write_u16(&mut buf[base + 10..base + 12], value_bytes.len() as u16);

            kv_offset += key_bytes.len() + value_bytes.len();
            kv_buf.extend_from_slice(&key_bytes);
            kv_buf.extend_from_slice(&value_bytes);
        }

        buf.extend_from_slice(&kv_buf);
        buf
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct TableEntry {
    pub item_id: Uuid,
    pub offset: u32,
    pub length: u32,
    pub flags: u32,
}

/// Everything the metadata region describes about the disk, plus the
/// derived BAT geometry.
#[derive(Clone, Debug)]
pub struct DiskSpec {
    pub disk_id: Uuid,
    pub disk_type: DiskType,
    pub virtual_disk_size: u64,
    pub block_size: u32,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    pub parent_locator: Option<ParentLocator>,
    pub chunk_ratio: u32,
    pub data_block_count: u32,
    pub bitmap_block_count: u32,
    pub total_bat_count: u32,
    pub sectors_per_block: u32,
    pub block_size_bits: u32,
    pub logical_sector_size_bits: u32,
    pub chunk_ratio_bits: u32,
    pub sectors_per_block_bits: u32,
    pub(crate) table_entries: Vec<TableEntry>,
}

impl DiskSpec {
    /// Parse all metadata from the file's metadata region.
    pub fn parse(f: &File, metadata_region: &RegionTableEntry) -> Result<DiskSpec> {
        let metadata_offset = metadata_region.file_offset;

        let mut header_buf = [0u8; METADATA_TABLE_HEADER_SIZE];
        f.read_exact_at(&mut header_buf, metadata_offset)
            .map_err(VhdxMetadataError::ReadMetadata)?;

        if &header_buf[0..8] != METADATA_SIGNATURE {
            return Err(VhdxMetadataError::InvalidMetadataSign);
        }
        if LittleEndian::read_u16(&header_buf[8..10]) != 0 {
            return Err(VhdxMetadataError::ReservedIsNonZero);
        }
        let entry_count = LittleEndian::read_u16(&header_buf[10..12]);
        if entry_count > METADATA_MAX_ENTRIES {
            return Err(VhdxMetadataError::InvalidEntryCount);
        }

        let mut entries_buf = vec![0u8; entry_count as usize * METADATA_ENTRY_SIZE];
        f.read_exact_at(
            &mut entries_buf,
            metadata_offset + METADATA_TABLE_HEADER_SIZE as u64,
        )
        .map_err(VhdxMetadataError::ReadMetadata)?;

        let mut spec = DiskSpec {
            disk_id: Uuid::nil(),
            disk_type: DiskType::Dynamic,
            virtual_disk_size: 0,
            block_size: 0,
            logical_sector_size: 0,
            physical_sector_size: 0,
            parent_locator: None,
            chunk_ratio: 0,
            data_block_count: 0,
            bitmap_block_count: 0,
            total_bat_count: 0,
            sectors_per_block: 0,
            block_size_bits: 0,
            logical_sector_size_bits: 0,
            chunk_ratio_bits: 0,
            sectors_per_block_bits: 0,
            table_entries: Vec::with_capacity(entry_count as usize),
        };

        let mut has_parent = false;
        let mut metadata_presence: u16 = 0;

        for i in 0..entry_count as usize {
            let base = i * METADATA_ENTRY_SIZE;
            let entry = TableEntry {
                item_id: guid::from_le_bytes(entries_buf[base..base + 16].try_into().unwrap()),
                offset: LittleEndian::read_u32(&entries_buf[base + 16..base + 20]),
                length: LittleEndian::read_u32(&entries_buf[base + 20..base + 24]),
                flags: LittleEndian::read_u32(&entries_buf[base + 24..base + 28]),
            };

            if entry.length > METADATA_LENGTH_MAX {
                return Err(VhdxMetadataError::InvalidMetadataLength);
            }
            if entry.length == 0 && entry.offset != 0 {
                return Err(VhdxMetadataError::InvalidMetadataLength);
            }
            if LittleEndian::read_u32(&entries_buf[base + 28..base + 32]) != 0 {
                return Err(VhdxMetadataError::ReservedIsNonZero);
            }

            let mut value = vec![0u8; entry.length as usize];
            f.read_exact_at(&mut value, metadata_offset + entry.offset as u64)
                .map_err(VhdxMetadataError::ReadMetadata)?;

            if entry.item_id == parse_guid(METADATA_FILE_PARAMETER)? {
                spec.block_size = LittleEndian::read_u32(&value[0..4]);

                // MUST be at least 1 MiB, not greater than 256 MiB, and a
                // power of two.
                if spec.block_size < BLOCK_SIZE_MIN || spec.block_size > BLOCK_SIZE_MAX {
                    return Err(VhdxMetadataError::InvalidBlockSize);
                }
                if !spec.block_size.is_power_of_two() {
                    return Err(VhdxMetadataError::InvalidBlockSize);
                }

                let bits = LittleEndian::read_u32(&value[4..8]);
                if bits & FILE_PARAM_LEAVE_BLOCK_ALLOCATED != 0 {
                    spec.disk_type = DiskType::Fixed;
                } else if bits & FILE_PARAM_HAS_PARENT != 0 {
                    spec.disk_type = DiskType::Differencing;
                    has_parent = true;
                } else {
                    spec.disk_type = DiskType::Dynamic;
                }

                metadata_presence |= METADATA_FILE_PARAMETER_PRESENT;
            } else if entry.item_id == parse_guid(METADATA_VIRTUAL_DISK_SIZE)? {
                spec.virtual_disk_size = LittleEndian::read_u64(&value[0..8]);
                metadata_presence |= METADATA_VIRTUAL_DISK_SIZE_PRESENT;
            } else if entry.item_id == parse_guid(METADATA_VIRTUAL_DISK_ID)? {
                spec.disk_id = guid::from_le_bytes(value[0..16].try_into().unwrap());
                metadata_presence |= METADATA_VIRTUAL_DISK_ID_PRESENT;
            } else if entry.item_id == parse_guid(METADATA_LOGICAL_SECTOR_SIZE)? {
                spec.logical_sector_size = LittleEndian::read_u32(&value[0..4]);
                if !(spec.logical_sector_size == 512 || spec.logical_sector_size == 4096) {
                    return Err(VhdxMetadataError::InvalidLogicalSectorSize);
                }
                metadata_presence |= METADATA_LOGICAL_SECTOR_SIZE_PRESENT;
            } else if entry.item_id == parse_guid(METADATA_PHYSICAL_SECTOR_SIZE)? {
                spec.physical_sector_size = LittleEndian::read_u32(&value[0..4]);
                if !(spec.physical_sector_size == 512 || spec.physical_sector_size == 4096) {
                    return Err(VhdxMetadataError::InvalidPhysicalSectorSize);
                }
                metadata_presence |= METADATA_PHYSICAL_SECTOR_SIZE_PRESENT;
            } else if entry.item_id == parse_guid(METADATA_PARENT_LOCATOR)? {
                let locator = ParentLocator::parse(&value)?;
                warn_unknown_locator_keys(&locator);
                spec.parent_locator = Some(locator);
                metadata_presence |= METADATA_PARENT_LOCATOR_PRESENT;
            } else {
                return Err(VhdxMetadataError::InvalidMetadataItem);
            }

            if (entry.flags & METADATA_FLAGS_IS_REQUIRED) == 0 {
                return Err(VhdxMetadataError::UnsupportedFlag);
            }

            spec.table_entries.push(entry);
        }

        if metadata_presence & METADATA_ALL_PRESENT != METADATA_ALL_PRESENT {
            return Err(VhdxMetadataError::MissingMetadata);
        }
        if has_parent && (metadata_presence & METADATA_PARENT_LOCATOR_PRESENT) == 0 {
            return Err(VhdxMetadataError::MissingParentLocator);
        }
        if spec.virtual_disk_size % spec.logical_sector_size as u64 != 0 {
            return Err(VhdxMetadataError::InvalidBlockSize);
        }

        spec.calc_bat_info()?;
        Ok(spec)
    }

    /// Build the spec for a disk about to be created. Zero `block_size`,
    /// `logical_sector_size` or `physical_sector_size` select the
    /// defaults; the block size default scales with the disk size to keep
    /// the BAT reasonable to load into RAM.
    pub fn new_for_create(
        disk_type: DiskType,
        virtual_disk_size: u64,
        block_size: u32,
        logical_sector_size: u32,
        physical_sector_size: u32,
    ) -> Result<DiskSpec> {
        let block_size = if block_size != 0 {
            block_size
        } else if virtual_disk_size > 32 * TIB {
            64 * MIB as u32
        } else if virtual_disk_size > 100 * GIB {
            32 * MIB as u32
        } else if virtual_disk_size > GIB {
            16 * MIB as u32
        } else {
            8 * MIB as u32
        };

        let mut spec = DiskSpec {
            disk_id: Uuid::new_v4(),
            disk_type,
            virtual_disk_size,
            block_size,
            logical_sector_size: if logical_sector_size != 0 {
                logical_sector_size
            } else {
                DEFAULT_LOGICAL_SECTOR_SIZE
            },
            physical_sector_size: if physical_sector_size != 0 {
                physical_sector_size
            } else {
                DEFAULT_PHYSICAL_SECTOR_SIZE
            },
            parent_locator: None,
            chunk_ratio: 0,
            data_block_count: 0,
            bitmap_block_count: 0,
            total_bat_count: 0,
            sectors_per_block: 0,
            block_size_bits: 0,
            logical_sector_size_bits: 0,
            chunk_ratio_bits: 0,
            sectors_per_block_bits: 0,
            table_entries: Vec::new(),
        };

        spec.calc_bat_info()?;
        Ok(spec)
    }

    fn calc_bat_info(&mut self) -> Result<()> {
        let chunk_ratio =
            MAX_SECTORS_PER_BLOCK * self.logical_sector_size as u64 / self.block_size as u64;
        if !chunk_ratio.is_power_of_two() {
            return Err(VhdxMetadataError::InvalidValue);
        }
        self.chunk_ratio = chunk_ratio as u32;

        self.data_block_count =
            div_round_up!(self.virtual_disk_size, self.block_size as u64) as u32;
        if self.data_block_count == 0 {
            return Err(VhdxMetadataError::InvalidValue);
        }
        self.bitmap_block_count =
            div_round_up!(self.data_block_count, self.chunk_ratio);

        self.total_bat_count = if self.disk_type == DiskType::Differencing {
            self.bitmap_block_count * (self.chunk_ratio + 1)
        } else {
            self.data_block_count + (self.data_block_count - 1) / self.chunk_ratio
        };

        self.sectors_per_block = self.block_size / self.logical_sector_size;
        if !self.sectors_per_block.is_power_of_two() {
            return Err(VhdxMetadataError::InvalidValue);
        }

        self.block_size_bits = self.block_size.trailing_zeros();
        self.logical_sector_size_bits = self.logical_sector_size.trailing_zeros();
        self.chunk_ratio_bits = self.chunk_ratio.trailing_zeros();
        self.sectors_per_block_bits = self.sectors_per_block.trailing_zeros();

        Ok(())
    }

    pub fn total_sectors(&self) -> u64 {
        self.virtual_disk_size / self.logical_sector_size as u64
    }

    pub fn total_bat_size_bytes(&self) -> u64 {
        self.total_bat_count as u64 * 8
    }

    /// Bytes the BAT region occupies on disk, rounded up to 1 MiB.
    pub fn bat_occupy_bytes(&self) -> u64 {
        disk_util::round_up(self.total_bat_size_bytes(), MIB)
    }

    pub fn parent_linkage(&self) -> Option<&str> {
        self.locator_value(KEY_PARENT_LINKAGE)
    }

    pub fn parent_linkage2(&self) -> Option<&str> {
        self.locator_value(KEY_PARENT_LINKAGE2)
    }

    pub fn parent_relative_path(&self) -> Option<&str> {
        self.locator_value(KEY_RELATIVE_PATH)
    }

    pub fn parent_volume_path(&self) -> Option<&str> {
        self.locator_value(KEY_VOLUME_PATH)
    }

    pub fn parent_absolute_win32_path(&self) -> Option<&str> {
        self.locator_value(KEY_ABSOLUTE_WIN32_PATH)
    }

    fn locator_value(&self, key: &str) -> Option<&str> {
        self.parent_locator.as_ref().and_then(|pl| pl.get(key))
    }

    /// Build the parent locator for a new differencing disk. The linkage
    /// records the parent's data-write GUID; the second linkage is the
    /// braced nil GUID.
    pub fn init_parent_locator(
        &mut self,
        parent_data_write_guid: &Uuid,
        absolute_path: &str,
        relative_path: &str,
    ) {
        let mut locator = ParentLocator::default();
        locator.set(
            KEY_PARENT_LINKAGE,
            guid::to_braced_string(parent_data_write_guid),
        );
        locator.set(KEY_ABSOLUTE_WIN32_PATH, absolute_path.to_string());
        locator.set(KEY_RELATIVE_PATH, relative_path.to_string());
        locator.set(KEY_PARENT_LINKAGE2, guid::to_braced_string(&Uuid::nil()));

        self.parent_locator = Some(locator);
    }

    /// Write the metadata table and all values of a freshly created file.
    pub fn write_content(&mut self, f: &File, metadata_offset: u64) -> Result<()> {
        let locator_bytes = self.parent_locator.as_ref().map(|pl| pl.value_bytes());

        self.table_entries.clear();
        let mut value_offset = METADATA_VALUE_OFFSET;
        let mut push = |entries: &mut Vec<TableEntry>, guid_str: &str, length: u32, flags: u32| {
            entries.push(TableEntry {
                item_id: Uuid::parse_str(guid_str).unwrap(),
                offset: value_offset,
                length,
                flags,
            });
            value_offset += length;
        };

        let vd_flags = METADATA_FLAGS_IS_VIRTUAL_DISK | METADATA_FLAGS_IS_REQUIRED;
        push(
            &mut self.table_entries,
            METADATA_FILE_PARAMETER,
            8,
            METADATA_FLAGS_IS_REQUIRED,
        );
        push(&mut self.table_entries, METADATA_VIRTUAL_DISK_SIZE, 8, vd_flags);
        push(&mut self.table_entries, METADATA_VIRTUAL_DISK_ID, 16, vd_flags);
        push(&mut self.table_entries, METADATA_LOGICAL_SECTOR_SIZE, 4, vd_flags);
        push(&mut self.table_entries, METADATA_PHYSICAL_SECTOR_SIZE, 4, vd_flags);
        if let Some(bytes) = &locator_bytes {
            push(
                &mut self.table_entries,
                METADATA_PARENT_LOCATOR,
                bytes.len() as u32,
                METADATA_FLAGS_IS_REQUIRED,
            );
        }

        // Table header and entries.
        let mut table_buf =
            vec![0u8; METADATA_TABLE_HEADER_SIZE + self.table_entries.len() * METADATA_ENTRY_SIZE];
        table_buf[0..8].copy_from_slice(METADATA_SIGNATURE);
        LittleEndian::write_u16(&mut table_buf[10..12], self.table_entries.len() as u16);
        for (i, entry) in self.table_entries.iter().enumerate() {
            let base = METADATA_TABLE_HEADER_SIZE + i * METADATA_ENTRY_SIZE;
            write_table_entry(&mut table_buf[base..base + METADATA_ENTRY_SIZE], entry);
        }
        f.write_all_at(&table_buf, metadata_offset)
            .map_err(VhdxMetadataError::WriteMetadata)?;

        // Fixed-size values, back to back past the 64 KiB mark.
        let mut value_buf = vec![0u8; 8 + 8 + 16 + 4 + 4];
        LittleEndian::write_u32(&mut value_buf[0..4], self.block_size);
        let file_param_flags = match self.disk_type {
            DiskType::Fixed => FILE_PARAM_LEAVE_BLOCK_ALLOCATED,
            DiskType::Differencing => FILE_PARAM_HAS_PARENT,
            DiskType::Dynamic => 0,
        };
        LittleEndian::write_u32(&mut value_buf[4..8], file_param_flags);
        LittleEndian::write_u64(&mut value_buf[8..16], self.virtual_disk_size);
        value_buf[16..32].copy_from_slice(&guid::to_le_bytes(&self.disk_id));
        LittleEndian::write_u32(&mut value_buf[32..36], self.logical_sector_size);
        LittleEndian::write_u32(&mut value_buf[36..40], self.physical_sector_size);

        if let Some(bytes) = &locator_bytes {
            value_buf.extend_from_slice(bytes);
        }

        f.write_all_at(&value_buf, metadata_offset + METADATA_VALUE_OFFSET as u64)
            .map_err(VhdxMetadataError::WriteMetadata)
    }

    /// Re-emit the parent locator in place: zero the old extent, rebuild
    /// the key/value block at its existing offset, rewrite the table entry
    /// with the new length.
    pub fn modify_parent_locator(
        &mut self,
        f: &File,
        metadata_offset: u64,
        parent_absolute_path: Option<&str>,
        parent_relative_path: Option<&str>,
    ) -> Result<()> {
        let locator_guid = parse_guid(METADATA_PARENT_LOCATOR)?;
        let entry_index = self
            .table_entries
            .iter()
            .position(|e| e.item_id == locator_guid)
            .ok_or(VhdxMetadataError::MissingParentLocator)?;

        let locator = self
            .parent_locator
            .as_mut()
            .ok_or(VhdxMetadataError::MissingParentLocator)?;
        if let Some(path) = parent_absolute_path {
            locator.set(KEY_ABSOLUTE_WIN32_PATH, path.to_string());
        }
        if let Some(path) = parent_relative_path {
            locator.set(KEY_RELATIVE_PATH, path.to_string());
        }
        let value_bytes = locator.value_bytes();

        let old = self.table_entries[entry_index];
        let value_offset = metadata_offset + old.offset as u64;

        let clear_buf = vec![0u8; old.length as usize];
        f.write_all_at(&clear_buf, value_offset)
            .map_err(VhdxMetadataError::WriteMetadata)?;

        self.table_entries[entry_index].length = value_bytes.len() as u32;

        let mut entry_buf = [0u8; METADATA_ENTRY_SIZE];
        write_table_entry(&mut entry_buf, &self.table_entries[entry_index]);
        let entry_offset = metadata_offset
            + METADATA_TABLE_HEADER_SIZE as u64
            + (entry_index * METADATA_ENTRY_SIZE) as u64;
        f.write_all_at(&entry_buf, entry_offset)
            .map_err(VhdxMetadataError::WriteMetadata)?;

        f.write_all_at(&value_bytes, value_offset)
            .map_err(VhdxMetadataError::WriteMetadata)
    }
}

fn write_table_entry(buf: &mut [u8], entry: &TableEntry) {
    buf[0..16].copy_from_slice(&guid::to_le_bytes(&entry.item_id));
    LittleEndian::write_u32(&mut buf[16..20], entry.offset);
    LittleEndian::write_u32(&mut buf[20..24], entry.length);
    LittleEndian::write_u32(&mut buf[24..28], entry.flags);
    LittleEndian::write_u32(&mut buf[28..32], 0);
}

fn parse_guid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(VhdxMetadataError::InvalidUuid)
}

/// Warn-level reporting helper for show-style commands; unknown keys in a
/// parent locator are not fatal.
pub(crate) fn warn_unknown_locator_keys(locator: &ParentLocator) {
    for (key, _) in &locator.entries {
        if !matches!(
            key.as_str(),
            KEY_PARENT_LINKAGE
                | KEY_PARENT_LINKAGE2
                | KEY_RELATIVE_PATH
                | KEY_VOLUME_PATH
                | KEY_ABSOLUTE_WIN32_PATH
        ) {
            warn!("unknown locator entry key: {}", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_geometry_32m_dynamic() {
        let spec = DiskSpec::new_for_create(DiskType::Dynamic, 32 * MIB, 0, 0, 0).unwrap();
        assert_eq!(spec.block_size, 8 * MIB as u32);
        assert_eq!(spec.logical_sector_size, 512);
        assert_eq!(spec.physical_sector_size, 4096);
        assert_eq!(spec.sectors_per_block, 16384);
        assert_eq!(spec.chunk_ratio, 512);
        assert_eq!(spec.data_block_count, 4);
        assert_eq!(spec.total_bat_count, 4);
        assert_eq!(spec.sectors_per_block_bits, 14);
        assert_eq!(spec.chunk_ratio_bits, 9);
        assert_eq!(spec.logical_sector_size_bits, 9);
    }

    #[test]
    fn test_geometry_differencing_counts() {
        let spec = DiskSpec::new_for_create(DiskType::Differencing, 32 * MIB, 8 * MIB as u32, 512, 4096)
            .unwrap();
        assert_eq!(spec.bitmap_block_count, 1);
        assert_eq!(spec.total_bat_count, 513);
        assert_eq!(spec.bat_occupy_bytes(), MIB);
    }

    #[test]
    fn test_block_size_defaults_scale() {
        let small = DiskSpec::new_for_create(DiskType::Dynamic, GIB, 0, 0, 0).unwrap();
        assert_eq!(small.block_size, 8 * MIB as u32);
        let medium = DiskSpec::new_for_create(DiskType::Dynamic, 2 * GIB, 0, 0, 0).unwrap();
        assert_eq!(medium.block_size, 16 * MIB as u32);
        let large = DiskSpec::new_for_create(DiskType::Dynamic, 200 * GIB, 0, 0, 0).unwrap();
        assert_eq!(large.block_size, 32 * MIB as u32);
        let huge = DiskSpec::new_for_create(DiskType::Dynamic, 33 * TIB, 0, 0, 0).unwrap();
        assert_eq!(huge.block_size, 64 * MIB as u32);
    }

    #[test]
    fn test_parent_locator_round_trip() {
        let mut locator = ParentLocator::default();
        locator.set(KEY_PARENT_LINKAGE, "{83ed0ec3-24c8-49a6-a959-5e4bf1288bfb}".to_string());
        locator.set(KEY_ABSOLUTE_WIN32_PATH, "/images/parent.vhdx".to_string());
        locator.set(KEY_RELATIVE_PATH, "../parent.vhdx".to_string());

        let bytes = locator.value_bytes();
        let parsed = ParentLocator::parse(&bytes).unwrap();
        assert_eq!(parsed.entries.len(), 3);
        assert_eq!(
            parsed.get(KEY_PARENT_LINKAGE),
            Some("{83ed0ec3-24c8-49a6-a959-5e4bf1288bfb}")
        );
        assert_eq!(parsed.get(KEY_ABSOLUTE_WIN32_PATH), Some("/images/parent.vhdx"));
        assert_eq!(parsed.get(KEY_RELATIVE_PATH), Some("../parent.vhdx"));
        assert_eq!(parsed.get(KEY_VOLUME_PATH), None);
    }

    #[test]
    fn test_parent_locator_skips_empty_values() {
        let mut locator = ParentLocator::default();
        locator.set(KEY_PARENT_LINKAGE, "{x}".to_string());
        locator.set(KEY_RELATIVE_PATH, String::new());

        let bytes = locator.value_bytes();
        let parsed = ParentLocator::parse(&bytes).unwrap();
        assert_eq!(parsed.entries.len(), 1);
    }

    #[test]
    fn test_metadata_write_parse_round_trip() {
        let file = TempFile::new().unwrap().into_file();
        let mut spec = DiskSpec::new_for_create(DiskType::Dynamic, 32 * MIB, 0, 0, 0).unwrap();
        spec.write_content(&file, 0).unwrap();

        let region = RegionTableEntry {
            guid: Uuid::new_v4(),
            file_offset: 0,
            length: MIB as u32,
            required: 1,
        };
        let parsed = DiskSpec::parse(&file, &region).unwrap();
        assert_eq!(parsed.disk_type, DiskType::Dynamic);
        assert_eq!(parsed.virtual_disk_size, 32 * MIB);
        assert_eq!(parsed.block_size, 8 * MIB as u32);
        assert_eq!(parsed.disk_id, spec.disk_id);
        assert_eq!(parsed.total_bat_count, 4);
        assert!(parsed.parent_locator.is_none());
    }

    #[test]
    fn test_metadata_differencing_round_trip() {
        let file = TempFile::new().unwrap().into_file();
        let parent_guid = Uuid::new_v4();
        let mut spec =
            DiskSpec::new_for_create(DiskType::Differencing, 32 * MIB, 8 * MIB as u32, 512, 4096)
                .unwrap();
        spec.init_parent_locator(&parent_guid, "/images/p.vhdx", "./p.vhdx");
        spec.write_content(&file, 0).unwrap();

        let region = RegionTableEntry {
            guid: Uuid::new_v4(),
            file_offset: 0,
            length: MIB as u32,
            required: 1,
        };
        let parsed = DiskSpec::parse(&file, &region).unwrap();
        assert_eq!(parsed.disk_type, DiskType::Differencing);
        assert!(disk_util::guid::linkage_matches(
            parsed.parent_linkage().unwrap(),
            &parent_guid
        ));
        assert_eq!(parsed.parent_absolute_win32_path(), Some("/images/p.vhdx"));
        assert_eq!(parsed.parent_relative_path(), Some("./p.vhdx"));
        assert!(disk_util::guid::linkage_matches(
            parsed.parent_linkage2().unwrap(),
            &Uuid::nil()
        ));
    }

    #[test]
    fn test_modify_parent_locator_in_place() {
        let file = TempFile::new().unwrap().into_file();
        let parent_guid = Uuid::new_v4();
        let mut spec =
            DiskSpec::new_for_create(DiskType::Differencing, 32 * MIB, 8 * MIB as u32, 512, 4096)
                .unwrap();
        spec.init_parent_locator(&parent_guid, "/old/p.vhdx", "./old.vhdx");
        spec.write_content(&file, 0).unwrap();

        let region = RegionTableEntry {
            guid: Uuid::new_v4(),
            file_offset: 0,
            length: MIB as u32,
            required: 1,
        };
        let mut parsed = DiskSpec::parse(&file, &region).unwrap();
        parsed
            .modify_parent_locator(&file, 0, Some("/new/path/p.vhdx"), None)
            .unwrap();

        let reparsed = DiskSpec::parse(&file, &region).unwrap();
        assert_eq!(
            reparsed.parent_absolute_win32_path(),
            Some("/new/path/p.vhdx")
        );
        assert_eq!(reparsed.parent_relative_path(), Some("./old.vhdx"));
        assert!(disk_util::guid::linkage_matches(
            reparsed.parent_linkage().unwrap(),
            &parent_guid
        ));
    }
}
