// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use byteorder::{ByteOrder, LittleEndian};
use disk_util::checksum::crc32c_single;
use disk_util::{guid, utf16, MIB};
use log::warn;
use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

const VHDX_SIGNATURE: &[u8; 8] = b"vhdxfile";
const HEADER_SIGNATURE: &[u8; 4] = b"head";
const REGION_SIGNATURE: &[u8; 4] = b"regi";

const FILE_START: u64 = 0; // The first element
pub const HEADER_1_START: u64 = 64 * 1024; // Header 1 start in Bytes
pub const HEADER_2_START: u64 = 128 * 1024; // Header 2 start in Bytes
pub const REGION_TABLE_1_START: u64 = 192 * 1024; // Region 1 start in Bytes
pub const REGION_TABLE_2_START: u64 = 256 * 1024; // Region 2 start in Bytes

// Each header is 64 KiB, but only the first 4 KiB carries info and is
// covered by the checksum.
const HEADER_SIZE: usize = 4 * 1024;
const REGION_SIZE: usize = 64 * 1024;
const REGION_HEADER_SIZE: usize = 16;
const REGION_ENTRY_SIZE: usize = 32;
const REGION_MAX_ENTRIES: u32 = 2047;

const FILE_IDENTIFIER_SIZE: usize = 8 + 512;

const REGION_ENTRY_REQUIRED: u32 = 1;

// Both headers are seeded at creation; the higher sequence number is the
// current one.
const HEADER_SEQ_FOR_CREATE: u64 = 7;
const SUPPORTED_VERSION: u16 = 1;

const CREATOR: &str = "vdisk v0.1";

pub const BAT_GUID: &str = "2DC27766-F623-4200-9D64-115E9BFD4A08"; // BAT GUID
pub const MDR_GUID: &str = "8B7CA206-4790-4B9A-B8FE-575F050F886E"; // Metadata GUID

pub const BAT_REGION_START: u64 = 3 * MIB;
pub const METADATA_REGION_START: u64 = 2 * MIB;
pub const METADATA_REGION_SIZE: u32 = MIB as u32;
pub const LOG_REGION_START: u64 = MIB;
pub const LOG_REGION_SIZE: u32 = MIB as u32;

#[sorted]
#[derive(Error, Debug)]
pub enum VhdxHeaderError {
    #[error("BAT entry is not unique")]
    DuplicateBatEntry,
    #[error("metadata region entry is not unique")]
    DuplicateMdrEntry,
    #[error("checksum[{0:#010X}|{1:#010X}] mismatch")]
    InvalidChecksum(u32, u32),
    #[error("invalid region entry count")]
    InvalidEntryCount,
    #[error("not a valid VHDx header")]
    InvalidHeaderSign,
    #[error("not a valid VHDx region table")]
    InvalidRegionSign,
    #[error("couldn't parse Uuid: {0}")]
    InvalidUuid(#[source] uuid::Error),
    #[error("not a VHDx file")]
    InvalidVhdxSign,
    #[error("no valid header found")]
    NoValidHeader,
    #[error("no valid region table found")]
    NoValidRegionTable,
    #[error("failed to read header section: {0}")]
    ReadHeaderSection(#[source] io::Error),
    #[error("failed to collect BAT and metadata region entries")]
    RegionEntryCollectionFailed,
    #[error("overlapping regions found")]
    RegionOverlap,
    #[error("reserved region has non-zero value")]
    ReservedIsNonZero,
    #[error("unrecognized region entry marked required")]
    UnrecognizedRegionEntry,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("failed to write header section: {0}")]
    WriteHeaderSection(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VhdxHeaderError>;

/// Calculate the CRC-32C of a buffer that contains its own checksum at
/// `csum_offset`: the field is zeroed for the computation and restored
/// afterwards.
pub fn calculate_checksum(buffer: &mut [u8], csum_offset: usize) -> u32 {
    let orig_csum = LittleEndian::read_u32(&buffer[csum_offset..csum_offset + 4]);
    LittleEndian::write_u32(&mut buffer[csum_offset..csum_offset + 4], 0);
    let new_csum = crc32c_single(buffer);
    LittleEndian::write_u32(&mut buffer[csum_offset..csum_offset + 4], orig_csum);

    new_csum
}

#[derive(Clone, Debug)]
pub struct FileTypeIdentifier {
    pub creator: String,
}

impl FileTypeIdentifier {
    pub fn read_from(buf: &[u8]) -> Result<FileTypeIdentifier> {
        if &buf[0..8] != VHDX_SIGNATURE {
            return Err(VhdxHeaderError::InvalidVhdxSign);
        }

        Ok(FileTypeIdentifier {
            creator: utf16::utf16le_to_utf8(&buf[8..FILE_IDENTIFIER_SIZE]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(VHDX_SIGNATURE);
        let creator = utf16::utf8_to_utf16le(&self.creator);
        let len = creator.len().min(512);
        buf[8..8 + len].copy_from_slice(&creator[..len]);
    }
}

/// One of the two 4 KiB header sectors at 64 KiB and 128 KiB.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    pub checksum: u32,
    pub sequence_number: u64,
    pub file_write_guid: Uuid,
    pub data_write_guid: Uuid,
    pub log_guid: Uuid,
    pub log_version: u16,
    pub version: u16,
    pub log_length: u32,
    pub log_offset: u64,
}

impl Header {
    pub fn read_from(buf: &mut [u8]) -> Result<Header> {
        if &buf[0..4] != HEADER_SIGNATURE {
            return Err(VhdxHeaderError::InvalidHeaderSign);
        }

        let checksum = LittleEndian::read_u32(&buf[4..8]);
        let computed = calculate_checksum(buf, 4);
        if checksum != computed {
            return Err(VhdxHeaderError::InvalidChecksum(checksum, computed));
        }

        Ok(Header {
            checksum,
            sequence_number: LittleEndian::read_u64(&buf[8..16]),
            file_write_guid: guid::from_le_bytes(buf[16..32].try_into().unwrap()),
            data_write_guid: guid::from_le_bytes(buf[32..48].try_into().unwrap()),
            log_guid: guid::from_le_bytes(buf[48..64].try_into().unwrap()),
            log_version: LittleEndian::read_u16(&buf[64..66]),
            version: LittleEndian::read_u16(&buf[66..68]),
            log_length: LittleEndian::read_u32(&buf[68..72]),
            log_offset: LittleEndian::read_u64(&buf[72..80]),
        })
    }

    /// Serialize the header into its 4 KiB sector, recomputing the
    /// checksum.
    pub fn write_to(&mut self, buf: &mut [u8]) {
        buf.fill(0);
        buf[0..4].copy_from_slice(HEADER_SIGNATURE);
        LittleEndian::write_u64(&mut buf[8..16], self.sequence_number);
        buf[16..32].copy_from_slice(&guid::to_le_bytes(&self.file_write_guid));
        buf[32..48].copy_from_slice(&guid::to_le_bytes(&self.data_write_guid));
        buf[48..64].copy_from_slice(&guid::to_le_bytes(&self.log_guid));
        LittleEndian::write_u16(&mut buf[64..66], self.log_version);
        LittleEndian::write_u16(&mut buf[66..68], self.version);
        LittleEndian::write_u32(&mut buf[68..72], self.log_length);
        LittleEndian::write_u64(&mut buf[72..80], self.log_offset);

        self.checksum = crc32c_single(buf);
        LittleEndian::write_u32(&mut buf[4..8], self.checksum);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionTableEntry {
    pub guid: Uuid,
    pub file_offset: u64,
    pub length: u32,
    pub required: u32,
}

/// One of the two 64 KiB region tables at 192 KiB and 256 KiB.
#[derive(Clone, Debug)]
pub struct RegionTable {
    pub checksum: u32,
    pub entries: Vec<RegionTableEntry>,
}

impl RegionTable {
    pub fn new_for_create(bat_length: u32) -> RegionTable {
        RegionTable {
            checksum: 0,
            entries: vec![
                RegionTableEntry {
                    guid: Uuid::parse_str(BAT_GUID).unwrap(),
                    file_offset: BAT_REGION_START,
                    length: bat_length,
                    required: REGION_ENTRY_REQUIRED,
                },
                RegionTableEntry {
                    guid: Uuid::parse_str(MDR_GUID).unwrap(),
                    file_offset: METADATA_REGION_START,
                    length: METADATA_REGION_SIZE,
                    required: REGION_ENTRY_REQUIRED,
                },
            ],
        }
    }

    pub fn read_from(buf: &mut [u8]) -> Result<RegionTable> {
        if &buf[0..4] != REGION_SIGNATURE {
            return Err(VhdxHeaderError::InvalidRegionSign);
        }

        let checksum = LittleEndian::read_u32(&buf[4..8]);
        let computed = calculate_checksum(buf, 4);
        if checksum != computed {
            return Err(VhdxHeaderError::InvalidChecksum(checksum, computed));
        }

        let entry_count = LittleEndian::read_u32(&buf[8..12]);
        if entry_count > REGION_MAX_ENTRIES {
            return Err(VhdxHeaderError::InvalidEntryCount);
        }
        if LittleEndian::read_u32(&buf[12..16]) != 0 {
            return Err(VhdxHeaderError::ReservedIsNonZero);
        }

        let mut entries = Vec::with_capacity(entry_count as usize);
        for i in 0..entry_count as usize {
            let base = REGION_HEADER_SIZE + i * REGION_ENTRY_SIZE;
            entries.push(RegionTableEntry {
                guid: guid::from_le_bytes(buf[base..base + 16].try_into().unwrap()),
                file_offset: LittleEndian::read_u64(&buf[base + 16..base + 24]),
                length: LittleEndian::read_u32(&buf[base + 24..base + 28]),
                required: LittleEndian::read_u32(&buf[base + 28..base + 32]),
            });
        }

        Ok(RegionTable { checksum, entries })
    }

    /// Serialize the table into its 64 KiB sector, recomputing the
    /// checksum.
    pub fn write_to(&mut self, buf: &mut [u8]) {
        buf.fill(0);
        buf[0..4].copy_from_slice(REGION_SIGNATURE);
        LittleEndian::write_u32(&mut buf[8..12], self.entries.len() as u32);

        for (i, entry) in self.entries.iter().enumerate() {
            let base = REGION_HEADER_SIZE + i * REGION_ENTRY_SIZE;
            buf[base..base + 16].copy_from_slice(&guid::to_le_bytes(&entry.guid));
            LittleEndian::write_u64(&mut buf[base + 16..base + 24], entry.file_offset);
            LittleEndian::write_u32(&mut buf[base + 24..base + 28], entry.length);
            LittleEndian::write_u32(&mut buf[base + 28..base + 32], entry.required);
        }

        self.checksum = crc32c_single(buf);
        LittleEndian::write_u32(&mut buf[4..8], self.checksum);
    }

    /// Identify the BAT and metadata region entries, rejecting duplicates,
    /// overlaps and unrecognized required entries.
    fn locate_entries(&self) -> Result<(RegionTableEntry, RegionTableEntry)> {
        let bat_guid = Uuid::parse_str(BAT_GUID).map_err(VhdxHeaderError::InvalidUuid)?;
        let mdr_guid = Uuid::parse_str(MDR_GUID).map_err(VhdxHeaderError::InvalidUuid)?;

        let mut bat_entry: Option<RegionTableEntry> = None;
        let mut mdr_entry: Option<RegionTableEntry> = None;
        let mut extents: Vec<(u64, u64)> = Vec::new();

        for entry in &self.entries {
            let start = entry.file_offset;
            let end = start + entry.length as u64;
            for (ent_start, ent_end) in &extents {
                if start < *ent_end && *ent_start < end {
                    return Err(VhdxHeaderError::RegionOverlap);
                }
            }
            extents.push((start, end));

            if entry.guid == bat_guid {
                if bat_entry.is_some() {
                    return Err(VhdxHeaderError::DuplicateBatEntry);
                }
                bat_entry = Some(*entry);
            } else if entry.guid == mdr_guid {
                if mdr_entry.is_some() {
                    return Err(VhdxHeaderError::DuplicateMdrEntry);
                }
                mdr_entry = Some(*entry);
            } else if (entry.required & REGION_ENTRY_REQUIRED) == 1 {
                // This implementation doesn't recognize the entry, so the
                // required flag forces a refusal.
                return Err(VhdxHeaderError::UnrecognizedRegionEntry);
            }
        }

        match (bat_entry, mdr_entry) {
            (Some(bat), Some(mdr)) => Ok((bat, mdr)),
            _ => Err(VhdxHeaderError::RegionEntryCollectionFailed),
        }
    }
}

/// The header section of a VHDX file: file identifier, two headers, two
/// region tables, and the once-per-handle file write GUID state.
#[derive(Clone, Debug)]
pub struct HeaderSection {
    file_identifier: FileTypeIdentifier,
    headers: [Option<Header>; 2],
    region_tables: [Option<RegionTable>; 2],
    current_header_index: usize,
    bat_entry: RegionTableEntry,
    mdr_entry: RegionTableEntry,
    file_write_guid: Uuid,
    first_visible_write: bool,
}

impl HeaderSection {
    /// Parse and validate the header section. A single corrupt header or
    /// region table slot is tolerated and reported.
    pub fn parse(f: &File, read_only: bool) -> Result<HeaderSection> {
        let mut id_buf = [0u8; FILE_IDENTIFIER_SIZE];
        f.read_exact_at(&mut id_buf, FILE_START)
            .map_err(VhdxHeaderError::ReadHeaderSection)?;
        let file_identifier = FileTypeIdentifier::read_from(&id_buf)?;

        let mut headers: [Option<Header>; 2] = [None, None];
        for (i, start) in [HEADER_1_START, HEADER_2_START].iter().enumerate() {
            let mut buf = vec![0u8; HEADER_SIZE];
            f.read_exact_at(&mut buf, *start)
                .map_err(VhdxHeaderError::ReadHeaderSection)?;
            match Header::read_from(&mut buf) {
                Ok(header) => headers[i] = Some(header),
                Err(e) => warn!("header[{}] {}", i, e),
            }
        }

        let mut current_header_index = None;
        let mut max_seq_num = 0;
        for (i, header) in headers.iter().enumerate() {
            if let Some(header) = header {
                if header.sequence_number >= max_seq_num {
                    max_seq_num = header.sequence_number;
                    current_header_index = Some(i);
                }
            }
        }
        let current_header_index = current_header_index.ok_or(VhdxHeaderError::NoValidHeader)?;

        let active_version = headers[current_header_index].as_ref().unwrap().version;
        if active_version != SUPPORTED_VERSION {
            return Err(VhdxHeaderError::UnsupportedVersion(active_version));
        }

        let mut region_tables: [Option<RegionTable>; 2] = [None, None];
        for (i, start) in [REGION_TABLE_1_START, REGION_TABLE_2_START]
            .iter()
            .enumerate()
        {
            let mut buf = vec![0u8; REGION_SIZE];
            f.read_exact_at(&mut buf, *start)
                .map_err(VhdxHeaderError::ReadHeaderSection)?;
            match RegionTable::read_from(&mut buf) {
                Ok(table) => region_tables[i] = Some(table),
                Err(e) => warn!("region[{}] {}", i, e),
            }
        }

        // Pick the BAT and metadata entries from whichever table parses
        // correctly, preferring the first.
        let mut located = None;
        for (i, table) in region_tables.iter().enumerate() {
            if let Some(table) = table {
                match table.locate_entries() {
                    Ok(entries) => {
                        located = Some(entries);
                        break;
                    }
                    Err(e) => warn!("region[{}] {}", i, e),
                }
            }
        }
        let (bat_entry, mdr_entry) = located.ok_or(VhdxHeaderError::NoValidRegionTable)?;

        let file_write_guid = if read_only { Uuid::nil() } else { Uuid::new_v4() };

        Ok(HeaderSection {
            file_identifier,
            headers,
            region_tables,
            current_header_index,
            bat_entry,
            mdr_entry,
            file_write_guid,
            first_visible_write: true,
        })
    }

    /// Build the in-memory section for a freshly created file.
    pub fn init_content(bat_length: u32) -> HeaderSection {
        let mut headers: [Option<Header>; 2] = [None, None];
        let file_write_guid = Uuid::new_v4();
        let data_write_guid = Uuid::new_v4();
        for (i, header) in headers.iter_mut().enumerate() {
            *header = Some(Header {
                checksum: 0,
                sequence_number: HEADER_SEQ_FOR_CREATE + i as u64,
                file_write_guid,
                data_write_guid,
                log_guid: Uuid::nil(),
                log_version: 0,
                version: SUPPORTED_VERSION,
                log_length: LOG_REGION_SIZE,
                log_offset: LOG_REGION_START,
            });
        }

        let table = RegionTable::new_for_create(bat_length);
        let (bat_entry, mdr_entry) = table.locate_entries().unwrap();

        HeaderSection {
            file_identifier: FileTypeIdentifier {
                creator: CREATOR.to_string(),
            },
            headers,
            region_tables: [Some(table.clone()), Some(table)],
            current_header_index: 1,
            bat_entry,
            mdr_entry,
            file_write_guid,
            first_visible_write: true,
        }
    }

    /// Write the file identifier, both headers and both region tables of a
    /// freshly created file.
    pub fn write_content(&mut self, f: &File) -> Result<()> {
        let mut id_buf = vec![0u8; FILE_IDENTIFIER_SIZE];
        self.file_identifier.write_to(&mut id_buf);
        f.write_all_at(&id_buf, FILE_START)
            .map_err(VhdxHeaderError::WriteHeaderSection)?;

        for (i, start) in [HEADER_1_START, HEADER_2_START].iter().enumerate() {
            let header = self.headers[i].as_mut().ok_or(VhdxHeaderError::NoValidHeader)?;
            let mut buf = vec![0u8; HEADER_SIZE];
            header.write_to(&mut buf);
            f.write_all_at(&buf, *start)
                .map_err(VhdxHeaderError::WriteHeaderSection)?;
        }

        for (i, start) in [REGION_TABLE_1_START, REGION_TABLE_2_START]
            .iter()
            .enumerate()
        {
            let table = self.region_tables[i]
                .as_mut()
                .ok_or(VhdxHeaderError::NoValidRegionTable)?;
            let mut buf = vec![0u8; REGION_SIZE];
            table.write_to(&mut buf);
            f.write_all_at(&buf, *start)
                .map_err(VhdxHeaderError::WriteHeaderSection)?;
        }

        Ok(())
    }

    pub fn active(&self) -> &Header {
        self.headers[self.current_header_index]
            .as_ref()
            .expect("current header index always points at a valid header")
    }

    pub fn file_identifier(&self) -> &FileTypeIdentifier {
        &self.file_identifier
    }

    pub fn headers(&self) -> &[Option<Header>; 2] {
        &self.headers
    }

    pub fn region_tables(&self) -> &[Option<RegionTable>; 2] {
        &self.region_tables
    }

    pub fn bat_entry(&self) -> &RegionTableEntry {
        &self.bat_entry
    }

    pub fn mdr_entry(&self) -> &RegionTableEntry {
        &self.mdr_entry
    }

    pub fn data_write_guid(&self) -> Uuid {
        self.active().data_write_guid
    }

    pub fn log_guid(&self) -> Uuid {
        self.active().log_guid
    }

    pub fn log_offset(&self) -> u64 {
        self.active().log_offset
    }

    pub fn log_length(&self) -> u32 {
        self.active().log_length
    }

    pub fn log_version(&self) -> u16 {
        self.active().log_version
    }

    /// Header updates are performed twice so that both the current and the
    /// non-current slot carry valid info afterwards.
    pub fn update(&mut self, f: &File) -> Result<()> {
        self.update_inactive_header(f, None)?;
        self.update_inactive_header(f, None)
    }

    /// A header update that also replaces the log GUID; resetting the log
    /// is an update with the nil GUID.
    pub fn update_log_guid(&mut self, f: &File, log_guid: Uuid) -> Result<()> {
        self.update_inactive_header(f, Some(log_guid))?;
        self.update_inactive_header(f, Some(log_guid))
    }

    /// On the first write of guest-visible data the file write GUID must
    /// reach the headers before anything else does.
    pub fn user_visible_write(&mut self, f: &File) -> Result<()> {
        if self.first_visible_write {
            self.first_visible_write = false;
            self.update(f)?;
        }
        Ok(())
    }

    fn update_inactive_header(&mut self, f: &File, log_guid: Option<Uuid>) -> Result<()> {
        let active = self.active();
        let inactive_index = 1 - self.current_header_index;
        let offset = if inactive_index == 0 {
            HEADER_1_START
        } else {
            HEADER_2_START
        };

        let mut new_header = Header {
            checksum: 0,
            sequence_number: active.sequence_number + 1,
            file_write_guid: self.file_write_guid,
            data_write_guid: Uuid::new_v4(),
            log_guid: log_guid.unwrap_or(active.log_guid),
            log_version: active.log_version,
            version: active.version,
            log_length: active.log_length,
            log_offset: active.log_offset,
        };

        let mut buf = vec![0u8; HEADER_SIZE];
        new_header.write_to(&mut buf);
        f.write_all_at(&buf, offset)
            .map_err(VhdxHeaderError::WriteHeaderSection)?;
        f.sync_all().map_err(VhdxHeaderError::WriteHeaderSection)?;

        self.headers[inactive_index] = Some(new_header);
        self.current_header_index = inactive_index;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    fn fresh_section(file: &File) -> HeaderSection {
        let mut section = HeaderSection::init_content(MIB as u32);
        section.write_content(file).unwrap();
        section
    }

    #[test]
    fn test_header_round_trip() {
        let mut header = Header {
            checksum: 0,
            sequence_number: 9,
            file_write_guid: Uuid::new_v4(),
            data_write_guid: Uuid::new_v4(),
            log_guid: Uuid::nil(),
            log_version: 0,
            version: 1,
            log_length: LOG_REGION_SIZE,
            log_offset: LOG_REGION_START,
        };

        let mut buf = vec![0u8; HEADER_SIZE];
        header.write_to(&mut buf);
        let parsed = Header::read_from(&mut buf).unwrap();
        assert_eq!(parsed.sequence_number, 9);
        assert_eq!(parsed.file_write_guid, header.file_write_guid);
        assert_eq!(parsed.data_write_guid, header.data_write_guid);
        assert_eq!(parsed.checksum, header.checksum);
        assert_eq!(parsed.log_offset, MIB);
        assert_eq!(parsed.log_length, MIB as u32);
    }

    #[test]
    fn test_header_rejects_corruption() {
        let mut header = Header {
            checksum: 0,
            sequence_number: 9,
            file_write_guid: Uuid::new_v4(),
            data_write_guid: Uuid::new_v4(),
            log_guid: Uuid::nil(),
            log_version: 0,
            version: 1,
            log_length: LOG_REGION_SIZE,
            log_offset: LOG_REGION_START,
        };
        let mut buf = vec![0u8; HEADER_SIZE];
        header.write_to(&mut buf);

        buf[100] ^= 0xFF;
        assert!(matches!(
            Header::read_from(&mut buf),
            Err(VhdxHeaderError::InvalidChecksum(..))
        ));
    }

    #[test]
    fn test_region_table_round_trip() {
        let mut table = RegionTable::new_for_create(2 * MIB as u32);
        let mut buf = vec![0u8; REGION_SIZE];
        table.write_to(&mut buf);

        let parsed = RegionTable::read_from(&mut buf).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        let (bat, mdr) = parsed.locate_entries().unwrap();
        assert_eq!(bat.file_offset, BAT_REGION_START);
        assert_eq!(bat.length, 2 * MIB as u32);
        assert_eq!(mdr.file_offset, METADATA_REGION_START);
        assert_eq!(mdr.length, METADATA_REGION_SIZE);
    }

    #[test]
    fn test_parse_written_content() {
        let file = TempFile::new().unwrap().into_file();
        fresh_section(&file);

        let section = HeaderSection::parse(&file, true).unwrap();
        assert_eq!(section.active().sequence_number, HEADER_SEQ_FOR_CREATE + 1);
        assert_eq!(section.current_header_index, 1);
        assert_eq!(section.bat_entry().file_offset, BAT_REGION_START);
        assert_eq!(section.mdr_entry().file_offset, METADATA_REGION_START);
        assert!(section.log_guid().is_nil());
        assert_eq!(section.file_identifier().creator, CREATOR);
    }

    #[test]
    fn test_parse_tolerates_one_corrupt_header() {
        let file = TempFile::new().unwrap().into_file();
        fresh_section(&file);

        // Corrupt the inactive header (slot 0, lower sequence number).
        file.write_all_at(&[0xFF], HEADER_1_START + 50).unwrap();

        let section = HeaderSection::parse(&file, true).unwrap();
        assert!(section.headers()[0].is_none());
        assert_eq!(section.active().sequence_number, HEADER_SEQ_FOR_CREATE + 1);
    }

    #[test]
    fn test_parse_fails_with_both_headers_corrupt() {
        let file = TempFile::new().unwrap().into_file();
        fresh_section(&file);

        file.write_all_at(&[0xFF], HEADER_1_START + 50).unwrap();
        file.write_all_at(&[0xFF], HEADER_2_START + 50).unwrap();

        assert!(matches!(
            HeaderSection::parse(&file, true),
            Err(VhdxHeaderError::NoValidHeader)
        ));
    }

    #[test]
    fn test_update_writes_inactive_slot_and_heals() {
        let file = TempFile::new().unwrap().into_file();
        fresh_section(&file);

        file.write_all_at(&[0xFF], HEADER_1_START + 50).unwrap();
        let mut section = HeaderSection::parse(&file, false).unwrap();
        assert!(section.headers()[0].is_none());

        let before_seq = section.active().sequence_number;
        section.update(&file).unwrap();

        // Both slots are valid again and the sequence advanced twice.
        let reparsed = HeaderSection::parse(&file, true).unwrap();
        assert!(reparsed.headers()[0].is_some());
        assert!(reparsed.headers()[1].is_some());
        assert_eq!(reparsed.active().sequence_number, before_seq + 2);
    }

    #[test]
    fn test_user_visible_write_updates_once() {
        let file = TempFile::new().unwrap().into_file();
        fresh_section(&file);

        let mut section = HeaderSection::parse(&file, false).unwrap();
        let fwg = section.file_write_guid;
        let seq = section.active().sequence_number;

        section.user_visible_write(&file).unwrap();
        assert_eq!(section.active().file_write_guid, fwg);
        assert_eq!(section.active().sequence_number, seq + 2);

        // Subsequent calls are no-ops.
        section.user_visible_write(&file).unwrap();
        assert_eq!(section.active().sequence_number, seq + 2);
    }

    #[test]
    fn test_update_log_guid() {
        let file = TempFile::new().unwrap().into_file();
        fresh_section(&file);

        let mut section = HeaderSection::parse(&file, false).unwrap();
        let log_guid = Uuid::new_v4();
        section.update_log_guid(&file, log_guid).unwrap();
        assert_eq!(section.log_guid(), log_guid);

        section.update_log_guid(&file, Uuid::nil()).unwrap();
        assert!(section.log_guid().is_nil());

        let reparsed = HeaderSection::parse(&file, true).unwrap();
        assert!(reparsed.log_guid().is_nil());
    }
}
