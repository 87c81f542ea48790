// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{error, warn};
use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

use crate::vhd_bat::{BatEntry, VhdBatError, BAT_ENTRY_UNUSED};
use crate::vhd_footer::{
    DiskType, Footer, VhdFooterError, FIXED_DATA_OFFSET, FOOTER_SIZE,
};
use crate::vhd_header::{
    ParentLocatorEntry, SparseHeader, VhdHeaderError, PLATFORM_CODE_W2KU, PLATFORM_CODE_W2RU,
    SPARSE_HEADER_SIZE,
};
use crate::{BITMAP_SIZE, BLOCK_SIZE, SECTORS_PER_BITMAP, SECTOR_SHIFT, SECTOR_SIZE};

#[sorted]
#[derive(Error, Debug)]
pub enum VhdError {
    #[error("BAT access failed: {0}")]
    Bat(#[source] VhdBatError),
    #[error("failed to access file: {0}")]
    FileAccess(#[source] io::Error),
    #[error("buffer length {0} does not match {1} sectors")]
    InvalidBufferLength(usize, u32),
    #[error("parent linkage mismatch[{0}|{1}]")]
    LinkageMismatch(Uuid, Uuid),
    #[error("disk is not a differencing disk")]
    NotDifferencing,
    #[error("disk is opened read-only")]
    NotPermitted,
    #[error("parent chain contains a cycle")]
    ParentCycle,
    #[error("cannot find parent by '{0}' or '{1}'")]
    ParentNotFound(String, String),
    #[error("parent path does not fit in a locator sector")]
    ParentPathTooLong,
    #[error("failed to parse footer: {0}")]
    ParseFooter(#[source] VhdFooterError),
    #[error("failed to parse sparse header: {0}")]
    ParseSparseHeader(#[source] VhdHeaderError),
    #[error("failed reading from disk: {0}")]
    ReadData(#[source] io::Error),
    #[error("failed changing file length: {0}")]
    ResizeFile(#[source] io::Error),
    #[error("sector {0} out of range, disk has {1} sectors")]
    SectorOutOfRange(u64, u64),
    #[error("operation not supported on a {0} disk")]
    UnsupportedDiskType(&'static str),
    #[error("failed writing to disk: {0}")]
    WriteData(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VhdError>;

const BIT_MASK: u8 = 0x80;

// Block bitmaps address sectors MSB first: bit 7 of byte i is sector 8*i.
fn test_bit(buf: &[u8], nr: usize) -> bool {
    (buf[nr >> 3] << (nr & 7)) & BIT_MASK != 0
}

fn set_bit(buf: &mut [u8], nr: usize) {
    buf[nr >> 3] |= BIT_MASK >> (nr & 7);
}

#[derive(Default)]
struct SectorInfo {
    bat_idx: usize,
    sectors_avail: u32,
    bytes_avail: usize,
    file_offset: u64,
    block_offset: u64,
}

/// A VHD disk image handle. Owns the file descriptor, the in-memory BAT
/// and, once a differencing read or write resolves them, the chain of
/// read-only parent handles.
#[derive(Debug)]
pub struct Vhd {
    file: File,
    path: PathBuf,
    read_only: bool,
    footer: Footer,
    header: Option<SparseHeader>,
    bat: Vec<BatEntry>,
    sectors_per_block: u32,
    parent_absolute_path: String,
    parent_relative_path: String,
    rewrite_footer: bool,
    parents: Vec<Vhd>,
}

impl Vhd {
    /// Open and parse an existing image. The trailing footer is preferred;
    /// the leading copy is the fallback.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Vhd> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(VhdError::FileAccess)?;

        let file_len = file.metadata().map_err(VhdError::FileAccess)?.len();
        let footer = read_footer(&file, file_len, &path)?;

        let mut disk = Vhd {
            file,
            path,
            read_only,
            footer,
            header: None,
            bat: Vec::new(),
            sectors_per_block: 0,
            parent_absolute_path: String::new(),
            parent_relative_path: String::new(),
            rewrite_footer: false,
            parents: Vec::new(),
        };

        if disk.footer.disk_type != DiskType::Fixed {
            disk.parse_sparse()?;
        }

        Ok(disk)
    }

    fn parse_sparse(&mut self) -> Result<()> {
        let mut buf = [0u8; SPARSE_HEADER_SIZE];
        self.file
            .read_exact_at(&mut buf, self.footer.data_offset)
            .map_err(VhdError::ReadData)?;
        let header = SparseHeader::read_from(&buf).map_err(VhdError::ParseSparseHeader)?;

        if self.footer.disk_type == DiskType::Differencing {
            for entry in header.parent_locator_entries.iter() {
                if !entry.is_populated() {
                    continue;
                }

                let mut data = vec![0u8; entry.data_length as usize];
                if let Err(e) = self.file.read_exact_at(&mut data, entry.data_offset) {
                    warn!(
                        "reading parent locator data at offset {} failed: {}",
                        entry.data_offset, e
                    );
                    continue;
                }

                if entry.platform_code == PLATFORM_CODE_W2RU {
                    self.parent_relative_path = disk_util::utf16::utf16le_to_utf8(&data);
                } else if entry.platform_code == PLATFORM_CODE_W2KU {
                    self.parent_absolute_path = disk_util::utf16::utf16le_to_utf8(&data);
                }
            }

            if self.parent_relative_path.is_empty() && self.parent_absolute_path.is_empty() {
                return Err(VhdError::ParentNotFound(String::new(), String::new()));
            }
        }

        self.sectors_per_block = header.block_size >> SECTOR_SHIFT;
        self.bat =
            BatEntry::collect_bat_entries(&self.file, header.table_offset, header.max_table_entries)
                .map_err(VhdError::Bat)?;
        self.header = Some(header);

        Ok(())
    }

    pub fn create_fixed<P: AsRef<Path>>(path: P, size: u64) -> Result<()> {
        Vhd::create_image(path.as_ref(), None, size, DiskType::Fixed, None, None)
    }

    pub fn create_dynamic<P: AsRef<Path>>(path: P, size: u64) -> Result<()> {
        Vhd::create_image(path.as_ref(), None, size, DiskType::Dynamic, None, None)
    }

    pub fn create_differencing<P: AsRef<Path>, Q: AsRef<Path>>(
        path: P,
        parent_path: Q,
        parent_absolute_path: Option<&str>,
        parent_relative_path: Option<&str>,
    ) -> Result<()> {
        Vhd::create_image(
            path.as_ref(),
            Some(parent_path.as_ref()),
            0,
            DiskType::Differencing,
            parent_absolute_path,
            parent_relative_path,
        )
    }

    fn create_image(
        path: &Path,
        parent_path: Option<&Path>,
        size: u64,
        disk_type: DiskType,
        parent_absolute_path: Option<&str>,
        parent_relative_path: Option<&str>,
    ) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(VhdError::FileAccess)?;

        let result = Vhd::write_new_image(
            &file,
            path,
            parent_path,
            size,
            disk_type,
            parent_absolute_path,
            parent_relative_path,
        );
        if result.is_err() {
            drop(file);
            let _ = std::fs::remove_file(path);
        }
        result
    }

    fn write_new_image(
        file: &File,
        path: &Path,
        parent_path: Option<&Path>,
        size: u64,
        disk_type: DiskType,
        parent_absolute_path: Option<&str>,
        parent_relative_path: Option<&str>,
    ) -> Result<()> {
        let mut round_size = if size != 0 {
            disk_util::round_up(size, 2 * disk_util::MIB)
        } else {
            0
        };

        if disk_type == DiskType::Fixed {
            let mut footer = Footer::new(disk_type, round_size, FIXED_DATA_OFFSET);
            let mut footer_buf = [0u8; FOOTER_SIZE];
            footer.write_to(&mut footer_buf);
            file.write_all_at(&footer_buf, round_size)
                .map_err(VhdError::WriteData)?;
            return file.sync_all().map_err(VhdError::FileAccess);
        }

        let mut table_offset = (FOOTER_SIZE + SPARSE_HEADER_SIZE) as u64;
        let mut header;
        let mut locator_sectors: Vec<[u8; SECTOR_SIZE as usize]> = Vec::new();

        if disk_type == DiskType::Differencing {
            let parent_path = parent_path.ok_or(VhdError::NotDifferencing)?;
            let parent = Vhd::open(parent_path, true)?;
            round_size = parent.footer.current_size;

            let abs_path = match parent_absolute_path {
                Some(p) => p.to_string(),
                None => disk_util::path::absolute_path(parent_path)
                    .map_err(VhdError::FileAccess)?
                    .to_string_lossy()
                    .into_owned(),
            };
            let rel_path = match parent_relative_path {
                Some(p) => p.to_string(),
                None => disk_util::path::relative_path_to(path, parent_path)
                    .map_err(VhdError::FileAccess)?
                    .to_string_lossy()
                    .into_owned(),
            };

            let rel_utf16 = disk_util::utf16::utf8_to_utf16le(&rel_path);
            let abs_utf16 = disk_util::utf16::utf8_to_utf16le(&abs_path);
            if rel_utf16.len() > SECTOR_SIZE as usize || abs_utf16.len() > SECTOR_SIZE as usize {
                return Err(VhdError::ParentPathTooLong);
            }

            header = SparseHeader::new(0, (round_size >> crate::BLOCK_SHIFT) as u32, BLOCK_SIZE);
            let parent_name = parent_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            header.set_parent(
                parent.footer.unique_id,
                parent.footer.timestamp,
                &parent_name,
            );

            header.parent_locator_entries[0] = ParentLocatorEntry {
                platform_code: PLATFORM_CODE_W2RU,
                data_space: SECTOR_SIZE,
                data_length: rel_utf16.len() as u32,
                data_offset: table_offset,
            };
            let mut sector = [0u8; SECTOR_SIZE as usize];
            sector[..rel_utf16.len()].copy_from_slice(&rel_utf16);
            locator_sectors.push(sector);
            table_offset += SECTOR_SIZE as u64;

            header.parent_locator_entries[1] = ParentLocatorEntry {
                platform_code: PLATFORM_CODE_W2KU,
                data_space: SECTOR_SIZE,
                data_length: abs_utf16.len() as u32,
                data_offset: table_offset,
            };
            let mut sector = [0u8; SECTOR_SIZE as usize];
            sector[..abs_utf16.len()].copy_from_slice(&abs_utf16);
            locator_sectors.push(sector);
            table_offset += SECTOR_SIZE as u64;

            header.table_offset = table_offset;
        } else {
            header = SparseHeader::new(
                table_offset,
                (round_size >> crate::BLOCK_SHIFT) as u32,
                BLOCK_SIZE,
            );
        }

        let mut footer = Footer::new(disk_type, round_size, FOOTER_SIZE as u64);
        let mut footer_buf = [0u8; FOOTER_SIZE];
        footer.write_to(&mut footer_buf);
        file.write_all_at(&footer_buf, 0)
            .map_err(VhdError::WriteData)?;

        let mut header_buf = [0u8; SPARSE_HEADER_SIZE];
        header.write_to(&mut header_buf);
        file.write_all_at(&header_buf, FOOTER_SIZE as u64)
            .map_err(VhdError::WriteData)?;

        let mut offset = (FOOTER_SIZE + SPARSE_HEADER_SIZE) as u64;
        for sector in &locator_sectors {
            file.write_all_at(sector, offset)
                .map_err(VhdError::WriteData)?;
            offset += SECTOR_SIZE as u64;
        }

        let bat = vec![BatEntry(BAT_ENTRY_UNUSED); header.max_table_entries as usize];
        BatEntry::write_bat_entries(file, table_offset, &bat).map_err(VhdError::Bat)?;

        let trailing_offset = table_offset + BatEntry::table_bytes(header.max_table_entries);
        file.write_all_at(&footer_buf, trailing_offset)
            .map_err(VhdError::WriteData)?;
        file.set_len(trailing_offset + FOOTER_SIZE as u64)
            .map_err(VhdError::ResizeFile)?;

        file.sync_all().map_err(VhdError::FileAccess)
    }

    /// Reset a dynamic or differencing disk to its freshly-created state:
    /// all BAT entries unused, payload truncated away.
    pub fn empty_disk<P: AsRef<Path>>(path: P) -> Result<()> {
        let mut disk = Vhd::open(path, false)?;
        if disk.footer.disk_type == DiskType::Fixed {
            return Err(VhdError::UnsupportedDiskType("Fixed"));
        }

        let (table_offset, max_entries) = {
            let header = disk.header.as_ref().ok_or(VhdError::NotDifferencing)?;
            (header.table_offset, header.max_table_entries)
        };

        disk.bat.fill(BatEntry(BAT_ENTRY_UNUSED));
        BatEntry::write_bat_entries(&disk.file, table_offset, &disk.bat).map_err(VhdError::Bat)?;

        let footer_offset = table_offset + BatEntry::table_bytes(max_entries);
        let mut footer_buf = [0u8; FOOTER_SIZE];
        disk.footer.write_to(&mut footer_buf);
        disk.file
            .write_all_at(&footer_buf, footer_offset)
            .map_err(VhdError::WriteData)?;
        disk.file
            .set_len(footer_offset + FOOTER_SIZE as u64)
            .map_err(VhdError::ResizeFile)?;
        disk.file.sync_all().map_err(VhdError::FileAccess)?;

        disk.rewrite_footer = false;
        Ok(())
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    pub fn disk_size(&self) -> u64 {
        self.footer.current_size
    }

    pub fn total_sectors(&self) -> u64 {
        self.footer.current_size >> SECTOR_SHIFT
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn sparse_header(&self) -> Option<&SparseHeader> {
        self.header.as_ref()
    }

    pub fn bat(&self) -> &[BatEntry] {
        &self.bat
    }

    pub fn parent_absolute_path(&self) -> &str {
        &self.parent_absolute_path
    }

    pub fn parent_relative_path(&self) -> &str {
        &self.parent_relative_path
    }

    pub fn parents(&self) -> &[Vhd] {
        &self.parents
    }

    /// The BAT entry covering `sector`, plus the block's 512-byte bitmap
    /// when the block is allocated.
    pub fn bat_entry_bitmap(&self, sector: u64) -> Result<(usize, BatEntry, Option<Vec<u8>>)> {
        self.check_range(sector, 1)?;
        if self.footer.disk_type == DiskType::Fixed {
            return Err(VhdError::UnsupportedDiskType("Fixed"));
        }

        let bat_idx = (sector / self.sectors_per_block as u64) as usize;
        let entry = *self.bat.get(bat_idx).ok_or(VhdError::Bat(VhdBatError::InvalidBatIndex))?;
        if entry.0 == BAT_ENTRY_UNUSED {
            return Ok((bat_idx, entry, None));
        }

        let mut bitmap = vec![0u8; BITMAP_SIZE as usize];
        self.file
            .read_exact_at(&mut bitmap, (entry.0 as u64) << SECTOR_SHIFT)
            .map_err(VhdError::ReadData)?;
        Ok((bat_idx, entry, Some(bitmap)))
    }

    fn check_range(&self, sector: u64, nb_sectors: u32) -> Result<()> {
        let total = self.total_sectors();
        match sector.checked_add(nb_sectors as u64) {
            Some(end) if end <= total => Ok(()),
            _ => Err(VhdError::SectorOutOfRange(sector, total)),
        }
    }

    fn check_buffer(nb_sectors: u32, buf: &[u8]) -> Result<()> {
        if buf.len() != (nb_sectors as usize) << SECTOR_SHIFT {
            return Err(VhdError::InvalidBufferLength(buf.len(), nb_sectors));
        }
        Ok(())
    }

    /// Resolve the parent chain, verifying each parent's unique ID against
    /// the child's recorded linkage.
    pub fn build_parent_list(&mut self) -> Result<()> {
        if self.footer.disk_type != DiskType::Differencing || !self.parents.is_empty() {
            return Ok(());
        }

        let result = self.try_build_parent_list();
        if result.is_err() {
            self.parents.clear();
        }
        result
    }

    fn try_build_parent_list(&mut self) -> Result<()> {
        let mut seen = vec![self.footer.unique_id];

        loop {
            let (parent_path, expected_id) = {
                let current = self.parents.last().unwrap_or(self);
                let header = current.header.as_ref().ok_or(VhdError::NotDifferencing)?;
                (current.resolve_parent_path()?, header.parent_unique_id)
            };

            let parent = Vhd::open(&parent_path, true)?;
            if parent.footer.unique_id != expected_id {
                error!(
                    "parent linkage mismatch[{}|{}]",
                    expected_id, parent.footer.unique_id
                );
                return Err(VhdError::LinkageMismatch(expected_id, parent.footer.unique_id));
            }
            if seen.contains(&parent.footer.unique_id) {
                return Err(VhdError::ParentCycle);
            }
            seen.push(parent.footer.unique_id);

            let is_last = parent.footer.disk_type != DiskType::Differencing;
            self.parents.push(parent);
            if is_last {
                return Ok(());
            }
        }
    }

    fn resolve_parent_path(&self) -> Result<PathBuf> {
        if !self.parent_absolute_path.is_empty()
            && disk_util::path::exists(&self.parent_absolute_path)
        {
            return Ok(PathBuf::from(&self.parent_absolute_path));
        }

        if !self.parent_relative_path.is_empty() {
            if let Some(dir) = self.path.parent() {
                let candidate = dir.join(&self.parent_relative_path);
                if disk_util::path::exists(&candidate) {
                    return Ok(candidate);
                }
            }
            if disk_util::path::exists(&self.parent_relative_path) {
                return Ok(PathBuf::from(&self.parent_relative_path));
            }
        }

        error!(
            "cannot find parent by '{}' or '{}'",
            self.parent_absolute_path, self.parent_relative_path
        );
        Err(VhdError::ParentNotFound(
            self.parent_absolute_path.clone(),
            self.parent_relative_path.clone(),
        ))
    }

    fn translate(&self, sector: u64, nb_sectors: u32) -> SectorInfo {
        let mut si = SectorInfo::default();

        if self.footer.disk_type != DiskType::Fixed {
            si.bat_idx = (sector / self.sectors_per_block as u64) as usize;
            let block_offset = (sector % self.sectors_per_block as u64) as u32;

            si.sectors_avail = (self.sectors_per_block - block_offset).min(nb_sectors);
            si.bytes_avail = (si.sectors_avail as usize) << SECTOR_SHIFT;
            si.block_offset = (block_offset as u64) << SECTOR_SHIFT;

            let entry = self
                .bat
                .get(si.bat_idx)
                .map(|e| e.0)
                .unwrap_or(BAT_ENTRY_UNUSED);
            if entry != BAT_ENTRY_UNUSED {
                si.file_offset = ((entry as u64 + 1) << SECTOR_SHIFT) + si.block_offset;
            }
        } else {
            si.sectors_avail = nb_sectors.min((self.total_sectors() - sector) as u32);
            si.bytes_avail = (si.sectors_avail as usize) << SECTOR_SHIFT;
            si.block_offset = sector << SECTOR_SHIFT;
            si.file_offset = si.block_offset;
        }

        si
    }

    /// Read `nb_sectors` sectors starting at `sector`, mixing in parent
    /// content at sector granularity for differencing disks.
    pub fn read(&mut self, sector: u64, nb_sectors: u32, buf: &mut [u8]) -> Result<()> {
        self.check_range(sector, nb_sectors)?;
        Self::check_buffer(nb_sectors, buf)?;
        if self.footer.disk_type == DiskType::Differencing {
            self.build_parent_list()?;
        }

        self.read_recursion(0, sector, nb_sectors, buf)
    }

    fn disk_at(&self, level: usize) -> Option<&Vhd> {
        if level == 0 {
            Some(self)
        } else {
            self.parents.get(level - 1)
        }
    }

    fn read_recursion(
        &self,
        level: usize,
        mut sector: u64,
        mut nb_sectors: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        let current = match self.disk_at(level) {
            Some(disk) => disk,
            None => {
                // Chain exhausted, nothing below to supply content.
                buf.fill(0);
                return Ok(());
            }
        };

        let mut done = 0usize;
        while nb_sectors > 0 {
            let si = current.translate(sector, nb_sectors);
            let out = &mut buf[done..done + si.bytes_avail];

            if current.footer.disk_type == DiskType::Fixed {
                current
                    .file
                    .read_exact_at(out, si.file_offset)
                    .map_err(VhdError::ReadData)?;
            } else {
                let entry = *current
                    .bat
                    .get(si.bat_idx)
                    .ok_or(VhdError::Bat(VhdBatError::InvalidBatIndex))?;
                if entry.0 == BAT_ENTRY_UNUSED {
                    if current.footer.disk_type == DiskType::Differencing {
                        self.read_recursion(level + 1, sector, si.sectors_avail, out)?;
                    } else {
                        out.fill(0);
                    }
                } else {
                    self.read_present_block(level, current, &si, entry, sector, out)?;
                }
            }

            sector += si.sectors_avail as u64;
            nb_sectors -= si.sectors_avail;
            done += si.bytes_avail;
        }

        Ok(())
    }

    /// Walk the block bitmap and split the span into runs served locally
    /// and runs deferred to the parent (differencing) or zero-filled
    /// (dynamic). Runs are emitted in ascending sector order.
    fn read_present_block(
        &self,
        level: usize,
        current: &Vhd,
        si: &SectorInfo,
        entry: BatEntry,
        sector: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let bitmap_offset = (entry.0 as u64) << SECTOR_SHIFT;
        let mut bitmap = vec![0u8; BITMAP_SIZE as usize];
        current
            .file
            .read_exact_at(&mut bitmap, bitmap_offset)
            .map_err(VhdError::ReadData)?;

        let first_bit = (sector % SECTORS_PER_BITMAP as u64) as usize;

        let mut i = 0u32;
        while i < si.sectors_avail {
            let present = test_bit(&bitmap, first_bit + i as usize);
            let start = i;
            while i < si.sectors_avail && test_bit(&bitmap, first_bit + i as usize) == present {
                i += 1;
            }

            let run_sectors = i - start;
            let run_bytes = (run_sectors as usize) << SECTOR_SHIFT;
            let byte_start = (start as usize) << SECTOR_SHIFT;
            let out = &mut buf[byte_start..byte_start + run_bytes];

            if present {
                current
                    .file
                    .read_exact_at(out, si.file_offset + ((start as u64) << SECTOR_SHIFT))
                    .map_err(VhdError::ReadData)?;
            } else if current.footer.disk_type == DiskType::Differencing {
                self.read_recursion(level + 1, sector + start as u64, run_sectors, out)?;
            } else {
                out.fill(0);
            }
        }

        Ok(())
    }

    /// Write `nb_sectors` sectors starting at `sector`, allocating blocks
    /// and setting bitmap bits on first touch.
    pub fn write(&mut self, mut sector: u64, mut nb_sectors: u32, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(VhdError::NotPermitted);
        }
        self.check_range(sector, nb_sectors)?;
        Self::check_buffer(nb_sectors, buf)?;

        let table_offset = self.header.as_ref().map(|h| h.table_offset).unwrap_or(0);

        let mut done = 0usize;
        while nb_sectors > 0 {
            let mut si = self.translate(sector, nb_sectors);
            let data = &buf[done..done + si.bytes_avail];

            if self.footer.disk_type == DiskType::Fixed {
                self.file
                    .write_all_at(data, si.file_offset)
                    .map_err(VhdError::WriteData)?;
            } else {
                let old_entry = *self
                    .bat
                    .get(si.bat_idx)
                    .ok_or(VhdError::Bat(VhdBatError::InvalidBatIndex))?;
                let mut entry = old_entry;
                let mut bitmap = vec![0u8; BITMAP_SIZE as usize];
                let bitmap_offset;

                if entry.0 == BAT_ENTRY_UNUSED {
                    let new_offset = self.allocate_new_block()?;
                    bitmap_offset = new_offset;
                    entry = BatEntry((bitmap_offset >> SECTOR_SHIFT) as u32);
                    self.bat[si.bat_idx] = entry;
                    si.file_offset = bitmap_offset + BITMAP_SIZE as u64 + si.block_offset;
                } else {
                    bitmap_offset = (entry.0 as u64) << SECTOR_SHIFT;
                    self.file
                        .read_exact_at(&mut bitmap, bitmap_offset)
                        .map_err(VhdError::ReadData)?;
                }

                let first_bit = (sector % SECTORS_PER_BITMAP as u64) as usize;
                for i in 0..si.sectors_avail as usize {
                    set_bit(&mut bitmap, first_bit + i);
                }

                self.file
                    .write_all_at(data, si.file_offset)
                    .map_err(VhdError::WriteData)?;
                self.file
                    .write_all_at(&bitmap, bitmap_offset)
                    .map_err(VhdError::WriteData)?;

                if old_entry != entry {
                    BatEntry::write_bat_entry(&self.file, table_offset, si.bat_idx, entry)
                        .map_err(VhdError::Bat)?;
                }
            }

            sector += si.sectors_avail as u64;
            nb_sectors -= si.sectors_avail;
            done += si.bytes_avail;
        }

        Ok(())
    }

    /// Place a new block at the end of the file: 512-byte bitmap followed
    /// by the payload. The first allocation claims the trailing footer's
    /// sector, to be rewritten at close.
    fn allocate_new_block(&mut self) -> Result<u64> {
        let file_len = self.file.metadata().map_err(VhdError::FileAccess)?.len();

        let mut new_offset = if self.rewrite_footer {
            file_len
        } else {
            file_len - FOOTER_SIZE as u64
        };
        new_offset = disk_util::round_up(new_offset, SECTOR_SIZE as u64);

        self.file
            .set_len(new_offset + (BITMAP_SIZE + BLOCK_SIZE) as u64)
            .map_err(VhdError::ResizeFile)?;
        self.rewrite_footer = true;

        Ok(new_offset)
    }

    /// Overwrite the stored parent locator paths in place and rewrite the
    /// sparse header.
    pub fn modify_parent_locator(
        &mut self,
        parent_absolute_path: Option<&str>,
        parent_relative_path: Option<&str>,
    ) -> Result<()> {
        if self.read_only {
            return Err(VhdError::NotPermitted);
        }
        if self.footer.disk_type != DiskType::Differencing {
            return Err(VhdError::NotDifferencing);
        }

        let mut header = self.header.clone().ok_or(VhdError::NotDifferencing)?;

        for entry in header.parent_locator_entries.iter_mut() {
            if !entry.is_populated() {
                continue;
            }

            let new_path = if entry.platform_code == PLATFORM_CODE_W2RU {
                parent_relative_path
            } else if entry.platform_code == PLATFORM_CODE_W2KU {
                parent_absolute_path
            } else {
                None
            };

            let Some(new_path) = new_path else { continue };
            let encoded = disk_util::utf16::utf8_to_utf16le(new_path);
            if encoded.len() > entry.data_space as usize {
                return Err(VhdError::ParentPathTooLong);
            }

            let mut sector = vec![0u8; entry.data_space as usize];
            sector[..encoded.len()].copy_from_slice(&encoded);
            self.file
                .write_all_at(&sector, entry.data_offset)
                .map_err(VhdError::WriteData)?;
            entry.data_length = encoded.len() as u32;

            if entry.platform_code == PLATFORM_CODE_W2RU {
                self.parent_relative_path = new_path.to_string();
            } else {
                self.parent_absolute_path = new_path.to_string();
            }
        }

        let mut header_buf = [0u8; SPARSE_HEADER_SIZE];
        header.write_to(&mut header_buf);
        self.file
            .write_all_at(&header_buf, self.footer.data_offset)
            .map_err(VhdError::WriteData)?;
        self.header = Some(header);

        Ok(())
    }

    fn flush_trailing_footer(&mut self) -> Result<()> {
        if !self.rewrite_footer {
            return Ok(());
        }

        let file_len = self.file.metadata().map_err(VhdError::FileAccess)?.len();
        let mut footer_buf = [0u8; FOOTER_SIZE];
        self.footer.write_to(&mut footer_buf);
        self.file
            .write_all_at(&footer_buf, file_len)
            .map_err(VhdError::WriteData)?;
        self.file.sync_all().map_err(VhdError::FileAccess)?;
        self.rewrite_footer = false;

        Ok(())
    }

    /// Flush pending footer work and close the handle.
    pub fn close(mut self) -> Result<()> {
        self.flush_trailing_footer()
    }
}

impl Drop for Vhd {
    fn drop(&mut self) {
        if self.rewrite_footer {
            if let Err(e) = self.flush_trailing_footer() {
                error!("rewriting trailing footer of {} failed: {}", self.path.display(), e);
            }
        }
    }
}

fn read_footer(file: &File, file_len: u64, path: &Path) -> Result<Footer> {
    let mut buf = [0u8; FOOTER_SIZE];

    if file_len >= FOOTER_SIZE as u64 {
        file.read_exact_at(&mut buf, file_len - FOOTER_SIZE as u64)
            .map_err(VhdError::ReadData)?;
        match Footer::read_from(&buf) {
            Ok(footer) => return Ok(footer),
            Err(e) => warn!(
                "file {}: trailing footer invalid ({}), trying leading copy",
                path.display(),
                e
            ),
        }
    }

    file.read_exact_at(&mut buf, 0).map_err(VhdError::ReadData)?;
    Footer::read_from(&buf).map_err(VhdError::ParseFooter)
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_dynamic_write_read_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("d.vhd");
        Vhd::create_dynamic(&path, 2 * disk_util::MIB).unwrap();

        let mut disk = Vhd::open(&path, false).unwrap();
        let mut buf = vec![0xAAu8; 512];
        disk.read(0, 1, &mut buf).unwrap();
        assert_eq!(buf, vec![0u8; 512]);

        let data = pattern(512);
        disk.write(0, 1, &data).unwrap();
        disk.close().unwrap();

        let mut disk = Vhd::open(&path, true).unwrap();
        assert_ne!(disk.bat()[0].0, BAT_ENTRY_UNUSED);
        let mut buf = vec![0u8; 512];
        disk.read(0, 1, &mut buf).unwrap();
        assert_eq!(buf, data);

        let file_len = std::fs::metadata(&path).unwrap().len();
        assert!(file_len >= 1024 + 512 + 2 * disk_util::MIB + 512);
    }

    #[test]
    fn test_leading_and_trailing_footers_agree() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("d.vhd");
        Vhd::create_dynamic(&path, 2 * disk_util::MIB).unwrap();

        let mut disk = Vhd::open(&path, false).unwrap();
        disk.write(3, 1, &pattern(512)).unwrap();
        disk.close().unwrap();

        let file = File::open(&path).unwrap();
        let file_len = file.metadata().unwrap().len();
        let mut leading = [0u8; FOOTER_SIZE];
        let mut trailing = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut leading, 0).unwrap();
        file.read_exact_at(&mut trailing, file_len - FOOTER_SIZE as u64)
            .unwrap();
        assert_eq!(leading, trailing);
    }

    #[test]
    fn test_fixed_disk_read_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("f.vhd");
        Vhd::create_fixed(&path, 2 * disk_util::MIB).unwrap();

        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            2 * disk_util::MIB + FOOTER_SIZE as u64
        );

        let mut disk = Vhd::open(&path, false).unwrap();
        assert_eq!(disk.disk_type(), DiskType::Fixed);

        let mut buf = vec![0xFFu8; 512];
        disk.read(10, 1, &mut buf).unwrap();
        assert_eq!(buf, vec![0u8; 512]);

        let data = pattern(512);
        disk.write(10, 1, &data).unwrap();
        disk.read(10, 1, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_read_past_end_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("d.vhd");
        Vhd::create_dynamic(&path, 2 * disk_util::MIB).unwrap();

        let mut disk = Vhd::open(&path, true).unwrap();
        let total = disk.total_sectors();
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            disk.read(total, 1, &mut buf),
            Err(VhdError::SectorOutOfRange(..))
        ));
        // The last sector itself is fine.
        disk.read(total - 1, 1, &mut buf).unwrap();
    }

    #[test]
    fn test_write_crossing_block_boundary() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("d.vhd");
        Vhd::create_dynamic(&path, 8 * disk_util::MIB).unwrap();

        let mut disk = Vhd::open(&path, false).unwrap();
        let spb = BLOCK_SIZE >> SECTOR_SHIFT;
        let data = pattern(1024);
        disk.write(spb as u64 - 1, 2, &data).unwrap();

        let mut buf = vec![0u8; 1024];
        disk.read(spb as u64 - 1, 2, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_ne!(disk.bat()[0].0, BAT_ENTRY_UNUSED);
        assert_ne!(disk.bat()[1].0, BAT_ENTRY_UNUSED);
    }

    #[test]
    fn test_differencing_chain() {
        let tmp = TempDir::new().unwrap();
        let parent_path = tmp.as_path().join("p.vhd");
        let child_path = tmp.as_path().join("c.vhd");

        Vhd::create_dynamic(&parent_path, 4 * disk_util::MIB).unwrap();
        {
            let mut parent = Vhd::open(&parent_path, false).unwrap();
            let data = vec![0xA5u8; 8 * 512];
            parent.write(0, 8, &data).unwrap();
            parent.close().unwrap();
        }

        Vhd::create_differencing(&child_path, &parent_path, None, None).unwrap();
        let mut child = Vhd::open(&child_path, false).unwrap();
        assert_eq!(child.disk_type(), DiskType::Differencing);
        assert_eq!(child.disk_size(), 4 * disk_util::MIB);

        // Unwritten in the child, present in the parent.
        let mut buf = vec![0u8; 8 * 512];
        child.read(0, 8, &mut buf).unwrap();
        assert_eq!(buf, vec![0xA5u8; 8 * 512]);

        // Overwrite one sector in the child; the rest still comes from the
        // parent.
        let data = vec![0x5Au8; 512];
        child.write(0, 1, &data).unwrap();
        child.read(0, 8, &mut buf).unwrap();
        assert_eq!(&buf[..512], &data[..]);
        assert_eq!(&buf[512..], &vec![0xA5u8; 7 * 512][..]);

        // Only the written sector's bit is set in the child's bitmap.
        let (_, entry, bitmap) = child.bat_entry_bitmap(0).unwrap();
        assert_ne!(entry.0, BAT_ENTRY_UNUSED);
        let bitmap = bitmap.unwrap();
        assert!(test_bit(&bitmap, 0));
        assert!(!test_bit(&bitmap, 1));

        // Untouched anywhere in the chain reads as zeros.
        let mut far = vec![0xEEu8; 512];
        child.read(5000, 1, &mut far).unwrap();
        assert_eq!(far, vec![0u8; 512]);
    }

    #[test]
    fn test_linkage_mismatch_detected() {
        let tmp = TempDir::new().unwrap();
        let parent_path = tmp.as_path().join("p.vhd");
        let child_path = tmp.as_path().join("c.vhd");

        Vhd::create_dynamic(&parent_path, 2 * disk_util::MIB).unwrap();
        Vhd::create_differencing(&child_path, &parent_path, None, None).unwrap();

        // Replace the parent with a new image: unique ID changes.
        std::fs::remove_file(&parent_path).unwrap();
        Vhd::create_dynamic(&parent_path, 2 * disk_util::MIB).unwrap();

        let mut child = Vhd::open(&child_path, true).unwrap();
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            child.read(0, 1, &mut buf),
            Err(VhdError::LinkageMismatch(..))
        ));
    }

    #[test]
    fn test_empty_disk_resets() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("d.vhd");
        Vhd::create_dynamic(&path, 2 * disk_util::MIB).unwrap();

        {
            let mut disk = Vhd::open(&path, false).unwrap();
            disk.write(0, 4, &pattern(4 * 512)).unwrap();
            disk.close().unwrap();
        }

        Vhd::empty_disk(&path).unwrap();

        let mut disk = Vhd::open(&path, true).unwrap();
        assert!(disk.bat().iter().all(|e| e.0 == BAT_ENTRY_UNUSED));
        let mut buf = vec![0xBBu8; 512];
        disk.read(0, 1, &mut buf).unwrap();
        assert_eq!(buf, vec![0u8; 512]);

        let header = disk.sparse_header().unwrap();
        let expected_len = header.table_offset
            + BatEntry::table_bytes(header.max_table_entries)
            + FOOTER_SIZE as u64;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected_len);
    }

    #[test]
    fn test_modify_parent_locator() {
        let tmp = TempDir::new().unwrap();
        let parent_path = tmp.as_path().join("p.vhd");
        let child_path = tmp.as_path().join("c.vhd");

        Vhd::create_dynamic(&parent_path, 2 * disk_util::MIB).unwrap();
        Vhd::create_differencing(&child_path, &parent_path, None, None).unwrap();

        {
            let mut child = Vhd::open(&child_path, false).unwrap();
            child
                .modify_parent_locator(Some("/nonexistent/p.vhd"), Some("./p.vhd"))
                .unwrap();
        }

        let mut child = Vhd::open(&child_path, true).unwrap();
        assert_eq!(child.parent_absolute_path(), "/nonexistent/p.vhd");
        assert_eq!(child.parent_relative_path(), "./p.vhd");

        // The absolute path is gone but the relative one still resolves.
        let mut buf = vec![0u8; 512];
        child.read(0, 1, &mut buf).unwrap();
    }
}
