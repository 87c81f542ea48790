// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use disk_util::{guid, MIB, MIB_SHIFT};
use log::{error, warn};
use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

use crate::vhdx_bat::{BatEntry, BitmapStatus, PayloadStatus, VhdxBatError};
use crate::vhdx_header::{
    HeaderSection, VhdxHeaderError, BAT_REGION_START, METADATA_REGION_START,
};
use crate::vhdx_io::{self, SectorInfo};
use crate::vhdx_log::{LogSection, VhdxLogError};
use crate::vhdx_metadata::{DiskSpec, DiskType, VhdxMetadataError};

#[sorted]
#[derive(Error, Debug)]
pub enum VhdxError {
    #[error("BAT access failed: {0}")]
    Bat(#[source] VhdxBatError),
    #[error("failed to access file: {0}")]
    FileAccess(#[source] io::Error),
    #[error("failed to parse VHDx header section: {0}")]
    Header(#[source] VhdxHeaderError),
    #[error("buffer length {0} does not match {1} sectors")]
    InvalidBufferLength(usize, u32),
    #[error("parent linkage mismatch[{0}|{1}]")]
    LinkageMismatch(String, String),
    #[error("log operation failed: {0}")]
    Log(#[source] VhdxLogError),
    #[error("failed to parse VHDx metadata: {0}")]
    Metadata(#[source] VhdxMetadataError),
    #[error("disk is not a differencing disk")]
    NotDifferencing,
    #[error("disk is opened read-only")]
    NotPermitted,
    #[error("parent chain contains a cycle")]
    ParentCycle,
    #[error("cannot find parent by '{0}' or '{1}'")]
    ParentNotFound(String, String),
    #[error("failed reading sector from disk: {0}")]
    ReadFailed(#[source] io::Error),
    #[error("failed changing file length: {0}")]
    ResizeFile(#[source] io::Error),
    #[error("sector {0} out of range, disk has {1} sectors")]
    SectorOutOfRange(u64, u64),
    #[error("failed writing to sector on disk: {0}")]
    WriteFailed(#[source] io::Error),
    #[error("write file offset {0} falls into the header section")]
    WriteFileOffsetTooSmall(u64),
}

pub type Result<T> = std::result::Result<T, VhdxError>;

/// A VHDX disk image handle. Owns the file descriptor, the parsed header
/// and metadata sections, the in-memory BAT, the log ring state and, once
/// a differencing read or write resolves them, the chain of read-only
/// parent handles.
#[derive(Debug)]
pub struct Vhdx {
    file: File,
    path: PathBuf,
    read_only: bool,
    header_section: HeaderSection,
    log: LogSection,
    disk_spec: DiskSpec,
    bat: Vec<BatEntry>,
    parents: Vec<Vhdx>,
}

impl Vhdx {
    /// Open and parse an image. The log is replayed (read-write handles
    /// only) before the metadata and BAT are loaded.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Vhdx> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(VhdxError::FileAccess)?;

        let mut header_section =
            HeaderSection::parse(&file, read_only).map_err(VhdxError::Header)?;

        let mut log = LogSection::new(header_section.log_offset(), header_section.log_length());
        log.parse(&file, &mut header_section, read_only)
            .map_err(VhdxError::Log)?;

        let disk_spec =
            DiskSpec::parse(&file, header_section.mdr_entry()).map_err(VhdxError::Metadata)?;
        let bat = BatEntry::collect_bat_entries(&file, &disk_spec, header_section.bat_entry())
            .map_err(VhdxError::Bat)?;

        Ok(Vhdx {
            file,
            path,
            read_only,
            header_section,
            log,
            disk_spec,
            bat,
            parents: Vec::new(),
        })
    }

    pub fn create_fixed<P: AsRef<Path>>(path: P, size: u64) -> Result<()> {
        Vhdx::create_image(path.as_ref(), None, size, true, None, None)
    }

    pub fn create_dynamic<P: AsRef<Path>>(path: P, size: u64) -> Result<()> {
        Vhdx::create_image(path.as_ref(), None, size, false, None, None)
    }

    pub fn create_differencing<P: AsRef<Path>, Q: AsRef<Path>>(
        path: P,
        parent_path: Q,
        parent_absolute_path: Option<&str>,
        parent_relative_path: Option<&str>,
    ) -> Result<()> {
        Vhdx::create_image(
            path.as_ref(),
            Some(parent_path.as_ref()),
            0,
            false,
            parent_absolute_path,
            parent_relative_path,
        )
    }

    fn create_image(
        path: &Path,
        parent_path: Option<&Path>,
        size: u64,
        is_fixed: bool,
        parent_absolute_path: Option<&str>,
        parent_relative_path: Option<&str>,
    ) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(VhdxError::FileAccess)?;

        let result = Vhdx::write_new_image(
            &file,
            path,
            parent_path,
            size,
            is_fixed,
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
        is_fixed: bool,
        parent_absolute_path: Option<&str>,
        parent_relative_path: Option<&str>,
    ) -> Result<()> {
        let mut round_size = disk_util::round_up(size, MIB);

        let mut spec = if let Some(parent_path) = parent_path {
            // A differencing child inherits its geometry from the parent
            // and links against the parent's data write GUID.
            let parent = Vhdx::open(parent_path, true)?;
            round_size = parent.disk_spec.virtual_disk_size;

            let mut spec = DiskSpec::new_for_create(
                DiskType::Differencing,
                round_size,
                parent.disk_spec.block_size,
                parent.disk_spec.logical_sector_size,
                parent.disk_spec.physical_sector_size,
            )
            .map_err(VhdxError::Metadata)?;

            let abs_path = match parent_absolute_path {
                Some(p) => p.to_string(),
                None => disk_util::path::absolute_path(parent_path)
                    .map_err(VhdxError::FileAccess)?
                    .to_string_lossy()
                    .into_owned(),
            };
            let rel_path = match parent_relative_path {
                Some(p) => p.to_string(),
                None => match disk_util::path::relative_path_to(path, parent_path) {
                    Ok(p) => p.to_string_lossy().into_owned(),
                    Err(e) => {
                        warn!(
                            "computing relative path to {} failed: {}",
                            parent_path.display(),
                            e
                        );
                        String::new()
                    }
                },
            };

            spec.init_parent_locator(
                &parent.header_section.data_write_guid(),
                &abs_path,
                &rel_path,
            );
            spec
        } else {
            let disk_type = if is_fixed {
                DiskType::Fixed
            } else {
                DiskType::Dynamic
            };
            DiskSpec::new_for_create(disk_type, round_size, 0, 0, 0).map_err(VhdxError::Metadata)?
        };

        let bat_occupy_bytes = spec.bat_occupy_bytes();

        let mut header_section = HeaderSection::init_content(bat_occupy_bytes as u32);
        header_section
            .write_content(file)
            .map_err(VhdxError::Header)?;

        let file_payload_mb =
            (bat_occupy_bytes >> MIB_SHIFT) + if is_fixed { round_size >> MIB_SHIFT } else { 0 };
        LogSection::write_initial_entry(file, file_payload_mb).map_err(VhdxError::Log)?;

        spec.write_content(file, METADATA_REGION_START)
            .map_err(VhdxError::Metadata)?;

        // Init and write the BAT; fixed disks prefill every payload entry.
        let mut bat = vec![BatEntry::default(); spec.total_bat_count as usize];
        if is_fixed {
            let mut payload_offset = BAT_REGION_START + bat_occupy_bytes;
            for block in 0..spec.data_block_count as u64 {
                let bat_idx = (block + (block >> spec.chunk_ratio_bits)) as usize;
                bat[bat_idx] = BatEntry::new_payload(PayloadStatus::FullPresent, payload_offset);
                payload_offset += spec.block_size as u64;
            }
        }
        BatEntry::write_bat_entries(file, BAT_REGION_START, &bat).map_err(VhdxError::Bat)?;

        let mut file_size = BAT_REGION_START + bat_occupy_bytes;
        if is_fixed {
            file_size += round_size;
        }
        file.set_len(file_size).map_err(VhdxError::ResizeFile)?;

        file.sync_all().map_err(VhdxError::FileAccess)
    }

    pub fn disk_type(&self) -> DiskType {
        self.disk_spec.disk_type
    }

    pub fn disk_size(&self) -> u64 {
        self.disk_spec.virtual_disk_size
    }

    pub fn total_sectors(&self) -> u64 {
        self.disk_spec.total_sectors()
    }

    pub fn disk_spec(&self) -> &DiskSpec {
        &self.disk_spec
    }

    pub fn header_section(&self) -> &HeaderSection {
        &self.header_section
    }

    pub fn data_write_guid(&self) -> Uuid {
        self.header_section.data_write_guid()
    }

    pub fn bat(&self) -> &[BatEntry] {
        &self.bat
    }

    pub fn parents(&self) -> &[Vhdx] {
        &self.parents
    }

    fn check_range(&self, sector: u64, nb_sectors: u32) -> Result<()> {
        let total = self.total_sectors();
        match sector.checked_add(nb_sectors as u64) {
            Some(end) if end <= total => Ok(()),
            _ => Err(VhdxError::SectorOutOfRange(sector, total)),
        }
    }

    fn check_buffer(&self, nb_sectors: u32, buf: &[u8]) -> Result<()> {
        if buf.len() != (nb_sectors as usize) << self.disk_spec.logical_sector_size_bits {
            return Err(VhdxError::InvalidBufferLength(buf.len(), nb_sectors));
        }
        Ok(())
    }

    fn bat_entry_at(bat: &[BatEntry], index: usize) -> Result<BatEntry> {
        bat.get(index)
            .copied()
            .ok_or(VhdxError::Bat(VhdxBatError::InvalidBatIndex))
    }

    /// Resolve the parent chain, verifying each parent's data write GUID
    /// against the child's recorded linkage.
    pub fn build_parent_list(&mut self) -> Result<()> {
        if self.disk_spec.disk_type != DiskType::Differencing || !self.parents.is_empty() {
            return Ok(());
        }

        let result = self.try_build_parent_list();
        if result.is_err() {
            self.parents.clear();
        }
        result
    }

    fn try_build_parent_list(&mut self) -> Result<()> {
        let mut seen = vec![self.disk_spec.disk_id];

        loop {
            let (parent_path, linkage) = {
                let current = self.parents.last().unwrap_or(self);
                let linkage = current
                    .disk_spec
                    .parent_linkage()
                    .map(str::to_string)
                    .ok_or(VhdxError::NotDifferencing)?;
                (current.resolve_parent_path()?, linkage)
            };

            let parent = Vhdx::open(&parent_path, true)?;
            let parent_guid = parent.header_section.data_write_guid();
            if !guid::linkage_matches(&linkage, &parent_guid) {
                error!("linkage mismatch[{}|{}]", linkage, parent_guid);
                return Err(VhdxError::LinkageMismatch(linkage, parent_guid.to_string()));
            }
            if seen.contains(&parent.disk_spec.disk_id) {
                return Err(VhdxError::ParentCycle);
            }
            seen.push(parent.disk_spec.disk_id);

            let is_last = parent.disk_spec.disk_type != DiskType::Differencing;
            self.parents.push(parent);
            if is_last {
                return Ok(());
            }
        }
    }

    fn resolve_parent_path(&self) -> Result<PathBuf> {
        let abs = self.disk_spec.parent_absolute_win32_path().unwrap_or("");
        let rel = self.disk_spec.parent_relative_path().unwrap_or("");

        if !abs.is_empty() && disk_util::path::exists(abs) {
            return Ok(PathBuf::from(abs));
        }

        if !rel.is_empty() {
            if let Some(dir) = self.path.parent() {
                let candidate = dir.join(rel);
                if disk_util::path::exists(&candidate) {
                    return Ok(candidate);
                }
            }
            if disk_util::path::exists(rel) {
                return Ok(PathBuf::from(rel));
            }
        }

        error!("cannot find parent by '{}' or '{}'", abs, rel);
        Err(VhdxError::ParentNotFound(abs.to_string(), rel.to_string()))
    }

    /// Read `nb_sectors` sectors starting at `sector`, mixing in parent
    /// content at sector granularity for differencing disks.
    pub fn read(&mut self, sector: u64, nb_sectors: u32, buf: &mut [u8]) -> Result<()> {
        self.check_range(sector, nb_sectors)?;
        self.check_buffer(nb_sectors, buf)?;
        if self.disk_spec.disk_type == DiskType::Differencing {
            self.build_parent_list()?;
        }

        self.read_recursion(0, sector, nb_sectors, buf)
    }

    fn disk_at(&self, level: usize) -> Option<&Vhdx> {
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
            let si = SectorInfo::new(&current.disk_spec, &current.bat, sector, nb_sectors);
            let out = &mut buf[done..done + si.bytes_avail];
            let entry = Vhdx::bat_entry_at(&current.bat, si.bat_idx)?;

            match entry.payload_status().map_err(VhdxError::Bat)? {
                PayloadStatus::NotPresent
                | PayloadStatus::Undefined
                | PayloadStatus::Unmapped
                | PayloadStatus::Zero => {
                    if current.disk_spec.disk_type == DiskType::Differencing {
                        self.read_recursion(level + 1, sector, si.sectors_avail, out)?;
                    } else {
                        out.fill(0);
                    }
                }
                PayloadStatus::FullPresent => {
                    current
                        .file
                        .read_exact_at(out, si.file_offset)
                        .map_err(VhdxError::ReadFailed)?;
                }
                PayloadStatus::PartiallyPresent => {
                    self.read_partially_present(level, current, &si, sector, out)?;
                }
            }

            sector += si.sectors_avail as u64;
            nb_sectors -= si.sectors_avail;
            done += si.bytes_avail;
        }

        Ok(())
    }

    /// Walk the relevant byte range of the block's sector bitmap and split
    /// the span into runs served locally and runs deferred to the parent.
    /// Runs are emitted in ascending sector order, each byte exactly once.
    fn read_partially_present(
        &self,
        level: usize,
        current: &Vhdx,
        si: &SectorInfo,
        sector: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let bitmap_entry = Vhdx::bat_entry_at(&current.bat, si.bitmap_idx)?;
        let status = bitmap_entry.bitmap_status().map_err(VhdxError::Bat)?;
        if status != BitmapStatus::Present || bitmap_entry.file_offset() == 0 {
            return Err(VhdxError::Bat(VhdxBatError::InvalidBatEntryState(
                bitmap_entry.0 & crate::vhdx_bat::BAT_STATE_BIT_MASK,
            )));
        }

        let (byte_offset, first_bit, bytes) = vhdx_io::bitmap_byte_range(sector, si.sectors_avail);
        let mut bitmap = vec![0u8; bytes];
        current
            .file
            .read_exact_at(&mut bitmap, bitmap_entry.file_offset() + byte_offset)
            .map_err(VhdxError::ReadFailed)?;

        let lss_bits = current.disk_spec.logical_sector_size_bits;
        let mut i = 0u32;
        while i < si.sectors_avail {
            let present = vhdx_io::test_bit(&bitmap, first_bit + i as usize);
            let start = i;
            while i < si.sectors_avail
                && vhdx_io::test_bit(&bitmap, first_bit + i as usize) == present
            {
                i += 1;
            }

            let run_sectors = i - start;
            let byte_start = (start as usize) << lss_bits;
            let run_bytes = (run_sectors as usize) << lss_bits;
            let out = &mut buf[byte_start..byte_start + run_bytes];

            if present {
                current
                    .file
                    .read_exact_at(out, si.file_offset + ((start as u64) << lss_bits))
                    .map_err(VhdxError::ReadFailed)?;
            } else {
                self.read_recursion(level + 1, sector + start as u64, run_sectors, out)?;
            }
        }

        Ok(())
    }

    /// Write `nb_sectors` sectors starting at `sector`. Blocks are
    /// allocated on first touch; BAT and bitmap changes are made durable
    /// through the log.
    pub fn write(&mut self, mut sector: u64, mut nb_sectors: u32, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(VhdxError::NotPermitted);
        }
        self.check_range(sector, nb_sectors)?;
        self.check_buffer(nb_sectors, buf)?;

        self.header_section
            .user_visible_write(&self.file)
            .map_err(VhdxError::Header)?;

        if self.disk_spec.disk_type == DiskType::Differencing {
            self.build_parent_list()?;
        }

        let bat_region_offset = self.header_section.bat_entry().file_offset;

        let mut done = 0usize;
        while nb_sectors > 0 {
            let mut si = SectorInfo::new(&self.disk_spec, &self.bat, sector, nb_sectors);
            let data = &buf[done..done + si.bytes_avail];
            let prior_entry = Vhdx::bat_entry_at(&self.bat, si.bat_idx)?;
            let status = prior_entry.payload_status().map_err(VhdxError::Bat)?;

            let mut bat_update = false;
            let mut bitmap_bat_update = false;
            let mut bitmap_update: Option<(u64, Vec<u8>)> = None;

            match status {
                PayloadStatus::Zero
                | PayloadStatus::NotPresent
                | PayloadStatus::Undefined
                | PayloadStatus::Unmapped => {
                    let parent_already_alloc = self.disk_spec.disk_type == DiskType::Differencing
                        && self.is_parent_already_alloc_block(si.bat_idx);

                    let (block_offset, bitmap_offset) =
                        self.allocate_block(parent_already_alloc)?;

                    // Once a parent holds the block, the new copy is only
                    // partially present and needs its own sector bitmap.
                    if parent_already_alloc {
                        self.bat[si.bat_idx] = BatEntry::new_payload(
                            PayloadStatus::PartiallyPresent,
                            block_offset,
                        );
                        self.bat[si.bitmap_idx] =
                            BatEntry::new_bitmap(BitmapStatus::Present, bitmap_offset);
                        bitmap_bat_update = true;
                    } else {
                        self.bat[si.bat_idx] =
                            BatEntry::new_payload(PayloadStatus::FullPresent, block_offset);
                    }
                    bat_update = true;

                    si.file_offset = block_offset + si.block_offset;
                    if let Err(e) = self.write_payload(data, si.file_offset) {
                        self.bat[si.bat_idx] = prior_entry;
                        if bitmap_bat_update {
                            self.bat[si.bitmap_idx] = BatEntry::default();
                        }
                        return Err(e);
                    }

                    if parent_already_alloc {
                        bitmap_update =
                            Some(self.modify_partial_bitmap(bitmap_offset, sector, si.sectors_avail)?);
                    }
                }
                PayloadStatus::FullPresent => {
                    self.write_payload(data, si.file_offset)?;
                }
                PayloadStatus::PartiallyPresent => {
                    si.file_offset = prior_entry.file_offset() + si.block_offset;

                    let bitmap_entry = Vhdx::bat_entry_at(&self.bat, si.bitmap_idx)?;
                    if bitmap_entry.bitmap_status().map_err(VhdxError::Bat)?
                        != BitmapStatus::Present
                    {
                        return Err(VhdxError::Bat(VhdxBatError::InvalidBatEntryState(
                            bitmap_entry.0 & crate::vhdx_bat::BAT_STATE_BIT_MASK,
                        )));
                    }

                    self.write_payload(data, si.file_offset)?;
                    bitmap_update = Some(self.modify_partial_bitmap(
                        bitmap_entry.file_offset(),
                        sector,
                        si.sectors_avail,
                    )?);
                }
            }

            // Persist the BAT entry and any bitmap bytes through the log.
            if bat_update {
                let offset = BatEntry::entry_offset(bat_region_offset, si.bat_idx);
                let bytes = self.bat[si.bat_idx].to_le_bytes();
                self.log
                    .write_entry_and_flush(&self.file, &mut self.header_section, offset, &bytes)
                    .map_err(VhdxError::Log)?;
            }
            if let Some((offset, bytes)) = bitmap_update {
                self.log
                    .write_entry_and_flush(&self.file, &mut self.header_section, offset, &bytes)
                    .map_err(VhdxError::Log)?;
            }
            if bitmap_bat_update {
                let offset = BatEntry::entry_offset(bat_region_offset, si.bitmap_idx);
                let bytes = self.bat[si.bitmap_idx].to_le_bytes();
                self.log
                    .write_entry_and_flush(&self.file, &mut self.header_section, offset, &bytes)
                    .map_err(VhdxError::Log)?;
            }

            sector += si.sectors_avail as u64;
            nb_sectors -= si.sectors_avail;
            done += si.bytes_avail;
        }

        Ok(())
    }

    fn write_payload(&self, data: &[u8], file_offset: u64) -> Result<()> {
        // A payload address inside the header zone means the BAT is wrong.
        if file_offset < MIB {
            return Err(VhdxError::WriteFileOffsetTooSmall(file_offset));
        }
        self.file
            .write_all_at(data, file_offset)
            .map_err(VhdxError::WriteFailed)
    }

    /// Whether any parent holds payload for the block at `bat_idx`.
    fn is_parent_already_alloc_block(&self, bat_idx: usize) -> bool {
        self.parents.iter().any(|parent| {
            matches!(
                parent.bat.get(bat_idx).map(BatEntry::payload_status),
                Some(Ok(PayloadStatus::FullPresent | PayloadStatus::PartiallyPresent))
            )
        })
    }

    /// Append a block (and optionally a 1 MiB sector bitmap region in
    /// front of it) at the end of the file, rounded up to 1 MiB. The
    /// truncation provides the zero fill.
    fn allocate_block(&self, with_bitmap: bool) -> Result<(u64, u64)> {
        let file_len = self
            .file
            .metadata()
            .map_err(VhdxError::FileAccess)?
            .len();

        let mut new_offset = disk_util::round_up(file_len, MIB);
        let mut bitmap_offset = 0;
        if with_bitmap {
            bitmap_offset = new_offset;
            new_offset += MIB;
        }

        self.file
            .set_len(new_offset + self.disk_spec.block_size as u64)
            .map_err(VhdxError::ResizeFile)?;

        Ok((new_offset, bitmap_offset))
    }

    /// Read-modify the affected byte range of a sector bitmap, setting the
    /// bits for the written sectors. Returns the absolute file offset and
    /// the bytes to be persisted through the log.
    fn modify_partial_bitmap(
        &self,
        bitmap_region_offset: u64,
        sector: u64,
        nb_sectors: u32,
    ) -> Result<(u64, Vec<u8>)> {
        let (byte_offset, first_bit, bytes) = vhdx_io::bitmap_byte_range(sector, nb_sectors);
        let offset = bitmap_region_offset + byte_offset;

        let mut bitmap = vec![0u8; bytes];
        self.file
            .read_exact_at(&mut bitmap, offset)
            .map_err(VhdxError::ReadFailed)?;

        for i in 0..nb_sectors as usize {
            vhdx_io::set_bit(&mut bitmap, first_bit + i);
        }

        Ok((offset, bitmap))
    }

    /// Re-emit the parent locator in place at its existing metadata
    /// offset.
    pub fn modify_parent_locator(
        &mut self,
        parent_absolute_path: Option<&str>,
        parent_relative_path: Option<&str>,
    ) -> Result<()> {
        if self.read_only {
            return Err(VhdxError::NotPermitted);
        }
        if self.disk_spec.disk_type != DiskType::Differencing {
            return Err(VhdxError::NotDifferencing);
        }

        let metadata_offset = self.header_section.mdr_entry().file_offset;
        self.disk_spec
            .modify_parent_locator(
                &self.file,
                metadata_offset,
                parent_absolute_path,
                parent_relative_path,
            )
            .map_err(VhdxError::Metadata)
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempdir::TempDir;

    use crate::vhdx_header::{HeaderSection, HEADER_1_START};
    use crate::vhdx_log::LogSection;

    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_dynamic_geometry_and_write_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("d.vhdx");
        Vhdx::create_dynamic(&path, 32 * MIB).unwrap();

        let mut disk = Vhdx::open(&path, false).unwrap();
        assert_eq!(disk.disk_type(), DiskType::Dynamic);
        assert_eq!(disk.disk_spec().block_size, 8 * MIB as u32);
        assert_eq!(disk.disk_spec().sectors_per_block, 16384);
        assert_eq!(disk.disk_spec().chunk_ratio, 512);
        assert_eq!(disk.disk_spec().data_block_count, 4);
        assert_eq!(disk.disk_spec().total_bat_count, 4);
        assert_eq!(
            disk.bat()[0].payload_status().unwrap(),
            PayloadStatus::NotPresent
        );

        let data = pattern(8 * 512);
        disk.write(0, 8, &data).unwrap();

        assert_eq!(
            disk.bat()[0].payload_status().unwrap(),
            PayloadStatus::FullPresent
        );
        // The replay-and-reset cycle leaves the log empty.
        assert!(disk.header_section().log_guid().is_nil());

        let mut buf = vec![0xEEu8; 16384 * 512];
        disk.read(0, 16384, &mut buf).unwrap();
        assert_eq!(&buf[..8 * 512], &data[..]);
        assert_eq!(&buf[8 * 512..], &vec![0u8; (16384 - 8) * 512][..]);

        // Reopen: the BAT change survived through the log persistence.
        drop(disk);
        let mut disk = Vhdx::open(&path, true).unwrap();
        assert_eq!(
            disk.bat()[0].payload_status().unwrap(),
            PayloadStatus::FullPresent
        );
        let mut buf = vec![0u8; 8 * 512];
        disk.read(0, 8, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_fixed_disk_prefilled() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("f.vhdx");
        Vhdx::create_fixed(&path, 16 * MIB).unwrap();

        let mut disk = Vhdx::open(&path, false).unwrap();
        assert_eq!(disk.disk_type(), DiskType::Fixed);
        for entry in disk.bat() {
            assert_eq!(entry.payload_status().unwrap(), PayloadStatus::FullPresent);
            assert_ne!(entry.file_offset(), 0);
        }

        let mut buf = vec![0xAAu8; 512];
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
        let path = tmp.as_path().join("d.vhdx");
        Vhdx::create_dynamic(&path, 32 * MIB).unwrap();

        let mut disk = Vhdx::open(&path, true).unwrap();
        let total = disk.total_sectors();
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            disk.read(total, 1, &mut buf),
            Err(VhdxError::SectorOutOfRange(..))
        ));
        disk.read(total - 1, 1, &mut buf).unwrap();
    }

    #[test]
    fn test_write_on_read_only_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("d.vhdx");
        Vhdx::create_dynamic(&path, 32 * MIB).unwrap();

        let mut disk = Vhdx::open(&path, true).unwrap();
        assert!(matches!(
            disk.write(0, 1, &pattern(512)),
            Err(VhdxError::NotPermitted)
        ));
    }

    #[test]
    fn test_write_crossing_chunk_boundary() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("big.vhdx");
        // 8 GiB with 8 MiB blocks: 1024 data blocks, one interleaved
        // bitmap slot after the first 512 payload entries.
        Vhdx::create_dynamic(&path, 8 * disk_util::GIB).unwrap();

        let mut disk = Vhdx::open(&path, false).unwrap();
        assert_eq!(disk.disk_spec().data_block_count, 1024);
        assert_eq!(disk.disk_spec().total_bat_count, 1025);

        let spb = disk.disk_spec().sectors_per_block as u64;
        let boundary = 512 * spb;
        let data = pattern(2 * 512);
        disk.write(boundary - 1, 2, &data).unwrap();

        let mut buf = vec![0u8; 2 * 512];
        disk.read(boundary - 1, 2, &mut buf).unwrap();
        assert_eq!(buf, data);

        // Payload entries land at 511 and 513; index 512 stays a bitmap
        // slot.
        assert_eq!(
            disk.bat()[511].payload_status().unwrap(),
            PayloadStatus::FullPresent
        );
        assert_eq!(
            disk.bat()[513].payload_status().unwrap(),
            PayloadStatus::FullPresent
        );
        assert_eq!(disk.bat()[512].0, 0);
    }

    #[test]
    fn test_write_into_zero_status_block() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("d.vhdx");
        Vhdx::create_dynamic(&path, 32 * MIB).unwrap();

        let mut disk = Vhdx::open(&path, false).unwrap();
        disk.bat[1] = BatEntry::new_payload(PayloadStatus::Zero, 0);

        let spb = disk.disk_spec().sectors_per_block as u64;
        let data = pattern(512);
        disk.write(spb, 1, &data).unwrap();

        assert_eq!(
            disk.bat()[1].payload_status().unwrap(),
            PayloadStatus::FullPresent
        );

        // The written sector carries the data, the rest of the freshly
        // allocated block reads back as zeros.
        let mut buf = vec![0xEEu8; 2 * 512];
        disk.read(spb, 2, &mut buf).unwrap();
        assert_eq!(&buf[..512], &data[..]);
        assert_eq!(&buf[512..], &vec![0u8; 512][..]);
    }

    #[test]
    fn test_differencing_chain_with_bitmap() {
        let tmp = TempDir::new().unwrap();
        let parent_path = tmp.as_path().join("p.vhdx");
        let child_path = tmp.as_path().join("c.vhdx");

        Vhdx::create_dynamic(&parent_path, 32 * MIB).unwrap();
        {
            let mut parent = Vhdx::open(&parent_path, false).unwrap();
            parent.write(0, 8, &vec![0xA5u8; 8 * 512]).unwrap();
        }

        Vhdx::create_differencing(&child_path, &parent_path, None, None).unwrap();
        let mut child = Vhdx::open(&child_path, false).unwrap();
        assert_eq!(child.disk_type(), DiskType::Differencing);
        assert_eq!(child.disk_size(), 32 * MIB);
        assert_eq!(child.disk_spec().total_bat_count, 513);

        // Unwritten in the child, present in the parent.
        let mut buf = vec![0u8; 8 * 512];
        child.read(0, 8, &mut buf).unwrap();
        assert_eq!(buf, vec![0xA5u8; 8 * 512]);

        // Write one sector into the child: the block becomes partially
        // present with a freshly allocated bitmap region.
        let data = vec![0x5Au8; 512];
        child.write(0, 1, &data).unwrap();

        assert_eq!(
            child.bat()[0].payload_status().unwrap(),
            PayloadStatus::PartiallyPresent
        );
        let bitmap_idx = child.disk_spec().chunk_ratio as usize;
        let bitmap_entry = child.bat()[bitmap_idx];
        assert_eq!(bitmap_entry.bitmap_status().unwrap(), BitmapStatus::Present);
        assert_eq!(bitmap_entry.file_offset() % MIB, 0);
        assert_ne!(bitmap_entry.file_offset(), 0);

        // Only the bit for sector 0 is set.
        let mut bitmap = vec![0u8; 1];
        child
            .file
            .read_exact_at(&mut bitmap, bitmap_entry.file_offset())
            .unwrap();
        assert_eq!(bitmap[0], 0x80);

        child.read(0, 8, &mut buf).unwrap();
        assert_eq!(&buf[..512], &data[..]);
        assert_eq!(&buf[512..], &vec![0xA5u8; 7 * 512][..]);

        // A sector present nowhere in the chain reads as zeros.
        let mut far = vec![0xEEu8; 512];
        child.read(40000, 1, &mut far).unwrap();
        assert_eq!(far, vec![0u8; 512]);

        // Reopen and verify persistence of both BAT entries and bitmap.
        drop(child);
        let mut child = Vhdx::open(&child_path, false).unwrap();
        child.read(0, 8, &mut buf).unwrap();
        assert_eq!(&buf[..512], &data[..]);
        assert_eq!(&buf[512..], &vec![0xA5u8; 7 * 512][..]);

        // Writing another sector of the same block goes through the
        // partially-present path.
        child.write(3, 1, &vec![0x77u8; 512]).unwrap();
        child.read(0, 8, &mut buf).unwrap();
        assert_eq!(&buf[..512], &data[..]);
        assert_eq!(&buf[512..3 * 512], &vec![0xA5u8; 2 * 512][..]);
        assert_eq!(&buf[3 * 512..4 * 512], &vec![0x77u8; 512][..]);
        assert_eq!(&buf[4 * 512..], &vec![0xA5u8; 4 * 512][..]);
    }

    #[test]
    fn test_linkage_mismatch_detected() {
        let tmp = TempDir::new().unwrap();
        let parent_path = tmp.as_path().join("p.vhdx");
        let child_path = tmp.as_path().join("c.vhdx");

        Vhdx::create_dynamic(&parent_path, 32 * MIB).unwrap();
        Vhdx::create_differencing(&child_path, &parent_path, None, None).unwrap();

        // Replace the parent: its data write GUID changes.
        std::fs::remove_file(&parent_path).unwrap();
        Vhdx::create_dynamic(&parent_path, 32 * MIB).unwrap();

        let mut child = Vhdx::open(&child_path, true).unwrap();
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            child.read(0, 1, &mut buf),
            Err(VhdxError::LinkageMismatch(..))
        ));
    }

    #[test]
    fn test_corrupt_inactive_header_heals_on_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("d.vhdx");
        Vhdx::create_dynamic(&path, 32 * MIB).unwrap();

        {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.write_all_at(&[0xFF], HEADER_1_START + 99).unwrap();
        }

        // Parsing succeeds on the intact active header.
        let mut disk = Vhdx::open(&path, false).unwrap();
        assert!(disk.header_section().headers()[0].is_none());

        // Any write triggers the header update that rewrites the inactive
        // slot.
        disk.write(0, 1, &pattern(512)).unwrap();
        drop(disk);

        let disk = Vhdx::open(&path, true).unwrap();
        assert!(disk.header_section().headers()[0].is_some());
        assert!(disk.header_section().headers()[1].is_some());
    }

    #[test]
    fn test_log_replay_and_read_only_refusal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.as_path().join("d.vhdx");
        Vhdx::create_dynamic(&path, 32 * MIB).unwrap();

        let block_offset;
        {
            // Simulate a crash between the log flush and the replay: write
            // a valid log entry carrying a BAT update, leave the log GUID
            // set, and extend the file to hold the block.
            let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let mut hs = HeaderSection::parse(&file, false).unwrap();

            let file_len = file.metadata().unwrap().len();
            block_offset = disk_util::round_up(file_len, MIB);
            file.set_len(block_offset + 8 * MIB).unwrap();

            let entry = BatEntry::new_payload(PayloadStatus::FullPresent, block_offset);
            let bat_entry_offset = BatEntry::entry_offset(hs.bat_entry().file_offset, 0);

            let mut log = LogSection::new(hs.log_offset(), hs.log_length());
            log.write_entry(&file, &mut hs, bat_entry_offset, &entry.to_le_bytes())
                .unwrap();
            file.sync_all().unwrap();
            assert!(!hs.log_guid().is_nil());
        }

        // Read-only open must refuse to replay.
        assert!(matches!(
            Vhdx::open(&path, true),
            Err(VhdxError::Log(VhdxLogError::ReplayOnReadOnly))
        ));

        // Read-write open replays the entry and resets the log.
        let disk = Vhdx::open(&path, false).unwrap();
        assert!(disk.header_section().log_guid().is_nil());
        assert_eq!(
            disk.bat()[0].payload_status().unwrap(),
            PayloadStatus::FullPresent
        );
        assert_eq!(disk.bat()[0].file_offset(), block_offset);

        // A second open has nothing left to replay.
        let disk = Vhdx::open(&path, true).unwrap();
        assert_eq!(
            disk.bat()[0].payload_status().unwrap(),
            PayloadStatus::FullPresent
        );
    }

    #[test]
    fn test_modify_parent_locator() {
        let tmp = TempDir::new().unwrap();
        let parent_path = tmp.as_path().join("p.vhdx");
        let child_path = tmp.as_path().join("c.vhdx");

        Vhdx::create_dynamic(&parent_path, 32 * MIB).unwrap();
        Vhdx::create_differencing(&child_path, &parent_path, None, None).unwrap();

        {
            let mut child = Vhdx::open(&child_path, false).unwrap();
            child
                .modify_parent_locator(Some("/nonexistent/p.vhdx"), Some("./p.vhdx"))
                .unwrap();
        }

        let mut child = Vhdx::open(&child_path, false).unwrap();
        assert_eq!(
            child.disk_spec().parent_absolute_win32_path(),
            Some("/nonexistent/p.vhdx")
        );
        assert_eq!(child.disk_spec().parent_relative_path(), Some("./p.vhdx"));

        // The relative path still resolves the chain.
        let mut buf = vec![0u8; 512];
        child.read(0, 1, &mut buf).unwrap();
    }
}
