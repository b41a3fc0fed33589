use std::cmp::min;
use std::collections::BTreeMap;

use fatvfs::{AccessMode, FatCode, FatOutcome, FileAttr};
use log::debug;

use crate::block::{DiskIo, DiskResult, DiskStatus, VolumeId};
use crate::config::{MAX_OPEN_OBJECTS, MAX_SECTOR_SIZE, NORTC_DATE, NORTC_TIME};
use crate::engine::{DirCursor, FatEngine, FileCursor, FileInfo};
use crate::mkfs;

pub(crate) const BPB_SIZE: usize = 512;
pub(crate) const BPB_SIGNATURE_OFFSET: usize = 510;
pub(crate) const BPB_SIGNATURE: u16 = 0xaa55;
pub(crate) const BPB_BYTES_PER_SECTOR_OFFSET: usize = 11;
pub(crate) const BPB_SECTORS_PER_CLUSTER_OFFSET: usize = 13;
pub(crate) const BPB_RESERVED_SECTORS_OFFSET: usize = 14;
pub(crate) const BPB_NUM_FATS_OFFSET: usize = 16;
pub(crate) const BPB_ROOT_ENTRIES_OFFSET: usize = 17;
pub(crate) const BPB_TOTAL_SECTORS_16_OFFSET: usize = 19;
pub(crate) const BPB_FAT_SIZE_16_OFFSET: usize = 22;
pub(crate) const BPB_TOTAL_SECTORS_32_OFFSET: usize = 32;
pub(crate) const BPB_FAT_SIZE_32_OFFSET: usize = 36;
pub(crate) const BPB_ROOT_CLUSTER_OFFSET: usize = 44;
pub(crate) const DIR_ENTRY_SIZE: usize = 32;
pub(crate) const FAT_ENTRY_SIZE: usize = 4;
pub(crate) const FAT32_EOC: u32 = 0x0fff_ffff;
const FAT32_EOC_MIN: u32 = 0x0fff_fff8;
const FAT32_MASK: u32 = 0x0fff_ffff;
const ATTR_LONG_NAME: u8 = 0x0f;
const ENTRY_FREE: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xe5;
const NT_LOWER_BASE: u8 = 0x08;
const NT_LOWER_EXT: u8 = 0x10;
const LFN_CHARS: usize = 13;
const LFN_MAX: usize = 260;

pub(crate) fn disk_result(result: DiskResult) -> FatOutcome<()> {
    match result {
        DiskResult::Ok => Ok(()),
        DiskResult::WriteProtected => Err(FatCode::WriteProtected),
        DiskResult::NotReady => Err(FatCode::NotReady),
        DiskResult::Error | DiskResult::ParamError => Err(FatCode::DiskErr),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Bpb {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub total_sectors: u32,
    pub sectors_per_fat: u32,
    pub root_cluster: u32,
}

impl Bpb {
    pub fn parse(buf: &[u8]) -> FatOutcome<Self> {
        if buf.len() < BPB_SIZE {
            return Err(FatCode::NoFilesystem);
        }
        if read_u16(buf, BPB_SIGNATURE_OFFSET) != BPB_SIGNATURE {
            return Err(FatCode::NoFilesystem);
        }
        let bytes_per_sector = read_u16(buf, BPB_BYTES_PER_SECTOR_OFFSET);
        let sectors_per_cluster = buf[BPB_SECTORS_PER_CLUSTER_OFFSET];
        let reserved_sectors = read_u16(buf, BPB_RESERVED_SECTORS_OFFSET);
        let num_fats = buf[BPB_NUM_FATS_OFFSET];
        let root_entries = read_u16(buf, BPB_ROOT_ENTRIES_OFFSET);
        let total_sectors_16 = read_u16(buf, BPB_TOTAL_SECTORS_16_OFFSET);
        let fat_size_16 = read_u16(buf, BPB_FAT_SIZE_16_OFFSET);
        let total_sectors_32 = read_u32(buf, BPB_TOTAL_SECTORS_32_OFFSET);
        let fat_size_32 = read_u32(buf, BPB_FAT_SIZE_32_OFFSET);
        let root_cluster = read_u32(buf, BPB_ROOT_CLUSTER_OFFSET);
        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16 as u32
        } else {
            total_sectors_32
        };
        let sectors_per_fat = if fat_size_16 != 0 {
            fat_size_16 as u32
        } else {
            fat_size_32
        };
        if !(BPB_SIZE..=MAX_SECTOR_SIZE).contains(&(bytes_per_sector as usize))
            || !bytes_per_sector.is_power_of_two()
            || !sectors_per_cluster.is_power_of_two()
            || reserved_sectors == 0
            || num_fats == 0
            || total_sectors == 0
            || sectors_per_fat == 0
            || root_entries != 0
            || root_cluster < 2
        {
            return Err(FatCode::NoFilesystem);
        }
        let data_start = sectors_per_fat
            .checked_mul(num_fats as u32)
            .and_then(|fats| fats.checked_add(reserved_sectors as u32))
            .ok_or(FatCode::NoFilesystem)?;
        if data_start >= total_sectors {
            return Err(FatCode::NoFilesystem);
        }
        let bpb = Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            total_sectors,
            sectors_per_fat,
            root_cluster,
        };
        if root_cluster > bpb.cluster_count() + 1 {
            return Err(FatCode::NoFilesystem);
        }
        Ok(bpb)
    }

    pub fn fat_start_sector(&self) -> u32 {
        self.reserved_sectors as u32
    }

    pub fn data_start_sector(&self) -> u32 {
        self.fat_start_sector()
            .saturating_add(self.sectors_per_fat.saturating_mul(self.num_fats as u32))
    }

    pub fn cluster_count(&self) -> u32 {
        self.total_sectors.saturating_sub(self.data_start_sector()) / self.sectors_per_cluster as u32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct EntryLoc {
    sector: u32,
    offset: usize,
}

#[derive(Clone, Debug)]
struct DirRecord {
    name: String,
    short: [u8; 11],
    attr: FileAttr,
    cluster: u32,
    size: u32,
    wdate: u16,
    wtime: u16,
    loc: EntryLoc,
    lfn: Vec<EntryLoc>,
}

impl DirRecord {
    fn parse(entry: &[u8], loc: EntryLoc, lfn: Option<(String, Vec<EntryLoc>)>) -> Self {
        let mut short = [0u8; 11];
        short.copy_from_slice(&entry[..11]);
        let (name, lfn) = match lfn {
            Some((name, locs)) => (name, locs),
            None => (short_name(&short, entry[12]), Vec::new()),
        };
        Self {
            name,
            short,
            attr: FileAttr::from_bits_truncate(entry[11]),
            cluster: ((read_u16(entry, 20) as u32) << 16) | read_u16(entry, 26) as u32,
            size: read_u32(entry, 28),
            wtime: read_u16(entry, 22),
            wdate: read_u16(entry, 24),
            loc,
            lfn,
        }
    }

    fn is_dot(&self) -> bool {
        self.short[0] == b'.'
    }

    fn is_dir(&self) -> bool {
        self.attr.contains(FileAttr::DIRECTORY)
    }

    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || short_name(&self.short, 0).eq_ignore_ascii_case(name)
    }

    fn info(&self) -> FileInfo {
        FileInfo {
            name: self.name.clone(),
            size: self.size as u64,
            attrib: self.attr,
            fdate: self.wdate,
            ftime: self.wtime,
        }
    }
}

struct NewEntry {
    short: [u8; 11],
    nt: u8,
    attr: FileAttr,
    cluster: u32,
    size: u32,
}

struct LfnState {
    buf: [u16; LFN_MAX],
    expected: u8,
    active: bool,
    locs: Vec<EntryLoc>,
}

impl LfnState {
    fn new() -> Self {
        Self {
            buf: [0; LFN_MAX],
            expected: 0,
            active: false,
            locs: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.buf = [0; LFN_MAX];
        self.expected = 0;
        self.active = false;
        self.locs.clear();
    }

    fn push(&mut self, entry: &[u8], loc: EntryLoc) {
        let order = entry[0] & 0x1f;
        let is_last = (entry[0] & 0x40) != 0;
        if is_last {
            self.reset();
            self.active = true;
            self.expected = order;
        }
        if !self.active || order == 0 || order != self.expected {
            self.reset();
            return;
        }
        let index = (order - 1) as usize * LFN_CHARS;
        if index + LFN_CHARS > self.buf.len() {
            self.reset();
            return;
        }
        const OFFSETS: [usize; LFN_CHARS] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
        for (idx, offset) in OFFSETS.iter().enumerate() {
            self.buf[index + idx] = read_u16(entry, *offset);
        }
        self.locs.push(loc);
        self.expected -= 1;
    }

    fn take_name(&mut self) -> Option<(String, Vec<EntryLoc>)> {
        if !self.active || self.expected != 0 {
            self.reset();
            return None;
        }
        let len = self
            .buf
            .iter()
            .position(|ch| *ch == 0 || *ch == 0xffff)
            .unwrap_or(self.buf.len());
        let name: String = char::decode_utf16(self.buf[..len].iter().copied())
            .map(|ch| ch.unwrap_or('?'))
            .collect();
        let locs = std::mem::take(&mut self.locs);
        self.reset();
        if name.is_empty() {
            None
        } else {
            Some((name, locs))
        }
    }
}

enum Slot {
    Free(EntryLoc),
    Full { last: u32 },
}

/// Sector-level view of one mounted FAT32 volume.
struct Fs<'a, D: ?Sized> {
    disk: &'a D,
    pdrv: VolumeId,
    bpb: Bpb,
}

impl<'a, D: DiskIo + ?Sized> Fs<'a, D> {
    fn new(disk: &'a D, pdrv: VolumeId, bpb: Bpb) -> Self {
        Self { disk, pdrv, bpb }
    }

    fn read_sector(&self, sector: u32, buf: &mut [u8]) -> FatOutcome<()> {
        disk_result(self.disk.sector_read(self.pdrv, sector as u64, 1, buf))
    }

    fn write_sector(&self, sector: u32, buf: &[u8]) -> FatOutcome<()> {
        disk_result(self.disk.sector_write(self.pdrv, sector as u64, 1, buf))
    }

    fn bytes_per_sector(&self) -> usize {
        self.bpb.bytes_per_sector as usize
    }

    fn cluster_size(&self) -> usize {
        self.bytes_per_sector() * self.bpb.sectors_per_cluster as usize
    }

    fn cluster_to_sector(&self, cluster: u32) -> FatOutcome<u32> {
        self.check_cluster(cluster)?;
        Ok(self
            .bpb
            .data_start_sector()
            .saturating_add((cluster - 2).saturating_mul(self.bpb.sectors_per_cluster as u32)))
    }

    fn max_cluster(&self) -> u32 {
        let fat_entries = self.bpb.sectors_per_fat as u64 * self.bytes_per_sector() as u64 / FAT_ENTRY_SIZE as u64;
        min(self.bpb.cluster_count() as u64 + 1, fat_entries.saturating_sub(1)) as u32
    }

    fn check_cluster(&self, cluster: u32) -> FatOutcome<()> {
        if cluster < 2 || cluster > self.max_cluster() {
            return Err(FatCode::IntErr);
        }
        Ok(())
    }

    /// `next_cluster` that fails once a walk has taken more links than the
    /// volume has clusters.
    fn follow(&self, cluster: u32, hops: &mut u32) -> FatOutcome<Option<u32>> {
        *hops += 1;
        if *hops > self.max_cluster() {
            return Err(FatCode::IntErr);
        }
        self.next_cluster(cluster)
    }

    fn fat_position(&self, cluster: u32) -> (u32, usize) {
        let offset = cluster as usize * FAT_ENTRY_SIZE;
        let bytes_per_sector = self.bytes_per_sector();
        (
            (offset / bytes_per_sector) as u32,
            offset % bytes_per_sector,
        )
    }

    fn read_fat_entry(&self, cluster: u32) -> FatOutcome<u32> {
        self.check_cluster(cluster)?;
        let (sector_offset, in_sector) = self.fat_position(cluster);
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        let bytes_per_sector = self.bytes_per_sector();
        self.read_sector(
            self.bpb.fat_start_sector() + sector_offset,
            &mut scratch[..bytes_per_sector],
        )?;
        Ok(read_u32(&scratch, in_sector) & FAT32_MASK)
    }

    fn write_fat_entry(&self, cluster: u32, value: u32) -> FatOutcome<()> {
        self.check_cluster(cluster)?;
        let (sector_offset, in_sector) = self.fat_position(cluster);
        let bytes_per_sector = self.bytes_per_sector();
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        for fat_index in 0..self.bpb.num_fats {
            let sector = self.bpb.fat_start_sector()
                + fat_index as u32 * self.bpb.sectors_per_fat
                + sector_offset;
            self.read_sector(sector, &mut scratch[..bytes_per_sector])?;
            let reserved = read_u32(&scratch, in_sector) & !FAT32_MASK;
            write_u32(&mut scratch, in_sector, reserved | (value & FAT32_MASK));
            self.write_sector(sector, &scratch[..bytes_per_sector])?;
        }
        Ok(())
    }

    fn next_cluster(&self, cluster: u32) -> FatOutcome<Option<u32>> {
        let entry = self.read_fat_entry(cluster)?;
        if entry < 2 || entry >= FAT32_EOC_MIN {
            return Ok(None);
        }
        if entry > self.max_cluster() {
            return Err(FatCode::IntErr);
        }
        Ok(Some(entry))
    }

    fn chain_at(&self, start: u32, hops: u32) -> FatOutcome<Option<u32>> {
        let mut cluster = start;
        let mut walked = 0;
        for _ in 0..hops {
            match self.follow(cluster, &mut walked)? {
                Some(next) => cluster = next,
                None => return Ok(None),
            }
        }
        Ok(Some(cluster))
    }

    fn zero_cluster(&self, cluster: u32) -> FatOutcome<()> {
        let scratch = [0u8; MAX_SECTOR_SIZE];
        let first = self.cluster_to_sector(cluster)?;
        for sector_index in 0..self.bpb.sectors_per_cluster {
            self.write_sector(first + sector_index as u32, &scratch[..self.bytes_per_sector()])?;
        }
        Ok(())
    }

    /// Claims the first free cluster, or `None` when the volume is full.
    fn alloc_cluster(&self) -> FatOutcome<Option<u32>> {
        let bytes_per_sector = self.bytes_per_sector();
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        let mut loaded = None;
        for cluster in 2..=self.max_cluster() {
            let (sector_offset, in_sector) = self.fat_position(cluster);
            if loaded != Some(sector_offset) {
                self.read_sector(
                    self.bpb.fat_start_sector() + sector_offset,
                    &mut scratch[..bytes_per_sector],
                )?;
                loaded = Some(sector_offset);
            }
            if read_u32(&scratch, in_sector) & FAT32_MASK == 0 {
                self.write_fat_entry(cluster, FAT32_EOC)?;
                self.zero_cluster(cluster)?;
                return Ok(Some(cluster));
            }
        }
        Ok(None)
    }

    fn free_chain(&self, start: u32) -> FatOutcome<()> {
        let mut current = (start >= 2).then_some(start);
        let mut hops = 0;
        while let Some(cluster) = current {
            current = self.follow(cluster, &mut hops)?;
            self.write_fat_entry(cluster, 0)?;
        }
        Ok(())
    }

    /// Grows the chain at `start` until it holds `bytes` or the volume runs
    /// out of clusters. Returns the (possibly new) start cluster and the
    /// capacity of the chain in bytes.
    fn reserve(&self, start: u32, bytes: u64) -> FatOutcome<(u32, u64)> {
        let cluster_size = self.cluster_size() as u64;
        let needed = bytes.div_ceil(cluster_size);
        let mut start = start;
        let mut count = 0u64;
        let mut last = 0u32;
        if start >= 2 {
            let mut current = Some(start);
            let mut hops = 0;
            while let Some(cluster) = current {
                last = cluster;
                count += 1;
                current = self.follow(cluster, &mut hops)?;
            }
        }
        while count < needed {
            let Some(next) = self.alloc_cluster()? else {
                break;
            };
            if start < 2 {
                start = next;
            } else {
                self.write_fat_entry(last, next)?;
            }
            last = next;
            count += 1;
        }
        Ok((start, count * cluster_size))
    }

    fn read_cluster_bytes(&self, cluster: u32, offset: usize, buf: &mut [u8]) -> FatOutcome<usize> {
        let cluster_size = self.cluster_size();
        if offset >= cluster_size {
            return Ok(0);
        }
        let bytes_per_sector = self.bytes_per_sector();
        let mut remaining = min(buf.len(), cluster_size - offset);
        let mut copied = 0usize;
        let mut sector_index = offset / bytes_per_sector;
        let mut sector_offset = offset % bytes_per_sector;
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        while remaining > 0 && sector_index < self.bpb.sectors_per_cluster as usize {
            let sector = self.cluster_to_sector(cluster)? + sector_index as u32;
            self.read_sector(sector, &mut scratch[..bytes_per_sector])?;
            let take = min(remaining, bytes_per_sector - sector_offset);
            buf[copied..copied + take].copy_from_slice(&scratch[sector_offset..sector_offset + take]);
            copied += take;
            remaining -= take;
            sector_index += 1;
            sector_offset = 0;
        }
        Ok(copied)
    }

    fn write_cluster_bytes(&self, cluster: u32, offset: usize, buf: &[u8]) -> FatOutcome<usize> {
        let cluster_size = self.cluster_size();
        if offset >= cluster_size || buf.is_empty() {
            return Ok(0);
        }
        let bytes_per_sector = self.bytes_per_sector();
        let to_write = min(buf.len(), cluster_size - offset);
        let mut remaining = to_write;
        let mut written = 0usize;
        let mut sector = self.cluster_to_sector(cluster)? + (offset / bytes_per_sector) as u32;
        let mut in_sector = offset % bytes_per_sector;
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        while remaining > 0 {
            let chunk = min(remaining, bytes_per_sector - in_sector);
            if in_sector == 0 && chunk == bytes_per_sector {
                self.write_sector(sector, &buf[written..written + bytes_per_sector])?;
            } else {
                self.read_sector(sector, &mut scratch[..bytes_per_sector])?;
                scratch[in_sector..in_sector + chunk].copy_from_slice(&buf[written..written + chunk]);
                self.write_sector(sector, &scratch[..bytes_per_sector])?;
            }
            remaining -= chunk;
            written += chunk;
            in_sector = 0;
            sector += 1;
        }
        Ok(written)
    }

    fn read_chain(&self, start: u32, offset: u64, buf: &mut [u8]) -> FatOutcome<usize> {
        if start < 2 || buf.is_empty() {
            return Ok(0);
        }
        let cluster_size = self.cluster_size();
        let Some(mut cluster) = self.chain_at(start, (offset / cluster_size as u64) as u32)? else {
            return Ok(0);
        };
        let mut in_cluster = (offset % cluster_size as u64) as usize;
        let mut total = 0usize;
        let mut hops = 0;
        while total < buf.len() {
            let chunk = min(buf.len() - total, cluster_size - in_cluster);
            let copied = self.read_cluster_bytes(cluster, in_cluster, &mut buf[total..total + chunk])?;
            total += copied;
            if copied == 0 || total == buf.len() {
                break;
            }
            in_cluster = 0;
            match self.follow(cluster, &mut hops)? {
                Some(next) => cluster = next,
                None => break,
            }
        }
        Ok(total)
    }

    fn write_chain(&self, start: u32, offset: u64, buf: &[u8]) -> FatOutcome<usize> {
        if start < 2 || buf.is_empty() {
            return Ok(0);
        }
        let cluster_size = self.cluster_size();
        let Some(mut cluster) = self.chain_at(start, (offset / cluster_size as u64) as u32)? else {
            return Ok(0);
        };
        let mut in_cluster = (offset % cluster_size as u64) as usize;
        let mut total = 0usize;
        let mut hops = 0;
        while total < buf.len() {
            let chunk = min(buf.len() - total, cluster_size - in_cluster);
            let wrote = self.write_cluster_bytes(cluster, in_cluster, &buf[total..total + chunk])?;
            total += wrote;
            if wrote == 0 || total == buf.len() {
                break;
            }
            in_cluster = 0;
            match self.follow(cluster, &mut hops)? {
                Some(next) => cluster = next,
                None => break,
            }
        }
        Ok(total)
    }

    fn scan_dir(
        &self,
        cluster: u32,
        mut visit: impl FnMut(&DirRecord) -> FatOutcome<bool>,
    ) -> FatOutcome<()> {
        if cluster < 2 {
            return Err(FatCode::IntErr);
        }
        let bytes_per_sector = self.bytes_per_sector();
        let mut current = cluster;
        let mut lfn = LfnState::new();
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        let mut hops = 0;
        loop {
            for sector_index in 0..self.bpb.sectors_per_cluster {
                let sector = self.cluster_to_sector(current)? + sector_index as u32;
                self.read_sector(sector, &mut scratch[..bytes_per_sector])?;
                let mut offset = 0usize;
                while offset + DIR_ENTRY_SIZE <= bytes_per_sector {
                    let entry = &scratch[offset..offset + DIR_ENTRY_SIZE];
                    let loc = EntryLoc { sector, offset };
                    match entry[0] {
                        ENTRY_FREE => return Ok(()),
                        ENTRY_DELETED => lfn.reset(),
                        _ if entry[11] == ATTR_LONG_NAME => lfn.push(entry, loc),
                        _ if entry[11] & FileAttr::VOLUME_ID.bits() != 0 => lfn.reset(),
                        _ => {
                            let record = DirRecord::parse(entry, loc, lfn.take_name());
                            if visit(&record)? {
                                return Ok(());
                            }
                        }
                    }
                    offset += DIR_ENTRY_SIZE;
                }
            }
            match self.follow(current, &mut hops)? {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(())
    }

    fn find(&self, dir: u32, name: &str) -> FatOutcome<Option<DirRecord>> {
        let mut found = None;
        self.scan_dir(dir, |record| {
            if !record.is_dot() && record.matches(name) {
                found = Some(record.clone());
                return Ok(true);
            }
            Ok(false)
        })?;
        Ok(found)
    }

    /// Resolves a chain of directory names to the cluster of the last one.
    fn walk(&self, parts: &[&str]) -> FatOutcome<u32> {
        let mut current = self.bpb.root_cluster;
        for part in parts {
            let record = self.find(current, part)?.ok_or(FatCode::NoPath)?;
            if !record.is_dir() {
                return Err(FatCode::NoPath);
            }
            current = if record.cluster < 2 {
                self.bpb.root_cluster
            } else {
                record.cluster
            };
        }
        Ok(current)
    }

    fn lookup(&self, parts: &[&str]) -> FatOutcome<DirRecord> {
        let (name, parents) = parts.split_last().ok_or(FatCode::InvalidName)?;
        let dir = self.walk(parents)?;
        self.find(dir, name)?.ok_or(FatCode::NoFile)
    }

    fn is_dir_empty(&self, cluster: u32) -> FatOutcome<bool> {
        let mut empty = true;
        self.scan_dir(cluster, |record| {
            if record.is_dot() {
                return Ok(false);
            }
            empty = false;
            Ok(true)
        })?;
        Ok(empty)
    }

    fn free_slot(&self, dir: u32) -> FatOutcome<Slot> {
        let bytes_per_sector = self.bytes_per_sector();
        let mut current = dir;
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        let mut hops = 0;
        loop {
            for sector_index in 0..self.bpb.sectors_per_cluster {
                let sector = self.cluster_to_sector(current)? + sector_index as u32;
                self.read_sector(sector, &mut scratch[..bytes_per_sector])?;
                let mut offset = 0usize;
                while offset + DIR_ENTRY_SIZE <= bytes_per_sector {
                    if matches!(scratch[offset], ENTRY_FREE | ENTRY_DELETED) {
                        return Ok(Slot::Free(EntryLoc { sector, offset }));
                    }
                    offset += DIR_ENTRY_SIZE;
                }
            }
            match self.follow(current, &mut hops)? {
                Some(next) => current = next,
                None => return Ok(Slot::Full { last: current }),
            }
        }
    }

    fn write_entry(&self, loc: EntryLoc, entry: &NewEntry) -> FatOutcome<()> {
        let bytes_per_sector = self.bytes_per_sector();
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        self.read_sector(loc.sector, &mut scratch[..bytes_per_sector])?;
        let slot = &mut scratch[loc.offset..loc.offset + DIR_ENTRY_SIZE];
        slot.fill(0);
        slot[..11].copy_from_slice(&entry.short);
        slot[11] = entry.attr.bits();
        slot[12] = entry.nt;
        write_u16(slot, 14, NORTC_TIME);
        write_u16(slot, 16, NORTC_DATE);
        write_u16(slot, 18, NORTC_DATE);
        write_u16(slot, 20, (entry.cluster >> 16) as u16);
        write_u16(slot, 22, NORTC_TIME);
        write_u16(slot, 24, NORTC_DATE);
        write_u16(slot, 26, (entry.cluster & 0xffff) as u16);
        write_u32(slot, 28, entry.size);
        self.write_sector(loc.sector, &scratch[..bytes_per_sector])
    }

    fn add_entry(&self, dir: u32, entry: &NewEntry) -> FatOutcome<EntryLoc> {
        let loc = match self.free_slot(dir)? {
            Slot::Free(loc) => loc,
            Slot::Full { last } => {
                let next = self.alloc_cluster()?.ok_or(FatCode::Denied)?;
                self.write_fat_entry(last, next)?;
                EntryLoc {
                    sector: self.cluster_to_sector(next)?,
                    offset: 0,
                }
            }
        };
        self.write_entry(loc, entry)?;
        Ok(loc)
    }

    fn update_entry(&self, loc: EntryLoc, cluster: u32, size: u32) -> FatOutcome<()> {
        let bytes_per_sector = self.bytes_per_sector();
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        self.read_sector(loc.sector, &mut scratch[..bytes_per_sector])?;
        let slot = &mut scratch[loc.offset..loc.offset + DIR_ENTRY_SIZE];
        slot[11] |= FileAttr::ARCHIVE.bits();
        write_u16(slot, 20, (cluster >> 16) as u16);
        write_u16(slot, 22, NORTC_TIME);
        write_u16(slot, 24, NORTC_DATE);
        write_u16(slot, 26, (cluster & 0xffff) as u16);
        write_u32(slot, 28, size);
        self.write_sector(loc.sector, &scratch[..bytes_per_sector])
    }

    /// Points the `..` entry of `dir` at `parent`.
    fn set_parent_link(&self, dir: u32, parent: u32) -> FatOutcome<()> {
        let bytes_per_sector = self.bytes_per_sector();
        let sector = self.cluster_to_sector(dir)?;
        let parent = if parent == self.bpb.root_cluster { 0 } else { parent };
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        self.read_sector(sector, &mut scratch[..bytes_per_sector])?;
        let slot = &mut scratch[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE];
        if &slot[..2] != b".." {
            return Err(FatCode::IntErr);
        }
        write_u16(slot, 20, (parent >> 16) as u16);
        write_u16(slot, 26, (parent & 0xffff) as u16);
        self.write_sector(sector, &scratch[..bytes_per_sector])
    }

    fn delete_entry(&self, record: &DirRecord) -> FatOutcome<()> {
        let bytes_per_sector = self.bytes_per_sector();
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        for loc in record.lfn.iter().chain(core::iter::once(&record.loc)) {
            self.read_sector(loc.sector, &mut scratch[..bytes_per_sector])?;
            scratch[loc.offset] = ENTRY_DELETED;
            self.write_sector(loc.sector, &scratch[..bytes_per_sector])?;
        }
        Ok(())
    }

    fn make_dir(&self, parent: u32, short: [u8; 11], nt: u8) -> FatOutcome<()> {
        let cluster = self.alloc_cluster()?.ok_or(FatCode::Denied)?;
        let first = self.cluster_to_sector(cluster)?;
        let parent_link = if parent == self.bpb.root_cluster { 0 } else { parent };
        let dot = NewEntry {
            short: *b".          ",
            nt: 0,
            attr: FileAttr::DIRECTORY,
            cluster,
            size: 0,
        };
        let dot_dot = NewEntry {
            short: *b"..         ",
            cluster: parent_link,
            ..dot
        };
        let entry = NewEntry {
            short,
            nt,
            attr: FileAttr::DIRECTORY,
            cluster,
            size: 0,
        };
        let result = self
            .write_entry(EntryLoc { sector: first, offset: 0 }, &dot)
            .and_then(|_| self.write_entry(EntryLoc { sector: first, offset: DIR_ENTRY_SIZE }, &dot_dot))
            .and_then(|_| self.add_entry(parent, &entry));
        if let Err(err) = result {
            self.free_chain(cluster)?;
            return Err(err);
        }
        Ok(())
    }
}

struct FileObject {
    pdrv: VolumeId,
    loc: EntryLoc,
    cluster: u32,
    size: u32,
    pos: u32,
    mode: AccessMode,
    dirty: bool,
}

struct DirObject {
    pdrv: VolumeId,
    cluster: u32,
    index: usize,
}

/// FAT32 engine that reaches its media exclusively through [`DiskIo`].
///
/// New entries get 8.3 names only; long names are decoded when listing and
/// removed with their short entry on unlink.
pub struct Fat32Engine<D> {
    disk: D,
    volumes: BTreeMap<VolumeId, Bpb>,
    files: BTreeMap<u64, FileObject>,
    dirs: BTreeMap<u64, DirObject>,
    next_id: u64,
}

impl<D: DiskIo> Fat32Engine<D> {
    pub fn new(disk: D) -> Self {
        Self {
            disk,
            volumes: BTreeMap::new(),
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    pub fn bpb(&self, pdrv: VolumeId) -> Option<&Bpb> {
        self.volumes.get(&pdrv)
    }

    fn volume(&self, pdrv: VolumeId) -> FatOutcome<Bpb> {
        self.volumes.get(&pdrv).copied().ok_or(FatCode::NotEnabled)
    }

    fn allocate_id(&mut self) -> FatOutcome<u64> {
        if self.files.len() + self.dirs.len() >= MAX_OPEN_OBJECTS {
            return Err(FatCode::TooManyOpenFiles);
        }
        self.next_id += 1;
        Ok(self.next_id)
    }

    fn drop_objects(&mut self, pdrv: VolumeId) {
        self.files.retain(|_, file| file.pdrv != pdrv);
        self.dirs.retain(|_, dir| dir.pdrv != pdrv);
    }

    /// Multiple readers or a single writer per directory entry.
    fn check_lock(&self, pdrv: VolumeId, loc: EntryLoc, exclusive: bool) -> FatOutcome<()> {
        let conflict = self
            .files
            .values()
            .filter(|file| file.pdrv == pdrv && file.loc == loc)
            .any(|file| exclusive || file.mode.contains(AccessMode::WRITE));
        if conflict {
            return Err(FatCode::Locked);
        }
        Ok(())
    }

    fn in_use(&self, pdrv: VolumeId, record: &DirRecord) -> bool {
        self.files
            .values()
            .any(|file| file.pdrv == pdrv && file.loc == record.loc)
            || (record.is_dir()
                && self
                    .dirs
                    .values()
                    .any(|dir| dir.pdrv == pdrv && dir.cluster == record.cluster))
    }

    fn file(&self, file: &FileCursor) -> FatOutcome<&FileObject> {
        self.files.get(&file.id()).ok_or(FatCode::InvalidObject)
    }

    fn file_mut(&mut self, file: &FileCursor) -> FatOutcome<&mut FileObject> {
        self.files.get_mut(&file.id()).ok_or(FatCode::InvalidObject)
    }

    fn flush(&self, object: &FileObject) -> FatOutcome<()> {
        let bpb = self.volume(object.pdrv).map_err(|_| FatCode::InvalidObject)?;
        Fs::new(&self.disk, object.pdrv, bpb).update_entry(object.loc, object.cluster, object.size)
    }
}

impl<D: DiskIo> FatEngine for Fat32Engine<D> {
    fn mount(&mut self, prefix: &str) -> FatOutcome<()> {
        let (pdrv, _) = split_drive(prefix)?;
        if self.disk.initialize(pdrv).contains(DiskStatus::NOINIT) {
            return Err(FatCode::NotReady);
        }
        let sector_size = self.disk.sector_size(pdrv);
        if !(BPB_SIZE..=MAX_SECTOR_SIZE).contains(&sector_size) || !sector_size.is_power_of_two() {
            return Err(FatCode::DiskErr);
        }
        let mut sector = [0u8; MAX_SECTOR_SIZE];
        disk_result(self.disk.sector_read(pdrv, 0, 1, &mut sector[..sector_size]))?;
        let bpb = Bpb::parse(&sector[..sector_size])?;
        if bpb.bytes_per_sector as usize != sector_size {
            return Err(FatCode::NoFilesystem);
        }
        debug!(
            "fat32: drive {pdrv} mounted, {} clusters of {} bytes",
            bpb.cluster_count(),
            bpb.bytes_per_sector as usize * bpb.sectors_per_cluster as usize
        );
        self.drop_objects(pdrv);
        self.volumes.insert(pdrv, bpb);
        Ok(())
    }

    fn unmount(&mut self, prefix: &str) -> FatOutcome<()> {
        let (pdrv, _) = split_drive(prefix)?;
        self.drop_objects(pdrv);
        if self.volumes.remove(&pdrv).is_some() {
            debug!("fat32: drive {pdrv} unmounted");
        }
        Ok(())
    }

    fn mkfs(&mut self, prefix: &str) -> FatOutcome<()> {
        let (pdrv, _) = split_drive(prefix)?;
        self.drop_objects(pdrv);
        self.volumes.remove(&pdrv);
        mkfs::format(&self.disk, pdrv)
    }

    fn open(&mut self, path: &str, mode: AccessMode) -> FatOutcome<FileCursor> {
        let (pdrv, rest) = split_drive(path)?;
        let bpb = self.volume(pdrv)?;
        let id = self.allocate_id()?;
        let fs = Fs::new(&self.disk, pdrv, bpb);
        let parts = components(rest);
        let (name, parents) = parts.split_last().ok_or(FatCode::InvalidName)?;
        let parent = fs.walk(parents)?;
        let writes = mode.contains(AccessMode::WRITE);
        let (loc, cluster, size) = match fs.find(parent, name)? {
            Some(record) => {
                if record.is_dir() {
                    return Err(FatCode::NoFile);
                }
                if mode.contains(AccessMode::CREATE_NEW) {
                    return Err(FatCode::Exist);
                }
                let truncate = mode.contains(AccessMode::CREATE_ALWAYS);
                if (writes || truncate) && record.attr.contains(FileAttr::READ_ONLY) {
                    return Err(FatCode::Denied);
                }
                self.check_lock(pdrv, record.loc, writes || truncate)?;
                if truncate {
                    fs.update_entry(record.loc, 0, 0)?;
                    fs.free_chain(record.cluster)?;
                    (record.loc, 0, 0)
                } else {
                    (record.loc, record.cluster, record.size)
                }
            }
            None => {
                if !mode.creates() {
                    return Err(FatCode::NoFile);
                }
                let (short, nt) = encode_short_name(name)?;
                let entry = NewEntry {
                    short,
                    nt,
                    attr: FileAttr::ARCHIVE,
                    cluster: 0,
                    size: 0,
                };
                (fs.add_entry(parent, &entry)?, 0, 0)
            }
        };
        let pos = if mode.seeks_to_end() { size } else { 0 };
        self.files.insert(
            id,
            FileObject {
                pdrv,
                loc,
                cluster,
                size,
                pos,
                mode,
                dirty: false,
            },
        );
        Ok(FileCursor::new(id))
    }

    fn close(&mut self, file: FileCursor) -> FatOutcome<()> {
        let object = self.files.remove(&file.id()).ok_or(FatCode::InvalidObject)?;
        if object.dirty {
            self.flush(&object)?;
        }
        Ok(())
    }

    fn read(&mut self, file: &FileCursor, buf: &mut [u8]) -> FatOutcome<usize> {
        let object = self.file(file)?;
        if !object.mode.contains(AccessMode::READ) {
            return Err(FatCode::Denied);
        }
        let (pdrv, cluster, pos) = (object.pdrv, object.cluster, object.pos);
        let want = min(buf.len(), object.size.saturating_sub(pos) as usize);
        if want == 0 {
            return Ok(0);
        }
        let bpb = self.volume(pdrv).map_err(|_| FatCode::InvalidObject)?;
        let read = Fs::new(&self.disk, pdrv, bpb).read_chain(cluster, pos as u64, &mut buf[..want])?;
        self.file_mut(file)?.pos += read as u32;
        Ok(read)
    }

    fn write(&mut self, file: &FileCursor, buf: &[u8]) -> FatOutcome<usize> {
        let object = self.file(file)?;
        if !object.mode.contains(AccessMode::WRITE) {
            return Err(FatCode::Denied);
        }
        let (pdrv, cluster, pos) = (object.pdrv, object.cluster, object.pos);
        let len = min(buf.len(), (u32::MAX - pos) as usize);
        if len == 0 {
            return Ok(0);
        }
        let bpb = self.volume(pdrv).map_err(|_| FatCode::InvalidObject)?;
        let fs = Fs::new(&self.disk, pdrv, bpb);
        let end = pos as u64 + len as u64;
        let (start, capacity) = fs.reserve(cluster, end)?;
        let writable = min(end, capacity).saturating_sub(pos as u64) as usize;
        let written = fs.write_chain(start, pos as u64, &buf[..writable])?;
        let object = self.file_mut(file)?;
        object.cluster = start;
        object.pos += written as u32;
        object.size = object.size.max(object.pos);
        object.dirty = true;
        Ok(written)
    }

    fn lseek(&mut self, file: &FileCursor, offset: u64) -> FatOutcome<()> {
        let object = self.file(file)?;
        let (pdrv, cluster, size, mode) = (object.pdrv, object.cluster, object.size, object.mode);
        let mut target = min(offset, u32::MAX as u64) as u32;
        let mut grown = None;
        if target > size {
            if mode.contains(AccessMode::WRITE) {
                let bpb = self.volume(pdrv).map_err(|_| FatCode::InvalidObject)?;
                let (start, capacity) = Fs::new(&self.disk, pdrv, bpb).reserve(cluster, target as u64)?;
                target = min(target as u64, capacity) as u32;
                grown = Some(start);
            } else {
                target = size;
            }
        }
        let object = self.file_mut(file)?;
        if let Some(start) = grown {
            object.cluster = start;
            object.size = target;
            object.dirty = true;
        }
        object.pos = target;
        Ok(())
    }

    fn tell(&self, file: &FileCursor) -> FatOutcome<u64> {
        Ok(self.file(file)?.pos as u64)
    }

    fn size(&self, file: &FileCursor) -> FatOutcome<u64> {
        Ok(self.file(file)?.size as u64)
    }

    fn truncate(&mut self, file: &FileCursor) -> FatOutcome<()> {
        let object = self.file(file)?;
        if !object.mode.contains(AccessMode::WRITE) {
            return Err(FatCode::Denied);
        }
        let (pdrv, cluster, size, pos) = (object.pdrv, object.cluster, object.size, object.pos);
        if pos >= size {
            return Ok(());
        }
        let bpb = self.volume(pdrv).map_err(|_| FatCode::InvalidObject)?;
        let fs = Fs::new(&self.disk, pdrv, bpb);
        let mut start = cluster;
        if pos == 0 {
            fs.free_chain(cluster)?;
            start = 0;
        } else if cluster >= 2 {
            let keep = (pos as u64).div_ceil(fs.cluster_size() as u64) as u32;
            let tail = fs.chain_at(cluster, keep - 1)?.ok_or(FatCode::IntErr)?;
            if let Some(next) = fs.next_cluster(tail)? {
                fs.write_fat_entry(tail, FAT32_EOC)?;
                fs.free_chain(next)?;
            }
        }
        let object = self.file_mut(file)?;
        object.cluster = start;
        object.size = pos;
        object.dirty = true;
        Ok(())
    }

    fn sync(&mut self, file: &FileCursor) -> FatOutcome<()> {
        let object = self.file(file)?;
        if object.dirty {
            self.flush(object)?;
            self.file_mut(file)?.dirty = false;
        }
        Ok(())
    }

    fn opendir(&mut self, path: &str) -> FatOutcome<DirCursor> {
        let (pdrv, rest) = split_drive(path)?;
        let bpb = self.volume(pdrv)?;
        let id = self.allocate_id()?;
        let fs = Fs::new(&self.disk, pdrv, bpb);
        let parts = components(rest);
        let cluster = if parts.is_empty() {
            bpb.root_cluster
        } else {
            let record = fs.lookup(&parts).map_err(|err| match err {
                FatCode::NoFile => FatCode::NoPath,
                other => other,
            })?;
            if !record.is_dir() {
                return Err(FatCode::NoPath);
            }
            if record.cluster < 2 {
                bpb.root_cluster
            } else {
                record.cluster
            }
        };
        self.dirs.insert(id, DirObject { pdrv, cluster, index: 0 });
        Ok(DirCursor::new(id))
    }

    fn closedir(&mut self, dir: DirCursor) -> FatOutcome<()> {
        self.dirs
            .remove(&dir.id())
            .map(|_| ())
            .ok_or(FatCode::InvalidObject)
    }

    fn readdir(&mut self, dir: &DirCursor) -> FatOutcome<FileInfo> {
        let object = self.dirs.get(&dir.id()).ok_or(FatCode::InvalidObject)?;
        let (pdrv, cluster, index) = (object.pdrv, object.cluster, object.index);
        let bpb = self.volume(pdrv).map_err(|_| FatCode::InvalidObject)?;
        let mut seen = 0usize;
        let mut found = None;
        Fs::new(&self.disk, pdrv, bpb).scan_dir(cluster, |record| {
            if record.is_dot() {
                return Ok(false);
            }
            if seen == index {
                found = Some(record.info());
                return Ok(true);
            }
            seen += 1;
            Ok(false)
        })?;
        match found {
            Some(info) => {
                if let Some(object) = self.dirs.get_mut(&dir.id()) {
                    object.index += 1;
                }
                Ok(info)
            }
            None => Ok(FileInfo::default()),
        }
    }

    fn stat(&mut self, path: &str) -> FatOutcome<FileInfo> {
        let (pdrv, rest) = split_drive(path)?;
        let bpb = self.volume(pdrv)?;
        let parts = components(rest);
        Ok(Fs::new(&self.disk, pdrv, bpb).lookup(&parts)?.info())
    }

    fn unlink(&mut self, path: &str) -> FatOutcome<()> {
        let (pdrv, rest) = split_drive(path)?;
        let bpb = self.volume(pdrv)?;
        let fs = Fs::new(&self.disk, pdrv, bpb);
        let record = fs.lookup(&components(rest))?;
        if self.in_use(pdrv, &record) {
            return Err(FatCode::Locked);
        }
        if record.attr.contains(FileAttr::READ_ONLY) {
            return Err(FatCode::Denied);
        }
        if record.is_dir() && record.cluster >= 2 && !fs.is_dir_empty(record.cluster)? {
            return Err(FatCode::Denied);
        }
        fs.delete_entry(&record)?;
        fs.free_chain(record.cluster)
    }

    fn mkdir(&mut self, path: &str) -> FatOutcome<()> {
        let (pdrv, rest) = split_drive(path)?;
        let bpb = self.volume(pdrv)?;
        let fs = Fs::new(&self.disk, pdrv, bpb);
        let parts = components(rest);
        let (name, parents) = parts.split_last().ok_or(FatCode::InvalidName)?;
        let parent = fs.walk(parents)?;
        if fs.find(parent, name)?.is_some() {
            return Err(FatCode::Exist);
        }
        let (short, nt) = encode_short_name(name)?;
        fs.make_dir(parent, short, nt)
    }

    fn rename(&mut self, old: &str, new: &str) -> FatOutcome<()> {
        let (pdrv, old_rest) = split_drive(old)?;
        let new_rest = match new.split_once(':') {
            Some(_) => {
                let (new_drive, rest) = split_drive(new)?;
                if new_drive != pdrv {
                    return Err(FatCode::InvalidDrive);
                }
                rest
            }
            None => new,
        };
        let bpb = self.volume(pdrv)?;
        let fs = Fs::new(&self.disk, pdrv, bpb);
        let old_parts = components(old_rest);
        let record = fs.lookup(&old_parts)?;
        if self.in_use(pdrv, &record) {
            return Err(FatCode::Locked);
        }
        let new_parts = components(new_rest);
        let (new_name, new_parents) = new_parts.split_last().ok_or(FatCode::InvalidName)?;
        let into_self = new_parts.len() > old_parts.len()
            && old_parts
                .iter()
                .zip(new_parts.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b));
        if record.is_dir() && into_self {
            return Err(FatCode::InvalidName);
        }
        let parent = fs.walk(new_parents)?;
        if fs.find(parent, new_name)?.is_some() {
            return Err(FatCode::Exist);
        }
        let old_parent = fs.walk(&old_parts[..old_parts.len() - 1])?;
        let (short, nt) = encode_short_name(new_name)?;
        let entry = NewEntry {
            short,
            nt,
            attr: record.attr,
            cluster: record.cluster,
            size: record.size,
        };
        fs.add_entry(parent, &entry)?;
        fs.delete_entry(&record)?;
        if record.is_dir() && record.cluster >= 2 && parent != old_parent {
            fs.set_parent_link(record.cluster, parent)?;
        }
        Ok(())
    }
}

/// Splits a `"<id>:"` volume prefix off `path`. Paths without one address
/// drive 0.
pub(crate) fn split_drive(path: &str) -> FatOutcome<(VolumeId, &str)> {
    match path.split_once(':') {
        Some((drive, rest)) => {
            let pdrv = drive.parse::<VolumeId>().map_err(|_| FatCode::InvalidDrive)?;
            Ok((pdrv, rest))
        }
        None => Ok((0, path)),
    }
}

fn components(path: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    parts
}

fn is_short_char(ch: u8) -> bool {
    ch.is_ascii_graphic() && !b"\"*+,./:;<=>?[\\]|".contains(&ch)
}

/// Encodes an 8.3 name. Returns the padded upper-case name and the NT case
/// flags that restore an all-lower-case base or extension.
fn encode_short_name(name: &str) -> FatOutcome<([u8; 11], u8)> {
    let (base, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return Err(FatCode::InvalidName);
    }
    let mut short = [b' '; 11];
    let mut nt = 0u8;
    for (part, start, flag) in [(base, 0usize, NT_LOWER_BASE), (ext, 8usize, NT_LOWER_EXT)] {
        for (idx, ch) in part.bytes().enumerate() {
            if !is_short_char(ch) {
                return Err(FatCode::InvalidName);
            }
            short[start + idx] = ch.to_ascii_uppercase();
        }
        let lower = part.bytes().any(|ch| ch.is_ascii_lowercase());
        let upper = part.bytes().any(|ch| ch.is_ascii_uppercase());
        if lower && !upper {
            nt |= flag;
        }
    }
    Ok((short, nt))
}

fn short_name(short: &[u8; 11], nt: u8) -> String {
    let trimmed_len = |part: &[u8]| part.iter().rposition(|ch| *ch != b' ').map_or(0, |idx| idx + 1);
    let display = |ch: u8, lower: bool| {
        let ch = if ch == 0x05 { ENTRY_DELETED } else { ch };
        if !ch.is_ascii() {
            '?'
        } else if lower {
            ch.to_ascii_lowercase() as char
        } else {
            ch as char
        }
    };
    let base = &short[..8];
    let ext = &short[8..];
    let mut name: String = base[..trimmed_len(base)]
        .iter()
        .map(|ch| display(*ch, nt & NT_LOWER_BASE != 0))
        .collect();
    let ext_len = trimmed_len(ext);
    if ext_len > 0 {
        name.push('.');
        name.extend(ext[..ext_len].iter().map(|ch| display(*ch, nt & NT_LOWER_EXT != 0)));
    }
    name
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
