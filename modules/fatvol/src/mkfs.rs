use fatvfs::{FatCode, FatOutcome};
use log::debug;

use crate::block::{DiskIo, DiskStatus, VolumeId};
use crate::config::MAX_SECTOR_SIZE;
use crate::fat32::{
    disk_result, write_u16, write_u32, BPB_BYTES_PER_SECTOR_OFFSET, BPB_FAT_SIZE_32_OFFSET,
    BPB_NUM_FATS_OFFSET, BPB_RESERVED_SECTORS_OFFSET, BPB_ROOT_CLUSTER_OFFSET, BPB_SECTORS_PER_CLUSTER_OFFSET,
    BPB_SIGNATURE, BPB_SIGNATURE_OFFSET, BPB_SIZE, BPB_TOTAL_SECTORS_32_OFFSET, FAT32_EOC,
};

const RESERVED_SECTORS: u32 = 32;
const NUM_FATS: u32 = 2;
const ROOT_CLUSTER: u32 = 2;
const FSINFO_SECTOR: u32 = 1;
const BACKUP_BOOT_SECTOR: u32 = 6;
const MEDIA_FIXED: u8 = 0xf8;
/// Smallest data area worth formatting.
const MIN_CLUSTERS: u32 = 16;
const ZERO_BATCH: u32 = 64;

/// Cluster size by volume size, small volumes first.
const CLUSTER_TABLE: [(u64, u32); 6] = [
    (64 << 20, 512),
    (256 << 20, 2048),
    (8 << 30, 4096),
    (16 << 30, 8192),
    (32 << 30, 16384),
    (u64::MAX, 32768),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub total_sectors: u32,
    pub sectors_per_fat: u32,
    pub clusters: u32,
}

impl Layout {
    pub(crate) fn plan(total_sectors: u64, bytes_per_sector: usize) -> FatOutcome<Self> {
        let total_sectors = total_sectors.min(u32::MAX as u64) as u32;
        let bytes_per_sector = bytes_per_sector as u32;
        let volume_bytes = total_sectors as u64 * bytes_per_sector as u64;
        let cluster_bytes = CLUSTER_TABLE
            .iter()
            .find(|(limit, _)| volume_bytes <= *limit)
            .map_or(32768, |(_, bytes)| *bytes);
        let sectors_per_cluster = (cluster_bytes / bytes_per_sector).max(1);
        if total_sectors <= RESERVED_SECTORS + NUM_FATS {
            return Err(FatCode::MkfsAborted);
        }
        let entries_per_sector = bytes_per_sector / 4;
        let mut sectors_per_fat = 1u32;
        loop {
            let data = total_sectors.saturating_sub(RESERVED_SECTORS + NUM_FATS * sectors_per_fat);
            let clusters = data / sectors_per_cluster;
            let needed = (clusters + 2).div_ceil(entries_per_sector);
            if needed <= sectors_per_fat {
                break;
            }
            sectors_per_fat = needed;
        }
        let data = total_sectors.saturating_sub(RESERVED_SECTORS + NUM_FATS * sectors_per_fat);
        let clusters = data / sectors_per_cluster;
        if clusters < MIN_CLUSTERS {
            return Err(FatCode::MkfsAborted);
        }
        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors,
            sectors_per_fat,
            clusters,
        })
    }

    fn fat_start(&self) -> u32 {
        RESERVED_SECTORS
    }

    fn root_sector(&self) -> u32 {
        self.fat_start() + NUM_FATS * self.sectors_per_fat
    }

    fn boot_sector(&self, buf: &mut [u8]) {
        buf.fill(0);
        buf[..3].copy_from_slice(&[0xeb, 0x58, 0x90]);
        buf[3..11].copy_from_slice(b"MSWIN4.1");
        write_u16(buf, BPB_BYTES_PER_SECTOR_OFFSET, self.bytes_per_sector as u16);
        buf[BPB_SECTORS_PER_CLUSTER_OFFSET] = self.sectors_per_cluster as u8;
        write_u16(buf, BPB_RESERVED_SECTORS_OFFSET, RESERVED_SECTORS as u16);
        buf[BPB_NUM_FATS_OFFSET] = NUM_FATS as u8;
        buf[21] = MEDIA_FIXED;
        write_u16(buf, 24, 63);
        write_u16(buf, 26, 255);
        write_u32(buf, BPB_TOTAL_SECTORS_32_OFFSET, self.total_sectors);
        write_u32(buf, BPB_FAT_SIZE_32_OFFSET, self.sectors_per_fat);
        write_u32(buf, BPB_ROOT_CLUSTER_OFFSET, ROOT_CLUSTER);
        write_u16(buf, 48, FSINFO_SECTOR as u16);
        write_u16(buf, 50, BACKUP_BOOT_SECTOR as u16);
        buf[64] = 0x80;
        buf[66] = 0x29;
        write_u32(buf, 67, self.total_sectors.rotate_left(16) ^ 0x4641_5433);
        buf[71..82].copy_from_slice(b"NO NAME    ");
        buf[82..90].copy_from_slice(b"FAT32   ");
        write_u16(buf, BPB_SIGNATURE_OFFSET, BPB_SIGNATURE);
    }

    fn fsinfo_sector(&self, buf: &mut [u8]) {
        buf.fill(0);
        write_u32(buf, 0, 0x4161_5252);
        write_u32(buf, 484, 0x6141_7272);
        write_u32(buf, 488, self.clusters - 1);
        write_u32(buf, 492, ROOT_CLUSTER + 1);
        write_u32(buf, 508, 0xaa55_0000);
    }
}

/// Writes an empty FAT32 filesystem spanning the whole device.
pub(crate) fn format<D: DiskIo + ?Sized>(disk: &D, pdrv: VolumeId) -> FatOutcome<()> {
    let status = disk.initialize(pdrv);
    if status.contains(DiskStatus::NOINIT) {
        return Err(FatCode::NotReady);
    }
    if status.contains(DiskStatus::PROTECT) {
        return Err(FatCode::WriteProtected);
    }
    let bytes_per_sector = disk.sector_size(pdrv);
    if !(BPB_SIZE..=MAX_SECTOR_SIZE).contains(&bytes_per_sector) || !bytes_per_sector.is_power_of_two() {
        return Err(FatCode::DiskErr);
    }
    let layout = Layout::plan(disk.sector_count(pdrv), bytes_per_sector)?;
    debug!(
        "mkfs: drive {pdrv}: {} sectors, {} clusters, {} sectors per FAT",
        layout.total_sectors, layout.clusters, layout.sectors_per_fat
    );

    let zero_end = layout.root_sector() + layout.sectors_per_cluster;
    let batch = vec![0u8; ZERO_BATCH as usize * bytes_per_sector];
    let mut sector = 0u32;
    while sector < zero_end {
        let count = (zero_end - sector).min(ZERO_BATCH);
        disk_result(disk.sector_write(pdrv, sector as u64, count, &batch[..count as usize * bytes_per_sector]))?;
        sector += count;
    }

    let mut scratch = [0u8; MAX_SECTOR_SIZE];
    let buf = &mut scratch[..bytes_per_sector];
    layout.boot_sector(buf);
    disk_result(disk.sector_write(pdrv, 0, 1, buf))?;
    disk_result(disk.sector_write(pdrv, BACKUP_BOOT_SECTOR as u64, 1, buf))?;

    layout.fsinfo_sector(buf);
    disk_result(disk.sector_write(pdrv, FSINFO_SECTOR as u64, 1, buf))?;
    disk_result(disk.sector_write(pdrv, (BACKUP_BOOT_SECTOR + FSINFO_SECTOR) as u64, 1, buf))?;

    buf.fill(0);
    write_u32(buf, 0, 0x0fff_ff00 | MEDIA_FIXED as u32);
    write_u32(buf, 4, FAT32_EOC);
    write_u32(buf, 8, FAT32_EOC);
    for fat in 0..NUM_FATS {
        let first = layout.fat_start() + fat * layout.sectors_per_fat;
        disk_result(disk.sector_write(pdrv, first as u64, 1, buf))?;
    }
    Ok(())
}
