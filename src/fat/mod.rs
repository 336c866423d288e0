use crate::cache::SectorCache;
use crate::card::SdCard;
use crate::error::SdFatError;
use crate::SD_SECTOR_SIZE;

mod dir;
mod mount;
mod table;

pub(crate) use dir::{encode_short_name, DirFound, DirLocation, DirRecord, ATTR_ARCHIVE};
pub(crate) use mount::mount_volume;

pub(crate) const DIR_ENTRY_SIZE: usize = 32;

const FAT16_EOC: u32 = 0xFFF8;
const FAT16_EOC_WRITE: u32 = 0xFFFF;
const FAT32_EOC: u32 = 0x0FFF_FFF8;
const FAT32_EOC_WRITE: u32 = 0x0FFF_FFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatKind {
    Fat16,
    Fat32,
}

/// Mounted volume geometry, fixed at mount time. All sector numbers are
/// absolute card LBAs; the partition offset is already folded in.
#[derive(Clone, Copy)]
pub(crate) struct Volume {
    pub(crate) kind: FatKind,
    pub(crate) partition_start: u32,
    pub(crate) sectors_per_cluster: u8,
    pub(crate) reserved_sectors: u16,
    pub(crate) fat_count: u8,
    pub(crate) root_entries: u16,
    pub(crate) fat_size: u32,
    pub(crate) root_cluster: u32,
    pub(crate) fat_start: u32,
    pub(crate) root_dir_start: u32,
    pub(crate) data_start: u32,
    pub(crate) total_clusters: u32,
}

impl Volume {
    pub(crate) fn cluster_bytes(&self) -> u32 {
        self.sectors_per_cluster as u32 * SD_SECTOR_SIZE as u32
    }

    /// Highest valid cluster number. Data clusters are numbered from 2.
    pub(crate) fn max_cluster(&self) -> u32 {
        self.total_clusters.saturating_add(1)
    }

    pub(crate) fn cluster_to_lba<E>(&self, cluster: u32) -> Result<u32, SdFatError<E>> {
        if cluster < 2 {
            return Err(SdFatError::BadCluster(cluster));
        }
        let index = cluster - 2;
        Ok(self
            .data_start
            .saturating_add(index.saturating_mul(self.sectors_per_cluster as u32)))
    }

    pub(crate) fn end_of_chain(&self, value: u32) -> bool {
        match self.kind {
            FatKind::Fat16 => value >= FAT16_EOC,
            FatKind::Fat32 => value >= FAT32_EOC,
        }
    }

    pub(crate) fn end_of_chain_value(&self) -> u32 {
        match self.kind {
            FatKind::Fat16 => FAT16_EOC_WRITE,
            FatKind::Fat32 => FAT32_EOC_WRITE,
        }
    }
}

/// Borrowed bundle the FAT and directory layers operate on: the card, the
/// sector cache in front of it, and the mounted geometry.
pub(crate) struct VolumeIo<'a, SPI, CS> {
    pub(crate) card: &'a mut SdCard<SPI, CS>,
    pub(crate) cache: &'a mut SectorCache,
    pub(crate) volume: &'a Volume,
}
