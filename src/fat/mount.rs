use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use log::debug;

use crate::bus::ClockControl;
use crate::cache::SectorCache;
use crate::card::SdCard;
use crate::error::SdFatError;
use crate::SD_SECTOR_SIZE;

use super::{FatKind, Volume, DIR_ENTRY_SIZE};

const MBR_PARTITION_TYPE: usize = 0x1C2;
const MBR_PARTITION_LBA: usize = 0x1C6;

// Largest cluster counts the 16-bit and 28-bit FAT entry widths can link.
const FAT16_MAX_CLUSTERS: u32 = 65_524;
const FAT32_MAX_CLUSTERS: u32 = 268_435_444;

pub(crate) fn mount_volume<SPI, CS>(
    card: &mut SdCard<SPI, CS>,
    cache: &mut SectorCache,
) -> Result<Volume, SdFatError<SPI::Error>>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    cache.reset();
    let sector0 = cache.load(card, 0)?;
    let start = partition_start(sector0);
    let boot = cache.load(card, start)?;
    let volume = parse_boot_sector(start, boot)?;
    debug!(
        "mount ok kind={:?} start={} reserved={} spc={} clusters={}",
        volume.kind,
        volume.partition_start,
        volume.reserved_sectors,
        volume.sectors_per_cluster,
        volume.total_clusters
    );
    Ok(volume)
}

/// Probes sector 0 for an MBR whose first entry carries a FAT partition
/// type. Anything else is treated as an unpartitioned volume with the boot
/// sector at LBA 0.
pub(crate) fn partition_start(sector0: &[u8; SD_SECTOR_SIZE]) -> u32 {
    if sector0[510] != 0x55 || sector0[511] != 0xAA {
        return 0;
    }
    let part_type = sector0[MBR_PARTITION_TYPE];
    if !matches!(part_type, 0x04 | 0x06 | 0x0B | 0x0C | 0x0E) {
        return 0;
    }
    u32::from_le_bytes([
        sector0[MBR_PARTITION_LBA],
        sector0[MBR_PARTITION_LBA + 1],
        sector0[MBR_PARTITION_LBA + 2],
        sector0[MBR_PARTITION_LBA + 3],
    ])
}

pub(crate) fn parse_boot_sector<E>(
    partition_start: u32,
    boot: &[u8; SD_SECTOR_SIZE],
) -> Result<Volume, SdFatError<E>> {
    if boot[510] != 0x55 || boot[511] != 0xAA {
        return Err(SdFatError::InvalidBootSector);
    }

    let bytes_per_sector = u16::from_le_bytes([boot[11], boot[12]]);
    if bytes_per_sector as usize != SD_SECTOR_SIZE {
        return Err(SdFatError::UnsupportedSectorSize(bytes_per_sector));
    }

    let sectors_per_cluster = boot[13];
    if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
        return Err(SdFatError::InvalidBootSector);
    }

    let reserved_sectors = u16::from_le_bytes([boot[14], boot[15]]);
    let fat_count = boot[16];
    if reserved_sectors == 0 || fat_count == 0 {
        return Err(SdFatError::InvalidBootSector);
    }
    let root_entries = u16::from_le_bytes([boot[17], boot[18]]);

    let total_16 = u16::from_le_bytes([boot[19], boot[20]]) as u32;
    let total_32 = u32::from_le_bytes([boot[32], boot[33], boot[34], boot[35]]);
    let total_sectors = if total_16 != 0 { total_16 } else { total_32 };
    if total_sectors == 0 {
        return Err(SdFatError::InvalidBootSector);
    }

    // A nonzero 16-bit FAT size marks FAT16; FAT32 moves the FAT size and
    // root cluster into the extended fields.
    let fat_size_16 = u16::from_le_bytes([boot[22], boot[23]]) as u32;
    let (kind, fat_size, root_cluster) = if fat_size_16 != 0 {
        (FatKind::Fat16, fat_size_16, 0)
    } else {
        let fat_size_32 = u32::from_le_bytes([boot[36], boot[37], boot[38], boot[39]]);
        let root_cluster = u32::from_le_bytes([boot[44], boot[45], boot[46], boot[47]]);
        if fat_size_32 == 0 || root_cluster < 2 {
            return Err(SdFatError::InvalidBootSector);
        }
        (FatKind::Fat32, fat_size_32, root_cluster)
    };

    if kind == FatKind::Fat16 && root_entries == 0 {
        return Err(SdFatError::InvalidBootSector);
    }

    let fat_start = partition_start.saturating_add(reserved_sectors as u32);
    let fat_sectors = fat_size.saturating_mul(fat_count as u32);
    let root_dir_start = fat_start.saturating_add(fat_sectors);
    let root_dir_sectors = match kind {
        FatKind::Fat16 => {
            let bytes = root_entries as u32 * DIR_ENTRY_SIZE as u32;
            bytes.div_ceil(SD_SECTOR_SIZE as u32)
        }
        FatKind::Fat32 => 0,
    };
    let data_start = root_dir_start.saturating_add(root_dir_sectors);

    let used = (reserved_sectors as u32)
        .saturating_add(fat_sectors)
        .saturating_add(root_dir_sectors);
    if total_sectors <= used {
        return Err(SdFatError::InvalidBootSector);
    }
    let total_clusters = (total_sectors - used) / sectors_per_cluster as u32;
    let max_clusters = match kind {
        FatKind::Fat16 => FAT16_MAX_CLUSTERS,
        FatKind::Fat32 => FAT32_MAX_CLUSTERS,
    };
    if total_clusters == 0 || total_clusters > max_clusters {
        return Err(SdFatError::InvalidBootSector);
    }

    Ok(Volume {
        kind,
        partition_start,
        sectors_per_cluster,
        reserved_sectors,
        fat_count,
        root_entries,
        fat_size,
        root_cluster,
        fat_start,
        root_dir_start,
        data_start,
        total_clusters,
    })
}
