use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::bus::ClockControl;
use crate::error::SdFatError;
use crate::SD_SECTOR_SIZE;

use super::{FatKind, VolumeIo, DIR_ENTRY_SIZE};

pub(crate) const ATTR_VOLUME_ID: u8 = 0x08;
pub(crate) const ATTR_DIRECTORY: u8 = 0x10;
pub(crate) const ATTR_ARCHIVE: u8 = 0x20;

const DIR_ENTRY_END: u8 = 0x00;
const DIR_ENTRY_DELETED: u8 = 0xE5;

/// Where a directory entry lives on disk: its sector and the byte offset
/// of the 32-byte record inside it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirLocation {
    pub(crate) lba: u32,
    pub(crate) offset: u16,
}

#[derive(Clone, Copy)]
pub(crate) struct DirRecord {
    pub(crate) short_name: [u8; 11],
    pub(crate) attr: u8,
    pub(crate) first_cluster: u32,
    pub(crate) size: u32,
}

#[derive(Clone, Copy)]
pub(crate) struct DirFound {
    pub(crate) location: DirLocation,
    pub(crate) record: DirRecord,
}

/// One pass over the root directory: the matching entry, if a target name
/// was given, and the first reusable slot seen along the way.
#[derive(Clone, Copy)]
pub(crate) struct DirScan {
    pub(crate) found: Option<DirFound>,
    pub(crate) free: Option<DirLocation>,
}

impl<SPI, CS> VolumeIo<'_, SPI, CS>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    pub(crate) fn scan_directory(
        &mut self,
        target: Option<&[u8; 11]>,
    ) -> Result<DirScan, SdFatError<SPI::Error>> {
        let mut scan = DirScan {
            found: None,
            free: None,
        };
        match self.volume.kind {
            FatKind::Fat16 => {
                // FAT16 keeps the root in a fixed region sized by the boot sector.
                let entry_bytes = self.volume.root_entries as u32 * DIR_ENTRY_SIZE as u32;
                let sectors = entry_bytes.div_ceil(SD_SECTOR_SIZE as u32);
                for sector_index in 0..sectors {
                    let lba = self.volume.root_dir_start + sector_index;
                    if self.scan_directory_sector(lba, target, &mut scan)? {
                        return Ok(scan);
                    }
                }
            }
            FatKind::Fat32 => {
                let mut cluster = self.volume.root_cluster;
                let mut visited = 0u32;
                loop {
                    if visited > self.volume.total_clusters.saturating_add(2) {
                        return Err(SdFatError::ChainTooLong);
                    }
                    visited = visited.saturating_add(1);

                    let first_lba = self.volume.cluster_to_lba(cluster)?;
                    for sector_index in 0..self.volume.sectors_per_cluster as u32 {
                        if self.scan_directory_sector(first_lba + sector_index, target, &mut scan)?
                        {
                            return Ok(scan);
                        }
                    }
                    match self.next_cluster(cluster)? {
                        Some(next) => cluster = next,
                        None => break,
                    }
                }
            }
        }
        Ok(scan)
    }

    /// Returns `Ok(true)` once the scan can stop: the target was found or
    /// the end marker was reached.
    fn scan_directory_sector(
        &mut self,
        lba: u32,
        target: Option<&[u8; 11]>,
        scan: &mut DirScan,
    ) -> Result<bool, SdFatError<SPI::Error>> {
        let kind = self.volume.kind;
        let sector = self.cache.load(&mut *self.card, lba)?;
        for base in (0..SD_SECTOR_SIZE).step_by(DIR_ENTRY_SIZE) {
            let first = sector[base];
            if first == DIR_ENTRY_END {
                // 0x00 frees this slot and every one after it.
                if scan.free.is_none() {
                    scan.free = Some(DirLocation {
                        lba,
                        offset: base as u16,
                    });
                }
                return Ok(true);
            }
            if first == DIR_ENTRY_DELETED {
                if scan.free.is_none() {
                    scan.free = Some(DirLocation {
                        lba,
                        offset: base as u16,
                    });
                }
                continue;
            }
            let attr = sector[base + 11];
            if (attr & (ATTR_VOLUME_ID | ATTR_DIRECTORY)) != 0 {
                // Volume labels, long-name entries and subdirectories are
                // not files this driver serves.
                continue;
            }
            if let Some(name) = target {
                if sector[base..base + 11] == name[..] {
                    scan.found = Some(DirFound {
                        location: DirLocation {
                            lba,
                            offset: base as u16,
                        },
                        record: decode_record(sector, base, kind),
                    });
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Turns the free slot of a scan into a slot ready to be written,
    /// growing the FAT32 root chain when the scan came up empty.
    pub(crate) fn reserve_entry_slot(
        &mut self,
        free: Option<DirLocation>,
    ) -> Result<DirLocation, SdFatError<SPI::Error>> {
        if let Some(location) = free {
            return Ok(location);
        }
        match self.volume.kind {
            FatKind::Fat16 => Err(SdFatError::DirectoryFull),
            FatKind::Fat32 => {
                self.extend_root_directory()?;
                let scan = self.scan_directory(None)?;
                scan.free.ok_or(SdFatError::DirectoryFull)
            }
        }
    }

    fn extend_root_directory(&mut self) -> Result<(), SdFatError<SPI::Error>> {
        let mut tail = self.volume.root_cluster;
        let mut visited = 0u32;
        while let Some(next) = self.next_cluster(tail)? {
            if visited > self.volume.total_clusters.saturating_add(2) {
                return Err(SdFatError::ChainTooLong);
            }
            visited = visited.saturating_add(1);
            tail = next;
        }
        // The fresh cluster arrives zeroed, which is exactly a run of free
        // directory slots.
        self.allocate_cluster(tail)?;
        Ok(())
    }

    pub(crate) fn write_entry(
        &mut self,
        location: DirLocation,
        record: &DirRecord,
    ) -> Result<(), SdFatError<SPI::Error>> {
        let kind = self.volume.kind;
        let sector = self.cache.load_mut(&mut *self.card, location.lba)?;
        let base = location.offset as usize;
        for byte in sector[base..base + DIR_ENTRY_SIZE].iter_mut() {
            *byte = 0;
        }
        sector[base..base + 11].copy_from_slice(&record.short_name);
        sector[base + 11] = record.attr;
        write_cluster_fields(sector, base, kind, record.first_cluster);
        sector[base + 28..base + 32].copy_from_slice(&record.size.to_le_bytes());
        self.cache.flush(&mut *self.card)?;
        Ok(())
    }

    /// Patches first cluster and size of an existing entry, leaving name
    /// and attributes untouched.
    pub(crate) fn update_entry(
        &mut self,
        location: DirLocation,
        first_cluster: u32,
        size: u32,
    ) -> Result<(), SdFatError<SPI::Error>> {
        let kind = self.volume.kind;
        let sector = self.cache.load_mut(&mut *self.card, location.lba)?;
        let base = location.offset as usize;
        write_cluster_fields(sector, base, kind, first_cluster);
        sector[base + 28..base + 32].copy_from_slice(&size.to_le_bytes());
        self.cache.flush(&mut *self.card)?;
        Ok(())
    }

    pub(crate) fn delete_entry(
        &mut self,
        location: DirLocation,
    ) -> Result<(), SdFatError<SPI::Error>> {
        let sector = self.cache.load_mut(&mut *self.card, location.lba)?;
        sector[location.offset as usize] = DIR_ENTRY_DELETED;
        self.cache.flush(&mut *self.card)?;
        Ok(())
    }
}

fn decode_record(sector: &[u8; SD_SECTOR_SIZE], base: usize, kind: FatKind) -> DirRecord {
    let mut short_name = [0u8; 11];
    short_name.copy_from_slice(&sector[base..base + 11]);
    let attr = sector[base + 11];
    let cluster_lo = u16::from_le_bytes([sector[base + 26], sector[base + 27]]) as u32;
    let first_cluster = match kind {
        FatKind::Fat16 => cluster_lo,
        FatKind::Fat32 => {
            let cluster_hi = u16::from_le_bytes([sector[base + 20], sector[base + 21]]) as u32;
            (cluster_hi << 16) | cluster_lo
        }
    };
    let size = u32::from_le_bytes([
        sector[base + 28],
        sector[base + 29],
        sector[base + 30],
        sector[base + 31],
    ]);
    DirRecord {
        short_name,
        attr,
        first_cluster,
        size,
    }
}

fn write_cluster_fields(
    sector: &mut [u8; SD_SECTOR_SIZE],
    base: usize,
    kind: FatKind,
    first_cluster: u32,
) {
    if kind == FatKind::Fat32 {
        // FAT16 keeps unrelated data in bytes 20/21; only FAT32 stores the
        // high half of the cluster number there.
        let hi = ((first_cluster >> 16) as u16).to_le_bytes();
        sector[base + 20..base + 22].copy_from_slice(&hi);
    }
    let lo = (first_cluster as u16).to_le_bytes();
    sector[base + 26..base + 28].copy_from_slice(&lo);
}

/// Encodes a bare `NAME.EXT` into the padded 11-byte short form: uppercase,
/// at most 8+3, split at the last dot.
pub(crate) fn encode_short_name<E>(name: &str) -> Result<[u8; 11], SdFatError<E>> {
    let bytes = name.as_bytes();
    let (base, ext) = match bytes.iter().rposition(|&b| b == b'.') {
        Some(dot) => (&bytes[..dot], &bytes[dot + 1..]),
        None => (bytes, &[][..]),
    };

    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return Err(SdFatError::InvalidName);
    }

    let mut out = [b' '; 11];
    for (i, &byte) in base.iter().enumerate() {
        out[i] = normalize_short_char(byte)?;
    }
    for (i, &byte) in ext.iter().enumerate() {
        out[8 + i] = normalize_short_char(byte)?;
    }
    Ok(out)
}

fn normalize_short_char<E>(byte: u8) -> Result<u8, SdFatError<E>> {
    let up = byte.to_ascii_uppercase();
    if up.is_ascii_alphanumeric() || matches!(up, b'_' | b'-' | b'$' | b'~') {
        Ok(up)
    } else {
        Err(SdFatError::InvalidName)
    }
}
