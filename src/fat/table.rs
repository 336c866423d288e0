use core::cmp;

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::bus::ClockControl;
use crate::error::SdFatError;
use crate::SD_SECTOR_SIZE;

use super::{FatKind, VolumeIo};

impl<SPI, CS> VolumeIo<'_, SPI, CS>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    pub(crate) fn fat_entry(&mut self, cluster: u32) -> Result<u32, SdFatError<SPI::Error>> {
        let (lba, index) = self.fat_location(cluster, 0)?;
        let kind = self.volume.kind;
        let sector = self.cache.load(&mut *self.card, lba)?;
        let value = match kind {
            FatKind::Fat16 => u16::from_le_bytes([sector[index], sector[index + 1]]) as u32,
            FatKind::Fat32 => {
                u32::from_le_bytes([
                    sector[index],
                    sector[index + 1],
                    sector[index + 2],
                    sector[index + 3],
                ]) & 0x0FFF_FFFF
            }
        };
        Ok(value)
    }

    /// Writes one FAT entry into every FAT copy, flushing each patched
    /// sector so the copies never drift apart.
    pub(crate) fn set_fat_entry(
        &mut self,
        cluster: u32,
        value: u32,
    ) -> Result<(), SdFatError<SPI::Error>> {
        for fat_index in 0..self.volume.fat_count as u32 {
            let (lba, index) = self.fat_location(cluster, fat_index)?;
            let kind = self.volume.kind;
            let sector = self.cache.load_mut(&mut *self.card, lba)?;
            match kind {
                FatKind::Fat16 => {
                    sector[index..index + 2].copy_from_slice(&(value as u16).to_le_bytes());
                }
                FatKind::Fat32 => {
                    let old = u32::from_le_bytes([
                        sector[index],
                        sector[index + 1],
                        sector[index + 2],
                        sector[index + 3],
                    ]);
                    // The top four FAT32 bits are reserved and must survive.
                    let new = (old & 0xF000_0000) | (value & 0x0FFF_FFFF);
                    sector[index..index + 4].copy_from_slice(&new.to_le_bytes());
                }
            }
            self.cache.flush(&mut *self.card)?;
        }
        Ok(())
    }

    /// Follows one chain link. `Ok(None)` is end of chain; a link outside
    /// the volume is corruption.
    pub(crate) fn next_cluster(
        &mut self,
        cluster: u32,
    ) -> Result<Option<u32>, SdFatError<SPI::Error>> {
        let value = self.fat_entry(cluster)?;
        if self.volume.end_of_chain(value) {
            return Ok(None);
        }
        if value < 2 || value > self.volume.max_cluster() {
            return Err(SdFatError::BadCluster(value));
        }
        Ok(Some(value))
    }

    /// Claims a free cluster, marks it end-of-chain, links it after
    /// `previous` when one is given, and zero-fills its sectors.
    pub(crate) fn allocate_cluster(
        &mut self,
        previous: u32,
    ) -> Result<u32, SdFatError<SPI::Error>> {
        let search_from = if previous >= 2 {
            previous.saturating_add(1)
        } else {
            2
        };
        let cluster = self.find_free_cluster(search_from)?;
        self.set_fat_entry(cluster, self.volume.end_of_chain_value())?;
        if previous >= 2 {
            self.set_fat_entry(previous, cluster)?;
        }
        self.zero_fill_cluster(cluster)?;
        Ok(cluster)
    }

    pub(crate) fn free_chain(&mut self, start_cluster: u32) -> Result<(), SdFatError<SPI::Error>> {
        if start_cluster < 2 {
            return Ok(());
        }
        let max_cluster = self.volume.max_cluster();
        let mut cluster = start_cluster;
        let mut visited = 0u32;
        loop {
            if visited > self.volume.total_clusters.saturating_add(2) {
                return Err(SdFatError::ChainTooLong);
            }
            visited = visited.saturating_add(1);

            let entry = self.fat_entry(cluster)?;
            self.set_fat_entry(cluster, 0)?;
            if self.volume.end_of_chain(entry) || entry < 2 || entry > max_cluster {
                break;
            }
            cluster = entry;
        }
        Ok(())
    }

    /// Walks `index` links from `first_cluster`. Running off the end of the
    /// chain means the chain disagrees with the recorded file size.
    pub(crate) fn cluster_at_index(
        &mut self,
        first_cluster: u32,
        index: u32,
    ) -> Result<u32, SdFatError<SPI::Error>> {
        if first_cluster < 2 {
            return Err(SdFatError::BadCluster(first_cluster));
        }
        let mut cluster = first_cluster;
        for _ in 0..index {
            cluster = self
                .next_cluster(cluster)?
                .ok_or(SdFatError::ChainTooLong)?;
        }
        Ok(cluster)
    }

    fn find_free_cluster(&mut self, start_cluster: u32) -> Result<u32, SdFatError<SPI::Error>> {
        let max_cluster = self.volume.max_cluster();
        let start = cmp::max(2, cmp::min(start_cluster, max_cluster));
        for cluster in start..=max_cluster {
            if self.fat_entry(cluster)? == 0 {
                return Ok(cluster);
            }
        }
        for cluster in 2..start {
            if self.fat_entry(cluster)? == 0 {
                return Ok(cluster);
            }
        }
        Err(SdFatError::DiskFull)
    }

    fn zero_fill_cluster(&mut self, cluster: u32) -> Result<(), SdFatError<SPI::Error>> {
        let first_lba = self.volume.cluster_to_lba(cluster)?;
        let sectors = self.volume.sectors_per_cluster as u32;
        // The direct writes below would leave any cached copy stale.
        self.cache.forget_range(first_lba, sectors);
        let zero = [0u8; SD_SECTOR_SIZE];
        for offset in 0..sectors {
            self.card.write_sector(first_lba + offset, &zero)?;
        }
        Ok(())
    }

    fn fat_location(
        &self,
        cluster: u32,
        fat_index: u32,
    ) -> Result<(u32, usize), SdFatError<SPI::Error>> {
        if cluster < 2 || cluster > self.volume.max_cluster() {
            return Err(SdFatError::BadCluster(cluster));
        }
        let entry_size = match self.volume.kind {
            FatKind::Fat16 => 2u64,
            FatKind::Fat32 => 4u64,
        };
        let byte_offset = cluster as u64 * entry_size;
        let sector_offset = (byte_offset / SD_SECTOR_SIZE as u64) as u32;
        let index = (byte_offset % SD_SECTOR_SIZE as u64) as usize;
        if sector_offset >= self.volume.fat_size {
            return Err(SdFatError::BadCluster(cluster));
        }
        let fat_base = self
            .volume
            .fat_start
            .saturating_add(fat_index.saturating_mul(self.volume.fat_size));
        Ok((fat_base.saturating_add(sector_offset), index))
    }
}
