#![cfg_attr(not(test), no_std)]

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

pub mod bus;
mod cache;
mod card;
mod error;
mod fat;
mod file;
pub mod power;

pub use bus::{BusClock, ClockControl};
pub use card::CardKind;
pub use error::{SdCardError, SdFatError};
pub use fat::FatKind;
pub use file::FileMode;
pub use power::{power_off, power_on_for_io, SD_POWER_SETTLE_MS};

pub const SD_SECTOR_SIZE: usize = 512;
pub const SD_LINE_MAX: usize = 256;

/// SPI-mode SD/SDHC card driver with a built-in FAT16/FAT32 filesystem.
/// Holds the whole driver state: the card session, a single-sector cache,
/// the mounted volume and at most one open file. No allocator involved.
pub struct SdFat<SPI, CS> {
    card: card::SdCard<SPI, CS>,
    cache: cache::SectorCache,
    volume: Option<fat::Volume>,
    session: Option<file::FileSession>,
}

impl<SPI, CS> SdFat<SPI, CS>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self {
            card: card::SdCard::new(spi, cs),
            cache: cache::SectorCache::new(),
            volume: None,
            session: None,
        }
    }

    /// Runs card bring-up and mounts the first FAT volume. Any previous
    /// session and cached sector are discarded first, so a remount after a
    /// card swap starts clean.
    pub fn mount(&mut self) -> Result<(), SdFatError<SPI::Error>> {
        self.session = None;
        self.volume = None;
        self.cache.reset();
        self.card.init()?;
        let volume = fat::mount_volume(&mut self.card, &mut self.cache)?;
        self.volume = Some(volume);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.volume.is_some()
    }

    pub fn card_kind(&self) -> CardKind {
        self.card.kind()
    }

    pub fn fat_kind(&self) -> Option<FatKind> {
        self.volume.map(|v| v.kind)
    }

    /// Card capacity decoded from the CSD register, independent of any
    /// mounted volume.
    pub fn card_capacity_bytes(&mut self) -> Result<u64, SdFatError<SPI::Error>> {
        Ok(self.card.capacity_bytes()?)
    }

    fn volume_io(&mut self) -> Result<fat::VolumeIo<'_, SPI, CS>, SdFatError<SPI::Error>> {
        let volume = self.volume.as_ref().ok_or(SdFatError::NotInitialized)?;
        Ok(fat::VolumeIo {
            card: &mut self.card,
            cache: &mut self.cache,
            volume,
        })
    }
}
