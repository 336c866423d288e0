use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::bus::ClockControl;
use crate::card::SdCard;
use crate::error::SdCardError;
use crate::SD_SECTOR_SIZE;

/// Single-sector read-modify-write cache. All filesystem sector traffic
/// funnels through here; only one sector is resident at a time and a dirty
/// sector is written back before its slot is reused.
pub(crate) struct SectorCache {
    buf: [u8; SD_SECTOR_SIZE],
    lba: Option<u32>,
    dirty: bool,
}

impl SectorCache {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [0; SD_SECTOR_SIZE],
            lba: None,
            dirty: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.lba = None;
        self.dirty = false;
    }

    pub(crate) fn load<SPI, CS>(
        &mut self,
        card: &mut SdCard<SPI, CS>,
        lba: u32,
    ) -> Result<&[u8; SD_SECTOR_SIZE], SdCardError<SPI::Error>>
    where
        SPI: SpiBus + ClockControl,
        CS: OutputPin,
    {
        self.fill(card, lba)?;
        Ok(&self.buf)
    }

    pub(crate) fn load_mut<SPI, CS>(
        &mut self,
        card: &mut SdCard<SPI, CS>,
        lba: u32,
    ) -> Result<&mut [u8; SD_SECTOR_SIZE], SdCardError<SPI::Error>>
    where
        SPI: SpiBus + ClockControl,
        CS: OutputPin,
    {
        self.fill(card, lba)?;
        self.dirty = true;
        Ok(&mut self.buf)
    }

    pub(crate) fn flush<SPI, CS>(
        &mut self,
        card: &mut SdCard<SPI, CS>,
    ) -> Result<(), SdCardError<SPI::Error>>
    where
        SPI: SpiBus + ClockControl,
        CS: OutputPin,
    {
        if !self.dirty {
            return Ok(());
        }
        if let Some(lba) = self.lba {
            card.write_sector(lba, &self.buf)?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Drops the slot when it falls inside a sector range that was written
    /// past the cache.
    pub(crate) fn forget_range(&mut self, first_lba: u32, sectors: u32) {
        if let Some(lba) = self.lba {
            if lba >= first_lba && lba - first_lba < sectors {
                self.reset();
            }
        }
    }

    fn fill<SPI, CS>(
        &mut self,
        card: &mut SdCard<SPI, CS>,
        lba: u32,
    ) -> Result<(), SdCardError<SPI::Error>>
    where
        SPI: SpiBus + ClockControl,
        CS: OutputPin,
    {
        if self.lba == Some(lba) {
            return Ok(());
        }
        self.flush(card)?;
        // The slot identity must not survive a failed refill.
        self.lba = None;
        card.read_sector(lba, &mut self.buf)?;
        self.lba = Some(lba);
        Ok(())
    }
}
