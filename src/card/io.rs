use embassy_time::Instant;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::bus::ClockControl;
use crate::error::SdCardError;
use crate::SD_SECTOR_SIZE;

use super::{
    SdCard, R1_READY, SD_CMD17, SD_CMD24, SD_DATA_START_TOKEN, SD_WRITE_BUSY_TIMEOUT,
    SD_WRITE_READY_TIMEOUT,
};

impl<SPI, CS> SdCard<SPI, CS>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    pub(crate) fn read_sector(
        &mut self,
        lba: u32,
        out: &mut [u8; SD_SECTOR_SIZE],
    ) -> Result<(), SdCardError<SPI::Error>> {
        if !self.is_initialized() {
            return Err(SdCardError::NotInitialized);
        }

        let arg = self.block_argument(lba);
        let r1 = self.send_command_hold_cs(SD_CMD17, arg, &mut [])?;
        if r1 != R1_READY {
            let _ = self.end_transaction();
            return Err(SdCardError::UnexpectedResponse { cmd: SD_CMD17, r1 });
        }
        if let Err(err) = self.wait_data_token() {
            let _ = self.end_transaction();
            return Err(err);
        }

        for slot in out.iter_mut() {
            *slot = self.transfer_byte(0xFF)?;
        }
        // Discard the data CRC16.
        let _ = self.transfer_byte(0xFF)?;
        let _ = self.transfer_byte(0xFF)?;

        self.end_transaction()?;
        Ok(())
    }

    pub(crate) fn write_sector(
        &mut self,
        lba: u32,
        data: &[u8; SD_SECTOR_SIZE],
    ) -> Result<(), SdCardError<SPI::Error>> {
        if !self.is_initialized() {
            return Err(SdCardError::NotInitialized);
        }

        // A previous write may still be committing.
        self.select()?;
        if let Err(err) = self.wait_ready(SD_WRITE_READY_TIMEOUT) {
            let _ = self.end_transaction();
            return Err(err);
        }

        let arg = self.block_argument(lba);
        let r1 = self.send_command_hold_cs(SD_CMD24, arg, &mut [])?;
        if r1 != R1_READY {
            let _ = self.end_transaction();
            return Err(SdCardError::UnexpectedResponse { cmd: SD_CMD24, r1 });
        }

        let _ = self.transfer_byte(0xFF)?;
        let _ = self.transfer_byte(SD_DATA_START_TOKEN)?;
        for &byte in data.iter() {
            let _ = self.transfer_byte(byte)?;
        }
        // The data CRC16 goes unchecked in SPI mode.
        let _ = self.transfer_byte(0xFF)?;
        let _ = self.transfer_byte(0xFF)?;

        let response = self.transfer_byte(0xFF)? & 0x1F;
        match response {
            0x05 => {}
            0x0B => {
                let _ = self.end_transaction();
                return Err(SdCardError::Crc);
            }
            other => {
                let _ = self.end_transaction();
                return Err(SdCardError::WriteRejected(other));
            }
        }

        let started = Instant::now();
        loop {
            if self.transfer_byte(0xFF)? == 0xFF {
                break;
            }
            if started.elapsed() > SD_WRITE_BUSY_TIMEOUT {
                let _ = self.end_transaction();
                return Err(SdCardError::WriteBusyTimeout);
            }
        }

        self.end_transaction()?;
        Ok(())
    }
}
