use embassy_time::{Duration, Instant};
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::bus::ClockControl;
use crate::error::SdCardError;
use crate::SD_SECTOR_SIZE;

mod csd;
mod init;
mod io;

pub(crate) const SD_CMD0: u8 = 0;
pub(crate) const SD_CMD8: u8 = 8;
pub(crate) const SD_CMD9: u8 = 9;
pub(crate) const SD_CMD16: u8 = 16;
pub(crate) const SD_CMD17: u8 = 17;
pub(crate) const SD_CMD24: u8 = 24;
pub(crate) const SD_ACMD41: u8 = 41;
pub(crate) const SD_CMD55: u8 = 55;
pub(crate) const SD_CMD58: u8 = 58;

pub(crate) const R1_READY: u8 = 0x00;
pub(crate) const R1_IDLE: u8 = 0x01;
pub(crate) const R1_ILLEGAL_COMMAND: u8 = 0x04;

const SD_R1_POLL_BYTES: usize = 10;
const SD_DATA_START_TOKEN: u8 = 0xFE;

const SD_COMMAND_READY_TIMEOUT: Duration = Duration::from_millis(100);
const SD_WRITE_READY_TIMEOUT: Duration = Duration::from_millis(500);
const SD_TOKEN_TIMEOUT: Duration = Duration::from_millis(200);
const SD_WRITE_BUSY_TIMEOUT: Duration = Duration::from_millis(500);

/// Card flavor established by the initialization handshake. `Unknown`
/// doubles as "not initialized"; sector IO refuses to run in that state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardKind {
    Unknown,
    SdV1,
    SdV2Standard,
    SdV2HighCapacity,
}

pub(crate) struct SdCard<SPI, CS> {
    spi: SPI,
    cs: CS,
    kind: CardKind,
}

impl<SPI, CS> SdCard<SPI, CS>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    pub(crate) fn new(spi: SPI, mut cs: CS) -> Self {
        let _ = cs.set_high();
        Self {
            spi,
            cs,
            kind: CardKind::Unknown,
        }
    }

    pub(crate) fn kind(&self) -> CardKind {
        self.kind
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.kind != CardKind::Unknown
    }

    fn select(&mut self) -> Result<(), SdCardError<SPI::Error>> {
        self.cs.set_low().map_err(|_| SdCardError::ChipSelect)
    }

    fn deselect(&mut self) -> Result<(), SdCardError<SPI::Error>> {
        self.cs.set_high().map_err(|_| SdCardError::ChipSelect)
    }

    fn transfer_byte(&mut self, byte: u8) -> Result<u8, SdCardError<SPI::Error>> {
        let mut frame = [byte];
        self.spi
            .transfer_in_place(&mut frame)
            .map_err(SdCardError::Bus)?;
        Ok(frame[0])
    }

    fn send_dummy_clocks(&mut self, bytes: usize) -> Result<(), SdCardError<SPI::Error>> {
        for _ in 0..bytes {
            let _ = self.transfer_byte(0xFF)?;
        }
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<(), SdCardError<SPI::Error>> {
        let started = Instant::now();
        loop {
            if self.transfer_byte(0xFF)? == 0xFF {
                return Ok(());
            }
            if started.elapsed() > timeout {
                return Err(SdCardError::ReadyTimeout);
            }
        }
    }

    fn send_command(
        &mut self,
        cmd: u8,
        arg: u32,
        extra_response: &mut [u8],
    ) -> Result<u8, SdCardError<SPI::Error>> {
        self.send_command_inner(cmd, arg, extra_response, true)
    }

    /// Variant that leaves chip select asserted so a data phase can follow.
    fn send_command_hold_cs(
        &mut self,
        cmd: u8,
        arg: u32,
        extra_response: &mut [u8],
    ) -> Result<u8, SdCardError<SPI::Error>> {
        self.send_command_inner(cmd, arg, extra_response, false)
    }

    fn send_command_inner(
        &mut self,
        cmd: u8,
        arg: u32,
        extra_response: &mut [u8],
        release_cs_after: bool,
    ) -> Result<u8, SdCardError<SPI::Error>> {
        let frame = [
            0x40 | cmd,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            command_crc(cmd),
        ];

        self.select()?;
        match self.wait_ready(SD_COMMAND_READY_TIMEOUT) {
            // A card stuck busy shows up in the R1 poll; send the frame anyway.
            Ok(()) | Err(SdCardError::ReadyTimeout) => {}
            Err(err) => {
                let _ = self.end_transaction();
                return Err(err);
            }
        }

        for byte in frame {
            let _ = self.transfer_byte(byte)?;
        }

        // A valid R1 has the top bit clear. If the card never answers, the
        // caller gets the last polled byte and judges it.
        let mut r1 = 0xFF;
        for _ in 0..SD_R1_POLL_BYTES {
            r1 = self.transfer_byte(0xFF)?;
            if (r1 & 0x80) == 0 {
                break;
            }
        }

        if (r1 & 0x80) == 0 {
            for slot in extra_response.iter_mut() {
                *slot = self.transfer_byte(0xFF)?;
            }
        }

        if release_cs_after {
            self.end_transaction()?;
        }
        Ok(r1)
    }

    fn wait_data_token(&mut self) -> Result<(), SdCardError<SPI::Error>> {
        let started = Instant::now();
        loop {
            let token = self.transfer_byte(0xFF)?;
            if token != 0xFF {
                if token == SD_DATA_START_TOKEN {
                    return Ok(());
                }
                return Err(SdCardError::BadToken(token));
            }
            if started.elapsed() > SD_TOKEN_TIMEOUT {
                return Err(SdCardError::TokenTimeout);
            }
        }
    }

    /// Releases chip select and clocks one trailing byte so the card lets
    /// go of the data line.
    fn end_transaction(&mut self) -> Result<(), SdCardError<SPI::Error>> {
        self.deselect()?;
        let _ = self.transfer_byte(0xFF)?;
        Ok(())
    }

    /// Standard-capacity cards address by byte offset, high-capacity by
    /// sector number.
    fn block_argument(&self, lba: u32) -> u32 {
        if self.kind == CardKind::SdV2HighCapacity {
            lba
        } else {
            lba.saturating_mul(SD_SECTOR_SIZE as u32)
        }
    }
}

fn command_crc(cmd: u8) -> u8 {
    // Only CMD0 and CMD8 have their CRC checked in SPI mode.
    match cmd {
        SD_CMD0 => 0x95,
        SD_CMD8 => 0x87,
        _ => 0xFF,
    }
}
