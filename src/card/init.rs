use embassy_time::{block_for, Duration, Instant};
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use log::debug;

use crate::bus::{BusClock, ClockControl};
use crate::error::SdCardError;
use crate::SD_SECTOR_SIZE;

use super::{
    CardKind, SdCard, R1_IDLE, R1_ILLEGAL_COMMAND, R1_READY, SD_ACMD41, SD_CMD0, SD_CMD16,
    SD_CMD55, SD_CMD58, SD_CMD8,
};

const SD_CMD0_RETRIES: usize = 16;
const SD_OP_COND_TIMEOUT: Duration = Duration::from_millis(2000);
const SD_OP_COND_POLL: Duration = Duration::from_millis(10);

const CMD8_VHS_CHECK_PATTERN: u32 = 0x0000_01AA;
const ACMD41_HIGH_CAPACITY: u32 = 0x4000_0000;
const OCR_HIGH_CAPACITY: u8 = 0x40;

impl<SPI, CS> SdCard<SPI, CS>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    /// Runs the SPI-mode initialization handshake and establishes the card
    /// kind. Safe to call again after a failure or card swap; the previous
    /// state is discarded up front.
    pub(crate) fn init(&mut self) -> Result<CardKind, SdCardError<SPI::Error>> {
        self.kind = CardKind::Unknown;
        self.spi
            .set_clock(BusClock::Init)
            .map_err(SdCardError::Bus)?;

        // At least 74 clocks with chip select released put the card into
        // SPI command mode.
        self.deselect()?;
        self.send_dummy_clocks(10)?;

        let mut cmd0_r1 = 0xFF;
        for _ in 0..SD_CMD0_RETRIES {
            cmd0_r1 = self.send_command(SD_CMD0, 0, &mut [])?;
            if cmd0_r1 == R1_IDLE {
                break;
            }
        }
        if cmd0_r1 != R1_IDLE {
            return Err(SdCardError::IdleFailed(cmd0_r1));
        }

        let mut r7 = [0u8; 4];
        let cmd8_r1 = self.send_command(SD_CMD8, CMD8_VHS_CHECK_PATTERN, &mut r7)?;
        let v2 = if cmd8_r1 == R1_IDLE {
            if r7[2] != 0x01 || r7[3] != 0xAA {
                return Err(SdCardError::EchoMismatch(r7));
            }
            true
        } else if (cmd8_r1 & R1_ILLEGAL_COMMAND) != 0 {
            // CMD8 predates the v1 generation; rejecting it is the v1 answer.
            false
        } else {
            return Err(SdCardError::UnexpectedResponse {
                cmd: SD_CMD8,
                r1: cmd8_r1,
            });
        };

        let acmd41_arg = if v2 { ACMD41_HIGH_CAPACITY } else { 0 };
        let started = Instant::now();
        loop {
            let _ = self.send_command(SD_CMD55, 0, &mut [])?;
            let r1 = self.send_command(SD_ACMD41, acmd41_arg, &mut [])?;
            if r1 == R1_READY {
                break;
            }
            if started.elapsed() > SD_OP_COND_TIMEOUT {
                return Err(SdCardError::OpCondTimeout(r1));
            }
            block_for(SD_OP_COND_POLL);
        }

        let kind = if v2 {
            let mut ocr = [0u8; 4];
            let cmd58_r1 = self.send_command(SD_CMD58, 0, &mut ocr)?;
            if cmd58_r1 != R1_READY {
                return Err(SdCardError::UnexpectedResponse {
                    cmd: SD_CMD58,
                    r1: cmd58_r1,
                });
            }
            if (ocr[0] & OCR_HIGH_CAPACITY) != 0 {
                CardKind::SdV2HighCapacity
            } else {
                CardKind::SdV2Standard
            }
        } else {
            // v1 cards may power up with another block length.
            let cmd16_r1 = self.send_command(SD_CMD16, SD_SECTOR_SIZE as u32, &mut [])?;
            if cmd16_r1 != R1_READY {
                return Err(SdCardError::UnexpectedResponse {
                    cmd: SD_CMD16,
                    r1: cmd16_r1,
                });
            }
            CardKind::SdV1
        };

        self.spi
            .set_clock(BusClock::Data)
            .map_err(SdCardError::Bus)?;
        self.kind = kind;
        debug!("card init ok kind={:?}", kind);
        Ok(kind)
    }
}
