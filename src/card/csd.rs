use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::bus::ClockControl;
use crate::error::SdCardError;

use super::{SdCard, R1_READY, SD_CMD9};

impl<SPI, CS> SdCard<SPI, CS>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    /// Reads the CSD register and decodes the card capacity in bytes.
    pub(crate) fn capacity_bytes(&mut self) -> Result<u64, SdCardError<SPI::Error>> {
        if !self.is_initialized() {
            return Err(SdCardError::NotInitialized);
        }

        let r1 = self.send_command_hold_cs(SD_CMD9, 0, &mut [])?;
        if r1 != R1_READY {
            let _ = self.end_transaction();
            return Err(SdCardError::UnexpectedResponse { cmd: SD_CMD9, r1 });
        }
        if let Err(err) = self.wait_data_token() {
            let _ = self.end_transaction();
            return Err(err);
        }

        let mut csd = [0u8; 16];
        for slot in csd.iter_mut() {
            *slot = self.transfer_byte(0xFF)?;
        }
        // Discard the register CRC16.
        let _ = self.transfer_byte(0xFF)?;
        let _ = self.transfer_byte(0xFF)?;
        self.end_transaction()?;

        decode_capacity_bytes(&csd).ok_or(SdCardError::CsdDecode)
    }
}

fn decode_capacity_bytes(csd: &[u8; 16]) -> Option<u64> {
    match csd_get_bits(csd, 127, 126) {
        0 => {
            // CSD v1: capacity = (c_size + 1) * 2^(c_size_mult + 2) * 2^read_bl_len
            let c_size = csd_get_bits(csd, 73, 62) as u64;
            let c_size_mult = csd_get_bits(csd, 49, 47);
            let read_bl_len = csd_get_bits(csd, 83, 80);
            let mult = 1u64.checked_shl(c_size_mult + 2)?;
            let block_len = 1u64.checked_shl(read_bl_len)?;
            (c_size + 1).checked_mul(mult)?.checked_mul(block_len)
        }
        1 => {
            // CSD v2: capacity = (c_size + 1) * 512 KiB
            let c_size = csd_get_bits(csd, 69, 48) as u64;
            (c_size + 1).checked_mul(512 * 1024)
        }
        _ => None,
    }
}

/// Extracts `[msb:lsb]` from the CSD, which arrives with bit 127 first.
fn csd_get_bits(csd: &[u8; 16], msb: u32, lsb: u32) -> u32 {
    let mut value = 0u32;
    for bit in (lsb..=msb).rev() {
        let byte_index = ((127 - bit) / 8) as usize;
        let bit_in_byte = bit % 8;
        value = (value << 1) | ((csd[byte_index] >> bit_in_byte) & 1) as u32;
    }
    value
}
