use embedded_hal::spi::ErrorType;

/// Bus clock selection for the two phases of the SD protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusClock {
    /// Identification phase, 400 kHz or below.
    Init,
    /// Data phase, as fast as the board wiring allows.
    Data,
}

/// Switches the SPI clock between the identification and data rates.
///
/// Cards must be probed at the identification rate and only raised to the
/// data rate once initialization completes. `SpiBus` has no notion of
/// reconfiguration, so the transport supplies it through this trait.
pub trait ClockControl: ErrorType {
    fn set_clock(&mut self, clock: BusClock) -> Result<(), Self::Error>;
}
