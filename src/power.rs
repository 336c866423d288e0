use embassy_time::{block_for, Duration};

pub const SD_POWER_SETTLE_MS: u64 = 50;

/// Runs the board's power-on callback, then waits for the card supply
/// rail to settle before any bus traffic.
pub fn power_on_for_io<E, F>(mut power_on: F) -> Result<(), E>
where
    F: FnMut() -> Result<(), E>,
{
    power_on()?;
    block_for(Duration::from_millis(SD_POWER_SETTLE_MS));
    Ok(())
}

pub fn power_off<E, F>(mut power_off: F) -> Result<(), E>
where
    F: FnMut() -> Result<(), E>,
{
    power_off()
}
