/// Failures at the SPI protocol layer, below any notion of a filesystem.
#[derive(Debug)]
pub enum SdCardError<E> {
    /// The SPI transfer itself failed.
    Bus(E),
    /// The chip select line could not be driven.
    ChipSelect,
    /// CMD0 never brought the card into the idle state.
    IdleFailed(u8),
    /// CMD8 answered, but echoed back the wrong voltage/check pattern.
    EchoMismatch([u8; 4]),
    /// A command returned an R1 status its caller cannot proceed with.
    UnexpectedResponse { cmd: u8, r1: u8 },
    /// ACMD41 kept reporting busy past the initialization deadline.
    OpCondTimeout(u8),
    ReadyTimeout,
    TokenTimeout,
    /// The card sent an error token instead of a data start token.
    BadToken(u8),
    /// The card rejected a data block over its CRC.
    Crc,
    /// The card refused a data block for a reason other than CRC.
    WriteRejected(u8),
    WriteBusyTimeout,
    NotInitialized,
    /// The CSD register did not decode to a capacity.
    CsdDecode,
}

/// Failures visible to filesystem users. Card-level trouble is wrapped in
/// [`SdFatError::Card`]; everything else is a FAT or session condition.
#[derive(Debug)]
pub enum SdFatError<E> {
    Card(SdCardError<E>),
    InvalidBootSector,
    UnsupportedSectorSize(u16),
    NotInitialized,
    InvalidName,
    NotFound,
    NoFileOpen,
    ReadOnly,
    DiskFull,
    DirectoryFull,
    /// A FAT entry or directory record pointed outside the volume.
    BadCluster(u32),
    /// A cluster chain ran longer than the volume has clusters.
    ChainTooLong,
    /// A line read back from the card was not valid UTF-8.
    InvalidUtf8,
}

impl<E> From<SdCardError<E>> for SdFatError<E> {
    fn from(err: SdCardError<E>) -> Self {
        SdFatError::Card(err)
    }
}
