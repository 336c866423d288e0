use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use heapless::{String, Vec};
use log::{debug, warn};

use crate::bus::ClockControl;
use crate::error::SdFatError;
use crate::fat::{encode_short_name, DirFound, DirLocation, DirRecord, VolumeIo, ATTR_ARCHIVE};
use crate::{SdFat, SD_LINE_MAX, SD_SECTOR_SIZE};

/// Access discipline for an open file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

/// Cursor state of the one open file. `cluster_offset` may equal the
/// cluster size when the cursor parks on a cluster boundary; the next
/// access performs the follow-or-allocate step.
#[derive(Clone, Copy)]
pub(crate) struct FileSession {
    mode: FileMode,
    start_cluster: u32,
    size: u32,
    pos: u32,
    cluster: u32,
    cluster_offset: u32,
    entry: DirLocation,
}

impl<SPI, CS> SdFat<SPI, CS>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    /// Opens `name` in the root directory. A file already open is closed
    /// first. `Write` truncates or creates, `Append` positions at the end
    /// and creates when missing, `Read` fails on a missing file.
    pub fn open(&mut self, name: &str, mode: FileMode) -> Result<(), SdFatError<SPI::Error>> {
        let short_name = encode_short_name(name)?;
        if self.session.is_some() {
            self.close()?;
        }

        let mut io = self.volume_io()?;
        let scan = io.scan_directory(Some(&short_name))?;
        let session = match mode {
            FileMode::Read => {
                let found = scan.found.ok_or(SdFatError::NotFound)?;
                session_at_start(mode, &found)
            }
            FileMode::Write => match scan.found {
                Some(found) => truncate_session(&mut io, &found)?,
                None => create_session(&mut io, &short_name, scan.free, mode)?,
            },
            FileMode::Append => match scan.found {
                Some(found) => append_session(&mut io, &found)?,
                None => create_session(&mut io, &short_name, scan.free, mode)?,
            },
        };
        self.session = Some(session);
        debug!("open ok name={} mode={:?} size={}", name, mode, session.size);
        Ok(())
    }

    /// Closes the open file, committing its directory entry and any cached
    /// sector. The session ends even when committing fails. Without an open
    /// file this is a no-op.
    pub fn close(&mut self) -> Result<(), SdFatError<SPI::Error>> {
        let session = match self.session.take() {
            Some(session) => session,
            None => return Ok(()),
        };
        let persisted = if session.mode == FileMode::Read {
            Ok(())
        } else {
            self.persist_entry(&session)
        };
        let flushed = self.cache.flush(&mut self.card).map_err(SdFatError::from);
        let result = persisted.and(flushed);
        if result.is_ok() {
            debug!("close ok size={}", session.size);
        }
        result
    }

    /// Reads up to `out.len()` bytes from the current position. Short
    /// reads happen only at end of file; `Ok(0)` means the position is at
    /// or past the end.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, SdFatError<SPI::Error>> {
        let mut session = self.session.ok_or(SdFatError::NoFileOpen)?;
        let remaining = session.size.saturating_sub(session.pos) as usize;
        let want = remaining.min(out.len());
        if want == 0 {
            return Ok(0);
        }
        let result = {
            let mut io = self.volume_io()?;
            read_session(&mut io, &mut session, &mut out[..want])
        };
        self.session = Some(session);
        result?;
        Ok(want)
    }

    /// Writes all of `data` at the current position, growing the chain as
    /// needed. A full disk fails the call but keeps the bytes already
    /// written, with the directory entry updated to match.
    pub fn write(&mut self, data: &[u8]) -> Result<(), SdFatError<SPI::Error>> {
        let mut session = self.session.ok_or(SdFatError::NoFileOpen)?;
        if session.mode == FileMode::Read {
            return Err(SdFatError::ReadOnly);
        }
        if data.is_empty() {
            return Ok(());
        }
        let result = {
            let mut io = self.volume_io()?;
            write_session(&mut io, &mut session, data)
        };
        if result.is_err() {
            warn!("write incomplete pos={} size={}", session.pos, session.size);
            let _ = self.persist_entry(&session);
        }
        self.session = Some(session);
        result
    }

    /// Reads one newline-terminated line. The terminator is dropped and so
    /// is every carriage return. Both an empty line and end of file yield
    /// an empty string; `is_end_of_file` tells them apart. The cap counts
    /// bytes as stored, so multi-byte characters pass through uncut.
    pub fn read_line(&mut self) -> Result<String<SD_LINE_MAX>, SdFatError<SPI::Error>> {
        let mut raw: Vec<u8, SD_LINE_MAX> = Vec::new();
        loop {
            if raw.is_full() {
                break;
            }
            let mut byte = [0u8; 1];
            if self.read(&mut byte)? == 0 {
                break;
            }
            match byte[0] {
                b'\n' => break,
                b'\r' => continue,
                other => {
                    let _ = raw.push(other);
                }
            }
        }
        String::from_utf8(raw).map_err(|_| SdFatError::InvalidUtf8)
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), SdFatError<SPI::Error>> {
        self.write(line.as_bytes())?;
        self.write(b"\r\n")
    }

    /// Moves the cursor, clamped to the file size. Pending data is flushed
    /// before the chain is re-walked from the start.
    pub fn seek(&mut self, pos: u32) -> Result<(), SdFatError<SPI::Error>> {
        let mut session = self.session.ok_or(SdFatError::NoFileOpen)?;
        let target = pos.min(session.size);
        let result = {
            let mut io = self.volume_io()?;
            seek_session(&mut io, &mut session, target)
        };
        self.session = Some(session);
        result
    }

    /// Byte position of the cursor, or 0 with no open file.
    pub fn position(&self) -> u32 {
        self.session.map(|s| s.pos).unwrap_or(0)
    }

    /// Size of the open file, or 0 with no open file.
    pub fn size(&self) -> u32 {
        self.session.map(|s| s.size).unwrap_or(0)
    }

    /// With no open file this reports true.
    pub fn is_end_of_file(&self) -> bool {
        match self.session {
            Some(s) => s.pos >= s.size,
            None => true,
        }
    }

    /// Checks the root directory for `name` without opening it.
    pub fn exists(&mut self, name: &str) -> Result<bool, SdFatError<SPI::Error>> {
        let short_name = encode_short_name(name)?;
        let mut io = self.volume_io()?;
        let scan = io.scan_directory(Some(&short_name))?;
        Ok(scan.found.is_some())
    }

    /// Deletes `name`: frees its cluster chain and tombstones the entry.
    /// Removing the currently open file drops the session unpersisted.
    pub fn remove(&mut self, name: &str) -> Result<(), SdFatError<SPI::Error>> {
        let short_name = encode_short_name(name)?;
        let found = {
            let mut io = self.volume_io()?;
            io.scan_directory(Some(&short_name))?
                .found
                .ok_or(SdFatError::NotFound)?
        };
        if let Some(session) = self.session {
            if session.entry == found.location {
                // The session must not outlive its directory entry.
                self.session = None;
            }
        }
        let mut io = self.volume_io()?;
        if found.record.first_cluster >= 2 {
            io.free_chain(found.record.first_cluster)?;
        }
        io.delete_entry(found.location)?;
        debug!("remove ok name={}", name);
        Ok(())
    }

    /// Commits session metadata and any cached sector without closing.
    pub fn flush(&mut self) -> Result<(), SdFatError<SPI::Error>> {
        if let Some(session) = self.session {
            if session.mode != FileMode::Read {
                self.persist_entry(&session)?;
            }
        }
        self.cache.flush(&mut self.card)?;
        Ok(())
    }

    fn persist_entry(&mut self, session: &FileSession) -> Result<(), SdFatError<SPI::Error>> {
        let mut io = self.volume_io()?;
        io.update_entry(session.entry, session.start_cluster, session.size)
    }
}

fn session_at_start(mode: FileMode, found: &DirFound) -> FileSession {
    FileSession {
        mode,
        start_cluster: found.record.first_cluster,
        size: found.record.size,
        pos: 0,
        cluster: found.record.first_cluster,
        cluster_offset: 0,
        entry: found.location,
    }
}

fn truncate_session<SPI, CS>(
    io: &mut VolumeIo<'_, SPI, CS>,
    found: &DirFound,
) -> Result<FileSession, SdFatError<SPI::Error>>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    if found.record.first_cluster >= 2 {
        io.free_chain(found.record.first_cluster)?;
    }
    // The entry must stop pointing at freed clusters before a new chain
    // goes in.
    io.update_entry(found.location, 0, 0)?;
    let head = io.allocate_cluster(0)?;
    io.update_entry(found.location, head, 0)?;
    Ok(FileSession {
        mode: FileMode::Write,
        start_cluster: head,
        size: 0,
        pos: 0,
        cluster: head,
        cluster_offset: 0,
        entry: found.location,
    })
}

fn create_session<SPI, CS>(
    io: &mut VolumeIo<'_, SPI, CS>,
    short_name: &[u8; 11],
    free: Option<DirLocation>,
    mode: FileMode,
) -> Result<FileSession, SdFatError<SPI::Error>>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    // Reserving the slot before allocating means a full directory leaks
    // nothing, and the entry is only written once the chain head exists.
    let location = io.reserve_entry_slot(free)?;
    let head = io.allocate_cluster(0)?;
    let record = DirRecord {
        short_name: *short_name,
        attr: ATTR_ARCHIVE,
        first_cluster: head,
        size: 0,
    };
    io.write_entry(location, &record)?;
    Ok(FileSession {
        mode,
        start_cluster: head,
        size: 0,
        pos: 0,
        cluster: head,
        cluster_offset: 0,
        entry: location,
    })
}

fn append_session<SPI, CS>(
    io: &mut VolumeIo<'_, SPI, CS>,
    found: &DirFound,
) -> Result<FileSession, SdFatError<SPI::Error>>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    let mut session = session_at_start(FileMode::Append, found);
    session.pos = session.size;
    if session.size > 0 && session.start_cluster >= 2 {
        let (index, offset) = chain_position(session.size, io.volume.cluster_bytes());
        session.cluster = io.cluster_at_index(session.start_cluster, index)?;
        session.cluster_offset = offset;
    }
    Ok(session)
}

fn read_session<SPI, CS>(
    io: &mut VolumeIo<'_, SPI, CS>,
    session: &mut FileSession,
    out: &mut [u8],
) -> Result<(), SdFatError<SPI::Error>>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    let cluster_bytes = io.volume.cluster_bytes();
    let mut copied = 0usize;
    while copied < out.len() {
        if session.cluster < 2 {
            return Err(SdFatError::BadCluster(session.cluster));
        }
        if session.cluster_offset >= cluster_bytes {
            // The chain ending while size says more is left means the two
            // disagree.
            session.cluster = io
                .next_cluster(session.cluster)?
                .ok_or(SdFatError::ChainTooLong)?;
            session.cluster_offset = 0;
        }
        let lba = io.volume.cluster_to_lba(session.cluster)?
            + session.cluster_offset / SD_SECTOR_SIZE as u32;
        let byte_in_sector = (session.cluster_offset % SD_SECTOR_SIZE as u32) as usize;
        let chunk = (out.len() - copied).min(SD_SECTOR_SIZE - byte_in_sector);
        let sector = io.cache.load(&mut *io.card, lba)?;
        out[copied..copied + chunk]
            .copy_from_slice(&sector[byte_in_sector..byte_in_sector + chunk]);
        copied += chunk;
        session.pos += chunk as u32;
        session.cluster_offset += chunk as u32;
    }
    Ok(())
}

fn write_session<SPI, CS>(
    io: &mut VolumeIo<'_, SPI, CS>,
    session: &mut FileSession,
    data: &[u8],
) -> Result<(), SdFatError<SPI::Error>>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    let cluster_bytes = io.volume.cluster_bytes();
    let mut written = 0usize;
    while written < data.len() {
        if session.cluster < 2 {
            // An empty entry created elsewhere may carry no chain at all.
            let head = io.allocate_cluster(0)?;
            session.start_cluster = head;
            session.cluster = head;
            session.cluster_offset = 0;
        } else if session.cluster_offset >= cluster_bytes {
            session.cluster = match io.next_cluster(session.cluster)? {
                Some(next) => next,
                None => io.allocate_cluster(session.cluster)?,
            };
            session.cluster_offset = 0;
        }
        let lba = io.volume.cluster_to_lba(session.cluster)?
            + session.cluster_offset / SD_SECTOR_SIZE as u32;
        let byte_in_sector = (session.cluster_offset % SD_SECTOR_SIZE as u32) as usize;
        let chunk = (data.len() - written).min(SD_SECTOR_SIZE - byte_in_sector);
        let sector = io.cache.load_mut(&mut *io.card, lba)?;
        sector[byte_in_sector..byte_in_sector + chunk]
            .copy_from_slice(&data[written..written + chunk]);
        written += chunk;
        session.pos += chunk as u32;
        session.cluster_offset += chunk as u32;
        if session.pos > session.size {
            session.size = session.pos;
        }
    }
    Ok(())
}

fn seek_session<SPI, CS>(
    io: &mut VolumeIo<'_, SPI, CS>,
    session: &mut FileSession,
    target: u32,
) -> Result<(), SdFatError<SPI::Error>>
where
    SPI: SpiBus + ClockControl,
    CS: OutputPin,
{
    io.cache.flush(&mut *io.card)?;
    if target == 0 || session.start_cluster < 2 {
        session.pos = target;
        session.cluster = session.start_cluster;
        session.cluster_offset = 0;
        return Ok(());
    }
    // The session only moves once the whole walk has succeeded.
    let (index, offset) = chain_position(target, io.volume.cluster_bytes());
    let cluster = io.cluster_at_index(session.start_cluster, index)?;
    session.pos = target;
    session.cluster = cluster;
    session.cluster_offset = offset;
    Ok(())
}

/// Cluster index and in-cluster offset for a byte position. A position on
/// an exact cluster boundary parks on the previous cluster with a full
/// offset, so the chain is only stepped once the next byte arrives.
fn chain_position(pos: u32, cluster_bytes: u32) -> (u32, u32) {
    if pos == 0 {
        return (0, 0);
    }
    if pos % cluster_bytes == 0 {
        return (pos / cluster_bytes - 1, cluster_bytes);
    }
    (pos / cluster_bytes, pos % cluster_bytes)
}
