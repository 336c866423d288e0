#![allow(dead_code)]

//! Byte-level simulated SPI SD card plus FAT image builders. The card model
//! speaks the wire protocol (command frames, R1/R7 responses, data tokens,
//! busy signalling) against an in-memory sector image, so the whole driver
//! stack runs unmodified on the host.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::rc::Rc;

use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{self, SpiBus};

use sdfat::{BusClock, ClockControl, SdFat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimError;

impl spi::Error for SimError {
    fn kind(&self) -> spi::ErrorKind {
        spi::ErrorKind::Other
    }
}

impl digital::Error for SimError {
    fn kind(&self) -> digital::ErrorKind {
        digital::ErrorKind::Other
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    /// Never answers anything.
    Dead,
    V1,
    V2Standard,
    V2HighCapacity,
}

enum WritePhase {
    Idle,
    AwaitToken,
    Collect(Vec<u8>),
}

pub struct SimCard {
    kind: SimKind,
    pub image: Vec<u8>,
    /// Corrupt the CMD8 echo to provoke an init abort.
    pub echo_fault: bool,
    /// Answer data blocks with this response instead of accepting them.
    pub write_data_response: Option<u8>,
    /// How many ACMD41 polls report busy before the card comes up.
    pub acmd41_busy_polls: u32,
    pub clock: Option<BusClock>,
    pub clock_at_cmd0: Option<BusClock>,
    /// Bytes clocked with chip select released before the first command.
    pub preamble_bytes: u32,
    pub cmd16_block_len: Option<u32>,
    cs_low: bool,
    idle: bool,
    app_cmd: bool,
    seen_cmd0: bool,
    frame: Vec<u8>,
    response: VecDeque<u8>,
    write_phase: WritePhase,
    write_lba: u32,
    csd: [u8; 16],
}

impl SimCard {
    pub fn new(kind: SimKind, image: Vec<u8>) -> Self {
        let csd = match kind {
            SimKind::V1 => make_csd_v1(),
            _ => make_csd_v2(),
        };
        Self {
            kind,
            image,
            echo_fault: false,
            write_data_response: None,
            acmd41_busy_polls: 2,
            clock: None,
            clock_at_cmd0: None,
            preamble_bytes: 0,
            cmd16_block_len: None,
            cs_low: false,
            idle: false,
            app_cmd: false,
            seen_cmd0: false,
            frame: Vec::new(),
            response: VecDeque::new(),
            write_phase: WritePhase::Idle,
            write_lba: 0,
            csd,
        }
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.cs_low {
            if !self.seen_cmd0 {
                self.preamble_bytes += 1;
            }
            return 0xFF;
        }
        if let Some(byte) = self.response.pop_front() {
            return byte;
        }
        match mem::replace(&mut self.write_phase, WritePhase::Idle) {
            WritePhase::Idle => {}
            WritePhase::AwaitToken => {
                if mosi == 0xFE {
                    self.write_phase = WritePhase::Collect(Vec::with_capacity(514));
                } else {
                    self.write_phase = WritePhase::AwaitToken;
                }
                return 0xFF;
            }
            WritePhase::Collect(mut data) => {
                data.push(mosi);
                // 512 data bytes plus two CRC bytes complete the block.
                if data.len() == 514 {
                    if let Some(code) = self.write_data_response {
                        // A rejected block never reaches the image.
                        self.response.extend([code, 0x00, 0x00]);
                    } else {
                        let start = self.write_lba as usize * 512;
                        self.image[start..start + 512].copy_from_slice(&data[..512]);
                        // Data response (upper bits junk on purpose), two busy
                        // bytes, then the line is released.
                        self.response.extend([0xE5, 0x00, 0x00]);
                    }
                } else {
                    self.write_phase = WritePhase::Collect(data);
                }
                return 0xFF;
            }
        }
        self.accept_frame_byte(mosi);
        0xFF
    }

    fn accept_frame_byte(&mut self, byte: u8) {
        // Filler bytes between frames never start a command.
        if self.frame.is_empty() && (byte & 0xC0) != 0x40 {
            return;
        }
        self.frame.push(byte);
        if self.frame.len() == 6 {
            let cmd = self.frame[0] & 0x3F;
            let arg =
                u32::from_be_bytes([self.frame[1], self.frame[2], self.frame[3], self.frame[4]]);
            let crc = self.frame[5];
            self.frame.clear();
            self.process_command(cmd, arg, crc);
        }
    }

    fn process_command(&mut self, cmd: u8, arg: u32, crc: u8) {
        self.seen_cmd0 = true;
        if self.kind == SimKind::Dead {
            return;
        }
        let was_app_cmd = self.app_cmd;
        self.app_cmd = false;
        match cmd {
            0 => {
                if self.clock_at_cmd0.is_none() {
                    self.clock_at_cmd0 = self.clock;
                }
                if crc != 0x95 {
                    self.push_r1(0x09);
                } else {
                    self.idle = true;
                    self.push_r1(0x01);
                }
            }
            8 => {
                if self.kind == SimKind::V1 {
                    // Pre-v2 cards reject CMD8 outright.
                    self.push_r1(0x05);
                } else if crc != 0x87 || arg != 0x0000_01AA {
                    self.push_r1(0x09);
                } else {
                    self.push_r1(0x01);
                    let echo = if self.echo_fault { 0x55 } else { 0xAA };
                    self.response.extend([0x00, 0x00, 0x01, echo]);
                }
            }
            55 => {
                self.app_cmd = true;
                let r1 = self.r1();
                self.push_r1(r1);
            }
            41 if was_app_cmd => {
                if self.acmd41_busy_polls > 0 {
                    self.acmd41_busy_polls -= 1;
                    self.push_r1(0x01);
                } else {
                    self.idle = false;
                    self.push_r1(0x00);
                }
            }
            58 => {
                let ccs = if self.kind == SimKind::V2HighCapacity {
                    0x40
                } else {
                    0x00
                };
                let r1 = self.r1();
                self.push_r1(r1);
                self.response.extend([0x80 | ccs, 0xFF, 0x80, 0x00]);
            }
            16 => {
                self.cmd16_block_len = Some(arg);
                let r1 = self.r1();
                self.push_r1(r1);
            }
            9 => {
                let r1 = self.r1();
                self.push_r1(r1);
                self.response.push_back(0xFF);
                self.response.push_back(0xFE);
                for i in 0..16 {
                    self.response.push_back(self.csd[i]);
                }
                self.response.extend([0xAA, 0xBB]);
            }
            17 => {
                let start = self.data_lba(arg) as usize * 512;
                let r1 = self.r1();
                self.push_r1(r1);
                self.response.push_back(0xFF);
                self.response.push_back(0xFE);
                for i in 0..512 {
                    self.response.push_back(self.image[start + i]);
                }
                self.response.extend([0xAA, 0xBB]);
            }
            24 => {
                self.write_lba = self.data_lba(arg);
                let r1 = self.r1();
                self.push_r1(r1);
                self.write_phase = WritePhase::AwaitToken;
            }
            _ => {
                let r1 = self.r1() | 0x04;
                self.push_r1(r1);
            }
        }
    }

    fn r1(&self) -> u8 {
        if self.idle {
            0x01
        } else {
            0x00
        }
    }

    fn push_r1(&mut self, r1: u8) {
        // One turnaround byte before the response, like a real card.
        self.response.push_back(0xFF);
        self.response.push_back(r1);
    }

    fn data_lba(&self, arg: u32) -> u32 {
        if self.kind == SimKind::V2HighCapacity {
            arg
        } else {
            assert_eq!(arg % 512, 0, "byte-addressed access not sector aligned");
            arg / 512
        }
    }
}

pub struct SimBus(pub Rc<RefCell<SimCard>>);

impl spi::ErrorType for SimBus {
    type Error = SimError;
}

impl SpiBus for SimBus {
    fn read(&mut self, words: &mut [u8]) -> Result<(), SimError> {
        let mut card = self.0.borrow_mut();
        for slot in words.iter_mut() {
            *slot = card.exchange(0xFF);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), SimError> {
        let mut card = self.0.borrow_mut();
        for &byte in words {
            let _ = card.exchange(byte);
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), SimError> {
        let mut card = self.0.borrow_mut();
        let len = read.len().max(write.len());
        for i in 0..len {
            let mosi = write.get(i).copied().unwrap_or(0xFF);
            let miso = card.exchange(mosi);
            if let Some(slot) = read.get_mut(i) {
                *slot = miso;
            }
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), SimError> {
        let mut card = self.0.borrow_mut();
        for slot in words.iter_mut() {
            *slot = card.exchange(*slot);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SimError> {
        Ok(())
    }
}

impl ClockControl for SimBus {
    fn set_clock(&mut self, clock: BusClock) -> Result<(), SimError> {
        self.0.borrow_mut().clock = Some(clock);
        Ok(())
    }
}

pub struct SimPin(pub Rc<RefCell<SimCard>>);

impl digital::ErrorType for SimPin {
    type Error = SimError;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), SimError> {
        self.0.borrow_mut().cs_low = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), SimError> {
        let mut card = self.0.borrow_mut();
        card.cs_low = false;
        card.frame.clear();
        card.response.clear();
        card.write_phase = WritePhase::Idle;
        Ok(())
    }
}

pub fn sim_pair(kind: SimKind, image: Vec<u8>) -> (SimBus, SimPin, Rc<RefCell<SimCard>>) {
    let card = Rc::new(RefCell::new(SimCard::new(kind, image)));
    (SimBus(Rc::clone(&card)), SimPin(Rc::clone(&card)), card)
}

pub fn mount_sim(kind: SimKind, image: Vec<u8>) -> (SdFat<SimBus, SimPin>, Rc<RefCell<SimCard>>) {
    let (bus, pin, card) = sim_pair(kind, image);
    let mut sd = SdFat::new(bus, pin);
    sd.mount().unwrap();
    (sd, card)
}

/// Geometry of a built image, for poking at raw bytes from tests.
pub struct ImageSpec {
    pub fat_start: u32,
    pub fat_size: u32,
    pub root_start: u32,
    pub data_start: u32,
    pub sectors_per_cluster: u32,
    pub root_cluster: u32,
    pub root_sectors: u32,
    pub fat32: bool,
}

/// Unpartitioned FAT16 volume: boot sector at LBA 0, two FAT copies, a
/// fixed root region, media entries pre-seeded.
pub fn fat16_image(total_sectors: u32, spc: u32, root_entries: u32) -> (Vec<u8>, ImageSpec) {
    let reserved = 1u32;
    let fat_count = 2u32;
    let root_sectors = (root_entries * 32).div_ceil(512);
    let mut fat_size = 1u32;
    loop {
        let overhead = reserved + fat_count * fat_size + root_sectors;
        let clusters = total_sectors.saturating_sub(overhead) / spc;
        let needed = (clusters + 2).div_ceil(256);
        if needed <= fat_size {
            break;
        }
        fat_size = needed;
    }

    let mut image = vec![0u8; (total_sectors * 512) as usize];
    {
        let boot = &mut image[0..512];
        boot[11..13].copy_from_slice(&512u16.to_le_bytes());
        boot[13] = spc as u8;
        boot[14..16].copy_from_slice(&(reserved as u16).to_le_bytes());
        boot[16] = fat_count as u8;
        boot[17..19].copy_from_slice(&(root_entries as u16).to_le_bytes());
        if total_sectors <= 0xFFFF {
            boot[19..21].copy_from_slice(&(total_sectors as u16).to_le_bytes());
        } else {
            boot[32..36].copy_from_slice(&total_sectors.to_le_bytes());
        }
        boot[22..24].copy_from_slice(&(fat_size as u16).to_le_bytes());
        boot[510] = 0x55;
        boot[511] = 0xAA;
    }

    let root_start = reserved + fat_count * fat_size;
    let spec = ImageSpec {
        fat_start: reserved,
        fat_size,
        root_start,
        data_start: root_start + root_sectors,
        sectors_per_cluster: spc,
        root_cluster: 0,
        root_sectors,
        fat32: false,
    };
    set_image_fat_entry(&mut image, &spec, 0, 0xFFF8);
    set_image_fat_entry(&mut image, &spec, 1, 0xFFFF);
    (image, spec)
}

/// MBR-partitioned FAT32 volume. The root directory starts as the single
/// cluster 2.
pub fn fat32_image(part_start: u32, part_sectors: u32, spc: u32) -> (Vec<u8>, ImageSpec) {
    let reserved = 4u32;
    let fat_count = 2u32;
    let mut fat_size = 1u32;
    loop {
        let overhead = reserved + fat_count * fat_size;
        let clusters = part_sectors.saturating_sub(overhead) / spc;
        let needed = (clusters + 2).div_ceil(128);
        if needed <= fat_size {
            break;
        }
        fat_size = needed;
    }

    let total_sectors = part_start + part_sectors;
    let mut image = vec![0u8; (total_sectors * 512) as usize];

    image[446 + 4] = 0x0C;
    image[446 + 8..446 + 12].copy_from_slice(&part_start.to_le_bytes());
    image[510] = 0x55;
    image[511] = 0xAA;

    let boot_base = (part_start * 512) as usize;
    {
        let boot = &mut image[boot_base..boot_base + 512];
        boot[11..13].copy_from_slice(&512u16.to_le_bytes());
        boot[13] = spc as u8;
        boot[14..16].copy_from_slice(&(reserved as u16).to_le_bytes());
        boot[16] = fat_count as u8;
        boot[32..36].copy_from_slice(&part_sectors.to_le_bytes());
        boot[36..40].copy_from_slice(&fat_size.to_le_bytes());
        boot[44..48].copy_from_slice(&2u32.to_le_bytes());
        boot[510] = 0x55;
        boot[511] = 0xAA;
    }

    let data_start = part_start + reserved + fat_count * fat_size;
    let spec = ImageSpec {
        fat_start: part_start + reserved,
        fat_size,
        root_start: data_start,
        data_start,
        sectors_per_cluster: spc,
        root_cluster: 2,
        root_sectors: spc,
        fat32: true,
    };
    set_image_fat_entry(&mut image, &spec, 0, 0x0FFF_FFF8);
    set_image_fat_entry(&mut image, &spec, 1, 0x0FFF_FFFF);
    set_image_fat_entry(&mut image, &spec, 2, 0x0FFF_FFFF);
    (image, spec)
}

/// Writes a FAT entry into both FAT copies.
pub fn set_image_fat_entry(image: &mut [u8], spec: &ImageSpec, cluster: u32, value: u32) {
    for copy in 0..2u32 {
        let base = ((spec.fat_start + copy * spec.fat_size) * 512) as usize;
        if spec.fat32 {
            let off = base + cluster as usize * 4;
            image[off..off + 4].copy_from_slice(&value.to_le_bytes());
        } else {
            let off = base + cluster as usize * 2;
            image[off..off + 2].copy_from_slice(&(value as u16).to_le_bytes());
        }
    }
}

pub fn image_fat_entry(image: &[u8], spec: &ImageSpec, copy: u32, cluster: u32) -> u32 {
    let base = ((spec.fat_start + copy * spec.fat_size) * 512) as usize;
    if spec.fat32 {
        let off = base + cluster as usize * 4;
        u32::from_le_bytes([image[off], image[off + 1], image[off + 2], image[off + 3]])
    } else {
        let off = base + cluster as usize * 2;
        u16::from_le_bytes([image[off], image[off + 1]]) as u32
    }
}

pub struct RootEntry {
    pub offset: usize,
    pub first_cluster: u32,
    pub size: u32,
}

pub fn find_root_entry(image: &[u8], spec: &ImageSpec, name: &[u8; 11]) -> Option<RootEntry> {
    let start = (spec.root_start * 512) as usize;
    let end = start + (spec.root_sectors * 512) as usize;
    for offset in (start..end).step_by(32) {
        if image[offset] == 0x00 {
            return None;
        }
        if image[offset] == 0xE5 {
            continue;
        }
        if image[offset..offset + 11] == name[..] {
            let lo = u16::from_le_bytes([image[offset + 26], image[offset + 27]]) as u32;
            let hi = u16::from_le_bytes([image[offset + 20], image[offset + 21]]) as u32;
            let first_cluster = if spec.fat32 { (hi << 16) | lo } else { lo };
            let size = u32::from_le_bytes([
                image[offset + 28],
                image[offset + 29],
                image[offset + 30],
                image[offset + 31],
            ]);
            return Some(RootEntry {
                offset,
                first_cluster,
                size,
            });
        }
    }
    None
}

/// Plants a file in the root directory with a ready-made cluster chain,
/// the way another host would have written it.
pub fn install_root_file(image: &mut Vec<u8>, spec: &ImageSpec, name: &[u8; 11], data: &[u8]) {
    let first: u32 = if spec.fat32 { 3 } else { 2 };
    let cluster_bytes = (spec.sectors_per_cluster * 512) as usize;
    let clusters = data.len().div_ceil(cluster_bytes).max(1) as u32;
    for i in 0..clusters {
        let value = if i + 1 == clusters {
            if spec.fat32 {
                0x0FFF_FFFF
            } else {
                0xFFFF
            }
        } else {
            first + i + 1
        };
        set_image_fat_entry(image, spec, first + i, value);
    }
    for (i, chunk) in data.chunks(cluster_bytes).enumerate() {
        let cluster = first + i as u32;
        let lba = spec.data_start + (cluster - 2) * spec.sectors_per_cluster;
        let start = (lba * 512) as usize;
        image[start..start + chunk.len()].copy_from_slice(chunk);
    }

    let start = (spec.root_start * 512) as usize;
    let end = start + (spec.root_sectors * 512) as usize;
    for offset in (start..end).step_by(32) {
        if image[offset] == 0x00 || image[offset] == 0xE5 {
            image[offset..offset + 11].copy_from_slice(name);
            image[offset + 11] = 0x20;
            if spec.fat32 {
                image[offset + 20..offset + 22]
                    .copy_from_slice(&((first >> 16) as u16).to_le_bytes());
            }
            image[offset + 26..offset + 28].copy_from_slice(&(first as u16).to_le_bytes());
            image[offset + 28..offset + 32].copy_from_slice(&(data.len() as u32).to_le_bytes());
            return;
        }
    }
    panic!("no free root slot");
}

fn set_csd_bits(csd: &mut [u8; 16], msb: u32, lsb: u32, value: u32) {
    for (i, bit) in (lsb..=msb).enumerate() {
        let byte_index = ((127 - bit) / 8) as usize;
        let bit_in_byte = bit % 8;
        if (value >> i) & 1 != 0 {
            csd[byte_index] |= 1 << bit_in_byte;
        }
    }
}

/// 1 GiB card: 512-byte blocks, c_size 4095, mult 7.
fn make_csd_v1() -> [u8; 16] {
    let mut csd = [0u8; 16];
    set_csd_bits(&mut csd, 83, 80, 9);
    set_csd_bits(&mut csd, 73, 62, 4095);
    set_csd_bits(&mut csd, 49, 47, 7);
    csd
}

/// 8 MiB card, deliberately tiny: c_size 15.
fn make_csd_v2() -> [u8; 16] {
    let mut csd = [0u8; 16];
    set_csd_bits(&mut csd, 127, 126, 1);
    set_csd_bits(&mut csd, 69, 48, 15);
    csd
}
