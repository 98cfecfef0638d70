//! SD card driver (SPI mode).
//!
//! Cold-starts a card into SPI mode, negotiates operating conditions for
//! SD v1.x / v2.0+ / SDHC-SDXC / MMC, reads the CSD for capacity, and
//! exposes the result as a [`BlockDevice`]. Read-only; a bootloader has no
//! business writing to the card.
//!
//! Timeouts are attempt counts, not wall-clock; the only real delays are
//! the 1 ms spacings inside the ACMD41/CMD1 negotiation loops.

use crate::error::BootError;
use crate::storage::{BlockDevice, Sector, SECTOR_SIZE};

/// GO_IDLE_STATE - init card in SPI mode if CS low
const CMD0: u8 = 0;
/// SEND_OP_COND (MMC)
const CMD1: u8 = 1;
/// SEND_IF_COND - verify interface operating condition
const CMD8: u8 = 8;
/// SEND_CSD - read the Card Specific Data register
const CMD9: u8 = 9;
/// STOP_TRANSMISSION - end a multiple block read
const CMD12: u8 = 12;
/// SET_BLOCKLEN
const CMD16: u8 = 16;
/// READ_SINGLE_BLOCK
const CMD17: u8 = 17;
/// READ_MULTIPLE_BLOCK
const CMD18: u8 = 18;
/// APP_CMD - escape for application-specific commands
const CMD55: u8 = 55;
/// READ_OCR
const CMD58: u8 = 58;
/// SD_SEND_OP_COND (after CMD55)
const ACMD41: u8 = 41;

const R1_IDLE_STATE: u8 = 1 << 0;
const R1_ILLEGAL_CMD: u8 = 1 << 2;

/// Start token for CMD17/CMD18 data blocks.
const DATA_TOKEN: u8 = 0xFE;

/// Attempt bounds (see the negotiation loops below).
const INIT_ATTEMPTS: u32 = 1000;
const CMD_ATTEMPTS: u32 = 100;
const READ_ATTEMPTS: u32 = 100_000;

/// The SPI transport surface the driver drives.
///
/// The HAL implements this over its SPI peripheral, the card's chip-select
/// GPIO and a millisecond delay source. Single-threaded use only.
pub trait SdBus {
    /// Drive chip select. `true` asserts (CS low on the wire).
    fn select(&mut self, selected: bool);

    /// Exchange one byte.
    fn transfer(&mut self, out: u8) -> u8;

    /// Clock in `buf.len()` bytes while shifting out 0xFF.
    fn read(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.transfer(0xFF);
        }
    }

    /// Clock out bytes, discarding whatever comes back.
    fn write(&mut self, buf: &[u8]) {
        for b in buf.iter() {
            self.transfer(*b);
        }
    }

    fn delay_ms(&mut self, ms: u32);
}

/// What the negotiation concluded the card is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    /// SD v1.x, byte-addressed.
    Sd1,
    /// SD v2.0+, byte-addressed.
    Sd2,
    /// SDHC/SDXC, block-addressed.
    Sdhc,
    /// MMC (CMD1 negotiation), byte-addressed.
    Mmc,
}

/// An initialized card. Constructed only by [`SdCard::init`], so holding
/// one means the cold-start state machine ran to completion.
pub struct SdCard<B: SdBus> {
    bus: B,
    kind: CardKind,
    block_count: u32,
}

/// CRC7 over an SD command frame (polynomial x^7 + x^3 + 1), left-shifted
/// by one with the end bit set, as the wire wants it.
fn crc7(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        let mut byte = byte;
        for _ in 0..8 {
            crc <<= 1;
            if (byte ^ crc) & 0x80 != 0 {
                crc ^= 0x09;
            }
            byte <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Block count from a raw CSD register (v1.0 and v2.0 layouts).
fn csd_block_count(csd: &[u8; 16]) -> u32 {
    if (csd[0] >> 6) == 1 {
        // CSD v2.0 (SDHC/SDXC): capacity = (C_SIZE + 1) * 512 KiB
        let c_size = ((csd[7] as u32 & 0x3F) << 16) | ((csd[8] as u32) << 8) | csd[9] as u32;
        (c_size + 1) * 1024
    } else {
        // CSD v1.0
        let c_size =
            ((csd[6] as u32 & 0x03) << 10) | ((csd[7] as u32) << 2) | ((csd[8] as u32 >> 6) & 0x03);
        let c_size_mult = ((csd[9] as u32 & 0x03) << 1) | ((csd[10] as u32 >> 7) & 0x01);
        let read_bl_len = csd[5] as u32 & 0x0F;
        let mult = 1u32 << (c_size_mult + 2);
        let block_len = 1u32 << read_bl_len;
        (c_size + 1) * mult * (block_len / 512)
    }
}

impl<B: SdBus> SdCard<B> {
    /// Cold-starts the card and negotiates operating conditions.
    ///
    /// `Cold -> Idle -> (V2Probe | V1Probe) -> Ready`; any step that
    /// exhausts its attempt bound surfaces as `Io`.
    pub fn init(mut bus: B) -> Result<Self, BootError> {
        // Deselect and clock out 80+ cycles so the card wakes up in SPI mode.
        bus.select(false);
        for _ in 0..10 {
            bus.transfer(0xFF);
        }
        bus.select(true);

        // CMD0 until the card reports idle.
        let mut idle = false;
        for _ in 0..INIT_ATTEMPTS {
            if command(&mut bus, CMD0, 0) == R1_IDLE_STATE {
                idle = true;
                break;
            }
        }
        if !idle {
            log::warn!("sd: CMD0 not acknowledged");
            bus.select(false);
            return Err(BootError::Io);
        }

        // CMD8 probes for v2.0+; the echo argument doubles as a voltage check.
        let resp = command(&mut bus, CMD8, 0x0000_01AA);
        let kind;

        if resp == R1_IDLE_STATE {
            // SD v2.0+. The R7 tail must echo the check pattern.
            let mut r7 = [0u8; 4];
            bus.read(&mut r7);
            if r7[2] != 0x01 || r7[3] != 0xAA {
                log::warn!("sd: CMD8 echo mismatch");
                bus.select(false);
                return Err(BootError::Io);
            }

            // ACMD41 with HCS set, 1 ms apart, until the card leaves idle.
            let mut ready = false;
            for _ in 0..INIT_ATTEMPTS {
                if app_command(&mut bus, ACMD41, 0x4000_0000) == 0 {
                    ready = true;
                    break;
                }
                bus.delay_ms(1);
            }
            if !ready {
                log::warn!("sd: ACMD41 timed out");
                bus.select(false);
                return Err(BootError::Io);
            }

            // CMD58: the OCR's CCS bit picks block vs byte addressing.
            if command(&mut bus, CMD58, 0) != 0 {
                bus.select(false);
                return Err(BootError::Io);
            }
            let mut ocr = [0u8; 4];
            bus.read(&mut ocr);
            kind = if ocr[0] & 0x40 != 0 {
                CardKind::Sdhc
            } else {
                CardKind::Sd2
            };
        } else if resp == (R1_IDLE_STATE | R1_ILLEGAL_CMD) {
            // SD v1.x or MMC.
            let probe = app_command(&mut bus, ACMD41, 0);
            let mut resp = probe;

            if probe <= 1 {
                kind = CardKind::Sd1;
                for _ in 0..INIT_ATTEMPTS {
                    resp = app_command(&mut bus, ACMD41, 0);
                    if resp == 0 {
                        break;
                    }
                    bus.delay_ms(1);
                }
            } else {
                kind = CardKind::Mmc;
                for _ in 0..INIT_ATTEMPTS {
                    resp = command(&mut bus, CMD1, 0);
                    if resp == 0 {
                        break;
                    }
                    bus.delay_ms(1);
                }
            }

            if resp != 0 {
                log::warn!("sd: op-cond negotiation timed out");
                bus.select(false);
                return Err(BootError::Io);
            }

            // Byte-addressed cards need the block length pinned to 512.
            if command(&mut bus, CMD16, SECTOR_SIZE as u32) != 0 {
                bus.select(false);
                return Err(BootError::Io);
            }
        } else {
            log::warn!("sd: CMD8 response {:#04x}", resp);
            bus.select(false);
            return Err(BootError::Io);
        }

        // CMD9: capacity from the CSD. A card that won't yield its CSD still
        // works for reads, so failure here only zeroes the block count.
        let mut block_count = 0;
        if command(&mut bus, CMD9, 0) == 0 {
            if wait_token(&mut bus).is_ok() {
                let mut csd = [0u8; 16];
                bus.read(&mut csd);
                bus.transfer(0xFF); // CRC
                bus.transfer(0xFF);
                block_count = csd_block_count(&csd);
            }
        }

        bus.select(false);

        log::debug!("sd: {:?}, {} blocks", kind, block_count);

        Ok(Self {
            bus,
            kind,
            block_count,
        })
    }

    pub fn kind(&self) -> CardKind {
        self.kind
    }

    /// The underlying bus (diagnostics).
    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Block-addressed cards take an LBA directly; the rest take a byte
    /// offset.
    pub fn is_high_capacity(&self) -> bool {
        self.kind == CardKind::Sdhc
    }

    fn read_address(&self, lba: u32) -> u32 {
        if self.is_high_capacity() {
            lba
        } else {
            lba * SECTOR_SIZE as u32
        }
    }

    /// Reads `bufs.len()` consecutive sectors starting at `lba`.
    ///
    /// One sector goes over CMD17; more go over CMD18 terminated by CMD12
    /// plus the one extra clocked byte the spec sheet demands.
    pub fn read_blocks(&mut self, lba: u32, bufs: &mut [Sector]) -> Result<(), BootError> {
        if bufs.is_empty() {
            return Ok(());
        }

        let addr = self.read_address(lba);
        let bus = &mut self.bus;
        bus.select(true);

        let result = if bufs.len() == 1 {
            read_single(bus, addr, &mut bufs[0])
        } else {
            read_multi(bus, addr, bufs)
        };

        bus.select(false);
        result
    }
}

fn read_single<B: SdBus>(bus: &mut B, addr: u32, buf: &mut Sector) -> Result<(), BootError> {
    if command(bus, CMD17, addr) != 0 {
        return Err(BootError::Io);
    }
    wait_token(bus)?;
    bus.read(buf.as_mut_slice());
    bus.transfer(0xFF); // CRC
    bus.transfer(0xFF);
    Ok(())
}

fn read_multi<B: SdBus>(bus: &mut B, addr: u32, bufs: &mut [Sector]) -> Result<(), BootError> {
    if command(bus, CMD18, addr) != 0 {
        return Err(BootError::Io);
    }

    for buf in bufs.iter_mut() {
        if wait_token(bus).is_err() {
            command(bus, CMD12, 0);
            return Err(BootError::Io);
        }
        bus.read(buf.as_mut_slice());
        bus.transfer(0xFF); // CRC
        bus.transfer(0xFF);
    }

    command(bus, CMD12, 0);
    bus.transfer(0xFF); // one extra clocked byte after STOP_TRANSMISSION
    Ok(())
}

/// Waits for the 0xFE data token. Any byte with a zero upper nibble seen
/// first is an error token and aborts the read.
fn wait_token<B: SdBus>(bus: &mut B) -> Result<(), BootError> {
    for _ in 0..READ_ATTEMPTS {
        let b = bus.transfer(0xFF);
        if b == DATA_TOKEN {
            return Ok(());
        }
        if b != 0xFF && (b & 0xF0) == 0 {
            return Err(BootError::Io);
        }
    }
    Err(BootError::Io)
}

/// Sends a 6-byte command frame and polls for the R1 response.
///
/// Returns 0xFF if the card never came ready or never answered.
fn command<B: SdBus>(bus: &mut B, cmd: u8, arg: u32) -> u8 {
    // The card signals ready by releasing MISO to 0xFF.
    let mut ready = false;
    for _ in 0..CMD_ATTEMPTS {
        if bus.transfer(0xFF) == 0xFF {
            ready = true;
            break;
        }
    }
    if !ready {
        return 0xFF;
    }

    let mut frame = [0u8; 6];
    frame[0] = 0x40 | cmd;
    frame[1..5].copy_from_slice(&arg.to_be_bytes());
    frame[5] = crc7(&frame[..5]);
    bus.write(&frame);

    // R1 is the first byte with bit 7 clear.
    let mut resp = 0xFF;
    for _ in 0..CMD_ATTEMPTS {
        resp = bus.transfer(0xFF);
        if resp & 0x80 == 0 {
            break;
        }
    }
    resp
}

/// CMD55-prefixed application command.
fn app_command<B: SdBus>(bus: &mut B, cmd: u8, arg: u32) -> u8 {
    let resp = command(bus, CMD55, 0);
    if resp > 1 {
        return resp;
    }
    command(bus, cmd, arg)
}

impl<B: SdBus> BlockDevice for SdCard<B> {
    type Error = BootError;

    fn read_sector(&mut self, lba: u32, buf: &mut Sector) -> Result<(), Self::Error> {
        self.read_blocks(lba, core::slice::from_mut(buf))
    }

    fn sector_count(&self) -> u32 {
        self.block_count
    }

    fn read_sectors(&mut self, lba: u32, bufs: &mut [Sector]) -> Result<(), Self::Error> {
        self.read_blocks(lba, bufs)
    }
}
