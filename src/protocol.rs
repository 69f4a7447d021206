//! ISP wire protocol definitions
//!
//! Based on UM10360 (LPC176x/5x User manual), chapter 32 "Flash memory
//! interface and programming".

use core::convert::TryFrom;
use core::fmt;

/// Autobaud / synchronisation character
pub const SYNC_CHAR: u8 = b'?';

/// Synchronisation string exchanged in both directions during connection
pub const SYNC_STRING: &str = "Synchronized";

pub const REPLY_OK: &str = "OK";
pub const REPLY_RESEND: &str = "RESEND";

/// Maximum number of raw bytes carried by a single encoded line
pub const LINE_SIZE: usize = 45;
/// Maximum number of encoded lines between checksums
pub const MAX_LINES: usize = 20;
/// Maximum number of raw bytes sent in one write command
pub const BLOCK_SIZE: usize = LINE_SIZE * MAX_LINES;

/// Key accepted by the unlock command
pub const UNLOCK_KEY: u32 = 23130;

/// Part identifier of the LPC1768
pub const DEFAULT_PART_ID: u32 = 0x2601_3F37;
/// Crystal frequency in kHz sent during negotiation
pub const DEFAULT_CRYSTAL_KHZ: u32 = 12000;

/// Start of user RAM, above the region used by the bootloader itself
/// (0x1000_0118 to 0x1000_01FF)
pub const RAM_BASE: u32 = 0x1000_0200;
/// Usable RAM above `RAM_BASE`
pub const RAM_SIZE: u32 = 0x8000 - 0x200;

/// Sizes accepted by the copy RAM to flash command
pub const COPY_SIZES: [u32; 4] = [256, 512, 1024, 4096];

/// Flash write chunk, applied regardless of the sector size
pub const FLASH_CHUNK: usize = 4096;

const SMALL_SECTOR_SIZE: u32 = 4 * 1024;
const LARGE_SECTOR_SIZE: u32 = 32 * 1024;
const SMALL_SECTOR_LIMIT: u32 = 0x0001_0000;

/// ISP commands, rendered to their wire form with `Display`
#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    /// Unlock flash write, erase and go commands
    Unlock { key: u32 },

    /// Sets echo on or off
    Echo { on: bool },

    /// Writes data to RAM, followed by encoded lines and a checksum
    WriteRam { address: u32, len: u32 },

    /// Reads data from RAM or flash
    ReadMemory { address: u32, len: u32 },

    /// Prepares sectors for a write or erase operation
    Prepare { start: u32, end: u32 },

    /// Copies RAM to flash, `len` must be one of `COPY_SIZES`
    CopyRamToFlash { flash: u32, ram: u32, len: u32 },

    /// Jumps to an address in thumb mode
    Go { address: u32 },

    /// Erases sectors
    Erase { start: u32, end: u32 },

    /// Checks whether sectors are blank
    BlankCheck { start: u32, end: u32 },

    /// Reads the part identifier
    ReadPartId,

    /// Reads the boot code version
    ReadBootVersion,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Unlock { key } => write!(f, "U {}", key),
            Command::Echo { on } => write!(f, "A {}", *on as u8),
            Command::WriteRam { address, len } => write!(f, "W {} {}", address, len),
            Command::ReadMemory { address, len } => write!(f, "R {} {}", address, len),
            Command::Prepare { start, end } => write!(f, "P {} {}", start, end),
            Command::CopyRamToFlash { flash, ram, len } => {
                write!(f, "C {} {} {}", flash, ram, len)
            }
            Command::Go { address } => write!(f, "G {} T", address),
            Command::Erase { start, end } => write!(f, "E {} {}", start, end),
            Command::BlankCheck { start, end } => write!(f, "I {} {}", start, end),
            Command::ReadPartId => write!(f, "J"),
            Command::ReadBootVersion => write!(f, "K"),
        }
    }
}

/// Bootloader return codes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    CmdSuccess = 0,
    InvalidCommand = 1,
    SrcAddrError = 2,
    DstAddrError = 3,
    SrcAddrNotMapped = 4,
    DstAddrNotMapped = 5,
    CountError = 6,
    InvalidSector = 7,
    SectorNotBlank = 8,
    SectorNotPreparedForWriteOperation = 9,
    CompareError = 10,
    Busy = 11,
    ParamError = 12,
    AddrError = 13,
    AddrNotMapped = 14,
    CmdLocked = 15,
    InvalidCode = 16,
    InvalidBaudRate = 17,
    InvalidStopBit = 18,
    CodeReadProtectionEnabled = 19,
    /// Block checksum failed, the block must be sent again
    Resend = 20,
}

impl ReturnCode {
    pub fn is_success(self) -> bool {
        self == ReturnCode::CmdSuccess
    }

    /// Name as printed in the user manual
    pub fn name(self) -> &'static str {
        use ReturnCode::*;

        match self {
            CmdSuccess => "CMD_SUCCESS",
            InvalidCommand => "INVALID_COMMAND",
            SrcAddrError => "SRC_ADDR_ERROR",
            DstAddrError => "DST_ADDR_ERROR",
            SrcAddrNotMapped => "SRC_ADDR_NOT_MAPPED",
            DstAddrNotMapped => "DST_ADDR_NOT_MAPPED",
            CountError => "COUNT_ERROR",
            InvalidSector => "INVALID_SECTOR",
            SectorNotBlank => "SECTOR_NOT_BLANK",
            SectorNotPreparedForWriteOperation => "SECTOR_NOT_PREPARED_FOR_WRITE_OPERATION",
            CompareError => "COMPARE_ERROR",
            Busy => "BUSY",
            ParamError => "PARAM_ERROR",
            AddrError => "ADDR_ERROR",
            AddrNotMapped => "ADDR_NOT_MAPPED",
            CmdLocked => "CMD_LOCKED",
            InvalidCode => "INVALID_CODE",
            InvalidBaudRate => "INVALID_BAUD_RATE",
            InvalidStopBit => "INVALID_STOP_BIT",
            CodeReadProtectionEnabled => "CODE_READ_PROTECTION_ENABLED",
            Resend => "RESEND",
        }
    }
}

impl TryFrom<u32> for ReturnCode {
    type Error = u32;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        use ReturnCode::*;

        let c = match v {
            0 => CmdSuccess,
            1 => InvalidCommand,
            2 => SrcAddrError,
            3 => DstAddrError,
            4 => SrcAddrNotMapped,
            5 => DstAddrNotMapped,
            6 => CountError,
            7 => InvalidSector,
            8 => SectorNotBlank,
            9 => SectorNotPreparedForWriteOperation,
            10 => CompareError,
            11 => Busy,
            12 => ParamError,
            13 => AddrError,
            14 => AddrNotMapped,
            15 => CmdLocked,
            16 => InvalidCode,
            17 => InvalidBaudRate,
            18 => InvalidStopBit,
            19 => CodeReadProtectionEnabled,
            20 => Resend,
            _ => return Err(v),
        };

        Ok(c)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), *self as u8)
    }
}

/// Flash sector, derived from an address
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Sector {
    pub index: u32,
    pub size: u32,
}

impl Sector {
    /// Find the sector containing the provided flash address.
    ///
    /// Sectors 0-15 are 4 KiB and cover the first 64 KiB, every following
    /// 64 KiB region holds two 32 KiB sectors.
    pub fn containing(address: u32) -> Self {
        if address < SMALL_SECTOR_LIMIT {
            Sector {
                index: address / SMALL_SECTOR_SIZE,
                size: SMALL_SECTOR_SIZE,
            }
        } else {
            let region = address / SMALL_SECTOR_LIMIT - 1;
            let half = (address / LARGE_SECTOR_SIZE) & 1;
            Sector {
                index: 16 + region * 2 + half,
                size: LARGE_SECTOR_SIZE,
            }
        }
    }
}

/// Round a chunk length up to the smallest supported copy size
pub fn copy_size(len: usize) -> u32 {
    COPY_SIZES
        .iter()
        .copied()
        .find(|s| len <= *s as usize)
        .unwrap_or(COPY_SIZES[COPY_SIZES.len() - 1])
}
