//! NXP LPC Serial Bootloader.
//!
//! Based on UM10360 chapter 32, "Flash memory interface and programming".
//! The bootloader speaks a line oriented ASCII protocol: every command is a
//! line of text and every reply starts with a decimal return code.

use core::convert::TryFrom;
use core::fmt::Debug;
use core::marker::PhantomData;
use core::num::ParseIntError;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use thiserror::Error;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod codec;
pub mod protocol;

mod flash;
mod line;
mod ram;

#[cfg(test)]
mod mock;

use crate::codec::CodecError;
use crate::protocol::*;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Disconnected,
    Synchronizing,
    Negotiating,
    EchoDisabled,
    Identified,
    Ready,
    Aborted,
}

#[derive(Error, Clone, PartialEq, Debug)]
pub enum Error<SerialError: Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("timeout awaiting bootloader response")]
    ResponseTimeout,

    #[error("invalid response: {0:?}")]
    InvalidResponse(String),

    #[error("synchronisation failed, received {0:?}")]
    SyncFailed(String),

    #[error("unknown return code {0}")]
    UnknownReturnCode(u32),

    #[error("command '{command}' failed: {code}")]
    Isp { command: String, code: ReturnCode },

    #[error("write to 0x{address:08x} failed, resend retries exhausted")]
    RetriesExhausted { address: u32 },

    #[error("checksum mismatch reading 0x{address:08x}: received {expected}, computed {actual}")]
    ChecksumMismatch {
        address: u32,
        expected: u32,
        actual: u32,
    },

    #[error("line encoding error: {0}")]
    Codec(CodecError),

    #[error("no device detected")]
    NoDevice,

    #[error("unexpected part id 0x{found:08X}, expected 0x{expected:08X}")]
    IdentityMismatch { expected: u32, found: u32 },

    #[error("operation not permitted in state {0:?}")]
    InvalidState(State),

    #[error("copy size {0} is not one of 256, 512, 1024 or 4096")]
    InvalidCopySize(u32),

    #[error("block of {0} bytes exceeds the maximum of 900")]
    BlockTooLarge(usize),

    #[error("{len} bytes at 0x{address:08x} exceed the 32-bit address space")]
    AddressOverflow { address: u32, len: usize },
}

impl<SerialError: Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

/// Address of the last byte of a `len` byte region starting at `address`
pub(crate) fn last_address<E: Debug>(address: u32, len: usize) -> Result<u32, Error<E>> {
    u32::try_from(len.saturating_sub(1))
        .ok()
        .and_then(|n| address.checked_add(n))
        .ok_or(Error::AddressOverflow { address, len })
}

/// Parse a hex value, with or without a leading `0x`
pub fn parse_hex(s: &str) -> Result<u32, ParseIntError> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(s, 16)
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Expected part identifier (hex)
    #[cfg_attr(feature = "structopt", structopt(long, default_value="0x26013F37", parse(try_from_str=parse_hex)))]
    pub part_id: u32,

    /// Target crystal frequency in kHz, sent during negotiation
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "12000"))]
    pub crystal_khz: u32,

    /// Reset the device into ISP mode using DTR (reset) and RTS (ISP entry)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub reset: bool,

    /// Timeout to wait for each bootloader response line
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub init_delay_ms: u32,

    /// RAM buffer used to stage flash writes (hex)
    #[cfg_attr(feature = "structopt", structopt(long, default_value="0x10000200", parse(try_from_str=parse_hex)))]
    pub staging_address: u32,

    /// Start of RAM available for loading (hex)
    #[cfg_attr(feature = "structopt", structopt(long, default_value="0x10000200", parse(try_from_str=parse_hex)))]
    pub ram_base: u32,

    /// Size of RAM available for loading
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "32256"))]
    pub ram_size: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            part_id: DEFAULT_PART_ID,
            crystal_khz: DEFAULT_CRYSTAL_KHZ,
            reset: false,
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            init_delay_ms: 100,
            staging_address: RAM_BASE,
            ram_base: RAM_BASE,
            ram_size: RAM_SIZE,
        }
    }
}

/// Identity read from the device during connection
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DeviceIdentity {
    pub part_id: u32,
    pub boot_major: u32,
    pub boot_minor: u32,
}

/// Result of a blank check
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum BlankCheck {
    Blank,
    /// First non-blank word and its value
    NotBlank { offset: u32, value: u32 },
}

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// An empty implementation of [ProgressCallbacks] that does nothing
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DefaultProgressCallback;

impl ProgressCallbacks for DefaultProgressCallback {
    fn init(&mut self, _addr: u32, _total: usize) {}
    fn update(&mut self, _current: usize) {}
    fn finish(&mut self) {}
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    identity: Option<DeviceIdentity>,
    echo: bool,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Disconnected,
            options,
            identity: None,
            echo: true,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Fetch the session options
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Identity of the connected device, once identified
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity
    }

    /// Synchronise with the bootloader, disable echo and check the part id.
    ///
    /// Any failure leaves the programmer in `State::Aborted`.
    pub fn connect(&mut self) -> Result<DeviceIdentity, Error<E>> {
        if self.state != State::Disconnected {
            return Err(Error::InvalidState(self.state));
        }

        match self.handshake() {
            Ok(id) => {
                self.set_state(State::Ready);
                Ok(id)
            }
            Err(e) => {
                debug!("Connection failed: {}", e);
                self.set_state(State::Aborted);
                Err(e)
            }
        }
    }

    fn handshake(&mut self) -> Result<DeviceIdentity, Error<E>> {
        if self.options.reset {
            self.reset()?;
        }

        self.echo = true;
        self.identity = None;

        self.set_state(State::Synchronizing);

        debug!("Sending synchronisation character");
        self.write_bytes(&[SYNC_CHAR])?;

        let resp = self.read_line()?;
        if resp != SYNC_STRING {
            return Err(Error::SyncFailed(resp));
        }

        self.send_line(SYNC_STRING)?;
        self.skip_echo()?;
        let resp = self.read_line()?;
        if resp != REPLY_OK {
            return Err(Error::SyncFailed(resp));
        }

        self.set_state(State::Negotiating);

        let crystal = self.options.crystal_khz.to_string();
        self.send_line(&crystal)?;
        self.skip_echo()?;
        self.expect_line(REPLY_OK)?;

        // The echo-off command is still echoed once
        self.command_ok(&Command::Echo { on: false })?;
        self.echo = false;
        self.set_state(State::EchoDisabled);

        let part_id = self.query_part_id()?;
        let (boot_major, boot_minor) = self.query_boot_version()?;
        let id = DeviceIdentity {
            part_id,
            boot_major,
            boot_minor,
        };

        info!(
            "Device ID: 0x{:08X}, bootloader version: {}.{}",
            part_id, boot_major, boot_minor
        );

        if part_id == 0 {
            return Err(Error::NoDevice);
        }
        if part_id != self.options.part_id {
            return Err(Error::IdentityMismatch {
                expected: self.options.part_id,
                found: part_id,
            });
        }

        self.identity = Some(id);
        self.set_state(State::Identified);

        Ok(id)
    }

    fn reset(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting device into ISP");

        self.port.set_rts(true)?;
        self.port.set_dtr(true)?;

        self.delay.delay_ms(100u32);

        self.port.set_dtr(false)?;
        self.delay.delay_ms(self.options.init_delay_ms);
        self.port.set_rts(false)?;

        Ok(())
    }

    fn set_state(&mut self, state: State) {
        debug!("State: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), Error<E>> {
        match self.state {
            State::Ready => Ok(()),
            s => Err(Error::InvalidState(s)),
        }
    }

    fn query_part_id(&mut self) -> Result<u32, Error<E>> {
        self.command_ok(&Command::ReadPartId)?;
        self.read_number()
    }

    fn query_boot_version(&mut self) -> Result<(u32, u32), Error<E>> {
        self.command_ok(&Command::ReadBootVersion)?;
        let major = self.read_number()?;
        let minor = self.read_number()?;
        Ok((major, minor))
    }

    /// Read the part identifier
    pub fn read_part_id(&mut self) -> Result<u32, Error<E>> {
        self.ensure_ready()?;
        self.query_part_id()
    }

    /// Read the boot code version as (major, minor)
    pub fn read_boot_version(&mut self) -> Result<(u32, u32), Error<E>> {
        self.ensure_ready()?;
        self.query_boot_version()
    }

    /// Unlock flash write, erase and go commands
    pub fn unlock(&mut self, key: u32) -> Result<(), Error<E>> {
        self.ensure_ready()?;
        self.command_ok(&Command::Unlock { key })
    }

    /// Prepare sectors for write or erase
    pub fn prepare(&mut self, start: u32, end: u32) -> Result<(), Error<E>> {
        self.ensure_ready()?;
        self.command_ok(&Command::Prepare { start, end })
    }

    /// Erase sectors, these must be prepared first
    pub fn erase(&mut self, start: u32, end: u32) -> Result<(), Error<E>> {
        self.ensure_ready()?;
        self.command_ok(&Command::Erase { start, end })
    }

    /// Copy `len` bytes from RAM to a prepared flash sector
    pub fn copy_ram_to_flash(&mut self, flash: u32, ram: u32, len: u32) -> Result<(), Error<E>> {
        self.ensure_ready()?;
        if !COPY_SIZES.contains(&len) {
            return Err(Error::InvalidCopySize(len));
        }
        self.command_ok(&Command::CopyRamToFlash { flash, ram, len })
    }

    /// Check whether sectors are blank.
    ///
    /// The offset and value of the first non-blank word follow only a
    /// `SECTOR_NOT_BLANK` reply, as the bootloader sends nothing more for
    /// other codes. Any other nonzero code is returned as an error without
    /// reading further lines, and the stream is not realigned if the device
    /// sent more, so the session should be torn down afterwards.
    pub fn blank_check(&mut self, start: u32, end: u32) -> Result<BlankCheck, Error<E>> {
        self.ensure_ready()?;

        let cmd = Command::BlankCheck { start, end };
        match self.command(&cmd)? {
            ReturnCode::CmdSuccess => Ok(BlankCheck::Blank),
            ReturnCode::SectorNotBlank => {
                // Offset and contents of the first non-blank word follow
                let offset = self.read_number()?;
                let value = self.read_number()?;
                Ok(BlankCheck::NotBlank { offset, value })
            }
            code => Err(Error::Isp {
                command: cmd.to_string(),
                code,
            }),
        }
    }

    /// Execute from `address` in thumb mode, ending the session
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        self.ensure_ready()?;
        self.command_ok(&Command::Go { address })?;

        info!("Running from 0x{:08x}", address);
        self.set_state(State::Disconnected);

        Ok(())
    }
}
