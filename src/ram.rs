//! RAM loading and read back.

use core::cmp::min;
use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;

use crate::codec;
use crate::protocol::*;
use crate::{last_address, Error, ProgressCallbacks, Programmer, SerialPort};

/// RESEND replies tolerated over a whole load
pub const WRITE_RETRIES: usize = 2;

#[derive(Copy, Clone, PartialEq, Debug)]
enum BlockStatus {
    Ok,
    Resend,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Write `data` to RAM at `address`, in blocks of up to `BLOCK_SIZE` bytes.
    ///
    /// Blocks the bootloader asks to resend are retried, up to `WRITE_RETRIES`
    /// times over the whole load.
    pub fn write_ram(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error<E>> {
        self.ensure_ready()?;
        last_address(address, data.len())?;

        debug!("Writing {} bytes to RAM at 0x{:08x}", data.len(), address);
        progress.init(address, data.len());

        let mut retries = WRITE_RETRIES;
        let mut offset = 0;

        while offset < data.len() {
            let block = &data[offset..min(offset + BLOCK_SIZE, data.len())];
            let block_address = address + offset as u32;

            match self.write_block(block_address, block)? {
                BlockStatus::Ok => {
                    offset += block.len();
                    progress.update(offset);
                }
                BlockStatus::Resend => {
                    retries -= 1;
                    warn!("Resend requested for block at 0x{:08x}", block_address);

                    if retries == 0 {
                        return Err(Error::RetriesExhausted {
                            address: block_address,
                        });
                    }
                }
            }
        }

        progress.finish();

        Ok(())
    }

    fn write_block(&mut self, address: u32, block: &[u8]) -> Result<BlockStatus, Error<E>> {
        if block.len() > BLOCK_SIZE {
            return Err(Error::BlockTooLarge(block.len()));
        }

        self.command_ok(&Command::WriteRam {
            address,
            len: block.len() as u32,
        })?;

        for chunk in block.chunks(LINE_SIZE) {
            let line = codec::encode(chunk).map_err(Error::Codec)?;
            self.send_line(&line)?;
        }

        let sum = codec::checksum(block);
        self.send_line(&sum.to_string())?;

        let resp = self.read_line()?;
        match resp.as_str() {
            REPLY_OK => Ok(BlockStatus::Ok),
            REPLY_RESEND => Ok(BlockStatus::Resend),
            _ => Err(Error::InvalidResponse(resp)),
        }
    }

    /// Read `len` bytes of memory from `address`.
    ///
    /// Each group of up to `MAX_LINES` lines is followed by a checksum, which
    /// is acknowledged once it matches the decoded data.
    pub fn read_ram(&mut self, address: u32, len: u32) -> Result<Vec<u8>, Error<E>> {
        self.ensure_ready()?;
        last_address(address, len as usize)?;

        self.command_ok(&Command::ReadMemory { address, len })?;

        let mut data = Vec::with_capacity(len as usize);
        let mut lines = (len as usize + LINE_SIZE - 1) / LINE_SIZE;

        while lines > 0 {
            let count = min(lines, MAX_LINES);
            let mut group = Vec::with_capacity(count * LINE_SIZE);

            for _ in 0..count {
                let line = self.read_line()?;
                group.extend(codec::decode(&line).map_err(Error::Codec)?);
            }

            let expected: u32 = self.read_number()?;
            let actual = codec::checksum(&group);
            if expected != actual {
                return Err(Error::ChecksumMismatch {
                    address: address.wrapping_add(data.len() as u32),
                    expected,
                    actual,
                });
            }

            self.write_bytes(b"OK\r\n")?;

            data.extend(group);
            lines -= count;
        }

        Ok(data)
    }
}
