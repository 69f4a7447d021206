//! Flash programming, staged through RAM one chunk at a time.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::*;
use crate::{last_address, BlankCheck, DefaultProgressCallback, Error, ProgressCallbacks, Programmer, SerialPort};

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Write `image` to flash at `address`.
    ///
    /// Sectors spanned by the image are erased once if they are not blank,
    /// then the image is staged in RAM `FLASH_CHUNK` bytes at a time and
    /// copied into its sector. Any failure aborts immediately, leaving
    /// whatever was already erased or written in place.
    pub fn write_flash(
        &mut self,
        address: u32,
        image: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error<E>> {
        self.ensure_ready()?;

        if image.is_empty() {
            return Ok(());
        }

        let first = Sector::containing(address);
        let last = Sector::containing(last_address(address, image.len())?);

        if let BlankCheck::NotBlank { offset, value } = self.blank_check(first.index, last.index)? {
            debug!("Sector not blank at offset 0x{:x} (0x{:08x})", offset, value);
            info!("Erasing sectors {} to {}", first.index, last.index);

            self.unlock(UNLOCK_KEY)?;
            self.prepare(first.index, last.index)?;
            self.erase(first.index, last.index)?;
        }

        let staging = self.options.staging_address;
        let mut written = 0;

        progress.init(address, image.len());

        for chunk in image.chunks(FLASH_CHUNK) {
            let flash_address = address + written as u32;
            let sector = Sector::containing(flash_address);

            debug!("Writing {} bytes to sector {}", chunk.len(), sector.index);

            self.write_ram(staging, chunk, &mut DefaultProgressCallback)?;

            self.unlock(UNLOCK_KEY)?;
            self.prepare(sector.index, sector.index)?;
            self.copy_ram_to_flash(flash_address, staging, copy_size(chunk.len()))?;

            written += chunk.len();
            progress.update(written);
        }

        progress.finish();

        Ok(())
    }
}
