//! Line transport: commands are sent as `\n` terminated text, replies are
//! read back one CRLF terminated line at a time.

use core::convert::TryFrom;
use core::fmt::Debug;
use core::str::FromStr;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{Command, ReturnCode};
use crate::{Error, Programmer, SerialPort};

/// Longest reply line accepted before the stream is considered garbled
const MAX_LINE_LEN: usize = 128;

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub(crate) fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    /// Write a single line, appending the terminator
    pub(crate) fn send_line(&mut self, line: &str) -> Result<(), Error<E>> {
        trace!("> {}", line);

        for b in line.as_bytes() {
            block!(self.port.write(*b))?;
        }
        self.write_bytes(b"\n")
    }

    /// Read a single line, stripping the terminator
    pub(crate) fn read_line(&mut self) -> Result<String, Error<E>> {
        let mut buff = Vec::with_capacity(32);
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(b'\n') => break,
                Ok(v) => {
                    if buff.len() >= MAX_LINE_LEN {
                        let s = String::from_utf8_lossy(&buff).into_owned();
                        return Err(Error::InvalidResponse(s));
                    }
                    buff.push(v);
                    continue;
                }
            };

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);

            if t > self.options.response_timeout_ms {
                debug!("Receive timeout, partial line: {:?}", String::from_utf8_lossy(&buff));
                return Err(Error::ResponseTimeout);
            }
        }

        if buff.last() == Some(&b'\r') {
            buff.pop();
        }

        let line = String::from_utf8(buff)
            .map_err(|e| Error::InvalidResponse(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;

        trace!("< {}", line);

        Ok(line)
    }

    /// Read a line and check it matches `expected`
    pub(crate) fn expect_line(&mut self, expected: &str) -> Result<(), Error<E>> {
        let line = self.read_line()?;
        if line != expected {
            return Err(Error::InvalidResponse(line));
        }
        Ok(())
    }

    /// Discard the echoed command while echo is enabled
    pub(crate) fn skip_echo(&mut self) -> Result<(), Error<E>> {
        if self.echo {
            let _ = self.read_line()?;
        }
        Ok(())
    }

    /// Read a line holding a decimal value
    pub(crate) fn read_number<T: FromStr>(&mut self) -> Result<T, Error<E>> {
        let line = self.read_line()?;
        line.trim().parse().map_err(|_| Error::InvalidResponse(line))
    }

    pub(crate) fn read_code(&mut self) -> Result<ReturnCode, Error<E>> {
        let v: u32 = self.read_number()?;
        ReturnCode::try_from(v).map_err(Error::UnknownReturnCode)
    }

    /// Send a command and read its return code
    pub fn command(&mut self, cmd: &Command) -> Result<ReturnCode, Error<E>> {
        self.send_line(&cmd.to_string())?;
        self.skip_echo()?;

        let code = self.read_code()?;
        debug!("Command '{}': {}", cmd, code);

        Ok(code)
    }

    /// Send a command, failing on any return code other than success
    pub(crate) fn command_ok(&mut self, cmd: &Command) -> Result<(), Error<E>> {
        match self.command(cmd)? {
            ReturnCode::CmdSuccess => Ok(()),
            code => Err(Error::Isp {
                command: cmd.to_string(),
                code,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::mock::{programmer, Device};
    use crate::protocol::{Command, ReturnCode};
    use crate::Error;

    #[test]
    fn read_line_strips_crlf() {
        let mut p = programmer(Device::new());
        p.port.rx.extend(b"Synchronized\r\n0\r\n");

        assert_eq!(p.read_line().unwrap(), "Synchronized");
        assert_eq!(p.read_code().unwrap(), ReturnCode::CmdSuccess);
    }

    #[test]
    fn garbled_code_is_invalid() {
        let mut p = programmer(Device::new());
        p.port.rx.extend(b"0x\r\n21\r\n");

        assert_eq!(p.read_code(), Err(Error::InvalidResponse("0x".to_string())));
        assert_eq!(p.read_code(), Err(Error::UnknownReturnCode(21)));
    }

    #[test]
    fn overlong_line_is_invalid() {
        let mut p = programmer(Device::new());
        p.port.rx.extend([b'A'; 200].iter());

        match p.read_line() {
            Err(Error::InvalidResponse(_)) => (),
            r => panic!("Unexpected result: {:?}", r),
        }
    }

    #[test]
    fn partial_line_times_out() {
        let mut p = programmer(Device::new());
        p.port.rx.extend(b"12");

        assert_eq!(p.read_line(), Err(Error::ResponseTimeout));
    }

    #[test]
    fn timeout_matches_time_slept() {
        let mut p = programmer(Device::new());
        p.options.response_timeout_ms = 100;
        p.options.poll_delay_ms = 5;

        assert_eq!(p.read_line(), Err(Error::ResponseTimeout));
        assert!(p.delay.elapsed_ms > 100);
        assert!(p.delay.elapsed_ms <= 105);
    }

    #[test]
    fn command_skips_echo_while_enabled() {
        let mut p = programmer(Device::new());
        p.port.stage_commands();

        assert_eq!(p.command(&Command::Echo { on: false }).unwrap(), ReturnCode::CmdSuccess);
        p.echo = false;
        assert_eq!(p.command(&Command::ReadPartId).unwrap(), ReturnCode::CmdSuccess);
        assert_eq!(p.read_number::<u32>().unwrap(), 0x2601_3F37);
        assert_eq!(p.port.written(), "A 0\nJ\n");
    }
}
