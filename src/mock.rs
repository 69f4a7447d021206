//! Simulated bootloader for tests.
//!
//! Implements the serial traits and answers commands as the ROM bootloader
//! would, recording every command line received.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::codec;
use crate::protocol::*;
use crate::{Options, Programmer, SerialPort};

#[derive(Clone, Debug, PartialEq)]
enum Stage {
    AwaitSync,
    AwaitSyncString,
    AwaitCrystal,
    Commands,
    WriteData {
        address: u32,
        len: usize,
        lines: usize,
        data: Vec<u8>,
    },
}

pub struct Device {
    /// Bytes queued for the host
    pub rx: VecDeque<u8>,
    /// Command lines received, excluding encoded data and checksums
    pub commands: Vec<String>,
    /// Control line changes, in order
    pub line_events: Vec<(&'static str, bool)>,

    pub echo: bool,
    pub part_id: u32,
    pub boot_version: (u32, u32),
    pub sync_reply: String,
    /// Never respond
    pub silent: bool,
    /// Flash contents are blank
    pub blank: bool,
    /// Indices of received write blocks answered with RESEND
    pub resend: Vec<usize>,
    /// Corrupt checksums on read back
    pub corrupt_read: bool,
    /// Fail commands starting with this verb
    pub fail_on: Option<(char, ReturnCode)>,

    pub memory: HashMap<u32, u8>,

    written: Vec<u8>,
    line: Vec<u8>,
    blocks: usize,
    stage: Stage,
}

impl Device {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            commands: vec![],
            line_events: vec![],
            echo: true,
            part_id: DEFAULT_PART_ID,
            boot_version: (4, 1),
            sync_reply: SYNC_STRING.to_string(),
            silent: false,
            blank: true,
            resend: vec![],
            corrupt_read: false,
            fail_on: None,
            memory: HashMap::new(),
            written: vec![],
            line: vec![],
            blocks: 0,
            stage: Stage::AwaitSync,
        }
    }

    /// Skip the handshake and accept commands directly
    pub fn stage_commands(&mut self) {
        self.stage = Stage::Commands;
    }

    /// Everything written by the host
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }

    /// Commands received with the given verb
    pub fn count(&self, verb: char) -> usize {
        self.commands.iter().filter(|c| c.starts_with(verb)).count()
    }

    pub fn read_memory(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| *self.memory.get(&(address + i as u32)).unwrap_or(&0xff))
            .collect()
    }

    fn reply(&mut self, s: &str) {
        self.rx.extend(s.as_bytes());
        self.rx.extend(b"\r\n");
    }

    fn receive(&mut self, b: u8) {
        self.written.push(b);

        if self.silent {
            return;
        }

        if self.stage == Stage::AwaitSync {
            if b == SYNC_CHAR {
                let r = self.sync_reply.clone();
                self.reply(&r);
                self.stage = Stage::AwaitSyncString;
            }
            return;
        }

        if b != b'\n' {
            self.line.push(b);
            return;
        }

        let mut line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        if line.ends_with('\r') {
            line.pop();
        }

        self.handle_line(line);
    }

    fn handle_line(&mut self, line: String) {
        match self.stage.clone() {
            Stage::AwaitSync => (),
            Stage::AwaitSyncString => {
                self.commands.push(line.clone());
                self.echo_line(&line);
                if line == SYNC_STRING {
                    self.reply(REPLY_OK);
                    self.stage = Stage::AwaitCrystal;
                }
            }
            Stage::AwaitCrystal => {
                self.commands.push(line.clone());
                self.echo_line(&line);
                self.reply(REPLY_OK);
                self.stage = Stage::Commands;
            }
            Stage::WriteData {
                address,
                len,
                lines,
                mut data,
            } => {
                if lines > 0 {
                    data.extend(codec::decode(&line).unwrap());
                    self.stage = Stage::WriteData {
                        address,
                        len,
                        lines: lines - 1,
                        data,
                    };
                    return;
                }

                let sum: u32 = line.parse().unwrap();
                self.stage = Stage::Commands;

                let index = self.blocks;
                self.blocks += 1;

                if self.resend.contains(&index) || sum != codec::checksum(&data) || data.len() != len {
                    self.reply(REPLY_RESEND);
                    return;
                }

                for (i, b) in data.iter().enumerate() {
                    self.memory.insert(address + i as u32, *b);
                }
                self.reply(REPLY_OK);
            }
            Stage::Commands => self.handle_command(line),
        }
    }

    fn echo_line(&mut self, line: &str) {
        if self.echo {
            self.reply(line);
        }
    }

    fn handle_command(&mut self, line: String) {
        // Acknowledgement of a read back group
        if line == REPLY_OK {
            return;
        }

        self.commands.push(line.clone());
        self.echo_line(&line);

        let mut parts = line.split_whitespace();
        let verb = parts.next().and_then(|v| v.chars().next()).unwrap_or(' ');
        let args: Vec<u32> = parts.filter_map(|a| a.parse().ok()).collect();

        if let Some((v, code)) = self.fail_on {
            if v == verb {
                self.reply(&(code as u8).to_string());
                return;
            }
        }

        match verb {
            'A' => {
                self.echo = args[0] != 0;
                self.reply("0");
            }
            'J' => {
                self.reply("0");
                let id = self.part_id.to_string();
                self.reply(&id);
            }
            'K' => {
                self.reply("0");
                let (major, minor) = self.boot_version;
                self.reply(&major.to_string());
                self.reply(&minor.to_string());
            }
            'U' if args[0] != UNLOCK_KEY => self.reply("16"),
            'U' | 'P' | 'C' | 'G' => self.reply("0"),
            'E' => {
                self.blank = true;
                self.reply("0");
            }
            'I' if self.blank => self.reply("0"),
            'I' => {
                self.reply("8");
                self.reply("0");
                self.reply(&0x2000_8000u32.to_string());
            }
            'W' => {
                let len = args[1] as usize;
                self.reply("0");
                self.stage = Stage::WriteData {
                    address: args[0],
                    len,
                    lines: (len + LINE_SIZE - 1) / LINE_SIZE,
                    data: vec![],
                };
            }
            'R' => {
                self.reply("0");
                let data = self.read_memory(args[0], args[1] as usize);
                for group in data.chunks(BLOCK_SIZE) {
                    for line in group.chunks(LINE_SIZE) {
                        let l = codec::encode(line).unwrap();
                        self.reply(&l);
                    }
                    let mut sum = codec::checksum(group);
                    if self.corrupt_read {
                        sum += 1;
                    }
                    self.reply(&sum.to_string());
                }
            }
            _ => self.reply("1"),
        }
    }
}

impl Read<u8> for Device {
    type Error = ErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for Device {
    type Error = ErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl SerialPort<ErrorKind> for Device {
    fn set_rts(&mut self, level: bool) -> Result<(), ErrorKind> {
        self.line_events.push(("rts", level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), ErrorKind> {
        self.line_events.push(("dtr", level));
        Ok(())
    }
}

/// Delay that returns immediately, recording the time it would have slept
#[derive(Default)]
pub struct MockDelay {
    pub elapsed_ms: u64,
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms as u64;
    }
}

/// Programmer attached to a simulated device, with a short response timeout
pub fn programmer(device: Device) -> Programmer<Device, MockDelay, ErrorKind> {
    let options = Options {
        response_timeout_ms: 20,
        ..Options::default()
    };
    Programmer::new(device, MockDelay::default(), options)
}
