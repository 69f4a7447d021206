#[macro_use]
extern crate log;

use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::{Delay, Serial};

use lpc_uart_loader::protocol::UNLOCK_KEY;
use lpc_uart_loader::{parse_hex, Options, ProgressCallbacks, Programmer};

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "lpc-uart-loader")]
pub struct Args {
    /// Serial port to connect to
    #[structopt(short, long)]
    port: String,

    /// Binary image to load
    #[structopt(short, long, required_unless = "hexfile")]
    binfile: Option<PathBuf>,

    /// Intel hex image to load (not supported)
    #[structopt(short = "h", long)]
    hexfile: Option<PathBuf>,

    /// Load address (hex), images at the start of RAM are loaded to RAM,
    /// anything else is written to flash
    #[structopt(short, long, parse(try_from_str = parse_hex))]
    address: Option<u32>,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Read the image back after loading and compare
    #[structopt(long)]
    verify: bool,

    /// Do not start the loaded image
    #[structopt(long)]
    no_run: bool,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

type LinuxProgrammer = Programmer<Serial, Delay, IoErrorKind>;

#[derive(Default)]
struct ProgressBarCallback {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for ProgressBarCallback {
    fn init(&mut self, addr: u32, total: usize) {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
                .progress_chars("#>-"),
        );
        pb.set_message(&format!("0x{:08x}", addr));
        self.pb = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(pb) = &self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.finish();
        }
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    if o.hexfile.is_some() {
        bail!("hex files are not supported, convert the image and use --binfile");
    }

    let binfile = o.binfile.clone().context("no image file provided")?;
    let image = std::fs::read(&binfile)
        .with_context(|| format!("reading image {}", binfile.display()))?;

    let address = o.address.unwrap_or(o.options.ram_base);
    let to_ram = address == o.options.ram_base;

    if to_ram && image.len() > o.options.ram_size as usize {
        bail!(
            "cannot load {} into {} of RAM",
            bytefmt::format(image.len() as u64),
            bytefmt::format(o.options.ram_size as u64)
        );
    }

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("opening serial port {}", &o.port))?;

    info!("Connecting to bootloader");

    p.connect().context("connecting to bootloader")?;

    let mut progress = ProgressBarCallback::default();

    if to_ram {
        info!(
            "Loading {} to RAM at 0x{:08X}",
            bytefmt::format(image.len() as u64),
            address
        );
        p.write_ram(address, &image, &mut progress)
            .context("writing RAM")?;
    } else {
        info!(
            "Writing {} to flash at 0x{:08X}",
            bytefmt::format(image.len() as u64),
            address
        );
        p.write_flash(address, &image, &mut progress)
            .context("writing flash")?;
    }

    if o.verify {
        verify(&mut p, address, &image)?;
    }

    if o.no_run {
        info!("Done!");
        return Ok(());
    }

    p.unlock(UNLOCK_KEY).context("unlocking")?;
    p.go(address).context("starting image")?;

    Ok(())
}

fn verify(p: &mut LinuxProgrammer, address: u32, image: &[u8]) -> anyhow::Result<()> {
    // Reads must be a multiple of four bytes
    let len = (image.len() as u32 + 3) & !3;
    let data = p.read_ram(address, len).context("reading image back")?;

    if data.len() < image.len() {
        bail!("short read back, {} of {} bytes", data.len(), image.len());
    }

    if let Some(i) = image.iter().zip(data.iter()).position(|(a, b)| a != b) {
        let start = i & !0xf;
        let end = (start + 16).min(image.len());

        error!("expected: {}", hex::encode(&image[start..end]));
        error!("read:     {}", hex::encode(&data[start..end]));

        bail!("verification failed at 0x{:08X}", address + i as u32);
    }

    info!("Verified {} bytes", image.len());

    Ok(())
}
