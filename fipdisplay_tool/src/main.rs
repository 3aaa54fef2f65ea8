//! Command line front end for Saitek/Logitech FIP panels.
//!
//!   fip list                  # enumerate panels through DirectOutput
//!   fip image [PATH]          # show one picture, then blink the LEDs
//!   fip stream <MEDIA>        # stream a still image or animated GIF
//!   fip raw-image [PATH]      # push one picture over raw USB

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use fipdisplay::transport::native::{DirectOutputLibrary, Session};
use fipdisplay::transport::raw_usb::{self, ProbeOutcome, UsbPipe};
use fipdisplay::{
    test_pattern, CancelToken, FilterType, FipConfig, FipError, Frame, FramePump, MediaSource,
    PixelOrder,
};

const LED_STEP: Duration = Duration::from_millis(75);
const NATIVE_PAGE: u32 = 0;
const RAW_PAGE: u32 = 1;

#[derive(Parser)]
#[command(name = "fip")]
#[command(version)]
#[command(about = "Drive a Saitek/Logitech FIP panel", long_about = None)]
struct Cli {
    /// DirectOutput library to load
    #[arg(long, env = "FIP_LIBRARY", default_value = "./liblibfip.so", global = true)]
    library: PathBuf,

    /// Plugin name reported to DirectOutput
    #[arg(long, default_value = "fip", global = true)]
    plugin_name: String,

    #[arg(long, default_value_t = PixelOrder::Reversed, global = true)]
    pixel_order: PixelOrder,

    /// Frames buffered between decoder and panel
    #[arg(long, default_value_t = 32, global = true)]
    queue_capacity: usize,

    /// Display page, 0 for DirectOutput and 1 for raw USB unless given
    #[arg(long, global = true)]
    page: Option<u32>,

    /// Honour animation frame delays instead of streaming as fast as possible
    #[arg(long, global = true)]
    paced: bool,

    /// Give up waiting for a raw USB panel after this many seconds
    #[arg(long, global = true)]
    discovery_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List panels and their serial numbers
    List,
    /// Show one image (SMPTE bars when omitted) and blink the LEDs
    Image {
        path: Option<PathBuf>,
        /// Blink cycles, 0 blinks forever
        #[arg(long, default_value_t = 1)]
        blink_cycles: u32,
        #[arg(long, default_value_t = 2)]
        led_page: u32,
    },
    /// Stream every frame of a media file to the panel
    Stream {
        media: PathBuf,
        /// Talk to the panel over raw USB instead of DirectOutput
        #[arg(long)]
        raw: bool,
    },
    /// Show one image over raw USB, without the vendor library
    RawImage { path: Option<PathBuf> },
}

impl Cli {
    fn config(&self) -> FipConfig {
        FipConfig {
            discovery_timeout: self.discovery_timeout.map(Duration::from_secs),
            queue_capacity: self.queue_capacity,
            pixel_order: self.pixel_order,
            library_path: self.library.clone(),
            plugin_name: self.plugin_name.clone(),
            ..FipConfig::default()
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config();
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            log::info!("interrupted, shutting down");
            cancel.cancel();
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let native_page = cli.page.unwrap_or(NATIVE_PAGE);
    let raw_page = cli.page.unwrap_or(RAW_PAGE);

    let outcome = match &cli.command {
        Commands::List => list_devices(&config),
        Commands::Image {
            path,
            blink_cycles,
            led_page,
        } => show_image(
            &config,
            native_page,
            path.as_deref(),
            *blink_cycles,
            *led_page,
            &cancel,
        ),
        Commands::Stream { media, raw: false } => {
            stream(&config, native_page, media, cli.paced, &cancel)
        }
        Commands::Stream { media, raw: true } => {
            stream_raw(&config, raw_page, media, cli.paced, &cancel)
        }
        Commands::RawImage { path } => raw_image(&config, raw_page, path.as_deref(), &cancel),
    };

    match outcome {
        Err(err) if matches!(err.downcast_ref::<FipError>(), Some(FipError::NoDevice)) => {
            println!("No devices found!");
            std::process::exit(1);
        }
        Err(err) if matches!(err.downcast_ref::<FipError>(), Some(FipError::Cancelled)) => {
            log::info!("stopped");
            Ok(())
        }
        other => other,
    }
}

fn load_frame(path: Option<&Path>, order: PixelOrder) -> Result<Frame> {
    let Some(path) = path else {
        return Ok(test_pattern(order)?);
    };
    let source = MediaSource::open(path)
        .with_context(|| format!("could not open {}", path.display()))?
        .next()
        .with_context(|| format!("{} holds no frames", path.display()))??;
    Ok(Frame::from_image(&source.image, order, FilterType::Triangle)?)
}

fn load_library(config: &FipConfig) -> Result<DirectOutputLibrary> {
    DirectOutputLibrary::load(&config.library_path).with_context(|| {
        format!(
            "could not load DirectOutput from {}",
            config.library_path.display()
        )
    })
}

fn list_devices(config: &FipConfig) -> Result<()> {
    let library = load_library(config)?;
    let session = Session::initialize(&library, &config.plugin_name)?;

    let devices = session.enumerate()?;
    if devices.is_empty() {
        return Err(FipError::NoDevice.into());
    }
    for (i, handle) in devices.into_iter().enumerate() {
        let device = session.device(handle);
        let serial = device
            .serial_number()
            .unwrap_or_else(|err| format!("<{}>", err));
        let device_type = device
            .device_type()
            .map(|uuid| uuid.to_string())
            .unwrap_or_else(|err| format!("<{}>", err));
        println!(
            "#{}: {:p}  serial {}  type {}",
            i + 1,
            handle.as_ptr(),
            serial,
            device_type
        );
    }

    session.close()?;
    Ok(())
}

fn show_image(
    config: &FipConfig,
    page: u32,
    path: Option<&Path>,
    blink_cycles: u32,
    led_page: u32,
    cancel: &CancelToken,
) -> Result<()> {
    let frame = load_frame(path, config.pixel_order)?;
    let library = load_library(config)?;
    let session = Session::initialize(&library, &config.plugin_name)?;
    let device = session.first_device()?;

    println!("serial number: {}", device.serial_number()?);
    device.set_image(page, 0, &frame)?;

    device.blink_leds(led_page, blink_cycles, LED_STEP, cancel)?;

    session.close()?;
    Ok(())
}

fn stream(config: &FipConfig, page: u32, media: &Path, paced: bool, cancel: &CancelToken) -> Result<()> {
    let source = MediaSource::open(media)
        .with_context(|| format!("could not open {}", media.display()))?;
    let library = load_library(config)?;
    let session = Session::initialize(&library, &config.plugin_name)?;
    let mut device = session.first_device()?.with_page(page);

    let pump = FramePump::new(config.queue_capacity, cancel.clone());
    let report = pump.run(&mut device, |producer| {
        source.feed(producer, config.pixel_order, paced).map(|_| ())
    })?;
    println!(
        "{} frames delivered, {} failed",
        report.delivered, report.failed
    );

    session.close()?;
    Ok(())
}

fn open_raw_panel(config: &FipConfig, cancel: &CancelToken) -> Result<UsbPipe<rusb::Context>> {
    let context = rusb::Context::new().context("could not initialize libusb")?;
    let device = raw_usb::wait_for_display(
        &context,
        config.usb,
        config.discovery_poll,
        config.discovery_timeout,
        cancel,
    )?;
    let pipe = UsbPipe::open(&device, config.transfer_timeout)?;
    if let Some(serial) = pipe.serial_number() {
        println!("serial number: {}", serial);
    }
    Ok(pipe)
}

fn stream_raw(
    config: &FipConfig,
    page: u32,
    media: &Path,
    paced: bool,
    cancel: &CancelToken,
) -> Result<()> {
    let source = MediaSource::open(media)
        .with_context(|| format!("could not open {}", media.display()))?;
    let pipe = open_raw_panel(config, cancel)?;

    let report = raw_usb::run_session(&pipe, config, cancel, |link| {
        if link.probe()? == ProbeOutcome::FactoryMode {
            return Err(FipError::Protocol("panel is in factory mode".to_owned()));
        }
        link.set_page(page);
        let pump = FramePump::new(config.queue_capacity, cancel.clone());
        pump.run(link, |producer| {
            source.feed(producer, config.pixel_order, paced).map(|_| ())
        })
    })?;
    println!(
        "{} frames delivered, {} failed",
        report.delivered, report.failed
    );
    Ok(())
}

fn raw_image(config: &FipConfig, page: u32, path: Option<&Path>, cancel: &CancelToken) -> Result<()> {
    let frame = load_frame(path, config.pixel_order)?;
    let pipe = open_raw_panel(config, cancel)?;

    let outcome = raw_usb::run_session(&pipe, config, cancel, |link| {
        let outcome = link.probe()?;
        if outcome == ProbeOutcome::Normal {
            link.set_image(page, &frame)?;
        }
        Ok(outcome)
    })?;
    if outcome == ProbeOutcome::FactoryMode {
        bail!("panel is in factory mode, image not sent");
    }
    Ok(())
}
