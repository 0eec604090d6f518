/*!
# Lepton Frame Grabber

Captures frames from a FLIR Lepton over VoSPI and saves them as raw pixel
files with JSON metadata, or streams the metadata to stdout.

## Usage

### Capture from hardware
```bash
leptongrab capture --output-dir ./frames --frames 100
```

### Capture from the simulated camera, metadata to stdout
```bash
leptongrab capture --simulate --live
```

### Query the camera and run a calibration
```bash
leptongrab query --ffc
```

### Run from a configuration file
```bash
leptongrab config --output leptongrab.toml
leptongrab --config leptongrab.toml
```
*/

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lepton::protocol::{DEFAULT_I2C_PATH, DEFAULT_SPI_PATH};
use lepton::{sim, CommandInterface, Controller, ReaderConfig, Session, TelemetryMode};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;

use config::{AppConfig, DeviceConfig};

#[derive(Parser)]
#[command(name = "leptongrab")]
#[command(about = "FLIR Lepton frame capture and camera control")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "leptongrab.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start frame capture
    Capture {
        /// Output directory for frame files
        #[arg(short, long, default_value = "./frames")]
        output_dir: String,

        /// Print metadata to stdout instead of saving files
        #[arg(long)]
        live: bool,

        /// Stop after this many frames (0 = until Ctrl+C)
        #[arg(short, long, default_value = "0")]
        frames: u64,

        /// Telemetry placement: disabled, header or footer
        #[arg(short, long, default_value = "header")]
        telemetry: String,

        /// Verify the CRC of every line
        #[arg(long)]
        crc: bool,

        /// Use the simulated camera
        #[arg(long)]
        simulate: bool,

        /// SPI device
        #[arg(long, default_value = DEFAULT_SPI_PATH)]
        spi: String,

        /// I2C device
        #[arg(long, default_value = DEFAULT_I2C_PATH)]
        i2c: String,
    },

    /// Print camera status over the command channel
    Query {
        /// Trigger a flat-field correction
        #[arg(long)]
        ffc: bool,

        /// Use the simulated camera
        #[arg(long)]
        simulate: bool,

        /// I2C device
        #[arg(long, default_value = DEFAULT_I2C_PATH)]
        i2c: String,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "leptongrab.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries frame metadata, logs go to stderr
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Some(Commands::Capture { output_dir, live, frames, telemetry, crc, simulate, spi, i2c }) => {
            let mut config = AppConfig::new();
            config.device = DeviceConfig {
                spi_path: spi,
                i2c_path: i2c,
                simulate,
                ..DeviceConfig::default()
            };
            config.capture.output_directory = output_dir;
            config.capture.save_files = !live;
            config.capture.frame_limit = frames;
            config.capture.reader.telemetry = parse_telemetry(&telemetry)?;
            config.capture.reader.verify_crc = crc;
            run_capture(&config)
        }

        Some(Commands::Query { ffc, simulate, i2c }) => run_query(simulate, &i2c, ffc),

        Some(Commands::Config { output }) => generate_config_file(output),

        None => {
            let config = AppConfig::load_from_file(&cli.config)?;
            info!("🚀 Starting frame capture from config: {}", cli.config.display());
            run_capture(&config)
        }
    }
}

fn parse_telemetry(value: &str) -> Result<TelemetryMode> {
    match value.to_ascii_lowercase().as_str() {
        "disabled" | "off" => Ok(TelemetryMode::Disabled),
        "header" => Ok(TelemetryMode::Header),
        "footer" => Ok(TelemetryMode::Footer),
        other => bail!("Unknown telemetry placement '{}', expected disabled, header or footer", other),
    }
}

/// Run frame capture until the frame limit or Ctrl+C
fn run_capture(config: &AppConfig) -> Result<()> {
    let session = start_session(&config.device, config.capture.reader.clone())?;

    let running = session.running_flag();
    ctrlc::set_handler(move || {
        eprintln!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, Ordering::SeqCst);
    })?;

    let summary = capture::run(session, &config.capture)?;
    info!("✅ Frame capture completed: {} frames", summary.frames);
    Ok(())
}

fn start_session(device: &DeviceConfig, reader: ReaderConfig) -> Result<Session> {
    if device.simulate {
        info!("🧪 Using simulated camera");
        let (link, cci) = sim::simulated(TelemetryMode::Disabled);
        return Ok(Session::start(link.with_pacing(), cci, reader)?);
    }
    start_hardware_session(device, reader)
}

#[cfg(target_os = "linux")]
fn start_hardware_session(device: &DeviceConfig, reader: ReaderConfig) -> Result<Session> {
    use lepton::hardware::{HardwareCci, HardwareLink};

    let cci = HardwareCci::open(&device.i2c_path)
        .with_context(|| format!("Failed to open command channel {}", device.i2c_path))?;
    let link = HardwareLink::open(&device.spi_path, device.spi_speed_hz)
        .with_context(|| format!("Failed to open SPI device {}", device.spi_path))?
        .with_config(&reader);
    Ok(Session::start(link, cci, reader)?)
}

#[cfg(not(target_os = "linux"))]
fn start_hardware_session(_device: &DeviceConfig, _reader: ReaderConfig) -> Result<Session> {
    bail!("Hardware access requires Linux spidev/i2c-dev; use --simulate")
}

/// Print camera status, optionally running a calibration first
fn run_query(simulate: bool, i2c_path: &str, ffc: bool) -> Result<()> {
    if simulate {
        let (_link, cci) = sim::simulated(TelemetryMode::Disabled);
        return query(&Controller::new(cci), ffc);
    }
    query_hardware(i2c_path, ffc)
}

#[cfg(target_os = "linux")]
fn query_hardware(i2c_path: &str, ffc: bool) -> Result<()> {
    let cci = lepton::hardware::HardwareCci::open(i2c_path)
        .with_context(|| format!("Failed to open command channel {}", i2c_path))?;
    query(&Controller::new(cci), ffc)
}

#[cfg(not(target_os = "linux"))]
fn query_hardware(_i2c_path: &str, _ffc: bool) -> Result<()> {
    bail!("Hardware access requires Linux i2c-dev; use --simulate")
}

fn query<C: CommandInterface>(controller: &Controller<C>, ffc: bool) -> Result<()> {
    if ffc {
        controller.run_ffc().context("Flat-field correction failed")?;
        println!("✅ Flat-field correction started");
    }

    let status = controller.status()?;
    let temperature = controller.temperature()?;
    let housing = controller.housing_temperature()?;

    println!("📷 Status:       {} ({} commands)", status.camera, status.command_count);
    println!("🔢 Serial:       {:016X}", controller.serial()?);
    println!("⏱️ Uptime:       {:.1}s", controller.uptime()?.as_secs_f64());
    println!("🌡️ Sensor:       {} ({})", temperature, temperature.to_celsius());
    println!("🌡️ Housing:      {} ({})", housing, housing.to_celsius());
    println!("📡 Telemetry:    {:?}", controller.telemetry_mode()?);
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   leptongrab --config {}", output_path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_telemetry() {
        assert_eq!(parse_telemetry("Header").unwrap(), TelemetryMode::Header);
        assert_eq!(parse_telemetry("footer").unwrap(), TelemetryMode::Footer);
        assert_eq!(parse_telemetry("off").unwrap(), TelemetryMode::Disabled);
        assert!(parse_telemetry("sideways").is_err());
    }

    #[test]
    fn test_query_simulated_camera() {
        let (_link, cci) = sim::simulated(TelemetryMode::Header);
        let controller = Controller::new(cci);
        query(&controller, true).unwrap();
        assert_eq!(controller.telemetry_mode().unwrap(), TelemetryMode::Header);
    }
}
