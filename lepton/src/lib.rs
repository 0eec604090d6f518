/*!
# FLIR Lepton VoSPI Driver Core

This crate keeps a reader synchronized with the Lepton's unflow-controlled
VoSPI packet stream and turns it into validated 80x60 14-bit thermal frames
with per-frame telemetry.

## Core Types

- [`Frame`] - Complete frame: pixels, [`Metadata`] and min/max
- [`FrameReader`] - Blocking, single-threaded frame acquisition loop
- [`Session`] - Dedicated reader thread with a bounded hand-off queue
- [`StatsSnapshot`] - Consistent copy of the session counters

## Modules

- [`packet`] - Packet classification and CRC
- [`sync`] - Line synchronization state machine
- [`telemetry`] - Telemetry row decoding
- [`frame`] - Frame assembly, buffer pool and duplicate filter
- [`transport`] - VoSPI link and command channel traits
- [`cci`] - Telemetry/calibration control over the command channel
- [`sim`] - Simulated sensor
- [`hardware`] - spidev / i2c-dev implementation (Linux only)
*/

pub mod cci;
pub mod config;
pub mod error;
pub mod frame;
#[cfg(target_os = "linux")]
pub mod hardware;
pub mod packet;
pub mod reader;
pub mod session;
pub mod sim;
pub mod stats;
pub mod sync;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use cci::{CameraStatus, Controller};
pub use config::{ReaderConfig, TelemetryMode};
pub use error::{CommandError, LeptonError, Result, TelemetryError, TransportError};
pub use frame::{Frame, FrameAssembler, Metadata};
pub use reader::FrameReader;
pub use session::Session;
pub use sim::{SimulatedCci, SimulatedLink};
pub use stats::{Stats, StatsSnapshot};
pub use telemetry::{CentiCelsius, CentiKelvin, FfcState};
pub use transport::{CommandInterface, LinkCloser, Transport};

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// VoSPI wire format constants
pub mod protocol {
    use std::time::Duration;

    /// Size of one VoSPI packet in bytes
    pub const PACKET_SIZE: usize = 164;

    /// Size of the ID + CRC header preceding the payload
    pub const PACKET_HEADER_SIZE: usize = 4;

    /// Size of the payload in bytes (80 big-endian 16-bit words)
    pub const PAYLOAD_SIZE: usize = PACKET_SIZE - PACKET_HEADER_SIZE;

    /// Number of 16-bit words in a payload
    pub const PAYLOAD_WORDS: usize = PAYLOAD_SIZE / 2;

    /// Line ID field is 12 bits. Leading 4 bits are reserved.
    pub const LINE_ID_MASK: u16 = 0x0FFF;

    /// Any ID with these bits set marks a discard packet
    pub const DISCARD_MASK: u16 = 0x0F00;

    /// Frame width in pixels
    pub const FRAME_WIDTH: usize = 80;

    /// Frame height in pixels
    pub const FRAME_HEIGHT: usize = 60;

    /// Number of pixels in a frame
    pub const FRAME_PIXELS: usize = FRAME_WIDTH * FRAME_HEIGHT;

    /// Telemetry lines per frame when telemetry is enabled
    pub const TELEMETRY_LINES: usize = 3;

    /// The sensor emits a frame every 38.4ms (~27Hz), only every third is unique
    pub const FRAME_PERIOD: Duration = Duration::from_micros(38_400);

    /// Deasserting CS for at least 5 frame periods (>185ms) forces a resync
    pub const RESYNC_DELAY: Duration = Duration::from_millis(200);

    /// A calibration freezes the image for this many frames
    pub const FFC_FRAMES: u32 = 23;

    /// Default SPI clock, 8 MHz
    pub const DEFAULT_SPI_SPEED_HZ: u32 = 8_000_000;

    /// Highest SPI clock the camera supports
    pub const MAX_SPI_SPEED_HZ: u32 = 20_000_000;

    /// Default spidev node carrying the video stream
    pub const DEFAULT_SPI_PATH: &str = "/dev/spidev0.0";

    /// Default i2c-dev bus carrying the command channel
    pub const DEFAULT_I2C_PATH: &str = "/dev/i2c-1";
}
