/*!
Camera control over the command channel.

Only the handful of commands the frame reader depends on are wrapped here:
camera status, telemetry enable/placement, and flat-field correction, plus a
few read-only queries useful for diagnostics.
*/

use crate::config::TelemetryMode;
use crate::error::CommandError;
use crate::telemetry::CentiKelvin;
use crate::transport::CommandInterface;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Command IDs, module and command bits only. The channel adds the
/// get/set/run type bits.
pub mod command {
    /// Camera status, 4 words
    pub const SYS_STATUS: u16 = 0x0204;
    /// Module serial number, 4 words
    pub const SYS_SERIAL_NUMBER: u16 = 0x0208;
    /// Uptime in ms, 2 words
    pub const SYS_UPTIME: u16 = 0x020C;
    /// Housing temperature in centi-Kelvin, 1 word
    pub const SYS_HOUSING_TEMPERATURE: u16 = 0x0210;
    /// Sensor temperature in centi-Kelvin, 1 word
    pub const SYS_TEMPERATURE: u16 = 0x0214;
    /// Telemetry enable flag, 2 words
    pub const SYS_TELEMETRY_ENABLE: u16 = 0x0218;
    /// Telemetry location, 2 words: 0 header, 1 footer
    pub const SYS_TELEMETRY_LOCATION: u16 = 0x021C;
    /// Run a flat-field correction
    pub const SYS_FFC_RUN_NORMALIZATION: u16 = 0x0240;

    /// Type bits added to the command ID on the wire
    pub const TYPE_SET: u16 = 1;
    pub const TYPE_RUN: u16 = 2;
}

const TELEMETRY_HEADER: u32 = 0;
const TELEMETRY_FOOTER: u32 = 1;

/// Camera system status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CameraStatus {
    Ready,
    Initializing,
    LowPowerMode,
    GoingIntoStandby,
    FlatFieldInProcess,
}

impl CameraStatus {
    /// Raw value as reported by the camera
    pub fn code(self) -> u32 {
        match self {
            Self::Ready => 0,
            Self::Initializing => 1,
            Self::LowPowerMode => 2,
            Self::GoingIntoStandby => 3,
            Self::FlatFieldInProcess => 4,
        }
    }
}

impl TryFrom<u32> for CameraStatus {
    type Error = CommandError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ready),
            1 => Ok(Self::Initializing),
            2 => Ok(Self::LowPowerMode),
            3 => Ok(Self::GoingIntoStandby),
            4 => Ok(Self::FlatFieldInProcess),
            value => Err(CommandError::UnexpectedValue { what: "camera status", value }),
        }
    }
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::Initializing => "initializing",
            Self::LowPowerMode => "low power mode",
            Self::GoingIntoStandby => "going into standby",
            Self::FlatFieldInProcess => "flat field in process",
        };
        f.write_str(name)
    }
}

/// Result of a status query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Status {
    pub camera: CameraStatus,
    /// Commands executed since boot
    pub command_count: u16,
}

/// Typed access to the camera's command channel
#[derive(Debug, Clone)]
pub struct Controller<C> {
    cci: C,
}

impl<C: CommandInterface> Controller<C> {
    pub fn new(cci: C) -> Self {
        Self { cci }
    }

    /// Underlying command channel
    pub fn interface(&self) -> &C {
        &self.cci
    }

    fn get_u16(&self, id: u16) -> Result<u16, CommandError> {
        let mut buf = [0u8; 2];
        self.cci.get_attribute(id, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn get_u32(&self, id: u16) -> Result<u32, CommandError> {
        let mut buf = [0u8; 4];
        self.cci.get_attribute(id, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn set_u32(&self, id: u16, value: u32) -> Result<(), CommandError> {
        self.cci.set_attribute(id, &value.to_le_bytes())
    }

    /// Query the camera status
    pub fn status(&self) -> Result<Status, CommandError> {
        let mut buf = [0u8; 8];
        self.cci.get_attribute(command::SYS_STATUS, &mut buf)?;
        let camera = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Ok(Status {
            camera: CameraStatus::try_from(camera)?,
            command_count: u16::from_le_bytes([buf[4], buf[5]]),
        })
    }

    /// Module serial number
    pub fn serial(&self) -> Result<u64, CommandError> {
        let mut buf = [0u8; 8];
        self.cci.get_attribute(command::SYS_SERIAL_NUMBER, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Time since the camera booted
    pub fn uptime(&self) -> Result<Duration, CommandError> {
        Ok(Duration::from_millis(u64::from(self.get_u32(command::SYS_UPTIME)?)))
    }

    /// Sensor (FPA) temperature
    pub fn temperature(&self) -> Result<CentiKelvin, CommandError> {
        self.get_u16(command::SYS_TEMPERATURE).map(CentiKelvin)
    }

    /// Housing temperature
    pub fn housing_temperature(&self) -> Result<CentiKelvin, CommandError> {
        self.get_u16(command::SYS_HOUSING_TEMPERATURE).map(CentiKelvin)
    }

    /// Current telemetry placement
    pub fn telemetry_mode(&self) -> Result<TelemetryMode, CommandError> {
        if self.get_u32(command::SYS_TELEMETRY_ENABLE)? == 0 {
            return Ok(TelemetryMode::Disabled);
        }
        match self.get_u32(command::SYS_TELEMETRY_LOCATION)? {
            TELEMETRY_HEADER => Ok(TelemetryMode::Header),
            TELEMETRY_FOOTER => Ok(TelemetryMode::Footer),
            value => Err(CommandError::UnexpectedValue { what: "telemetry location", value }),
        }
    }

    /// Enable or disable telemetry and set where it is placed
    pub fn set_telemetry_mode(&self, mode: TelemetryMode) -> Result<(), CommandError> {
        let location = match mode {
            TelemetryMode::Disabled => None,
            TelemetryMode::Header => Some(TELEMETRY_HEADER),
            TelemetryMode::Footer => Some(TELEMETRY_FOOTER),
        };
        self.set_u32(command::SYS_TELEMETRY_ENABLE, u32::from(location.is_some()))?;
        if let Some(location) = location {
            self.set_u32(command::SYS_TELEMETRY_LOCATION, location)?;
        }
        debug!("Telemetry set to {:?}", mode);
        Ok(())
    }

    /// Trigger a flat-field correction. The image freezes for about 23 frames.
    pub fn run_ffc(&self) -> Result<(), CommandError> {
        info!("📷 Running flat-field correction");
        self.cci.run_command(command::SYS_FFC_RUN_NORMALIZATION)
    }

    /// Bring the camera up for streaming with the given telemetry placement.
    ///
    /// The camera must report ready, and the placement is read back to make
    /// sure the line count the reader relies on is in effect.
    pub fn configure(&self, mode: TelemetryMode) -> Result<(), CommandError> {
        let status = self.status()?;
        if status.camera != CameraStatus::Ready {
            return Err(CommandError::UnexpectedValue {
                what: "camera status",
                value: status.camera.code(),
            });
        }
        self.set_telemetry_mode(mode)?;
        let actual = self.telemetry_mode()?;
        if actual != mode {
            return Err(CommandError::ReadBack("telemetry mode"));
        }
        info!("✅ Camera configured: telemetry {:?}", mode);
        Ok(())
    }
}
