/*!
Reader configuration.
*/

use crate::protocol::{FRAME_HEIGHT, RESYNC_DELAY, TELEMETRY_LINES};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where, if anywhere, the telemetry lines sit within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Telemetry disabled, 60 lines per frame
    Disabled,
    /// Telemetry sent as lines 0-2, before the pixels
    #[default]
    Header,
    /// Telemetry sent as lines 60-62, after the pixels
    Footer,
}

impl TelemetryMode {
    /// Check if telemetry lines are part of the frame
    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Total number of lines per frame
    pub fn lines_per_frame(self) -> usize {
        if self.is_enabled() {
            FRAME_HEIGHT + TELEMETRY_LINES
        } else {
            FRAME_HEIGHT
        }
    }

    /// Highest valid line ID: 59 without telemetry, 62 with
    pub fn max_line(self) -> u16 {
        (self.lines_per_frame() - 1) as u16
    }
}

/// Frame reader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Telemetry placement to configure on the camera
    pub telemetry: TelemetryMode,

    /// Check the CRC of every accepted line
    pub verify_crc: bool,

    /// Quiet period after a transfer failure, in milliseconds
    pub resync_delay_ms: u64,

    /// Capacity of the frame hand-off queue
    pub queue_capacity: usize,

    /// Number of pre-allocated pixel buffers
    pub pool_capacity: usize,

    /// Publish statistics at least every this many packets
    pub stats_publish_interval: u32,
}

impl ReaderConfig {
    /// Quiet period after a transfer failure
    pub fn resync_delay(&self) -> Duration {
        Duration::from_millis(self.resync_delay_ms)
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            telemetry: TelemetryMode::Header,
            verify_crc: false,
            resync_delay_ms: RESYNC_DELAY.as_millis() as u64,
            queue_capacity: 9 * 10, // ~10 seconds at 9 unique fps
            pool_capacity: 16,
            stats_publish_interval: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_line() {
        assert_eq!(TelemetryMode::Disabled.max_line(), 59);
        assert_eq!(TelemetryMode::Header.max_line(), 62);
        assert_eq!(TelemetryMode::Footer.max_line(), 62);
    }

    #[test]
    fn test_default_values() {
        let config = ReaderConfig::default();
        assert_eq!(config.telemetry, TelemetryMode::Header);
        assert!(!config.verify_crc);
        assert_eq!(config.resync_delay(), Duration::from_millis(200));
        assert_eq!(config.queue_capacity, 90);
    }
}
