/*!
Error types for the Lepton driver core.

Failures split along the lines of how the reader recovers from them:
transfer failures are retried after a cooldown, desynchronization triggers a
link reset, validation failures only degrade metadata, and configuration
failures abort session startup.
*/

use std::io;
use thiserror::Error;

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, LeptonError>;

/// Errors reported by a VoSPI link
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link returned fewer bytes than a full packet
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// I/O errors from the underlying device
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The link was closed; the read loop must stop
    #[error("Link closed")]
    Closed,
}

impl TransportError {
    /// Closure of the link is the only failure the reader does not retry
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Errors reported by the command and control interface
#[derive(Error, Debug)]
pub enum CommandError {
    /// I/O errors from the underlying bus
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The camera reported an error code in the status register
    #[error("Camera returned error code {0}")]
    Device(i8),

    /// The camera stayed busy for too long
    #[error("Camera busy for more than {0} polls")]
    Busy(u32),

    /// Attribute payload exceeds the camera data buffer
    #[error("Attribute of {0} words is too large")]
    BufferTooLarge(usize),

    /// Attribute payloads are 16-bit words
    #[error("Attribute length {0} is not 16-bit aligned")]
    Unaligned(usize),

    /// The camera returned a value outside the documented enumeration
    #[error("Unexpected value {value} for {what}")]
    UnexpectedValue { what: &'static str, value: u32 },

    /// A written attribute did not read back as written
    #[error("{0} did not read back as written")]
    ReadBack(&'static str),

    /// The bus was closed
    #[error("Command channel closed")]
    Closed,
}

/// Errors found while decoding a telemetry row
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    /// The payload does not contain a full telemetry row
    #[error("Telemetry payload too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// Status bits outside the documented mask were set
    #[error("Unknown status bits 0x{extra:08X} in 0x{status:08X}")]
    UnknownStatusBits { status: u32, extra: u32 },

    /// Calibration state code not valid for this telemetry revision
    #[error("Unknown FFC state {code} for telemetry revision {revision}")]
    UnknownFfcState { code: u32, revision: u16 },
}

/// Comprehensive error type for the driver
#[derive(Error, Debug)]
pub enum LeptonError {
    /// Link I/O error or short read; retried after a cooldown
    #[error("Transfer failure: {0}")]
    Transfer(#[from] TransportError),

    /// Line ID out of sequence or out of range; the link is reset
    #[error("Lost synchronization: got line {got}, expected {expected:?}")]
    Desync { got: u16, expected: Option<u16> },

    /// Telemetry could not be fully decoded; the frame is still delivered
    #[error("Telemetry validation failure: {0}")]
    Validation(#[from] TelemetryError),

    /// Session could not configure the camera; fatal at startup
    #[error("Configuration failure: {0}")]
    Configuration(#[from] CommandError),

    /// The session was closed
    #[error("Session closed")]
    Closed,
}

impl LeptonError {
    /// Create a new desynchronization error
    pub fn desync(got: u16, expected: Option<u16>) -> Self {
        Self::Desync { got, expected }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LeptonError::from(TransportError::ShortRead { expected: 164, actual: 12 });
        assert_eq!(err.to_string(), "Transfer failure: Short read: expected 164 bytes, got 12");

        let err = LeptonError::desync(5, Some(3));
        assert_eq!(err.to_string(), "Lost synchronization: got line 5, expected Some(3)");

        let err = LeptonError::from(TelemetryError::UnknownFfcState { code: 3, revision: 8 });
        assert!(err.to_string().contains("revision 8"));

        let err = LeptonError::from(CommandError::Device(-5));
        assert_eq!(err.to_string(), "Configuration failure: Camera returned error code -5");
    }

    #[test]
    fn test_terminal_transport_errors() {
        assert!(TransportError::Closed.is_terminal());
        assert!(!TransportError::ShortRead { expected: 164, actual: 0 }.is_terminal());
        let io = io::Error::new(io::ErrorKind::TimedOut, "spi");
        assert!(!TransportError::from(io).is_terminal());
    }
}
