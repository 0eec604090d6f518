/*!
Device interfaces consumed by the reader.

A Lepton is driven through two independent channels: the VoSPI link that
streams packets, and the command channel (CCI) used for the few attribute
reads/writes the driver needs. Both are traits so the reader runs the same
against real hardware and the simulated device.
*/

use crate::error::{CommandError, TransportError};
use crate::protocol::PACKET_SIZE;
use std::sync::Arc;

/// Closes a link from another thread.
///
/// After `close` the link's pending or next `read_packet` returns
/// [`TransportError::Closed`].
pub trait LinkCloser: Send + Sync {
    fn close(&self);
}

impl<F: Fn() + Send + Sync> LinkCloser for F {
    fn close(&self) {
        self()
    }
}

/// Packet stream from the camera
pub trait Transport: Send {
    /// Read exactly one packet. A short read is an error, never padded.
    fn read_packet(&mut self, buf: &mut [u8; PACKET_SIZE]) -> Result<(), TransportError>;

    /// Force the camera to restart packet numbering, idling long enough for
    /// it to resynchronize
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Handle for closing the link while a read is in progress on another
    /// thread. Links without one are only stopped between packets.
    fn closer(&self) -> Option<Arc<dyn LinkCloser>> {
        None
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_packet(&mut self, buf: &mut [u8; PACKET_SIZE]) -> Result<(), TransportError> {
        (**self).read_packet(buf)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        (**self).reset()
    }

    fn closer(&self) -> Option<Arc<dyn LinkCloser>> {
        (**self).closer()
    }
}

/// Register-style command channel.
///
/// Attribute data is exchanged as little-endian 16-bit words; implementations
/// take care of whatever byte order the bus uses. Calls may come from any
/// thread while a reader is running.
pub trait CommandInterface: Send + Sync {
    /// Read an attribute into `out`
    fn get_attribute(&self, id: u16, out: &mut [u8]) -> Result<(), CommandError>;

    /// Write an attribute
    fn set_attribute(&self, id: u16, data: &[u8]) -> Result<(), CommandError>;

    /// Run a command that takes no data
    fn run_command(&self, id: u16) -> Result<(), CommandError>;
}

impl<T: CommandInterface + ?Sized> CommandInterface for Arc<T> {
    fn get_attribute(&self, id: u16, out: &mut [u8]) -> Result<(), CommandError> {
        (**self).get_attribute(id, out)
    }

    fn set_attribute(&self, id: u16, data: &[u8]) -> Result<(), CommandError> {
        (**self).set_attribute(id, data)
    }

    fn run_command(&self, id: u16) -> Result<(), CommandError> {
        (**self).run_command(id)
    }
}
