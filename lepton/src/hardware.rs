/*!
Linux hardware access: VoSPI over spidev and the command channel over i2c-dev.

Both interfaces speak 16-bit big-endian words on the wire. The SPI link hands
packets over untouched; the command channel converts attribute data to and
from little-endian at its boundary.
*/

use crate::config::ReaderConfig;
use crate::error::{CommandError, TransportError};
use crate::protocol::{PACKET_SIZE, RESYNC_DELAY};
use crate::transport::{CommandInterface, LinkCloser, Transport};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub use crate::protocol::{DEFAULT_I2C_PATH, DEFAULT_SPI_PATH, DEFAULT_SPI_SPEED_HZ, MAX_SPI_SPEED_HZ};

/// SPI mode 3: CPOL=1, CPHA=1
const SPI_MODE_3: u8 = 3;
const SPI_BITS_PER_WORD: u8 = 8;

mod ioctl {
    const SPI_IOC_MAGIC: u8 = b'k';

    nix::ioctl_write_ptr!(spi_write_mode, SPI_IOC_MAGIC, 1, u8);
    nix::ioctl_read!(spi_read_mode, SPI_IOC_MAGIC, 1, u8);
    nix::ioctl_write_ptr!(spi_write_bits_per_word, SPI_IOC_MAGIC, 3, u8);
    nix::ioctl_read!(spi_read_bits_per_word, SPI_IOC_MAGIC, 3, u8);
    nix::ioctl_write_ptr!(spi_write_max_speed_hz, SPI_IOC_MAGIC, 4, u32);
    nix::ioctl_read!(spi_read_max_speed_hz, SPI_IOC_MAGIC, 4, u32);

    // I2C_SLAVE
    nix::ioctl_write_int_bad!(i2c_set_slave, 0x0703);
}

fn invalid(what: &str, wanted: u32, actual: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("spi {}: set {}, read back {}", what, wanted, actual),
    )
}

/// VoSPI link over a spidev device.
///
/// The device is only released for good by [`close`](Self::close) or the
/// link's closer. A failed reopen after a reset leaves the link
/// disconnected, and the next read tries again.
pub struct HardwareLink {
    path: PathBuf,
    speed_hz: u32,
    resync_delay: Duration,
    file: Option<File>,
    closed: Arc<AtomicBool>,
}

impl HardwareLink {
    /// Open and configure the SPI device
    pub fn open<P: AsRef<Path>>(path: P, speed_hz: u32) -> Result<Self, TransportError> {
        let mut link = Self::disconnected(path, speed_hz);
        link.connect()?;
        info!("🔌 Opened {} at {} Hz", link.path.display(), link.speed_hz);
        Ok(link)
    }

    /// Use the reader's resync delay when resetting
    pub fn with_config(mut self, config: &ReaderConfig) -> Self {
        self.resync_delay = config.resync_delay();
        self
    }

    fn disconnected<P: AsRef<Path>>(path: P, speed_hz: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            speed_hz: speed_hz.clamp(1, MAX_SPI_SPEED_HZ),
            resync_delay: RESYNC_DELAY,
            file: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn connect(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let fd = file.as_raw_fd();
        let mut mode = 0u8;
        let mut bits = 0u8;
        let mut speed = 0u32;
        // SAFETY: fd is an open spidev descriptor and every pointer refers to a
        // live local of the size the request encodes.
        unsafe {
            ioctl::spi_write_mode(fd, &SPI_MODE_3)?;
            ioctl::spi_read_mode(fd, &mut mode)?;
            ioctl::spi_write_bits_per_word(fd, &SPI_BITS_PER_WORD)?;
            ioctl::spi_read_bits_per_word(fd, &mut bits)?;
            ioctl::spi_write_max_speed_hz(fd, &self.speed_hz)?;
            ioctl::spi_read_max_speed_hz(fd, &mut speed)?;
        }
        if mode != SPI_MODE_3 {
            return Err(invalid("mode", SPI_MODE_3.into(), mode.into()));
        }
        if bits != SPI_BITS_PER_WORD {
            return Err(invalid("bits per word", SPI_BITS_PER_WORD.into(), bits.into()));
        }
        if speed != self.speed_hz {
            return Err(invalid("max speed", self.speed_hz, speed));
        }
        self.file = Some(file);
        Ok(())
    }

    /// Release the device; reads fail with `Closed` from now on
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.file = None;
    }
}

impl Transport for HardwareLink {
    fn read_packet(&mut self, buf: &mut [u8; PACKET_SIZE]) -> Result<(), TransportError> {
        if self.is_closed() {
            self.file = None;
            return Err(TransportError::Closed);
        }
        if self.file.is_none() {
            debug!("Reconnecting {}", self.path.display());
            self.connect()?;
        }
        let file = self.file.as_mut().ok_or(TransportError::Closed)?;
        let n = file.read(buf)?;
        if n != PACKET_SIZE {
            return Err(TransportError::ShortRead { expected: PACKET_SIZE, actual: n });
        }
        Ok(())
    }

    /// Closing the device deasserts CS; idling for more than 5 frame periods
    /// makes the camera restart at the next frame.
    fn reset(&mut self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.file = None;
        debug!("Resetting SPI link");
        thread::sleep(self.resync_delay);
        self.connect()?;
        Ok(())
    }

    /// Marks the link closed; a read in flight completes, the next one
    /// returns `Closed`.
    fn closer(&self) -> Option<Arc<dyn LinkCloser>> {
        let closed = self.closed.clone();
        Some(Arc::new(move || closed.store(true, Ordering::SeqCst)))
    }
}
/// Fixed address of the camera
pub const I2C_ADDRESS: i32 = 0x2A;

/// Command channel registers
mod reg {
    pub const STATUS: u16 = 0x0002;
    pub const COMMAND_ID: u16 = 0x0004;
    pub const DATA_LENGTH: u16 = 0x0006;
    pub const DATA_0: u16 = 0x0008;
    pub const DATA_BUFFER_0: u16 = 0xF800;
}

const STATUS_BUSY: u16 = 0x0001;
const STATUS_BOOT_MODE: u16 = 0x0002;
const STATUS_BOOT_STATUS: u16 = 0x0004;
const STATUS_ERROR_SHIFT: u16 = 8;

/// Attributes up to this many words fit in the data registers
const DATA_REGISTER_WORDS: usize = 16;
/// Size of the data buffer
const MAX_ATTRIBUTE_WORDS: usize = 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const MAX_POLLS: u32 = 1000;

/// Convert between little-endian attribute data and big-endian wire words
fn swap_words(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Command channel over i2c-dev
pub struct HardwareCci {
    file: Mutex<Option<File>>,
}

impl HardwareCci {
    /// Open the bus and wait for the camera to finish booting
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CommandError> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        // SAFETY: fd is an open i2c-dev descriptor; I2C_SLAVE takes the address by value.
        unsafe {
            ioctl::i2c_set_slave(file.as_raw_fd(), I2C_ADDRESS).map_err(io::Error::from)?;
        }
        let cci = Self { file: Mutex::new(Some(file)) };
        {
            let mut guard = cci.file.lock();
            let file = guard.as_mut().ok_or(CommandError::Closed)?;
            let mut polls = 0;
            loop {
                let status = wait_idle(file)?;
                if status == STATUS_BOOT_STATUS | STATUS_BOOT_MODE {
                    break;
                }
                polls += 1;
                if polls >= MAX_POLLS {
                    return Err(CommandError::Busy(polls));
                }
                trace!("Camera not yet booted: 0x{:04X}", status);
                thread::sleep(POLL_INTERVAL);
            }
        }
        info!("🔌 Command channel open on {}", path.as_ref().display());
        Ok(cci)
    }

    /// Release the bus; commands fail with `Closed` from now on
    pub fn close(&self) {
        self.file.lock().take();
    }

    /// Run one transaction with exclusive access to the bus
    fn transact<R>(&self, f: impl FnOnce(&mut File) -> Result<R, CommandError>) -> Result<R, CommandError> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(CommandError::Closed)?;
        wait_idle(file)?;
        f(file)
    }
}

fn check_len(len: usize) -> Result<u16, CommandError> {
    if len % 2 != 0 {
        return Err(CommandError::Unaligned(len));
    }
    let words = len / 2;
    if words > MAX_ATTRIBUTE_WORDS {
        return Err(CommandError::BufferTooLarge(words));
    }
    Ok(words as u16)
}

fn data_register(words: u16) -> u16 {
    if usize::from(words) <= DATA_REGISTER_WORDS {
        reg::DATA_0
    } else {
        reg::DATA_BUFFER_0
    }
}

fn read_data(file: &mut File, addr: u16, out: &mut [u8]) -> Result<(), CommandError> {
    file.write_all(&addr.to_be_bytes())?;
    file.read_exact(out)?;
    Ok(())
}

fn read_register(file: &mut File, addr: u16) -> Result<u16, CommandError> {
    let mut buf = [0u8; 2];
    read_data(file, addr, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn write_register(file: &mut File, addr: u16, value: u16) -> Result<(), CommandError> {
    let [a0, a1] = addr.to_be_bytes();
    let [v0, v1] = value.to_be_bytes();
    file.write_all(&[a0, a1, v0, v1])?;
    Ok(())
}

/// Poll until the busy bit clears, returning the status register
fn wait_idle(file: &mut File) -> Result<u16, CommandError> {
    for _ in 0..MAX_POLLS {
        let status = read_register(file, reg::STATUS)?;
        if status & STATUS_BUSY == 0 {
            return Ok(status);
        }
        trace!("Camera busy: 0x{:04X}", status);
        thread::sleep(POLL_INTERVAL);
    }
    warn!("⚠️ Camera busy for {} polls", MAX_POLLS);
    Err(CommandError::Busy(MAX_POLLS))
}

/// Wait for the command to finish and surface the camera's error code
fn finish(file: &mut File) -> Result<(), CommandError> {
    let status = wait_idle(file)?;
    let code = (status >> STATUS_ERROR_SHIFT) as u8 as i8;
    if code != 0 {
        return Err(CommandError::Device(code));
    }
    Ok(())
}

impl CommandInterface for HardwareCci {
    fn get_attribute(&self, id: u16, out: &mut [u8]) -> Result<(), CommandError> {
        let words = check_len(out.len())?;
        self.transact(|file| {
            write_register(file, reg::DATA_LENGTH, words)?;
            write_register(file, reg::COMMAND_ID, id)?;
            finish(file)?;
            read_data(file, data_register(words), out)?;
            swap_words(out);
            Ok(())
        })
    }

    fn set_attribute(&self, id: u16, data: &[u8]) -> Result<(), CommandError> {
        let words = check_len(data.len())?;
        let mut wire = Vec::with_capacity(data.len() + 2);
        wire.extend_from_slice(&data_register(words).to_be_bytes());
        wire.extend_from_slice(data);
        swap_words(&mut wire[2..]);
        self.transact(|file| {
            file.write_all(&wire)?;
            write_register(file, reg::DATA_LENGTH, words)?;
            write_register(file, reg::COMMAND_ID, id | crate::cci::command::TYPE_SET)?;
            finish(file)
        })
    }

    fn run_command(&self, id: u16) -> Result<(), CommandError> {
        self.transact(|file| {
            write_register(file, reg::DATA_LENGTH, 0)?;
            write_register(file, reg::COMMAND_ID, id | crate::cci::command::TYPE_RUN)?;
            finish(file)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_words() {
        let mut data = [0x01, 0x02, 0x03, 0x04];
        swap_words(&mut data);
        assert_eq!(data, [0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn test_check_len() {
        assert_eq!(check_len(4).unwrap(), 2);
        assert!(matches!(check_len(3), Err(CommandError::Unaligned(3))));
        assert!(matches!(check_len(2050), Err(CommandError::BufferTooLarge(1025))));
    }

    #[test]
    fn test_data_register_selection() {
        assert_eq!(data_register(16), reg::DATA_0);
        assert_eq!(data_register(17), reg::DATA_BUFFER_0);
    }

    fn not_a_spi_device() -> (tempfile::NamedTempFile, HardwareLink) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut link = HardwareLink::disconnected(file.path(), DEFAULT_SPI_SPEED_HZ);
        link.resync_delay = Duration::ZERO;
        (file, link)
    }

    #[test]
    fn test_failed_reconnect_is_retried() {
        let (_file, mut link) = not_a_spi_device();
        let mut buf = [0u8; PACKET_SIZE];

        // A regular file rejects the SPI ioctls
        let err = link.reset().unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        for _ in 0..3 {
            let err = link.read_packet(&mut buf).unwrap_err();
            assert!(matches!(err, TransportError::Io(_)));
            assert!(!err.is_terminal());
        }
        assert!(matches!(link.reset(), Err(TransportError::Io(_))));
    }

    #[test]
    fn test_close_is_terminal() {
        let (_file, mut link) = not_a_spi_device();
        let mut buf = [0u8; PACKET_SIZE];
        link.close();
        assert!(matches!(link.read_packet(&mut buf), Err(TransportError::Closed)));
        assert!(matches!(link.reset(), Err(TransportError::Closed)));

        let (_file, mut link) = not_a_spi_device();
        link.closer().unwrap().close();
        assert!(matches!(link.read_packet(&mut buf), Err(TransportError::Closed)));
    }

    #[test]
    fn test_open_missing_device() {
        assert!(HardwareLink::open("/nonexistent/spidev0.0", DEFAULT_SPI_SPEED_HZ).is_err());
        assert!(matches!(HardwareCci::open("/nonexistent/i2c-1"), Err(CommandError::Io(_))));
    }
}
