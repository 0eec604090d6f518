/*!
Frame data structures, assembly and buffer reuse.

Pixel buffers cycle between a [`BufferPool`], the [`FrameAssembler`] filling
one row per accepted line, the [`Frame`] handed to the caller, and back to
the pool once the caller recycles it. The read thread never allocates while
the pool has buffers to spare.
*/

use crate::error::TelemetryError;
use crate::protocol::{FRAME_HEIGHT, FRAME_PIXELS, FRAME_WIDTH, PAYLOAD_SIZE};
use crate::telemetry::{self, CentiCelsius, CentiKelvin, FfcState};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;

/// Owned storage for one frame of 14-bit samples, row-major
pub type PixelBuffer = Box<[u16; FRAME_PIXELS]>;

fn new_buffer() -> PixelBuffer {
    Box::new([0u16; FRAME_PIXELS])
}

/// Per-frame metadata decoded from telemetry row A
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
    /// Camera frame counter, rolls over
    pub frame_counter: u32,
    /// Time since camera power on, in ms
    pub since_startup_ms: u32,
    /// Average sample value; computed from the pixels when telemetry is off
    pub frame_mean: u16,
    pub fpa_temp_counts: u16,
    pub fpa_temp: CentiKelvin,
    pub fpa_temp_c: CentiCelsius,
    pub housing_temp_counts: u16,
    pub housing_temp: CentiKelvin,
    pub housing_temp_c: CentiCelsius,
    /// Time elapsed since the last calibration, in ms
    pub ffc_since_ms: u32,
    /// Sensor temperature at the last calibration
    pub ffc_temp: CentiKelvin,
    pub ffc_temp_c: CentiCelsius,
    /// Housing temperature at the last calibration
    pub ffc_temp_housing: CentiKelvin,
    pub ffc_temp_housing_c: CentiCelsius,
    pub ffc_state: FfcState,
    /// The camera asks for a calibration as soon as possible
    pub ffc_desired: bool,
    /// Shutdown imminent
    pub overtemp: bool,
    pub agc_enabled: bool,
    pub telemetry_revision: u16,
    pub log2_ffc_frames: u16,
}

/// A complete 80x60 frame
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: PixelBuffer,
    metadata: Metadata,
    min: u16,
    max: u16,
}

impl Frame {
    /// Build a frame from a full buffer, computing its min and max
    pub fn new(pixels: PixelBuffer, metadata: Metadata) -> Self {
        let (min, max) = pixels
            .iter()
            .fold((u16::MAX, u16::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        Self { pixels, metadata, min, max }
    }

    pub fn width(&self) -> usize {
        FRAME_WIDTH
    }

    pub fn height(&self) -> usize {
        FRAME_HEIGHT
    }

    /// Sample at column `x`, row `y`
    pub fn at(&self, x: usize, y: usize) -> u16 {
        self.pixels[y * FRAME_WIDTH + x]
    }

    /// One row of samples
    pub fn row(&self, y: usize) -> &[u16] {
        &self.pixels[y * FRAME_WIDTH..(y + 1) * FRAME_WIDTH]
    }

    /// All samples, row-major
    pub fn pixels(&self) -> &[u16] {
        &self.pixels[..]
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Smallest sample in the frame
    pub fn min(&self) -> u16 {
        self.min
    }

    /// Largest sample in the frame
    pub fn max(&self) -> u16 {
        self.max
    }

    /// Check for bit-identical pixels
    pub fn same_pixels(&self, other: &[u16; FRAME_PIXELS]) -> bool {
        self.pixels[..] == other[..]
    }

    /// Give the pixel buffer back, typically to recycle it
    pub fn into_pixels(self) -> PixelBuffer {
        self.pixels
    }

    /// Samples as little-endian bytes
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// Fixed set of reusable pixel buffers.
///
/// Clones share the same buffers. `get` falls back to allocating when the pool
/// is drained; `put` drops the buffer when the pool is full.
#[derive(Debug, Clone)]
pub struct BufferPool {
    tx: Sender<PixelBuffer>,
    rx: Receiver<PixelBuffer>,
}

impl BufferPool {
    /// Create a pool pre-filled with `capacity` buffers
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            let _ = tx.try_send(new_buffer());
        }
        Self { tx, rx }
    }

    /// Take a buffer; contents are whatever the previous user left
    pub fn get(&self) -> PixelBuffer {
        self.rx.try_recv().unwrap_or_else(|_| new_buffer())
    }

    /// Return a buffer to the pool
    pub fn put(&self, buffer: PixelBuffer) {
        let _ = self.tx.try_send(buffer);
    }

    /// Buffers currently available
    pub fn available(&self) -> usize {
        self.rx.len()
    }
}

/// Builds frames line by line into a pooled buffer
#[derive(Debug)]
pub struct FrameAssembler {
    pool: BufferPool,
    current: Option<PixelBuffer>,
    /// Carried from frame to frame so fields that fail validation keep their last value
    metadata: Metadata,
    telemetry_enabled: bool,
}

impl FrameAssembler {
    pub fn new(pool: BufferPool, telemetry_enabled: bool) -> Self {
        Self {
            pool,
            current: None,
            metadata: Metadata::default(),
            telemetry_enabled,
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Start a fresh frame. A partially built frame is discarded; every row
    /// is overwritten before a frame can complete, so the buffer isn't cleared.
    pub fn begin_frame(&mut self) {
        if self.current.is_none() {
            self.current = Some(self.pool.get());
        }
    }

    /// Copy one line of big-endian samples into row `row`
    pub fn write_pixel_line(&mut self, row: usize, payload: &[u8]) {
        debug_assert!(row < FRAME_HEIGHT);
        debug_assert!(payload.len() >= PAYLOAD_SIZE);
        let pixels = self.current.get_or_insert_with(|| self.pool.get());
        let dst = &mut pixels[row * FRAME_WIDTH..(row + 1) * FRAME_WIDTH];
        for (sample, chunk) in dst.iter_mut().zip(payload.chunks_exact(2)) {
            *sample = u16::from_be_bytes([chunk[0], chunk[1]]);
        }
    }

    /// Decode telemetry line `index`; only row A carries known fields
    pub fn apply_telemetry(&mut self, index: usize, payload: &[u8]) -> Result<(), TelemetryError> {
        if index == 0 {
            telemetry::decode_row_a(payload, &mut self.metadata)?;
        }
        Ok(())
    }

    /// Metadata as decoded so far
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Complete the current frame
    pub fn finish_frame(&mut self) -> Frame {
        let pixels = self.current.take().unwrap_or_else(|| self.pool.get());
        let mut frame = Frame::new(pixels, self.metadata.clone());
        if !self.telemetry_enabled {
            let sum: u32 = frame.pixels.iter().map(|&v| u32::from(v)).sum();
            frame.metadata.frame_mean = (sum / FRAME_PIXELS as u32) as u16;
        }
        frame
    }

    /// Return a frame's buffer to the pool
    pub fn recycle(&self, frame: Frame) {
        self.pool.put(frame.into_pixels());
    }
}

/// Detects frames bit-identical to the last accepted one
#[derive(Debug, Default)]
pub struct DuplicateFilter {
    previous: Option<PixelBuffer>,
}

impl DuplicateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `frame` against the last accepted frame. A new frame becomes the
    /// reference for the next check and `true` is returned.
    pub fn accept(&mut self, frame: &Frame) -> bool {
        match self.previous.as_deref_mut() {
            Some(previous) if frame.same_pixels(previous) => false,
            Some(previous) => {
                previous.copy_from_slice(frame.pixels());
                true
            }
            None => {
                let mut previous = new_buffer();
                previous.copy_from_slice(frame.pixels());
                self.previous = Some(previous);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(value: u16) -> Vec<u8> {
        std::iter::repeat(value.to_be_bytes()).take(FRAME_WIDTH).flatten().collect()
    }

    fn fill(assembler: &mut FrameAssembler, value: u16) -> Frame {
        assembler.begin_frame();
        for row in 0..FRAME_HEIGHT {
            assembler.write_pixel_line(row, &line(value));
        }
        assembler.finish_frame()
    }

    #[test]
    fn test_write_pixel_line_is_big_endian() {
        let mut assembler = FrameAssembler::new(BufferPool::new(2), true);
        assembler.begin_frame();
        for row in 0..FRAME_HEIGHT {
            assembler.write_pixel_line(row, &line(0));
        }
        let mut payload = line(0);
        payload[80..82].copy_from_slice(&[0x30, 0x39]);
        assembler.write_pixel_line(30, &payload);
        let frame = assembler.finish_frame();

        assert_eq!(frame.at(40, 30), 12345);
        assert_eq!(frame.row(30)[40], 12345);
        assert_eq!(frame.min(), 0);
        assert_eq!(frame.max(), 12345);
    }

    #[test]
    fn test_mean_without_telemetry() {
        let mut assembler = FrameAssembler::new(BufferPool::new(1), false);
        let frame = fill(&mut assembler, 8192);
        assert_eq!(frame.metadata().frame_mean, 8192);
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let pool = BufferPool::new(2);
        assert_eq!(pool.available(), 2);
        let a = pool.get();
        let b = pool.get();
        let c = pool.get(); // allocated
        assert_eq!(pool.available(), 0);
        pool.put(a);
        pool.put(b);
        pool.put(c); // dropped
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_recycle_returns_buffer() {
        let pool = BufferPool::new(1);
        let mut assembler = FrameAssembler::new(pool.clone(), false);
        let frame = fill(&mut assembler, 1);
        assert_eq!(pool.available(), 0);
        assembler.recycle(frame);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_duplicate_filter() {
        let mut assembler = FrameAssembler::new(BufferPool::new(4), false);
        let mut filter = DuplicateFilter::new();

        let first = fill(&mut assembler, 100);
        assert!(filter.accept(&first));
        let same = fill(&mut assembler, 100);
        assert!(!filter.accept(&same));

        assembler.begin_frame();
        for row in 0..FRAME_HEIGHT {
            assembler.write_pixel_line(row, &line(100));
        }
        let mut payload = line(100);
        payload[0] = 0x01;
        assembler.write_pixel_line(59, &payload);
        let different = assembler.finish_frame();
        assert!(filter.accept(&different));
        assert!(!filter.accept(&different));
    }

    #[test]
    fn test_frame_le_bytes() {
        let mut assembler = FrameAssembler::new(BufferPool::new(1), false);
        let frame = fill(&mut assembler, 0x1234);
        let bytes = frame.to_le_bytes();
        assert_eq!(bytes.len(), FRAME_PIXELS * 2);
        assert_eq!(&bytes[..2], &[0x34, 0x12]);
    }
}
