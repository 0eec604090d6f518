/*!
Blocking frame acquisition loop.

[`FrameReader`] owns the link, the synchronizer, the assembler and the
duplicate filter. It pulls packets until a complete frame that differs from
the previous one is available, recovering from transfer failures and lost
synchronization on its own. Only closure of the link ends the loop.
*/

use crate::config::ReaderConfig;
use crate::error::{LeptonError, Result};
use crate::frame::{BufferPool, DuplicateFilter, Frame, FrameAssembler};
use crate::protocol::PACKET_SIZE;
use crate::stats::{Stats, StatsCell, StatsSnapshot};
use crate::sync::{Line, LineSynchronizer, SyncEvent, SyncState};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Single-threaded frame reader over a [`Transport`]
pub struct FrameReader<T> {
    link: T,
    config: ReaderConfig,
    sync: LineSynchronizer,
    assembler: FrameAssembler,
    duplicates: DuplicateFilter,
    stats: Stats,
    published: StatsCell,
    packet: Box<[u8; PACKET_SIZE]>,
    packets_since_publish: u32,
    running: Option<Arc<AtomicBool>>,
}

impl<T: Transport> FrameReader<T> {
    /// Create a reader with its own buffer pool
    pub fn new(link: T, config: ReaderConfig) -> Self {
        let pool = BufferPool::new(config.pool_capacity);
        Self::with_pool(link, config, pool)
    }

    /// Create a reader drawing pixel buffers from `pool`
    pub fn with_pool(link: T, config: ReaderConfig, pool: BufferPool) -> Self {
        info!(
            "🚀 Frame reader: telemetry {:?}, {} lines per frame, CRC check {}",
            config.telemetry,
            config.telemetry.lines_per_frame(),
            if config.verify_crc { "on" } else { "off" }
        );
        Self {
            link,
            sync: LineSynchronizer::new(config.telemetry, config.verify_crc),
            assembler: FrameAssembler::new(pool, config.telemetry.is_enabled()),
            duplicates: DuplicateFilter::new(),
            stats: Stats::default(),
            published: StatsCell::new(),
            packet: Box::new([0u8; PACKET_SIZE]),
            packets_since_publish: 0,
            running: None,
            config,
        }
    }

    /// Stop reading as soon as `running` is cleared
    pub fn with_running(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = Some(running);
        self
    }

    /// Shared handle to the published statistics
    pub fn stats_cell(&self) -> StatsCell {
        self.published.clone()
    }

    /// Latest published statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.published.snapshot()
    }

    /// Working counters, including updates not yet published
    pub fn current_stats(&self) -> &Stats {
        &self.stats
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    /// Pixel buffer pool shared with consumers
    pub fn pool(&self) -> &BufferPool {
        self.assembler.pool()
    }

    /// Return a frame's buffer to the pool
    pub fn recycle(&self, frame: Frame) {
        self.assembler.recycle(frame);
    }

    /// Count a frame evicted downstream
    pub fn record_dropped_frame(&mut self) {
        self.stats.dropped_frames += 1;
    }

    pub fn link_mut(&mut self) -> &mut T {
        &mut self.link
    }

    /// Publish the working counters
    pub fn publish_stats(&mut self) {
        self.published.publish(&self.stats);
        self.packets_since_publish = 0;
    }

    fn is_running(&self) -> bool {
        self.running.as_ref().map_or(true, |r| r.load(Ordering::Relaxed))
    }

    /// Read the next frame that differs from the previous one.
    ///
    /// Blocks until such a frame is assembled. Transfer failures, lost
    /// synchronization and bad telemetry are counted and recovered from;
    /// [`LeptonError::Closed`] is returned once the link is closed or the
    /// running flag is cleared.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if !self.is_running() {
                self.publish_stats();
                return Err(LeptonError::Closed);
            }

            if let Err(err) = self.link.read_packet(&mut self.packet) {
                if err.is_terminal() {
                    debug!("Link closed, stopping reader");
                    self.publish_stats();
                    return Err(LeptonError::Closed);
                }
                warn!("⚠️ Transfer failure: {}", err);
                self.stats.transfer_fails += 1;
                self.stats.record_fail(err.into());
                self.sync.desync();
                self.publish_stats();
                thread::sleep(self.config.resync_delay());
                continue;
            }

            let mut publish = false;
            let mut reset_link = false;
            let mut complete = false;

            match self.sync.process(&self.packet, &mut self.stats) {
                SyncEvent::Discard | SyncEvent::Ignored { .. } => {}
                SyncEvent::Accepted { line, frame_start, frame_complete } => {
                    if frame_start {
                        self.assembler.begin_frame();
                    }
                    match line {
                        Line::Pixel { row, payload } => self.assembler.write_pixel_line(row, payload),
                        Line::Telemetry { index, payload } => {
                            if let Err(err) = self.assembler.apply_telemetry(index, payload) {
                                warn!(
                                    "⚠️ Telemetry validation failure: {} [{}]",
                                    err,
                                    hex::encode(&payload[..payload.len().min(16)])
                                );
                                self.stats.validation_fails += 1;
                                self.stats.record_fail(err.into());
                                publish = true;
                            }
                        }
                    }
                    complete = frame_complete;
                }
                SyncEvent::Reset { got, expected } => {
                    warn!("🔄 Lost sync at line {} (expected {:?}), resetting link", got, expected);
                    self.stats.record_fail(LeptonError::desync(got, expected));
                    reset_link = true;
                    publish = true;
                }
            }

            if reset_link {
                if let Err(err) = self.link.reset() {
                    if err.is_terminal() {
                        self.publish_stats();
                        return Err(LeptonError::Closed);
                    }
                    warn!("⚠️ Link reset failed: {}", err);
                    self.stats.transfer_fails += 1;
                    self.stats.record_fail(err.into());
                }
            }

            if complete {
                let frame = self.assembler.finish_frame();
                if self.duplicates.accept(&frame) {
                    self.stats.good_frames += 1;
                    self.publish_stats();
                    debug!("Frame {} complete", frame.metadata().frame_counter);
                    return Ok(frame);
                }
                self.stats.duplicate_frames += 1;
                self.assembler.recycle(frame);
                publish = true;
            }

            self.packets_since_publish += 1;
            if publish || self.packets_since_publish >= self.config.stats_publish_interval {
                self.publish_stats();
            }
        }
    }

    /// Give back the link
    pub fn into_link(self) -> T {
        self.link
    }
}
