/*!
Threaded capture session.

A [`Session`] runs a [`FrameReader`] on a dedicated thread and hands frames
over through a bounded queue. The reader never blocks on consumers: when the
queue is full the oldest unread frame is evicted and its buffer recycled.
*/

use crate::cci::Controller;
use crate::config::ReaderConfig;
use crate::error::{CommandError, LeptonError, Result};
use crate::frame::{BufferPool, Frame};
use crate::reader::FrameReader;
use crate::stats::{StatsCell, StatsSnapshot};
use crate::transport::{CommandInterface, LinkCloser, Transport};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

type SharedCci = Arc<dyn CommandInterface>;

/// Device session: reader thread plus command channel
pub struct Session {
    frames: Receiver<Frame>,
    pool: BufferPool,
    stats: StatsCell,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    closer: Option<Arc<dyn LinkCloser>>,
    controller: Option<Controller<SharedCci>>,
}

impl Session {
    /// Configure the camera over `cci` and start streaming from `link`.
    ///
    /// Fails with [`LeptonError::Configuration`] when the camera isn't ready
    /// or refuses the telemetry placement.
    pub fn start<T, C>(link: T, cci: C, config: ReaderConfig) -> Result<Self>
    where
        T: Transport + 'static,
        C: CommandInterface + 'static,
    {
        let controller = Controller::new(Arc::new(cci) as SharedCci);
        controller.configure(config.telemetry)?;
        Self::spawn(link, Some(controller), config)
    }

    /// Start streaming from a link whose telemetry placement is already known
    pub fn start_reader<T>(link: T, config: ReaderConfig) -> Result<Self>
    where
        T: Transport + 'static,
    {
        Self::spawn(link, None, config)
    }

    fn spawn<T>(link: T, controller: Option<Controller<SharedCci>>, config: ReaderConfig) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let pool = BufferPool::new(config.pool_capacity);
        let (tx, rx) = bounded(config.queue_capacity.max(1));
        let closer = link.closer();
        let reader = FrameReader::with_pool(link, config, pool.clone()).with_running(running.clone());
        let stats = reader.stats_cell();

        let evict = rx.clone();
        let thread_running = running.clone();
        let handle = thread::Builder::new()
            .name("lepton-reader".to_string())
            .spawn(move || reader_loop(reader, tx, evict, thread_running))
            .map_err(|e| LeptonError::Transfer(e.into()))?;

        info!("▶️ Session started");
        Ok(Self {
            frames: rx,
            pool,
            stats,
            running,
            handle: Some(handle),
            closer,
            controller,
        })
    }

    /// Block until the next frame is available
    pub fn read_frame(&self) -> Result<Frame> {
        self.frames.recv().map_err(|_| LeptonError::Closed)
    }

    /// Next frame if one is queued
    pub fn try_read_frame(&self) -> Result<Option<Frame>> {
        match self.frames.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(LeptonError::Closed),
        }
    }

    /// Wait up to `timeout` for the next frame
    pub fn read_frame_timeout(&self, timeout: Duration) -> Result<Option<Frame>> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(LeptonError::Closed),
        }
    }

    /// Return a frame's pixel buffer for reuse
    pub fn recycle(&self, frame: Frame) {
        self.pool.put(frame.into_pixels());
    }

    /// Latest published statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Frames currently waiting in the queue
    pub fn queued(&self) -> usize {
        self.frames.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Flag shared with the reader thread; clearing it stops the session
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Command channel, if the session was started with one
    pub fn controller(&self) -> Option<&Controller<SharedCci>> {
        self.controller.as_ref()
    }

    /// Trigger a flat-field correction. Fails with [`CommandError::Closed`]
    /// when the session has no command channel.
    pub fn trigger_ffc(&self) -> std::result::Result<(), CommandError> {
        self.controller.as_ref().ok_or(CommandError::Closed)?.run_ffc()
    }

    /// Stop the reader and wait for it to exit. The link is closed first so
    /// a read blocked in the link returns. Frames already queued can still
    /// be read afterwards.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if let Some(closer) = &self.closer {
                closer.close();
            }
            if handle.join().is_err() {
                error!("❌ Reader thread panicked");
            }
            info!("⏹️ Session closed: {}", self.stats.snapshot());
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_loop<T: Transport>(
    mut reader: FrameReader<T>,
    tx: Sender<Frame>,
    evict: Receiver<Frame>,
    running: Arc<AtomicBool>,
) {
    loop {
        let mut frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(LeptonError::Closed) => break,
            Err(err) => {
                error!("❌ Reader stopped: {}", err);
                break;
            }
        };
        loop {
            match tx.try_send(frame) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    frame = rejected;
                    if let Ok(oldest) = evict.try_recv() {
                        debug!("Queue full, dropping frame {}", oldest.metadata().frame_counter);
                        reader.recycle(oldest);
                        reader.record_dropped_frame();
                        reader.publish_stats();
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    reader.publish_stats();
                    running.store(false, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
    reader.publish_stats();
    running.store(false, Ordering::Relaxed);
    debug!("Reader thread exiting");
}
