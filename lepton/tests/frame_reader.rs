//! End-to-end tests of the frame reader and session against a scripted link.

use lepton::packet::{encode_discard, encode_line};
use lepton::protocol::{FRAME_HEIGHT, FRAME_WIDTH, PACKET_SIZE, PAYLOAD_WORDS, TELEMETRY_LINES};
use lepton::sim;
use lepton::telemetry::{encode_status, TelemetryRow, STATUS_FFC_STATE_SHIFT};
use crossbeam_channel::{bounded, Receiver, Sender};
use lepton::{
    CommandError, FfcState, FrameReader, LeptonError, LinkCloser, ReaderConfig, Session, TelemetryMode,
    Transport, TransportError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

enum Step {
    Packet(Box<[u8; PACKET_SIZE]>),
    Fail,
}

/// Replays a fixed packet sequence, then reports the link closed
struct ScriptedLink {
    steps: VecDeque<Step>,
    resets: Arc<AtomicU64>,
}

impl ScriptedLink {
    fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            resets: Arc::new(AtomicU64::new(0)),
        }
    }

    fn push(&mut self, packets: impl IntoIterator<Item = [u8; PACKET_SIZE]>) -> &mut Self {
        self.steps.extend(packets.into_iter().map(|p| Step::Packet(Box::new(p))));
        self
    }

    fn fail(&mut self) -> &mut Self {
        self.steps.push_back(Step::Fail);
        self
    }

    fn resets(&self) -> Arc<AtomicU64> {
        self.resets.clone()
    }
}

impl Transport for ScriptedLink {
    fn read_packet(&mut self, buf: &mut [u8; PACKET_SIZE]) -> Result<(), TransportError> {
        match self.steps.pop_front() {
            Some(Step::Packet(packet)) => {
                buf.copy_from_slice(&packet[..]);
                Ok(())
            }
            Some(Step::Fail) => Err(TransportError::ShortRead { expected: PACKET_SIZE, actual: 80 }),
            None => Err(TransportError::Closed),
        }
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Every read blocks until the link's closer fires
struct BlockingLink {
    wake: Receiver<()>,
    wake_tx: Sender<()>,
}

impl BlockingLink {
    fn new() -> Self {
        let (wake_tx, wake) = bounded(1);
        Self { wake, wake_tx }
    }
}

impl Transport for BlockingLink {
    fn read_packet(&mut self, _buf: &mut [u8; PACKET_SIZE]) -> Result<(), TransportError> {
        let _ = self.wake.recv();
        Err(TransportError::Closed)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn closer(&self) -> Option<Arc<dyn LinkCloser>> {
        let wake = self.wake_tx.clone();
        Some(Arc::new(move || {
            let _ = wake.try_send(());
        }))
    }
}

fn config(mode: TelemetryMode) -> ReaderConfig {
    ReaderConfig {
        telemetry: mode,
        resync_delay_ms: 0,
        ..ReaderConfig::default()
    }
}

/// Encode one frame: a couple of discard packets, then every line in order
fn frame(mode: TelemetryMode, pixel: impl Fn(usize, usize) -> u16, row: &TelemetryRow) -> Vec<[u8; PACKET_SIZE]> {
    let mut packets = vec![encode_discard(0), encode_discard(1)];
    let first_pixel_line = if mode == TelemetryMode::Header { TELEMETRY_LINES } else { 0 };
    for id in 0..mode.lines_per_frame() {
        let mut words = [0u16; PAYLOAD_WORDS];
        if id >= first_pixel_line && id < first_pixel_line + FRAME_HEIGHT {
            let y = id - first_pixel_line;
            for (x, word) in words.iter_mut().enumerate() {
                *word = pixel(x, y);
            }
        } else if id == 0 || id == FRAME_HEIGHT {
            words = row.to_words();
        }
        packets.push(encode_line(id as u16, &words));
    }
    packets
}

fn flat(value: u16) -> impl Fn(usize, usize) -> u16 {
    move |_, _| value
}

#[test]
fn test_in_order_frame_accepts_every_line() {
    let mode = TelemetryMode::Header;
    let mut link = ScriptedLink::new();
    link.push(frame(mode, flat(8192), &TelemetryRow::default()));
    let resets = link.resets();
    let mut reader = FrameReader::new(link, config(mode));

    reader.read_frame().unwrap();
    let stats = reader.stats();
    assert_eq!(stats.good_lines, 63);
    assert_eq!(stats.discard_lines, 2);
    assert_eq!(stats.good_frames, 1);
    assert_eq!(stats.resets, 0);
    assert_eq!(resets.load(Ordering::SeqCst), 0);
}

#[test]
fn test_single_hot_pixel_frame() {
    let mode = TelemetryMode::Disabled;
    let mut link = ScriptedLink::new();
    link.push(frame(mode, |x, y| if (x, y) == (40, 30) { 12345 } else { 0 }, &TelemetryRow::default()));
    let mut reader = FrameReader::new(link, config(mode));

    let frame = reader.read_frame().unwrap();
    assert_eq!(frame.at(40, 30), 12345);
    assert_eq!(frame.min(), 0);
    assert_eq!(frame.max(), 12345);
    assert_eq!(reader.stats().good_frames, 1);
}

#[test]
fn test_header_telemetry_ffc_in_progress() {
    let mode = TelemetryMode::Header;
    let row = TelemetryRow {
        revision: 8,
        status_bits: 1 << STATUS_FFC_STATE_SHIFT,
        frame_counter: 77,
        ..TelemetryRow::default()
    };
    let mut link = ScriptedLink::new();
    link.push(frame(mode, flat(8000), &row));
    let mut reader = FrameReader::new(link, config(mode));

    let frame = reader.read_frame().unwrap();
    assert_eq!(frame.metadata().ffc_state, FfcState::InProgress);
    assert_eq!(frame.metadata().frame_counter, 77);
    assert_eq!(frame.metadata().telemetry_revision, 8);
}

#[test]
fn test_footer_telemetry() {
    let mode = TelemetryMode::Footer;
    let row = TelemetryRow {
        revision: 9,
        status_bits: encode_status(9, FfcState::Complete, true, false, false),
        frame_counter: 1234,
        frame_mean: 8100,
        ..TelemetryRow::default()
    };
    let mut link = ScriptedLink::new();
    link.push(frame(mode, |x, y| (x + y) as u16, &row));
    let mut reader = FrameReader::new(link, config(mode));

    let frame = reader.read_frame().unwrap();
    assert_eq!(frame.at(79, 59), 138);
    let meta = frame.metadata();
    assert_eq!(meta.frame_counter, 1234);
    assert_eq!(meta.frame_mean, 8100);
    assert_eq!(meta.ffc_state, FfcState::Complete);
    assert!(meta.ffc_desired);
}

#[test]
fn test_duplicate_frame_is_skipped() {
    let mode = TelemetryMode::Header;
    let packets = frame(mode, flat(8192), &TelemetryRow::default());
    let mut link = ScriptedLink::new();
    link.push(packets.clone()).push(packets);
    let mut reader = FrameReader::new(link, config(mode));

    reader.read_frame().unwrap();
    let stats = reader.stats();
    assert_eq!((stats.good_frames, stats.duplicate_frames), (1, 0));

    // Nothing but the duplicate left: the read keeps going until the link closes
    assert!(matches!(reader.read_frame(), Err(LeptonError::Closed)));
    let stats = reader.stats();
    assert_eq!((stats.good_frames, stats.duplicate_frames), (1, 1));
}

#[test]
fn test_read_after_duplicate_returns_next_new_frame() {
    let mode = TelemetryMode::Header;
    let packets = frame(mode, flat(8192), &TelemetryRow::default());
    let mut link = ScriptedLink::new();
    link.push(packets.clone())
        .push(packets)
        .push(frame(mode, flat(8193), &TelemetryRow::default()));
    let mut reader = FrameReader::new(link, config(mode));

    assert_eq!(reader.read_frame().unwrap().at(0, 0), 8192);
    assert_eq!(reader.read_frame().unwrap().at(0, 0), 8193);
    let stats = reader.stats();
    assert_eq!((stats.good_frames, stats.duplicate_frames), (2, 1));
}

#[test]
fn test_frames_differing_in_one_sample_are_both_returned() {
    let mode = TelemetryMode::Disabled;
    let mut link = ScriptedLink::new();
    link.push(frame(mode, flat(500), &TelemetryRow::default()))
        .push(frame(mode, |x, y| if (x, y) == (79, 59) { 501 } else { 500 }, &TelemetryRow::default()));
    let mut reader = FrameReader::new(link, config(mode));

    reader.read_frame().unwrap();
    let second = reader.read_frame().unwrap();
    assert_eq!(second.max(), 501);
    let stats = reader.stats();
    assert_eq!(stats.good_frames, 2);
    assert_eq!(stats.duplicate_frames, 0);
}

#[test]
fn test_gap_resets_link_once_then_recovers() {
    let mode = TelemetryMode::Disabled;
    let good = frame(mode, flat(42), &TelemetryRow::default());
    let mut link = ScriptedLink::new();
    // lines 0, 1, 2, 5, 6, 7
    link.push([0u16, 1, 2, 5, 6, 7].map(|id| encode_line(id, &[0; PAYLOAD_WORDS])))
        .push(good);
    let resets = link.resets();
    let mut reader = FrameReader::new(link, config(mode));

    let frame = reader.read_frame().unwrap();
    assert_eq!(frame.at(10, 10), 42);
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    let stats = reader.stats();
    assert_eq!(stats.resets, 1);
    assert!(stats.bad_sync_lines >= 1);
    assert!(matches!(stats.last_fail.as_deref(), Some(LeptonError::Desync { got: 5, expected: Some(3) })));
}

#[test]
fn test_out_of_range_line_is_broken() {
    let mode = TelemetryMode::Disabled;
    let mut link = ScriptedLink::new();
    link.push([encode_line(0, &[0; PAYLOAD_WORDS]), encode_line(61, &[0; PAYLOAD_WORDS])])
        .push(frame(mode, flat(1), &TelemetryRow::default()));
    let resets = link.resets();
    let mut reader = FrameReader::new(link, config(mode));

    reader.read_frame().unwrap();
    let stats = reader.stats();
    assert_eq!(stats.broken_lines, 1);
    assert_eq!(stats.resets, 1);
    assert_eq!(resets.load(Ordering::SeqCst), 1);
}

#[test]
fn test_transfer_failure_is_retried() {
    let mode = TelemetryMode::Header;
    let mut link = ScriptedLink::new();
    link.push(frame(mode, flat(3), &TelemetryRow::default())[..20].to_vec())
        .fail()
        .push(frame(mode, flat(4), &TelemetryRow::default()));
    let mut reader = FrameReader::new(link, config(mode));

    let frame = reader.read_frame().unwrap();
    assert_eq!(frame.at(0, 0), 4);
    let stats = reader.stats();
    assert_eq!(stats.transfer_fails, 1);
    assert_eq!(stats.good_frames, 1);
    assert!(matches!(stats.last_fail.as_deref(), Some(LeptonError::Transfer(TransportError::ShortRead { .. }))));
}

#[test]
fn test_transfer_failure_waits_resync_delay() {
    let mode = TelemetryMode::Disabled;
    let mut link = ScriptedLink::new();
    link.fail().push(frame(mode, flat(9), &TelemetryRow::default()));
    let mut reader = FrameReader::new(
        link,
        ReaderConfig {
            resync_delay_ms: 60,
            ..config(mode)
        },
    );

    let start = Instant::now();
    assert_eq!(reader.read_frame().unwrap().at(0, 0), 9);
    assert!(start.elapsed() >= Duration::from_millis(60));
    assert_eq!(reader.stats().transfer_fails, 1);
}

#[test]
fn test_crc_check_rejects_corrupt_line() {
    let mode = TelemetryMode::Disabled;
    let mut corrupt = frame(mode, flat(7), &TelemetryRow::default());
    corrupt[12][100] ^= 0x40;
    let mut link = ScriptedLink::new();
    link.push(corrupt).push(frame(mode, flat(8), &TelemetryRow::default()));
    let mut reader = FrameReader::new(
        link,
        ReaderConfig {
            verify_crc: true,
            ..config(mode)
        },
    );

    let frame = reader.read_frame().unwrap();
    assert_eq!(frame.at(0, 0), 8);
    let stats = reader.stats();
    assert_eq!(stats.broken_lines, 1);
    assert_eq!(stats.resets, 1);
}

#[test]
fn test_bad_telemetry_still_delivers_frame() {
    let mode = TelemetryMode::Header;
    let good = TelemetryRow {
        status_bits: encode_status(0, FfcState::Complete, false, false, false),
        ..TelemetryRow::default()
    };
    let bad = TelemetryRow {
        status_bits: 1 << 31,
        frame_counter: 2,
        ..TelemetryRow::default()
    };
    let mut link = ScriptedLink::new();
    link.push(frame(mode, flat(1), &good)).push(frame(mode, flat(2), &bad));
    let mut reader = FrameReader::new(link, config(mode));

    reader.read_frame().unwrap();
    let frame = reader.read_frame().unwrap();
    assert_eq!(frame.metadata().frame_counter, 2);
    assert_eq!(frame.metadata().ffc_state, FfcState::Complete);
    let stats = reader.stats();
    assert_eq!(stats.validation_fails, 1);
    assert_eq!(stats.good_frames, 2);
    assert!(matches!(stats.last_fail.as_deref(), Some(LeptonError::Validation(_))));
}

#[test]
fn test_session_drops_oldest_when_full() {
    let mode = TelemetryMode::Disabled;
    let mut link = ScriptedLink::new();
    for i in 0..6 {
        link.push(frame(mode, flat(i), &TelemetryRow::default()));
    }
    let session = Session::start_reader(
        link,
        ReaderConfig {
            queue_capacity: 2,
            ..config(mode)
        },
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!session.is_running());

    let stats = session.stats();
    assert_eq!(stats.good_frames, 6);
    assert_eq!(stats.dropped_frames, 4);
    assert_eq!(session.read_frame().unwrap().at(0, 0), 4);
    let last = session.read_frame().unwrap();
    assert_eq!(last.at(0, 0), 5);
    session.recycle(last);
    assert!(matches!(session.read_frame(), Err(LeptonError::Closed)));
    assert!(matches!(session.try_read_frame(), Err(LeptonError::Closed)));
}

#[test]
fn test_session_with_simulated_camera() {
    let (link, cci) = sim::simulated(TelemetryMode::Disabled);
    let mut session = Session::start(link, cci, config(TelemetryMode::Header)).unwrap();

    let first = session.read_frame().unwrap();
    assert_eq!(first.metadata().ffc_state, FfcState::Never);
    assert!(first.min() >= 8192 - 128 && first.max() <= 8192 + 128);

    session.trigger_ffc().unwrap();
    let mut calibrated = false;
    for _ in 0..500 {
        match session.read_frame_timeout(Duration::from_secs(5)).unwrap() {
            Some(frame) if frame.metadata().ffc_state == FfcState::Complete => {
                calibrated = true;
                break;
            }
            Some(frame) => session.recycle(frame),
            None => break,
        }
    }
    assert!(calibrated);

    session.close();
    session.close();
    assert!(!session.is_running());
    let stats = session.stats();
    assert!(stats.good_frames >= 2);
    assert_eq!(stats.resets, 0);
}

#[test]
fn test_session_start_requires_ready_camera() {
    let (link, cci) = sim::simulated(TelemetryMode::Header);
    lepton::Controller::new(cci.clone()).run_ffc().unwrap();
    let err = Session::start(link, cci, config(TelemetryMode::Header)).err().unwrap();
    assert!(matches!(err, LeptonError::Configuration(_)));
}

#[test]
fn test_simulated_glitches_force_resync() {
    let (link, _cci) = sim::simulated(TelemetryMode::Header);
    let link = link.with_dropped_line_every(4).with_frame_limit(40);
    let mut reader = FrameReader::new(link, config(TelemetryMode::Header));

    let mut frames = 0;
    while reader.read_frame().is_ok() {
        frames += 1;
    }
    let stats = reader.stats();
    assert!(frames > 0);
    assert!(stats.resets >= 1);
    assert_eq!(stats.good_frames, frames);
}

#[test]
fn test_close_unblocks_pending_read() {
    let mut session = Session::start_reader(BlockingLink::new(), config(TelemetryMode::Header)).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(session.is_running());

    let (done_tx, done_rx) = bounded(1);
    thread::spawn(move || {
        session.close();
        let _ = done_tx.send(session.is_running());
    });
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(3)), Ok(false));
}

#[test]
fn test_trigger_ffc_reports_command_errors() {
    let mode = TelemetryMode::Header;
    let session = Session::start_reader(ScriptedLink::new(), config(mode)).unwrap();
    assert!(matches!(session.trigger_ffc(), Err(CommandError::Closed)));

    let (link, cci) = sim::simulated(mode);
    let session = Session::start(link, cci.clone(), config(mode)).unwrap();
    cci.close();
    assert!(matches!(session.trigger_ffc(), Err(CommandError::Closed)));
}
