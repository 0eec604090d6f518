/*!
Line synchronization state machine.

The camera streams packets whether or not anyone is listening, so the reader
has to lock onto line 0 and then see every line of the frame in order. Any
gap fails closed: the caller resets the link and the synchronizer waits for
the next line 0.

The synchronizer itself never touches the link. It classifies a packet,
updates the line counters and returns a [`SyncEvent`] telling the caller
what to do with it.
*/

use crate::config::TelemetryMode;
use crate::packet::{Classifier, Packet, PacketKind};
use crate::protocol::PACKET_SIZE;
use crate::stats::Stats;
use tracing::{debug, trace};

/// Synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Waiting for line 0
    Unsynced,
    /// Expecting this line ID next
    Synced(u16),
}

/// Payload of an accepted line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
    /// Image row `row`
    Pixel { row: usize, payload: &'a [u8] },
    /// Telemetry line `index`
    Telemetry { index: usize, payload: &'a [u8] },
}

/// Outcome of feeding one packet to the synchronizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent<'a> {
    /// Filler packet, nothing to do
    Discard,
    /// Line accepted in sequence
    Accepted {
        line: Line<'a>,
        /// Line 0: any partial frame must be dropped
        frame_start: bool,
        /// Last line of the frame
        frame_complete: bool,
    },
    /// Line dropped without losing synchronization
    Ignored { id: u16 },
    /// Synchronization lost; the caller must reset the link
    Reset { got: u16, expected: Option<u16> },
}

/// Tracks the expected next line ID
#[derive(Debug)]
pub struct LineSynchronizer {
    classifier: Classifier,
    max_line: u16,
    verify_crc: bool,
    expected: Option<u16>,
    last_accepted: Option<u16>,
}

impl LineSynchronizer {
    /// Create a synchronizer for the given telemetry placement
    pub fn new(mode: TelemetryMode, verify_crc: bool) -> Self {
        Self {
            classifier: Classifier::new(mode),
            max_line: mode.max_line(),
            verify_crc,
            expected: None,
            last_accepted: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SyncState {
        match self.expected {
            None => SyncState::Unsynced,
            Some(id) => SyncState::Synced(id),
        }
    }

    /// Next expected line ID, `None` while unsynchronized
    pub fn expected(&self) -> Option<u16> {
        self.expected
    }

    /// Highest valid line ID
    pub fn max_line(&self) -> u16 {
        self.max_line
    }

    /// Drop synchronization, e.g. after a transfer failure
    pub fn desync(&mut self) {
        if self.expected.is_some() {
            debug!("Sync lost, waiting for line 0");
        }
        self.expected = None;
        self.last_accepted = None;
    }

    /// Process one raw packet
    pub fn process<'a>(&mut self, raw: &'a [u8; PACKET_SIZE], stats: &mut Stats) -> SyncEvent<'a> {
        let kind = self.classifier.classify(raw);
        let (id, line) = match kind {
            PacketKind::Discard => {
                stats.discard_lines += 1;
                return SyncEvent::Discard;
            }
            PacketKind::OutOfRange { id } => {
                stats.broken_lines += 1;
                return self.reset(id, stats);
            }
            PacketKind::Pixel { id, row, payload } => (id, Line::Pixel { row, payload }),
            PacketKind::Telemetry { id, index, payload } => (id, Line::Telemetry { index, payload }),
        };

        if self.verify_crc && !Packet::new(raw).verify_crc() {
            debug!("CRC mismatch on line {}", id);
            stats.broken_lines += 1;
            return self.reset(id, stats);
        }

        match self.expected {
            Some(expected) if expected == id => self.accept(id, line, stats),
            None if id == 0 => self.accept(id, line, stats),
            _ => {
                stats.bad_sync_lines += 1;
                if self.expected.is_some() && self.last_accepted == Some(id) {
                    trace!("Repeated line {}", id);
                    SyncEvent::Ignored { id }
                } else if id == 0 {
                    debug!("Frame restarted at line 0, expected {:?}", self.expected);
                    self.accept(id, line, stats)
                } else if self.expected.is_none() {
                    trace!("Unsynced, dropping line {}", id);
                    SyncEvent::Ignored { id }
                } else {
                    self.reset(id, stats)
                }
            }
        }
    }

    fn accept<'a>(&mut self, id: u16, line: Line<'a>, stats: &mut Stats) -> SyncEvent<'a> {
        stats.good_lines += 1;
        let frame_complete = id == self.max_line;
        self.last_accepted = Some(id);
        self.expected = Some(if frame_complete { 0 } else { id + 1 });
        trace!("Accepted line {}", id);
        SyncEvent::Accepted {
            line,
            frame_start: id == 0,
            frame_complete,
        }
    }

    fn reset<'a>(&mut self, got: u16, stats: &mut Stats) -> SyncEvent<'a> {
        let expected = self.expected;
        stats.resets += 1;
        self.desync();
        SyncEvent::Reset { got, expected }
    }
}
