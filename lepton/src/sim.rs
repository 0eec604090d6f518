/*!
Simulated Lepton.

[`SimulatedLink`] streams VoSPI packets the way the camera does: discard
packets between frames, 60 pixel lines plus three telemetry lines placed as
configured, and each unique image sent three times. [`SimulatedCci`] answers
the command channel and shares state with the link, so enabling telemetry or
running a calibration changes what the link emits.
*/

use crate::cci::{command, CameraStatus};
use crate::config::TelemetryMode;
use crate::error::{CommandError, TransportError};
use crate::frame::PixelBuffer;
use crate::packet::{encode_discard, encode_line};
use crate::protocol::{
    FFC_FRAMES, FRAME_HEIGHT, FRAME_PERIOD, FRAME_PIXELS, FRAME_WIDTH, PACKET_SIZE, PAYLOAD_WORDS,
    TELEMETRY_LINES,
};
use crate::telemetry::{encode_status, CentiKelvin, FfcState, TelemetryRow};
use crate::transport::{CommandInterface, LinkCloser, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Telemetry revision reported by the simulated camera
const SIM_REVISION: u16 = 9;

/// Link frames per unique image (27 Hz link, 9 Hz effective)
const REPEATS: u32 = 3;

/// Discard packets sent before each frame
const DISCARDS_PER_FRAME: usize = 4;

/// Scene dynamic range around the ambient level
const AMBIENT: f32 = 8192.0;
const DYNAMIC_RANGE: f32 = 128.0;

const FPA_TEMP: CentiKelvin = CentiKelvin(30315);
const HOUSING_TEMP: CentiKelvin = CentiKelvin(29815);

// Lepton error codes
const ERROR_RANGE: i8 = -2;
const ERROR_UNDEFINED_FUNCTION: i8 = -5;

#[derive(Debug)]
struct SimState {
    telemetry_enable: u32,
    telemetry_location: u32,
    command_count: u16,
    /// Link frames emitted since power on
    link_frames: u64,
    ffc_state: FfcState,
    ffc_remaining: u32,
    ffc_time_ms: u32,
    closed: bool,
}

impl SimState {
    fn mode(&self) -> TelemetryMode {
        match (self.telemetry_enable, self.telemetry_location) {
            (0, _) => TelemetryMode::Disabled,
            (_, 0) => TelemetryMode::Header,
            _ => TelemetryMode::Footer,
        }
    }

    fn uptime_ms(&self) -> u32 {
        (self.link_frames * FRAME_PERIOD.as_micros() as u64 / 1000) as u32
    }

    fn camera_status(&self) -> CameraStatus {
        if self.ffc_remaining > 0 {
            CameraStatus::FlatFieldInProcess
        } else {
            CameraStatus::Ready
        }
    }
}

/// Create a simulated camera with telemetry in `mode`
pub fn simulated(mode: TelemetryMode) -> (SimulatedLink, SimulatedCci) {
    let state = Arc::new(Mutex::new(SimState {
        telemetry_enable: u32::from(mode.is_enabled()),
        telemetry_location: u32::from(mode == TelemetryMode::Footer),
        command_count: 0,
        link_frames: 0,
        ffc_state: FfcState::Never,
        ffc_remaining: 0,
        ffc_time_ms: 0,
        closed: false,
    }));
    info!("🧪 Simulated Lepton, telemetry {:?}", mode);
    (SimulatedLink::new(state.clone()), SimulatedCci { state })
}

/// Simulated VoSPI link
pub struct SimulatedLink {
    state: Arc<Mutex<SimState>>,
    image: PixelBuffer,
    unique_images: u64,
    packets: Vec<[u8; PACKET_SIZE]>,
    cursor: usize,
    pacing: Option<Duration>,
    next_frame_at: Instant,
    frame_limit: Option<u64>,
    drop_line_every: Option<u64>,
    resets: u64,
}

impl SimulatedLink {
    fn new(state: Arc<Mutex<SimState>>) -> Self {
        let mut link = Self {
            state,
            image: Box::new([0u16; FRAME_PIXELS]),
            unique_images: 0,
            packets: Vec::with_capacity(DISCARDS_PER_FRAME + FRAME_HEIGHT + TELEMETRY_LINES),
            cursor: 0,
            pacing: None,
            next_frame_at: Instant::now(),
            frame_limit: None,
            drop_line_every: None,
            resets: 0,
        };
        link.render();
        link
    }

    /// Emit frames no faster than the camera's frame period
    pub fn with_pacing(mut self) -> Self {
        self.pacing = Some(FRAME_PERIOD);
        self
    }

    /// Close the link after `frames` link frames
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Leave out one pixel line every `n` link frames, forcing a resync
    pub fn with_dropped_line_every(mut self, n: u64) -> Self {
        self.drop_line_every = Some(n.max(1));
        self
    }

    /// Number of times the link was reset
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Draw the next unique image: smooth warm blobs drifting on sin/cos paths
    fn render(&mut self) {
        let t = self.unique_images as f32 * 0.1;
        for y in 0..FRAME_HEIGHT {
            let fy = y as f32;
            for x in 0..FRAME_WIDTH {
                let fx = x as f32;
                let wave = (fx * 0.15 + t * 0.7).sin() * (fy * 0.2 - t * 0.4).cos();
                let ripple = ((fx + fy) * 0.07 + t).sin();
                let value = AMBIENT + DYNAMIC_RANGE * (0.75 * wave + 0.25 * ripple);
                let value = value.clamp(AMBIENT - DYNAMIC_RANGE, AMBIENT + DYNAMIC_RANGE);
                self.image[y * FRAME_WIDTH + x] = value as u16;
            }
        }
        self.unique_images += 1;
    }

    fn frame_mean(&self) -> u16 {
        let sum: u32 = self.image.iter().map(|&v| u32::from(v)).sum();
        (sum / FRAME_PIXELS as u32) as u16
    }

    /// Encode the next link frame into `packets`
    fn next_frame(&mut self) -> Result<(), TransportError> {
        if let Some(period) = self.pacing {
            let now = Instant::now();
            if self.next_frame_at > now {
                thread::sleep(self.next_frame_at - now);
            }
            self.next_frame_at = Instant::now() + period;
        }

        let mut state = self.state.lock();
        if state.closed || self.frame_limit.is_some_and(|limit| state.link_frames >= limit) {
            return Err(TransportError::Closed);
        }

        let link_frame = state.link_frames;
        state.link_frames += 1;

        if state.ffc_remaining > 0 {
            state.ffc_remaining -= 1;
            if state.ffc_remaining == 0 {
                state.ffc_state = FfcState::Complete;
                state.ffc_time_ms = state.uptime_ms();
                debug!("Simulated FFC complete");
            }
        } else if link_frame > 0 && link_frame % u64::from(REPEATS) == 0 {
            // frozen while a calibration runs
            drop(state);
            self.render();
            state = self.state.lock();
        }

        let mode = state.mode();
        let row = TelemetryRow {
            revision: SIM_REVISION,
            time_counter_ms: state.uptime_ms(),
            status_bits: encode_status(SIM_REVISION, state.ffc_state, false, false, false),
            module_serial: *b"SIMULATED-LEPTON",
            frame_counter: link_frame as u32,
            frame_mean: self.frame_mean(),
            fpa_temp_counts: 3000,
            fpa_temp: FPA_TEMP,
            housing_temp_counts: 2950,
            housing_temp: HOUSING_TEMP,
            fpa_temp_last_ffc: FPA_TEMP,
            time_counter_last_ffc_ms: state.ffc_time_ms,
            housing_temp_last_ffc: HOUSING_TEMP,
            log2_ffc_frames: 3,
            ..TelemetryRow::default()
        };
        drop(state);

        let skip = self
            .drop_line_every
            .filter(|n| link_frame % n == n - 1)
            .map(|_| FRAME_HEIGHT / 2);

        self.packets.clear();
        self.cursor = 0;
        for seq in 0..DISCARDS_PER_FRAME {
            self.packets.push(encode_discard(seq as u16));
        }
        let telemetry = row.to_words();
        let blank = [0u16; PAYLOAD_WORDS];
        let first_pixel_line = if mode == TelemetryMode::Header { TELEMETRY_LINES } else { 0 };
        for id in 0..mode.lines_per_frame() {
            let line = if id >= first_pixel_line && id < first_pixel_line + FRAME_HEIGHT {
                let y = id - first_pixel_line;
                if skip == Some(y) {
                    continue;
                }
                let mut words = [0u16; PAYLOAD_WORDS];
                words.copy_from_slice(&self.image[y * FRAME_WIDTH..(y + 1) * FRAME_WIDTH]);
                encode_line(id as u16, &words)
            } else if id == 0 || id == FRAME_HEIGHT {
                encode_line(id as u16, &telemetry)
            } else {
                encode_line(id as u16, &blank)
            };
            self.packets.push(line);
        }
        Ok(())
    }
}

impl Transport for SimulatedLink {
    fn read_packet(&mut self, buf: &mut [u8; PACKET_SIZE]) -> Result<(), TransportError> {
        if self.state.lock().closed {
            return Err(TransportError::Closed);
        }
        if self.cursor >= self.packets.len() {
            self.next_frame()?;
        }
        buf.copy_from_slice(&self.packets[self.cursor]);
        self.cursor += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        if self.state.lock().closed {
            return Err(TransportError::Closed);
        }
        // Numbering restarts with the next frame
        self.packets.clear();
        self.cursor = 0;
        self.resets += 1;
        Ok(())
    }

    fn closer(&self) -> Option<Arc<dyn LinkCloser>> {
        let state = self.state.clone();
        Some(Arc::new(move || state.lock().closed = true))
    }
}

/// Simulated command channel
#[derive(Clone)]
pub struct SimulatedCci {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCci {
    /// Close the simulated camera; the link and commands fail from now on
    pub fn close(&self) {
        self.state.lock().closed = true;
    }
}

fn write_words(out: &mut [u8], data: &[u8]) -> Result<(), CommandError> {
    if out.len() != data.len() {
        return Err(CommandError::Device(ERROR_RANGE));
    }
    out.copy_from_slice(data);
    Ok(())
}

fn read_u32(data: &[u8]) -> Result<u32, CommandError> {
    let bytes: [u8; 4] = data.try_into().map_err(|_| CommandError::Device(ERROR_RANGE))?;
    Ok(u32::from_le_bytes(bytes))
}

impl CommandInterface for SimulatedCci {
    fn get_attribute(&self, id: u16, out: &mut [u8]) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CommandError::Closed);
        }
        state.command_count = state.command_count.wrapping_add(1);
        match id {
            command::SYS_STATUS => {
                let mut data = [0u8; 8];
                data[..4].copy_from_slice(&state.camera_status().code().to_le_bytes());
                data[4..6].copy_from_slice(&state.command_count.to_le_bytes());
                write_words(out, &data)
            }
            command::SYS_SERIAL_NUMBER => write_words(out, &0x1234u64.to_le_bytes()),
            command::SYS_UPTIME => write_words(out, &state.uptime_ms().to_le_bytes()),
            command::SYS_TEMPERATURE => write_words(out, &FPA_TEMP.0.to_le_bytes()),
            command::SYS_HOUSING_TEMPERATURE => write_words(out, &HOUSING_TEMP.0.to_le_bytes()),
            command::SYS_TELEMETRY_ENABLE => write_words(out, &state.telemetry_enable.to_le_bytes()),
            command::SYS_TELEMETRY_LOCATION => write_words(out, &state.telemetry_location.to_le_bytes()),
            _ => Err(CommandError::Device(ERROR_UNDEFINED_FUNCTION)),
        }
    }

    fn set_attribute(&self, id: u16, data: &[u8]) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CommandError::Closed);
        }
        state.command_count = state.command_count.wrapping_add(1);
        match id {
            command::SYS_TELEMETRY_ENABLE => state.telemetry_enable = read_u32(data)?,
            command::SYS_TELEMETRY_LOCATION => match read_u32(data)? {
                location @ (0 | 1) => state.telemetry_location = location,
                _ => return Err(CommandError::Device(ERROR_RANGE)),
            },
            _ => return Err(CommandError::Device(ERROR_UNDEFINED_FUNCTION)),
        }
        Ok(())
    }

    fn run_command(&self, id: u16) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CommandError::Closed);
        }
        state.command_count = state.command_count.wrapping_add(1);
        match id {
            command::SYS_FFC_RUN_NORMALIZATION => {
                state.ffc_state = FfcState::InProgress;
                state.ffc_remaining = FFC_FRAMES;
                Ok(())
            }
            _ => Err(CommandError::Device(ERROR_UNDEFINED_FUNCTION)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cci::Controller;
    use crate::packet::{Classifier, Packet, PacketKind};

    fn read_link_frame(link: &mut SimulatedLink) -> Vec<[u8; PACKET_SIZE]> {
        let mut buf = [0u8; PACKET_SIZE];
        let mut lines = Vec::new();
        loop {
            link.read_packet(&mut buf).unwrap();
            if !Packet::new(&buf).is_discard() {
                lines.push(buf);
                if link.cursor == link.packets.len() {
                    return lines;
                }
            }
        }
    }

    #[test]
    fn test_frame_layout() {
        for mode in [TelemetryMode::Disabled, TelemetryMode::Header, TelemetryMode::Footer] {
            let (mut link, _cci) = simulated(mode);
            let lines = read_link_frame(&mut link);
            assert_eq!(lines.len(), mode.lines_per_frame());
            for (i, raw) in lines.iter().enumerate() {
                assert_eq!(Packet::new(raw).line_id() as usize, i);
                assert!(Packet::new(raw).verify_crc());
            }
        }
    }

    #[test]
    fn test_images_repeat_three_times() {
        let (mut link, _cci) = simulated(TelemetryMode::Disabled);
        let frames: Vec<_> = (0..4).map(|_| read_link_frame(&mut link)).collect();
        assert_eq!(frames[0], frames[1]);
        assert_eq!(frames[1], frames[2]);
        assert_ne!(frames[2], frames[3]);
    }

    #[test]
    fn test_telemetry_frame_counter() {
        let (mut link, _cci) = simulated(TelemetryMode::Header);
        let classifier = Classifier::new(TelemetryMode::Header);
        for expected in 0..3 {
            let lines = read_link_frame(&mut link);
            let PacketKind::Telemetry { payload, .. } = classifier.classify(&lines[0]) else {
                panic!("line 0 is not telemetry");
            };
            let row = TelemetryRow::parse(payload).unwrap();
            assert_eq!(row.frame_counter, expected);
            assert_eq!(row.revision, SIM_REVISION);
        }
    }

    #[test]
    fn test_cci_changes_link_layout() {
        let (mut link, cci) = simulated(TelemetryMode::Disabled);
        Controller::new(cci.clone()).set_telemetry_mode(TelemetryMode::Footer).unwrap();
        assert_eq!(read_link_frame(&mut link).len(), 63);
    }

    #[test]
    fn test_ffc_freezes_image() {
        let (mut link, cci) = simulated(TelemetryMode::Disabled);
        let controller = Controller::new(cci);
        read_link_frame(&mut link);
        controller.run_ffc().unwrap();
        assert_eq!(controller.status().unwrap().camera, CameraStatus::FlatFieldInProcess);
        let frozen = read_link_frame(&mut link);
        for _ in 1..FFC_FRAMES {
            assert_eq!(read_link_frame(&mut link), frozen);
        }
        assert_eq!(controller.status().unwrap().camera, CameraStatus::Ready);
    }

    #[test]
    fn test_close_and_limit() {
        let (link, cci) = simulated(TelemetryMode::Disabled);
        let mut link = link.with_frame_limit(1);
        read_link_frame(&mut link);
        let mut buf = [0u8; PACKET_SIZE];
        assert!(matches!(link.read_packet(&mut buf), Err(TransportError::Closed)));

        cci.close();
        assert!(matches!(Controller::new(cci).status(), Err(CommandError::Closed)));
    }

    #[test]
    fn test_closer_closes_link() {
        let (mut link, _cci) = simulated(TelemetryMode::Disabled);
        let closer = link.closer().unwrap();
        let mut buf = [0u8; PACKET_SIZE];
        link.read_packet(&mut buf).unwrap();
        closer.close();
        assert!(matches!(link.read_packet(&mut buf), Err(TransportError::Closed)));
    }

    #[test]
    fn test_unknown_attribute() {
        let (_link, cci) = simulated(TelemetryMode::Disabled);
        let mut out = [0u8; 2];
        assert!(matches!(cci.get_attribute(0x0100, &mut out), Err(CommandError::Device(-5))));
        assert!(matches!(cci.set_attribute(command::SYS_TELEMETRY_LOCATION, &[2, 0, 0, 0]), Err(CommandError::Device(-2))));
    }
}
