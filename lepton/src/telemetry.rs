/*!
Telemetry row decoding.

Telemetry row A carries the frame counter, temperatures and calibration
state of the frame it travels with. Rows B and C are undocumented and are
consumed without being parsed.

Each 16-bit word is big-endian on the wire, exactly like pixel samples, but
values spanning several words are sent least-significant word first. Words
are decoded once by [`telemetry_words`] and multi-word values are assembled
from that array, so nothing else in the decoder deals with byte order.
*/

use crate::error::TelemetryError;
use crate::frame::Metadata;
use crate::protocol::{PAYLOAD_SIZE, PAYLOAD_WORDS};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Calibration desired, asserted at start-up and after period or temperature drift
pub const STATUS_FFC_DESIRED: u32 = 1 << 3;
/// 2-bit calibration state
pub const STATUS_FFC_STATE_MASK: u32 = (1 << 4) | (1 << 5);
pub const STATUS_FFC_STATE_SHIFT: u32 = 4;
pub const STATUS_RESERVED: u32 = 1 << 11;
pub const STATUS_AGC_ENABLED: u32 = 1 << 12;
/// Shutdown imminent
pub const STATUS_OVERTEMP: u32 = 1 << 20;
/// Every bit the camera is documented to set: 0x0010_1838
pub const STATUS_KNOWN_MASK: u32 = STATUS_FFC_DESIRED
    | STATUS_FFC_STATE_MASK
    | STATUS_RESERVED
    | STATUS_AGC_ENABLED
    | STATUS_OVERTEMP;

/// Revision using the 0/1/2 calibration state encoding
pub const REVISION_8: u16 = 8;

/// Offset between Kelvin and Celsius in hundredths of a degree
const KELVIN_OFFSET: i32 = 27315;

/// Temperature in 0.01 K, as reported by the camera
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CentiKelvin(pub u16);

/// Temperature in 0.01 °C
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CentiCelsius(pub i32);

impl CentiKelvin {
    pub fn to_celsius(self) -> CentiCelsius {
        centi_kelvin_to_celsius(self)
    }
}

impl CentiCelsius {
    pub fn to_kelvin(self) -> CentiKelvin {
        celsius_to_centi_kelvin(self)
    }
}

impl fmt::Display for CentiCelsius {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}°C", sign, abs / 100, abs % 100)
    }
}

impl fmt::Display for CentiKelvin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}K", self.0 / 100, self.0 % 100)
    }
}

/// Convert camera temperature units to Celsius. Integer only.
pub fn centi_kelvin_to_celsius(k: CentiKelvin) -> CentiCelsius {
    CentiCelsius(i32::from(k.0) - KELVIN_OFFSET)
}

/// Convert Celsius to camera temperature units, saturating at the u16 range
pub fn celsius_to_centi_kelvin(c: CentiCelsius) -> CentiKelvin {
    let k = c.0.saturating_add(KELVIN_OFFSET).clamp(0, i32::from(u16::MAX));
    CentiKelvin(k as u16)
}

/// Flat-field correction state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FfcState {
    /// No calibration since power on
    #[default]
    Never,
    /// Calibration running, the image is frozen
    InProgress,
    /// Last calibration completed
    Complete,
}

impl FfcState {
    /// Map a 2-bit status code to a state; the encoding depends on the revision
    pub fn from_code(code: u32, revision: u16) -> Result<Self, TelemetryError> {
        let state = match (revision == REVISION_8, code) {
            (_, 0) => Some(Self::Never),
            (true, 1) => Some(Self::InProgress),
            (true, 2) => Some(Self::Complete),
            (false, 2) => Some(Self::InProgress),
            (false, 3) => Some(Self::Complete),
            _ => None,
        };
        state.ok_or(TelemetryError::UnknownFfcState { code, revision })
    }

    /// Inverse of [`FfcState::from_code`]
    pub fn to_code(self, revision: u16) -> u32 {
        match (revision == REVISION_8, self) {
            (_, Self::Never) => 0,
            (true, Self::InProgress) => 1,
            (true, Self::Complete) => 2,
            (false, Self::InProgress) => 2,
            (false, Self::Complete) => 3,
        }
    }
}

impl fmt::Display for FfcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Never => "never",
            Self::InProgress => "in progress",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Region of interest used by the camera's AGC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgcRoi {
    pub top: u16,
    pub left: u16,
    pub bottom: u16,
    pub right: u16,
}

/// Telemetry row A
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryRow {
    pub revision: u16,
    /// Time since power on, in ms
    pub time_counter_ms: u32,
    pub status_bits: u32,
    pub module_serial: [u8; 16],
    pub software_revision: u64,
    pub frame_counter: u32,
    /// Average sample value of the frame
    pub frame_mean: u16,
    pub fpa_temp_counts: u16,
    pub fpa_temp: CentiKelvin,
    pub housing_temp_counts: u16,
    pub housing_temp: CentiKelvin,
    pub fpa_temp_last_ffc: CentiKelvin,
    /// Value of the time counter when the last calibration ran
    pub time_counter_last_ffc_ms: u32,
    pub housing_temp_last_ffc: CentiKelvin,
    pub agc_roi: AgcRoi,
    pub agc_clip_high: u16,
    pub agc_clip_low: u16,
    pub log2_ffc_frames: u16,
}

mod offset {
    pub const REVISION: usize = 0;
    pub const TIME_COUNTER: usize = 1;
    pub const STATUS_BITS: usize = 3;
    pub const MODULE_SERIAL: usize = 5;
    pub const SOFTWARE_REVISION: usize = 13;
    pub const FRAME_COUNTER: usize = 20;
    pub const FRAME_MEAN: usize = 22;
    pub const FPA_TEMP_COUNTS: usize = 23;
    pub const FPA_TEMP: usize = 24;
    pub const HOUSING_TEMP_COUNTS: usize = 25;
    pub const HOUSING_TEMP: usize = 26;
    pub const FPA_TEMP_LAST_FFC: usize = 29;
    pub const TIME_COUNTER_LAST_FFC: usize = 30;
    pub const HOUSING_TEMP_LAST_FFC: usize = 32;
    pub const AGC_ROI: usize = 34;
    pub const AGC_CLIP_HIGH: usize = 38;
    pub const AGC_CLIP_LOW: usize = 39;
    pub const LOG2_FFC_FRAMES: usize = 74;
}

/// Decode a telemetry payload into its 80 words
pub fn telemetry_words(payload: &[u8]) -> Result<[u16; PAYLOAD_WORDS], TelemetryError> {
    if payload.len() < PAYLOAD_SIZE {
        return Err(TelemetryError::TooShort {
            expected: PAYLOAD_SIZE,
            actual: payload.len(),
        });
    }
    let mut words = [0u16; PAYLOAD_WORDS];
    for (word, chunk) in words.iter_mut().zip(payload.chunks_exact(2)) {
        *word = u16::from_be_bytes([chunk[0], chunk[1]]);
    }
    Ok(words)
}

/// Two words, least significant first
fn dword(words: &[u16], at: usize) -> u32 {
    u32::from(words[at]) | (u32::from(words[at + 1]) << 16)
}

fn put_dword(words: &mut [u16], at: usize, value: u32) {
    words[at] = value as u16;
    words[at + 1] = (value >> 16) as u16;
}

impl TelemetryRow {
    /// Parse a telemetry line payload
    pub fn parse(payload: &[u8]) -> Result<Self, TelemetryError> {
        Ok(Self::from_words(&telemetry_words(payload)?))
    }

    /// Build the row from decoded words
    pub fn from_words(words: &[u16; PAYLOAD_WORDS]) -> Self {
        let mut module_serial = [0u8; 16];
        for (pair, word) in module_serial
            .chunks_exact_mut(2)
            .zip(&words[offset::MODULE_SERIAL..offset::MODULE_SERIAL + 8])
        {
            pair.copy_from_slice(&word.to_be_bytes());
        }
        let software_revision = (0..4).fold(0u64, |acc, i| {
            acc | (u64::from(words[offset::SOFTWARE_REVISION + i]) << (16 * i))
        });

        Self {
            revision: words[offset::REVISION],
            time_counter_ms: dword(words, offset::TIME_COUNTER),
            status_bits: dword(words, offset::STATUS_BITS),
            module_serial,
            software_revision,
            frame_counter: dword(words, offset::FRAME_COUNTER),
            frame_mean: words[offset::FRAME_MEAN],
            fpa_temp_counts: words[offset::FPA_TEMP_COUNTS],
            fpa_temp: CentiKelvin(words[offset::FPA_TEMP]),
            housing_temp_counts: words[offset::HOUSING_TEMP_COUNTS],
            housing_temp: CentiKelvin(words[offset::HOUSING_TEMP]),
            fpa_temp_last_ffc: CentiKelvin(words[offset::FPA_TEMP_LAST_FFC]),
            time_counter_last_ffc_ms: dword(words, offset::TIME_COUNTER_LAST_FFC),
            housing_temp_last_ffc: CentiKelvin(words[offset::HOUSING_TEMP_LAST_FFC]),
            // left, top, right, bottom on the wire
            agc_roi: AgcRoi {
                left: words[offset::AGC_ROI],
                top: words[offset::AGC_ROI + 1],
                right: words[offset::AGC_ROI + 2],
                bottom: words[offset::AGC_ROI + 3],
            },
            agc_clip_high: words[offset::AGC_CLIP_HIGH],
            agc_clip_low: words[offset::AGC_CLIP_LOW],
            log2_ffc_frames: words[offset::LOG2_FFC_FRAMES],
        }
    }

    /// Encode the row back into payload words, reserved words zeroed
    pub fn to_words(&self) -> [u16; PAYLOAD_WORDS] {
        let mut words = [0u16; PAYLOAD_WORDS];
        words[offset::REVISION] = self.revision;
        put_dword(&mut words, offset::TIME_COUNTER, self.time_counter_ms);
        put_dword(&mut words, offset::STATUS_BITS, self.status_bits);
        for (i, pair) in self.module_serial.chunks_exact(2).enumerate() {
            words[offset::MODULE_SERIAL + i] = u16::from_be_bytes([pair[0], pair[1]]);
        }
        for i in 0..4 {
            words[offset::SOFTWARE_REVISION + i] = (self.software_revision >> (16 * i)) as u16;
        }
        put_dword(&mut words, offset::FRAME_COUNTER, self.frame_counter);
        words[offset::FRAME_MEAN] = self.frame_mean;
        words[offset::FPA_TEMP_COUNTS] = self.fpa_temp_counts;
        words[offset::FPA_TEMP] = self.fpa_temp.0;
        words[offset::HOUSING_TEMP_COUNTS] = self.housing_temp_counts;
        words[offset::HOUSING_TEMP] = self.housing_temp.0;
        words[offset::FPA_TEMP_LAST_FFC] = self.fpa_temp_last_ffc.0;
        put_dword(&mut words, offset::TIME_COUNTER_LAST_FFC, self.time_counter_last_ffc_ms);
        words[offset::HOUSING_TEMP_LAST_FFC] = self.housing_temp_last_ffc.0;
        words[offset::AGC_ROI] = self.agc_roi.left;
        words[offset::AGC_ROI + 1] = self.agc_roi.top;
        words[offset::AGC_ROI + 2] = self.agc_roi.right;
        words[offset::AGC_ROI + 3] = self.agc_roi.bottom;
        words[offset::AGC_CLIP_HIGH] = self.agc_clip_high;
        words[offset::AGC_CLIP_LOW] = self.agc_clip_low;
        words[offset::LOG2_FFC_FRAMES] = self.log2_ffc_frames;
        words
    }

    /// Status bits outside the documented mask
    pub fn unknown_status_bits(&self) -> u32 {
        self.status_bits & !STATUS_KNOWN_MASK
    }

    /// Decode the calibration state for this row's revision
    pub fn ffc_state(&self) -> Result<FfcState, TelemetryError> {
        let code = (self.status_bits & STATUS_FFC_STATE_MASK) >> STATUS_FFC_STATE_SHIFT;
        FfcState::from_code(code, self.revision)
    }

    /// Hex rendering of the module serial
    pub fn serial_hex(&self) -> String {
        hex::encode(self.module_serial)
    }
}

/// Build status bits for a row of the given revision
pub fn encode_status(revision: u16, state: FfcState, ffc_desired: bool, agc_enabled: bool, overtemp: bool) -> u32 {
    let mut status = state.to_code(revision) << STATUS_FFC_STATE_SHIFT;
    if ffc_desired {
        status |= STATUS_FFC_DESIRED;
    }
    if agc_enabled {
        status |= STATUS_AGC_ENABLED;
    }
    if overtemp {
        status |= STATUS_OVERTEMP;
    }
    status
}

/// Decode telemetry row A into `meta`.
///
/// Fields read straight from words are always updated. When the status bits
/// can't be interpreted, the status-derived fields keep their previous value
/// and the error is returned for the caller to count.
pub fn decode_row_a(payload: &[u8], meta: &mut Metadata) -> Result<(), TelemetryError> {
    let row = TelemetryRow::parse(payload)?;

    meta.telemetry_revision = row.revision;
    meta.since_startup_ms = row.time_counter_ms;
    meta.frame_counter = row.frame_counter;
    meta.frame_mean = row.frame_mean;
    meta.fpa_temp_counts = row.fpa_temp_counts;
    meta.fpa_temp = row.fpa_temp;
    meta.fpa_temp_c = row.fpa_temp.to_celsius();
    meta.housing_temp_counts = row.housing_temp_counts;
    meta.housing_temp = row.housing_temp;
    meta.housing_temp_c = row.housing_temp.to_celsius();
    meta.ffc_temp = row.fpa_temp_last_ffc;
    meta.ffc_temp_c = row.fpa_temp_last_ffc.to_celsius();
    meta.ffc_temp_housing = row.housing_temp_last_ffc;
    meta.ffc_temp_housing_c = row.housing_temp_last_ffc.to_celsius();
    meta.ffc_since_ms = row.time_counter_ms.wrapping_sub(row.time_counter_last_ffc_ms);
    meta.log2_ffc_frames = row.log2_ffc_frames;

    let extra = row.unknown_status_bits();
    if extra != 0 {
        return Err(TelemetryError::UnknownStatusBits {
            status: row.status_bits,
            extra,
        });
    }
    meta.ffc_desired = row.status_bits & STATUS_FFC_DESIRED != 0;
    meta.agc_enabled = row.status_bits & STATUS_AGC_ENABLED != 0;
    meta.overtemp = row.status_bits & STATUS_OVERTEMP != 0;
    meta.ffc_state = row.ffc_state()?;
    Ok(())
}
