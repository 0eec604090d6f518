/*!
VoSPI packet parsing and classification.

Each packet is 164 bytes: a 16-bit header (4 reserved bits + 12-bit line ID),
a 16-bit CRC, and 80 big-endian 16-bit payload words. The vast majority of
packets on the wire are discard packets, so classification only looks at the
header and never touches the payload.
*/

use crate::config::TelemetryMode;
use crate::protocol::{
    DISCARD_MASK, FRAME_HEIGHT, LINE_ID_MASK, PACKET_HEADER_SIZE, PACKET_SIZE, PAYLOAD_WORDS,
    TELEMETRY_LINES,
};

/// Borrowed view over one raw VoSPI packet
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    raw: &'a [u8; PACKET_SIZE],
}

impl<'a> Packet<'a> {
    /// Wrap a raw packet
    pub fn new(raw: &'a [u8; PACKET_SIZE]) -> Self {
        Self { raw }
    }

    /// Raw 16-bit header, reserved bits included
    pub fn header(&self) -> u16 {
        u16::from_be_bytes([self.raw[0], self.raw[1]])
    }

    /// 12-bit line ID
    pub fn line_id(&self) -> u16 {
        self.header() & LINE_ID_MASK
    }

    /// Check if this is a filler packet carrying no data
    pub fn is_discard(&self) -> bool {
        self.header() & DISCARD_MASK == DISCARD_MASK
    }

    /// CRC as sent by the camera
    pub fn crc(&self) -> u16 {
        u16::from_be_bytes([self.raw[2], self.raw[3]])
    }

    /// The 160 payload bytes
    pub fn payload(&self) -> &'a [u8] {
        &self.raw[PACKET_HEADER_SIZE..]
    }

    /// Verify the packet CRC (x^16 + x^12 + x^5 + 1)
    pub fn verify_crc(&self) -> bool {
        packet_crc(self.raw) == self.crc()
    }
}

/// What a packet carries once its line ID is mapped onto the frame layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind<'a> {
    /// Filler packet, no data
    Discard,
    /// Pixel line for image row `row`
    Pixel { id: u16, row: usize, payload: &'a [u8] },
    /// Telemetry line `index` (0 = row A)
    Telemetry { id: u16, index: usize, payload: &'a [u8] },
    /// Line ID beyond the last line of a frame
    OutOfRange { id: u16 },
}

impl PacketKind<'_> {
    /// Line ID of the packet, if it is not a discard packet
    pub fn line_id(&self) -> Option<u16> {
        match *self {
            Self::Discard => None,
            Self::Pixel { id, .. } | Self::Telemetry { id, .. } | Self::OutOfRange { id } => Some(id),
        }
    }
}

/// Maps packets onto pixel rows and telemetry lines for a telemetry mode
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    mode: TelemetryMode,
}

impl Classifier {
    /// Create a classifier for the given telemetry placement
    pub fn new(mode: TelemetryMode) -> Self {
        Self { mode }
    }

    /// Telemetry placement this classifier routes for
    pub fn mode(&self) -> TelemetryMode {
        self.mode
    }

    /// Classify one raw packet
    pub fn classify<'a>(&self, raw: &'a [u8; PACKET_SIZE]) -> PacketKind<'a> {
        let packet = Packet::new(raw);
        if packet.is_discard() {
            return PacketKind::Discard;
        }
        let id = packet.line_id();
        let line = id as usize;
        let payload = packet.payload();
        match self.mode {
            _ if id > self.mode.max_line() => PacketKind::OutOfRange { id },
            TelemetryMode::Disabled => PacketKind::Pixel { id, row: line, payload },
            TelemetryMode::Header if line < TELEMETRY_LINES => {
                PacketKind::Telemetry { id, index: line, payload }
            }
            TelemetryMode::Header => PacketKind::Pixel { id, row: line - TELEMETRY_LINES, payload },
            TelemetryMode::Footer if line < FRAME_HEIGHT => PacketKind::Pixel { id, row: line, payload },
            TelemetryMode::Footer => PacketKind::Telemetry { id, index: line - FRAME_HEIGHT, payload },
        }
    }
}

/// Build a data packet with a valid CRC
pub fn encode_line(id: u16, words: &[u16; PAYLOAD_WORDS]) -> [u8; PACKET_SIZE] {
    let mut raw = [0u8; PACKET_SIZE];
    raw[..2].copy_from_slice(&(id & LINE_ID_MASK).to_be_bytes());
    for (chunk, word) in raw[PACKET_HEADER_SIZE..].chunks_exact_mut(2).zip(words) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    let crc = packet_crc(&raw);
    raw[2..4].copy_from_slice(&crc.to_be_bytes());
    raw
}

/// Build a discard packet; `seq` only varies the reserved bits and payload
pub fn encode_discard(seq: u16) -> [u8; PACKET_SIZE] {
    let mut raw = [0u8; PACKET_SIZE];
    raw[..2].copy_from_slice(&(DISCARD_MASK | (seq & 0xF0FF)).to_be_bytes());
    raw[PACKET_HEADER_SIZE..].fill(seq as u8);
    raw
}

/// CRC of a packet with the reserved ID bits and CRC field zeroed
fn packet_crc(raw: &[u8; PACKET_SIZE]) -> u16 {
    let head = [raw[0] & 0x0F, raw[1], 0, 0];
    crc16_update(crc16_update(0, &head), &raw[PACKET_HEADER_SIZE..])
}

const CRC16_POLY: u16 = 0x1021;

const CRC16_TABLE: [u16; 256] = {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ CRC16_POLY } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// CRC-16/CCITT with a zero initial value
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(0, data)
}

fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc = CRC16_TABLE[((crc >> 8) as u8 ^ byte) as usize] ^ (crc << 8);
    }
    crc
}
