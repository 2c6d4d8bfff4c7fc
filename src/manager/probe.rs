//! Probe datagram codec.
//!
//! Fixed 16-byte records, network byte order:
//!
//! ```text
//! single (disc != 1): [hdr u8][stat u8][disc u16][time i32][index i32][value f32]
//! dual   (disc == 1): [hdr u8][stat u8][disc u16][time i32][value f32][value2 f32]
//! ```
//!
//! The header's high nibble is the component kind (0 GW, 1 SAT, 2 ST) and
//! its low nibble the instance, only meaningful for terminals.

use crate::error::ProbeError;
use std::fmt;

pub const RECORD_LEN: usize = 16;

const DUAL: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentId {
    Gw,
    Sat,
    St(u8),
}

impl ComponentId {
    pub fn from_header(hdr: u8) -> Result<Self, ProbeError> {
        match hdr >> 4 {
            0 => Ok(ComponentId::Gw),
            1 => Ok(ComponentId::Sat),
            2 => Ok(ComponentId::St(hdr & 0x0f)),
            other => Err(ProbeError::UnknownComponent(other)),
        }
    }

    pub fn header(self) -> u8 {
        match self {
            ComponentId::Gw => 0x00,
            ComponentId::Sat => 0x10,
            ComponentId::St(id) => 0x20 | (id & 0x0f),
        }
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentId::Gw => f.write_str("GW"),
            ComponentId::Sat => f.write_str("SAT"),
            ComponentId::St(id) => write!(f, "ST{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Single { time: i32, index: i32, value: f32 },
    Dual { time: i32, value: f32, value2: f32 },
}

impl Sample {
    pub fn time(&self) -> i32 {
        match *self {
            Sample::Single { time, .. } | Sample::Dual { time, .. } => time,
        }
    }
}

/// One decoded datagram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeRecord {
    pub component: ComponentId,
    pub stat_id: u8,
    pub sample: Sample,
}

impl ProbeRecord {
    pub fn decode(buf: &[u8]) -> Result<Self, ProbeError> {
        let Some(raw) = buf.get(..RECORD_LEN) else {
            return Err(ProbeError::Short { len: buf.len() });
        };
        let word = |at: usize| [raw[at], raw[at + 1], raw[at + 2], raw[at + 3]];

        let component = ComponentId::from_header(raw[0])?;
        let stat_id = raw[1];
        let disc = u16::from_be_bytes([raw[2], raw[3]]);
        let time = i32::from_be_bytes(word(4));

        let sample = if disc == DUAL {
            Sample::Dual {
                time,
                value: f32::from_be_bytes(word(8)),
                value2: f32::from_be_bytes(word(12)),
            }
        } else {
            Sample::Single {
                time,
                index: i32::from_be_bytes(word(8)),
                value: f32::from_be_bytes(word(12)),
            }
        };

        Ok(Self {
            component,
            stat_id,
            sample,
        })
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0] = self.component.header();
        out[1] = self.stat_id;
        match self.sample {
            Sample::Single { time, index, value } => {
                out[4..8].copy_from_slice(&time.to_be_bytes());
                out[8..12].copy_from_slice(&index.to_be_bytes());
                out[12..16].copy_from_slice(&value.to_be_bytes());
            }
            Sample::Dual {
                time,
                value,
                value2,
            } => {
                out[2..4].copy_from_slice(&DUAL.to_be_bytes());
                out[4..8].copy_from_slice(&time.to_be_bytes());
                out[8..12].copy_from_slice(&value.to_be_bytes());
                out[12..16].copy_from_slice(&value2.to_be_bytes());
            }
        }
        out
    }
}
