// AMC board reply decoding
//
// Replies mirror the command framing: "@<field>,<channel>,<v1>[,<v2>],*" plus
// one checksum byte, e.g. "@rpm,2,-1450,*" or "@pwr,0,24.1,3.2,*".
// The decoder is fed one byte at a time and keeps the latest values per channel.

use tracing::debug;

use super::protocol::{Channel, Crc8, Field, FRAME_END, FRAME_START, MOTOR_COUNT};

/// Longest reply body accepted between '@' and '*'
const MAX_REPLY_LEN: usize = 32;

/// Latest decoded telemetry for one channel
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelState {
    pub rpm: i32,
    pub temperature: f32,
    pub voltage: f32,
    pub current: f32,
    /// false until the board reports the channel running
    pub healthy: bool,
}

/// Byte-feed decoder for inbound telemetry
pub trait InboundDecoder {
    fn feed(&mut self, byte: u8);
    fn channel_state(&self, channel: Channel) -> ChannelState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Preamble,
    Body,
    Checksum,
}

/// Decoder for the AMC reply format
pub struct AmcParser {
    crc: Crc8,
    state: ParseState,
    buffer: Vec<u8>,
    channels: [ChannelState; MOTOR_COUNT],
    rejected: u32,
}

impl AmcParser {
    pub fn new(crc: Crc8) -> Self {
        Self {
            crc,
            state: ParseState::Preamble,
            buffer: Vec::with_capacity(MAX_REPLY_LEN),
            channels: [ChannelState::default(); MOTOR_COUNT],
            rejected: 0,
        }
    }

    /// Number of frames dropped for bad checksum, length or content
    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    fn reject(&mut self, reason: &str) {
        debug!(
            "Dropping reply {:?}: {}",
            String::from_utf8_lossy(&self.buffer),
            reason
        );
        self.rejected += 1;
        self.buffer.clear();
        self.state = ParseState::Preamble;
    }

    /// Apply a checked reply body (without '@' and ",*")
    fn apply(&mut self, body: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(body) else {
            return false;
        };
        let mut parts = text.split(',');

        let Some(field) = parts.next().and_then(|tag| Field::from_tag(tag.as_bytes())) else {
            return false;
        };
        let Some(channel) = parts
            .next()
            .and_then(|c| c.parse::<u8>().ok())
            .and_then(|c| Channel::try_from(c).ok())
        else {
            return false;
        };
        let values: Vec<&str> = parts.collect();
        let state = &mut self.channels[channel.index()];

        match (field, values.as_slice()) {
            (Field::Rpm, [rpm]) => match rpm.parse() {
                Ok(rpm) => state.rpm = rpm,
                Err(_) => return false,
            },
            (Field::Temperature, [tmp]) => match tmp.parse() {
                Ok(tmp) => state.temperature = tmp,
                Err(_) => return false,
            },
            (Field::Power, [volts, amps]) => match (volts.parse(), amps.parse()) {
                (Ok(v), Ok(a)) => {
                    state.voltage = v;
                    state.current = a;
                }
                _ => return false,
            },
            (Field::State, ["1"]) => state.healthy = true,
            (Field::State, ["0"]) => state.healthy = false,
            _ => return false,
        }

        debug!("Decoded {} for channel {}: {:?}", field.as_str(), channel, state);
        true
    }
}

impl InboundDecoder for AmcParser {
    fn feed(&mut self, byte: u8) {
        match self.state {
            ParseState::Preamble => {
                if byte == FRAME_START {
                    self.buffer.clear();
                    self.buffer.push(byte);
                    self.state = ParseState::Body;
                }
            }
            ParseState::Body => {
                if byte == FRAME_START {
                    // Resync on a fresh frame start
                    self.buffer.clear();
                    self.buffer.push(byte);
                } else if self.buffer.len() >= MAX_REPLY_LEN {
                    self.reject("too long");
                } else {
                    self.buffer.push(byte);
                    if byte == FRAME_END {
                        self.state = ParseState::Checksum;
                    }
                }
            }
            ParseState::Checksum => {
                // buffer is "@...,*"; checksum covers everything before '*'
                let covered = &self.buffer[..self.buffer.len() - 1];
                if self.crc.checksum(covered) != byte {
                    self.reject("checksum mismatch");
                    return;
                }

                let body = self.buffer[1..self.buffer.len() - 1]
                    .strip_suffix(b",")
                    .map(<[u8]>::to_vec);
                match body {
                    Some(body) if self.apply(&body) => {
                        self.buffer.clear();
                        self.state = ParseState::Preamble;
                    }
                    _ => self.reject("malformed"),
                }
            }
        }
    }

    fn channel_state(&self, channel: Channel) -> ChannelState {
        self.channels[channel.index()]
    }
}
