// AMC board serial protocol (outbound side)
//
// Command format (ASCII): "@<Op>,<channel>,<value-or-field>,*" followed by one
// raw checksum byte. Op is 'S' (set speed) or 'R' (read telemetry).
// The checksum covers every byte before the trailing '*'.

use std::fmt;
use std::io::Write;

/// Number of motor channels on the board
pub const MOTOR_COUNT: usize = 4;

/// Largest frame including the trailing '*' (checksum byte not counted)
pub const MAX_FRAME_LEN: usize = 16;

/// Frame delimiters
pub const FRAME_START: u8 = b'@';
pub const FRAME_END: u8 = b'*';

/// Error types for AMC communication
#[derive(Debug, thiserror::Error)]
pub enum AmcError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid channel {0}, expected 0..{max}", max = MOTOR_COUNT - 1)]
    InvalidChannel(u8),

    #[error("Frame for channel {channel} does not fit {max} bytes", max = MAX_FRAME_LEN)]
    FrameOverflow { channel: Channel },

    #[error("Actuation value {0} cannot be sent as an integer speed")]
    InvalidValue(f64),

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Bus error: {0}")]
    Bus(String),
}

pub type Result<T> = std::result::Result<T, AmcError>;

/// Byte-wise CRC8 (MSB first, no reflection, no final xor)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc8 {
    poly: u8,
}

impl Crc8 {
    pub const fn new(poly: u8) -> Self {
        Self { poly }
    }

    /// Checksum of a whole buffer
    pub fn checksum(&self, data: &[u8]) -> u8 {
        data.iter().fold(0, |crc, &b| self.update(crc, b))
    }

    fn update(&self, crc: u8, byte: u8) -> u8 {
        let mut crc = crc ^ byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ self.poly
            } else {
                crc << 1
            };
        }
        crc
    }
}

/// A motor channel index, always in 0..MOTOR_COUNT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    pub const ALL: [Channel; MOTOR_COUNT] = [Channel(0), Channel(1), Channel(2), Channel(3)];

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u8> for Channel {
    type Error = AmcError;

    fn try_from(value: u8) -> Result<Self> {
        if (value as usize) < MOTOR_COUNT {
            Ok(Channel(value))
        } else {
            Err(AmcError::InvalidChannel(value))
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Telemetry fields that can be read from a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Rpm,
    Temperature,
    Power,
    State,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Rpm, Field::Temperature, Field::Power, Field::State];

    /// Field tag as it appears on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            Field::Rpm => "rpm",
            Field::Temperature => "tmp",
            Field::Power => "pwr",
            Field::State => "sta",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        Field::ALL.into_iter().find(|f| f.as_str().as_bytes() == tag)
    }
}

/// A complete outbound frame, checksum byte included
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: [u8; MAX_FRAME_LEN + 1],
    len: usize,
}

impl CommandFrame {
    /// Bytes to put on the wire
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// ASCII part of the frame, up to and including '*'
    pub fn body(&self) -> &[u8] {
        &self.bytes[..self.len - 1]
    }

    pub fn checksum(&self) -> u8 {
        self.bytes[self.len - 1]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}<{:02X}>",
            String::from_utf8_lossy(self.body()),
            self.checksum()
        )
    }
}

/// Build a frame from format arguments, failing if it would not fit
fn build_frame(crc: &Crc8, channel: Channel, args: fmt::Arguments<'_>) -> Result<CommandFrame> {
    let mut bytes = [0u8; MAX_FRAME_LEN + 1];

    let remaining = {
        let mut cursor = &mut bytes[..MAX_FRAME_LEN];
        if cursor.write_fmt(args).is_err() {
            return Err(AmcError::FrameOverflow { channel });
        }
        cursor.len()
    };
    let body_len = MAX_FRAME_LEN - remaining;

    // Checksum over everything except the trailing '*'
    bytes[body_len] = crc.checksum(&bytes[..body_len - 1]);

    Ok(CommandFrame {
        bytes,
        len: body_len + 1,
    })
}

/// Encode a set-speed command: "@S,<channel>,<value>,*" + checksum
pub fn encode_set(crc: &Crc8, channel: Channel, value: i32) -> Result<CommandFrame> {
    build_frame(crc, channel, format_args!("@S,{},{},*", channel, value))
}

/// Encode a telemetry read: "@R,<channel>,<field>,*" + checksum
pub fn encode_read(crc: &Crc8, channel: Channel, field: Field) -> Result<CommandFrame> {
    build_frame(crc, channel, format_args!("@R,{},{},*", channel, field.as_str()))
}
