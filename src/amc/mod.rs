// AMC motor controller board support
//
// Provides:
// - ASCII command framing with a CRC8 trailer
// - Inbound reply decoding (byte at a time)
// - Serial transport with readiness polling
// - The control loop that polls, actuates and supervises the board

mod driver;
pub mod parser;
pub mod protocol;
pub mod transport;

pub use driver::{
    AmcDriver, Bus, DriverOutcome, DriverState, MotorChannel, PollCursor, Watchdog,
};
pub use parser::{AmcParser, ChannelState, InboundDecoder};
pub use protocol::{encode_read, encode_set, AmcError, Channel, CommandFrame, Crc8, Field};
pub use transport::{SerialTransport, Transport};
