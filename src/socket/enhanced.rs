//! Enhanced frame codec: the two-byte tagged protocol multiplexing client
//! commands and adapter events over the enhanced TCP port.
//!
//! Client → adapter, two-byte form: `byte1 = 0b11_cccc_dd`, `byte2 =
//! 0b10_dddddd`. A single byte `0b0xxxxxxx` is shorthand for
//! `CMD_SEND(0xxxxxxx)`. Adapter → client uses the same two-byte encoding
//! with `cccc` drawn from the event tag set instead of the command set.

/// Mask/tag bits for the first byte of a two-byte frame (`0b11......`).
const TAG_BYTE1: u8 = 0b1100_0000;
/// Mask/tag bits for the second byte of a two-byte frame (`0b10......`).
const TAG_BYTE2: u8 = 0b1000_0000;
/// Mask isolating the fixed tag bits of either byte.
const TAG_MASK: u8 = 0b1100_0000;

/// Client commands decoded from the enhanced port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `CMD_INIT` — reset request; no bus action.
    Init(u8),
    /// `CMD_SEND` — write a byte to the bus.
    Send(u8),
    /// `CMD_START` — request (or cancel, if `data == SYN`) arbitration.
    Start(u8),
    /// `CMD_INFO` — reserved; accepted and ignored.
    Info(u8),
}

/// Adapter event tags sent to clients. Numeric assignments are stable for
/// client wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventTag {
    /// Engine was reset (response to `CMD_INIT`).
    Resetted = 0,
    /// A byte was received off the bus.
    Received = 1,
    /// Arbitration was won for this client.
    Started = 2,
    /// Arbitration was lost for this client.
    Failed = 3,
    /// A bus-level framing error occurred.
    ErrorEbus = 4,
    /// A host/protocol-level error occurred (e.g. conflicting arbitration
    /// request).
    ErrorHost = 5,
}

/// Data value for `ERROR_HOST`/`ERROR_EBUS` denoting a framing anomaly.
pub const ERR_FRAMING: u8 = 0x01;

/// Errors raised while decoding the enhanced wire protocol. Per §4.7, any
/// of these is fatal for the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnhancedError {
    /// The first byte of a two-byte frame did not carry the `11` tag.
    BadFirstByteSignature,
    /// The second byte of a two-byte frame did not carry the `10` tag.
    BadSecondByteSignature,
    /// The stream ended after a tagged first byte with no second byte.
    MissingSecondByte,
}

impl std::fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadFirstByteSignature => write!(f, "first command signature error"),
            Self::BadSecondByteSignature => write!(f, "second command signature error"),
            Self::MissingSecondByte => write!(f, "second command missing"),
        }
    }
}

impl std::error::Error for EnhancedError {}

fn cmd_from_bits(cmd_bits: u8, data: u8) -> Command {
    match cmd_bits {
        0 => Command::Init(data),
        1 => Command::Send(data),
        2 => Command::Start(data),
        _ => Command::Info(data),
    }
}

fn event_tag_bits(tag: EventTag) -> u8 {
    tag as u8
}

/// Encodes a two-byte adapter→client event frame.
#[must_use]
pub fn encode_event(tag: EventTag, data: u8) -> [u8; 2] {
    encode_two_byte(event_tag_bits(tag), data)
}

fn encode_two_byte(cmd: u8, data: u8) -> [u8; 2] {
    let byte1 = TAG_BYTE1 | ((cmd & 0x0F) << 2) | (data >> 6);
    let byte2 = TAG_BYTE2 | (data & 0x3F);
    [byte1, byte2]
}

/// Incremental decoder for the enhanced protocol, buffering partial frames
/// across `feed` calls so a frame split across two TCP reads still decodes
/// correctly.
#[derive(Debug, Default)]
pub struct EnhancedDecoder {
    buf: Vec<u8>,
}

impl EnhancedDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds newly received bytes, returning every complete command decoded
    /// so far.
    ///
    /// # Errors
    ///
    /// Returns [`EnhancedError`] as soon as a malformed frame is
    /// recognized; per §4.7 this is fatal and the caller should disconnect
    /// the client.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Command>, EnhancedError> {
        self.buf.extend_from_slice(bytes);
        let mut commands = Vec::new();
        let mut consumed = 0;

        loop {
            let remaining = &self.buf[consumed..];
            let Some(&byte1) = remaining.first() else {
                break;
            };

            if byte1 & 0x80 == 0 {
                // Single-byte shorthand for CMD_SEND.
                commands.push(Command::Send(byte1));
                consumed += 1;
                continue;
            }

            if byte1 & TAG_MASK != TAG_BYTE1 {
                return Err(EnhancedError::BadFirstByteSignature);
            }

            let Some(&byte2) = remaining.get(1) else {
                break;
            };
            if byte2 & TAG_MASK != TAG_BYTE2 {
                return Err(EnhancedError::BadSecondByteSignature);
            }

            let cmd_bits = (byte1 >> 2) & 0x0F;
            let data = ((byte1 & 0x03) << 6) | (byte2 & 0x3F);
            commands.push(cmd_from_bits(cmd_bits, data));
            consumed += 2;
        }

        self.buf.drain(..consumed);
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_two_byte_decode() {
        let mut decoder = EnhancedDecoder::new();
        let commands = decoder.feed(&[0xC8, 0x83]).expect("valid frame");
        assert_eq!(commands, vec![Command::Start(0x03)]);
    }

    #[test]
    fn s6_single_byte_shorthand() {
        let mut decoder = EnhancedDecoder::new();
        let commands = decoder.feed(&[0x12]).expect("valid frame");
        assert_eq!(commands, vec![Command::Send(0x12)]);
    }

    #[test]
    fn partial_two_byte_frame_waits_for_second_byte() {
        let mut decoder = EnhancedDecoder::new();
        assert_eq!(decoder.feed(&[0xC8]).expect("no error yet"), vec![]);
        let commands = decoder.feed(&[0x83]).expect("valid frame");
        assert_eq!(commands, vec![Command::Start(0x03)]);
    }

    #[test]
    fn rejects_bad_second_byte_signature() {
        let mut decoder = EnhancedDecoder::new();
        let err = decoder.feed(&[0xC8, 0x03]).unwrap_err();
        assert_eq!(err, EnhancedError::BadSecondByteSignature);
    }

    #[test]
    fn rejects_bad_first_byte_signature() {
        let mut decoder = EnhancedDecoder::new();
        let err = decoder.feed(&[0xA0, 0x80]).unwrap_err();
        assert_eq!(err, EnhancedError::BadFirstByteSignature);
    }

    #[test]
    fn encode_decode_round_trip_for_events() {
        let encoded = encode_event(EventTag::Started, 0x03);
        let mut decoder = EnhancedDecoder::new();
        // Events reuse the same two-byte wire shape as commands; cmd_bits 2
        // matches both CMD_START and EventTag::Started's discriminant.
        let commands = decoder.feed(&encoded).expect("valid frame");
        assert_eq!(commands, vec![Command::Start(0x03)]);
    }

    #[test]
    fn multiple_frames_in_one_feed() {
        let mut decoder = EnhancedDecoder::new();
        let mut bytes = Vec::new();
        bytes.push(0x10); // single-byte CMD_SEND(0x10)
        bytes.extend_from_slice(&encode_two_byte(2, 0x03)); // CMD_START(0x03)
        let commands = decoder.feed(&bytes).expect("valid frames");
        assert_eq!(commands, vec![Command::Send(0x10), Command::Start(0x03)]);
    }
}
