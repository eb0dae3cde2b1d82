//! Telegram assembly and validation: address classification, master/slave
//! construction from raw bytes, and telegram-type classification.

use super::sequence::Sequence;
use super::symbol::crc8;
use crate::constants::{BROADCAST, MASTER_NIBBLES, SEQ_MAX_BYTES};

/// `true` iff `addr`'s high and low nibble are both drawn from
/// `{0,1,3,7,F}` — the 25 valid master addresses.
#[must_use]
pub fn is_master(addr: u8) -> bool {
    let hi = (addr >> 4) & 0x0F;
    let lo = addr & 0x0F;
    MASTER_NIBBLES.contains(&hi) && MASTER_NIBBLES.contains(&lo)
}

/// `true` iff `addr` is a valid slave address: not a master, and not one of
/// the reserved symbol bytes (`SYN`, `ESC`, `ACK`, `NAK`).
#[must_use]
pub fn is_slave(addr: u8) -> bool {
    use crate::constants::{ACK, ESC, NAK, SYN};
    !is_master(addr) && !matches!(addr, SYN | ESC | ACK | NAK)
}

/// Returns the paired slave address for master address `master`.
#[must_use]
pub fn slave_address(master: u8) -> u8 {
    master.wrapping_add(5)
}

/// Telegram classification by destination address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramType {
    /// Undefined/not yet classified.
    Undefined,
    /// Broadcast: no response expected.
    Broadcast,
    /// Master-master: acknowledgement only, no slave payload.
    MasterMaster,
    /// Master-slave: slave responds with a payload.
    MasterSlave,
}

/// Validation/progress state of one side (master or slave) of a telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// No bytes assembled yet.
    Empty,
    /// Fully assembled and valid.
    Ok,
    /// Fewer bytes present than the length field requires.
    ShortErr,
    /// More bytes present than the length field requires.
    LongErr,
    /// Length field (`NN`) exceeds `SEQ_MAX_BYTES`.
    BadNn,
    /// CRC check failed.
    CrcError,
    /// Acknowledgement byte was neither `ACK` nor `NAK`.
    InvalidAck,
    /// Source address (`QQ`) is not a valid master.
    InvalidQq,
    /// Destination address (`ZZ`) is not broadcast, master, or slave.
    InvalidZz,
    /// Expected acknowledgement byte never arrived.
    MissingAck,
    /// Generic invalid state.
    Invalid,
}

/// A parsed or constructed eBUS telegram: master side, and (for MS
/// telegrams) the slave response side.
#[derive(Debug, Clone)]
pub struct Telegram {
    telegram_type: TelegramType,
    master: Sequence,
    master_nn: usize,
    master_crc: u8,
    master_state: SequenceState,
    master_ack: Option<u8>,
    slave: Sequence,
    slave_nn: usize,
    slave_crc: u8,
    slave_state: SequenceState,
    slave_ack: Option<u8>,
}

impl Default for Telegram {
    fn default() -> Self {
        Self::new()
    }
}

impl Telegram {
    /// Creates an empty telegram (both sides `Empty`).
    #[must_use]
    pub fn new() -> Self {
        Self {
            telegram_type: TelegramType::Undefined,
            master: Sequence::new(),
            master_nn: 0,
            master_crc: 0,
            master_state: SequenceState::Empty,
            master_ack: None,
            slave: Sequence::new(),
            slave_nn: 0,
            slave_crc: 0,
            slave_state: SequenceState::Empty,
            slave_ack: None,
        }
    }

    /// Resets the telegram to its empty state, for reuse.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Builds a master telegram from a source address and a payload whose
    /// first byte is `ZZ`, next two are `PB`/`SB`, fourth is `NN`, and the
    /// remaining `NN` bytes are the master payload. Appends the CRC and
    /// re-derives the wire form.
    ///
    /// `payload` is the logical (extended) byte sequence starting at `ZZ`,
    /// i.e. `[ZZ, PB, SB, NN, data...]`.
    pub fn create_master(&mut self, src: u8, payload: &[u8]) -> Result<(), SequenceState> {
        if !is_master(src) {
            self.master_state = SequenceState::InvalidQq;
            return Err(SequenceState::InvalidQq);
        }
        if payload.len() < 4 {
            self.master_state = SequenceState::ShortErr;
            return Err(SequenceState::ShortErr);
        }
        let zz = payload[0];
        if zz != BROADCAST && !is_master(zz) && !is_slave(zz) {
            self.master_state = SequenceState::InvalidZz;
            return Err(SequenceState::InvalidZz);
        }
        let nn = payload[3] as usize;
        if nn > SEQ_MAX_BYTES {
            self.master_state = SequenceState::BadNn;
            return Err(SequenceState::BadNn);
        }
        if payload.len() != 4 + nn {
            self.master_state = if payload.len() < 4 + nn {
                SequenceState::ShortErr
            } else {
                SequenceState::LongErr
            };
            return Err(self.master_state);
        }

        self.master.clear();
        self.master.push(src);
        for &b in payload {
            self.master.push(b);
        }
        let crc = crc8(self.master.to_vector());
        self.master.push(crc);
        self.master.extend();

        self.master_nn = nn;
        self.master_crc = crc;
        self.master_state = SequenceState::Ok;
        self.telegram_type = if zz == BROADCAST {
            TelegramType::Broadcast
        } else if is_master(zz) {
            TelegramType::MasterMaster
        } else {
            TelegramType::MasterSlave
        };
        Ok(())
    }

    /// Parses an observed slave response from raw (wire, escaped) bytes:
    /// `[NN, data..., CRC]`.
    pub fn create_slave(&mut self, raw: &[u8]) -> Result<(), SequenceState> {
        let extended = match super::symbol::unescape(raw) {
            Ok(e) => e,
            Err(_) => {
                self.slave_state = SequenceState::Invalid;
                return Err(SequenceState::Invalid);
            }
        };
        if extended.is_empty() {
            self.slave_state = SequenceState::ShortErr;
            return Err(SequenceState::ShortErr);
        }
        let nn = extended[0] as usize;
        if nn > SEQ_MAX_BYTES {
            self.slave_state = SequenceState::BadNn;
            return Err(SequenceState::BadNn);
        }
        let expected_len = 1 + nn + 1;
        if extended.len() != expected_len {
            self.slave_state = if extended.len() < expected_len {
                SequenceState::ShortErr
            } else {
                SequenceState::LongErr
            };
            return Err(self.slave_state);
        }
        let body = &extended[..1 + nn];
        let crc_byte = extended[1 + nn];
        let computed = crc8(body);
        if computed != crc_byte {
            self.slave_state = SequenceState::CrcError;
            return Err(SequenceState::CrcError);
        }

        self.slave.clear();
        for &b in &extended {
            self.slave.push(b);
        }
        self.slave.extend();
        self.slave_nn = nn;
        self.slave_crc = crc_byte;
        self.slave_state = SequenceState::Ok;
        Ok(())
    }

    /// The slave payload bytes (excluding the `NN` length byte and CRC),
    /// if the slave side has been validated.
    #[must_use]
    pub fn slave_payload(&self) -> Option<&[u8]> {
        if self.slave_state != SequenceState::Ok {
            return None;
        }
        let v = self.slave.to_vector();
        Some(&v[1..1 + self.slave_nn])
    }

    /// Sets the acknowledgement byte the master side sent for the slave
    /// response (`ACK` or `NAK`).
    pub fn set_master_ack(&mut self, byte: u8) {
        self.master_ack = Some(byte);
    }

    /// Sets the acknowledgement byte the slave sent for the master
    /// telegram (`ACK` or `NAK`).
    pub fn set_slave_ack(&mut self, byte: u8) {
        self.slave_ack = Some(byte);
    }

    /// The source address of this telegram (`QQ`), if assembled.
    #[must_use]
    pub fn master_qq(&self) -> Option<u8> {
        self.master.at(0)
    }

    /// Extended-form master bytes.
    #[must_use]
    pub fn master_vector(&self) -> &[u8] {
        self.master.to_vector()
    }

    /// Raw (wire) master bytes.
    #[must_use]
    pub fn master_raw(&self) -> &[u8] {
        self.master.to_raw_vector()
    }

    /// Master sequence validation state.
    #[must_use]
    pub fn master_state(&self) -> SequenceState {
        self.master_state
    }

    /// Slave sequence validation state.
    #[must_use]
    pub fn slave_state(&self) -> SequenceState {
        self.slave_state
    }

    /// Classified telegram type.
    #[must_use]
    pub fn telegram_type(&self) -> TelegramType {
        self.telegram_type
    }

    /// `true` iff the master side is valid and, for MS telegrams, the
    /// slave side is also valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.master_state != SequenceState::Ok {
            return false;
        }
        if self.telegram_type == TelegramType::MasterSlave {
            return self.slave_state == SequenceState::Ok;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_classification_counts_25_masters() {
        let count = (0u16..=255).filter(|&a| is_master(a as u8)).count();
        assert_eq!(count, 25);
    }

    #[test]
    fn s3_master_slave_classification() {
        assert!(is_master(0x03));
        assert!(!is_master(0x04));
        assert_eq!(slave_address(0x03), 0x08);
        assert_eq!(slave_address(0xFF), 0x04);
    }

    #[test]
    fn create_master_rejects_non_master_source() {
        let mut t = Telegram::new();
        let err = t.create_master(0x04, &[0x08, 0x07, 0x04, 0x00]).unwrap_err();
        assert_eq!(err, SequenceState::InvalidQq);
    }

    #[test]
    fn create_master_rejects_bad_nn() {
        let mut t = Telegram::new();
        let payload = [0x08u8, 0x07, 0x04, 0x11]; // NN=17 > 16, no data
        let err = t.create_master(0xFF, &payload).unwrap_err();
        assert_eq!(err, SequenceState::BadNn);
    }

    #[test]
    fn create_master_classifies_broadcast_mm_ms() {
        let mut t = Telegram::new();
        t.create_master(0xFF, &[BROADCAST, 0x07, 0x04, 0x00]).unwrap();
        assert_eq!(t.telegram_type(), TelegramType::Broadcast);

        let mut t2 = Telegram::new();
        t2.create_master(0xFF, &[0x03, 0x07, 0x04, 0x00]).unwrap();
        assert_eq!(t2.telegram_type(), TelegramType::MasterMaster);

        let mut t3 = Telegram::new();
        t3.create_master(0xFF, &[0x08, 0x07, 0x04, 0x00]).unwrap();
        assert_eq!(t3.telegram_type(), TelegramType::MasterSlave);
    }

    #[test]
    fn create_slave_validates_crc() {
        let payload = [0x03u8, 0x0A, 0x80, 0x12];
        let crc = crc8(&payload);
        let mut raw = payload.to_vec();
        raw.push(crc);

        let mut t = Telegram::new();
        t.create_slave(&raw).expect("valid slave");
        assert_eq!(t.slave_payload(), Some(&[0x0A, 0x80, 0x12][..]));
    }

    #[test]
    fn create_slave_rejects_bad_crc() {
        let payload = [0x03u8, 0x0A, 0x80, 0x12];
        let mut raw = payload.to_vec();
        raw.push(crc8(&payload) ^ 0xFF);

        let mut t = Telegram::new();
        let err = t.create_slave(&raw).unwrap_err();
        assert_eq!(err, SequenceState::CrcError);
    }
}
