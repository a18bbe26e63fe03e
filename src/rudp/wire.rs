//! Datagram wire format: fixed-width ASCII-hex fields framing a raw payload.
//!
//! Grounded on `Server/rudpconnection.py`'s `_COMPONENTS`/`_LENGTHS` and
//! `Server/rudpmanager.py::parse_datagram`. Field order is fixed: length,
//! cid, flag, sqn, data. `length` covers every byte after itself.

use crate::error::{RudpError, Result};

pub const LENGTH_FIELD_LEN: usize = 4;
pub const CID_FIELD_LEN: usize = 4;
pub const FLAG_FIELD_LEN: usize = 1;
pub const SQN_FIELD_LEN: usize = 4;
pub const MAX_DATA_LEN: usize = 1024;

/// Maximum possible datagram size: 4 + 4 + 1 + 4 + 1024.
pub const MAX_DATAGRAM_SIZE: usize =
    LENGTH_FIELD_LEN + CID_FIELD_LEN + FLAG_FIELD_LEN + SQN_FIELD_LEN + MAX_DATA_LEN;

/// The five packet flags on the wire, one hex digit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Data = 0,
    Ack = 1,
    Close = 2,
    Init = 4,
    KpAlive = 8,
}

impl Flag {
    fn from_u32(v: u32) -> Result<Flag> {
        match v {
            0 => Ok(Flag::Data),
            1 => Ok(Flag::Ack),
            2 => Ok(Flag::Close),
            4 => Ok(Flag::Init),
            8 => Ok(Flag::KpAlive),
            other => Err(RudpError::Protocol(format!("unknown datagram flag {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub cid: u32,
    pub flag: Flag,
    pub sqn: u32,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(cid: u32, flag: Flag, sqn: u32, data: Vec<u8>) -> Packet {
        Packet { cid, flag, sqn, data }
    }

    /// Serializes to the on-wire form: `length|cid|flag|sqn|data`, all
    /// integer fields as fixed-width lowercase ASCII hex.
    pub fn encode(&self) -> Vec<u8> {
        let mut content = Vec::with_capacity(CID_FIELD_LEN + FLAG_FIELD_LEN + SQN_FIELD_LEN + self.data.len());
        content.extend(format!("{:04x}", self.cid).into_bytes());
        content.extend(format!("{:01x}", self.flag as u8).into_bytes());
        content.extend(format!("{:04x}", self.sqn).into_bytes());
        content.extend_from_slice(&self.data);

        let mut out = format!("{:04x}", content.len()).into_bytes();
        out.extend(content);
        out
    }

    /// Parses a full datagram as read off the wire. Any malformed field is a
    /// dropped packet at the caller (§4.4/§7: protocol violation, not fatal).
    pub fn decode(buf: &[u8]) -> Result<Packet> {
        let min_len = LENGTH_FIELD_LEN + CID_FIELD_LEN + FLAG_FIELD_LEN + SQN_FIELD_LEN;
        if buf.len() < min_len {
            return Err(RudpError::Protocol("datagram shorter than header".into()));
        }
        let mut cursor = buf;
        let length = take_hex(&mut cursor, LENGTH_FIELD_LEN)?;
        if cursor.len() != length as usize {
            return Err(RudpError::Protocol(format!(
                "declared length {} does not match remaining {} bytes",
                length,
                cursor.len()
            )));
        }
        let cid = take_hex(&mut cursor, CID_FIELD_LEN)?;
        let flag = Flag::from_u32(take_hex(&mut cursor, FLAG_FIELD_LEN)?)?;
        let sqn = take_hex(&mut cursor, SQN_FIELD_LEN)?;
        if cursor.len() > MAX_DATA_LEN {
            return Err(RudpError::Protocol("datagram payload exceeds DATA_LENGTH".into()));
        }
        Ok(Packet {
            cid,
            flag,
            sqn,
            data: cursor.to_vec(),
        })
    }
}

fn take_hex(cursor: &mut &[u8], width: usize) -> Result<u32> {
    if cursor.len() < width {
        return Err(RudpError::Protocol("truncated datagram field".into()));
    }
    let (field, rest) = cursor.split_at(width);
    *cursor = rest;
    let s = std::str::from_utf8(field).map_err(|_| RudpError::Protocol("non-ASCII hex field".into()))?;
    u32::from_str_radix(s, 16).map_err(|_| RudpError::Protocol(format!("invalid hex field {:?}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_data_packet() {
        let pkt = Packet::new(0x12, Flag::Data, 7, b"hello".to_vec());
        let encoded = pkt.encode();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.cid, 0x12);
        assert_eq!(decoded.flag, Flag::Data);
        assert_eq!(decoded.sqn, 7);
        assert_eq!(decoded.data, b"hello");
    }

    #[test]
    fn round_trips_an_empty_init() {
        let pkt = Packet::new(0, Flag::Init, 0, Vec::new());
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded.flag, Flag::Init);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn rejects_mismatched_length_field() {
        let mut bytes = Packet::new(0, Flag::Ack, 0, Vec::new()).encode();
        bytes[0] = b'f';
        bytes[1] = b'f';
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_unknown_flag() {
        // length=0009, cid=0000, flag=3 (unused nibble), sqn=0000
        let raw = b"0009000030000";
        assert!(Packet::decode(raw).is_err());
    }

    #[test]
    fn max_datagram_size_matches_spec() {
        assert_eq!(MAX_DATAGRAM_SIZE, 1037);
    }
}
