use byteorder::{BigEndian, ByteOrder};

use codec::{Cursor, Writer};
use error::Error;

pub const RECORD_HEADER_LENGTH: usize = 13;

// sequence numbers are 48 bits on the wire; crossing this value exhausts
// the epoch.
pub const MAX_SEQUENCE_NUMBER: u64 = 0xffff_ffff_ffff;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            20 => Some(ContentType::ChangeCipherSpec),
            21 => Some(ContentType::Alert),
            22 => Some(ContentType::Handshake),
            23 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }
}

/// `ProtocolVersion` selects the wire version field. The record layer and
/// handshake behave identically under both; the choice is made at context
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Dtls10,
    Dtls12,
}

impl ProtocolVersion {
    pub fn to_bytes(&self) -> [u8; 2] {
        match self {
            &ProtocolVersion::Dtls10 => [0xfe, 0xff],
            &ProtocolVersion::Dtls12 => [0xfe, 0xfd],
        }
    }

    pub fn from_bytes(raw: [u8; 2]) -> Option<Self> {
        match raw {
            [0xfe, 0xff] => Some(ProtocolVersion::Dtls10),
            [0xfe, 0xfd] => Some(ProtocolVersion::Dtls12),
            _ => None,
        }
    }
}

/// `RecordHeader` is the 13-byte DTLS record header:
/// `type(1) || version(2) || epoch(2) || sequence(6) || length(2)`.
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub version: [u8; 2],
    pub epoch: u16,
    pub sequence: u64,
    pub length: u16,
}

impl RecordHeader {
    pub fn parse(cur: &mut Cursor) -> Result<Self, Error> {
        let content_type = ContentType::from_byte(cur.read_u8()?).ok_or(Error::BadRecord)?;
        let raw_version = cur.read_bytes(2)?;
        let mut version = [0; 2];
        version.copy_from_slice(raw_version);
        let epoch = cur.read_u16()?;
        let sequence = cur.read_u48()?;
        let length = cur.read_u16()?;

        Ok(RecordHeader {
            content_type: content_type,
            version: version,
            epoch: epoch,
            sequence: sequence,
            length: length,
        })
    }

    pub fn encode(&self, w: &mut Writer) {
        w.write_u8(self.content_type as u8);
        w.write_bytes(&self.version);
        w.write_u16(self.epoch);
        w.write_u48(self.sequence);
        w.write_u16(self.length);
    }

    /// `sequence_bytes` packs `epoch(2) || sequence(6)`: the 8-byte
    /// sequence number the AEAD construction binds as part of its
    /// associated data and explicit nonce.
    pub fn sequence_bytes(&self) -> [u8; 8] {
        pack_sequence(self.epoch, self.sequence)
    }
}

pub fn pack_sequence(epoch: u16, sequence: u64) -> [u8; 8] {
    let mut out = [0; 8];
    BigEndian::write_u16(&mut out[..2], epoch);
    BigEndian::write_u48(&mut out[2..], sequence);
    out
}
