use std::{error, fmt};

/// `Error` enumerates every failure the engine can report. Protocol-level
/// failures that the dispatch policy swallows (replays, stale records) use
/// the same type internally and never reach the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    BufferTooShort,
    BadRecord,
    Replay,
    Stale,
    ProtocolViolation,
    UnknownIdentity,
    HandshakeTimeout,
    ResourceExhausted,
    UnknownPeer,
    InvalidState,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            &BufferTooShort => write!(f, "buffer too short"),
            &BadRecord => write!(f, "bad record"),
            &Replay => write!(f, "replayed record"),
            &Stale => write!(f, "record outside the replay window"),
            &ProtocolViolation => write!(f, "unexpected message for the current state"),
            &UnknownIdentity => write!(f, "unknown psk identity"),
            &HandshakeTimeout => write!(f, "handshake timed out"),
            &ResourceExhausted => write!(f, "peer table full"),
            &UnknownPeer => write!(f, "no peer for this session"),
            &InvalidState => write!(f, "operation not valid in the current state"),
        }
    }
}

impl error::Error for Error {}

// alert levels and descriptions from the TLS alert registry, as used on the
// wire. Only the descriptions this engine can emit or meaningfully report
// are listed; everything else is carried as a raw code.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning = 1,
    Fatal = 2,
}

impl AlertLevel {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(AlertLevel::Warning),
            2 => Some(AlertLevel::Fatal),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDescription {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    RecordOverflow = 22,
    HandshakeFailure = 40,
    IllegalParameter = 47,
    DecodeError = 50,
    DecryptError = 51,
    ProtocolVersion = 70,
    InsufficientSecurity = 71,
    InternalError = 80,
    UnknownPskIdentity = 115,
}

impl AlertDescription {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AlertDescription::CloseNotify),
            10 => Some(AlertDescription::UnexpectedMessage),
            20 => Some(AlertDescription::BadRecordMac),
            22 => Some(AlertDescription::RecordOverflow),
            40 => Some(AlertDescription::HandshakeFailure),
            47 => Some(AlertDescription::IllegalParameter),
            50 => Some(AlertDescription::DecodeError),
            51 => Some(AlertDescription::DecryptError),
            70 => Some(AlertDescription::ProtocolVersion),
            71 => Some(AlertDescription::InsufficientSecurity),
            80 => Some(AlertDescription::InternalError),
            115 => Some(AlertDescription::UnknownPskIdentity),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_registry_round_trip() {
        assert_eq!(AlertDescription::from_byte(20), Some(AlertDescription::BadRecordMac));
        assert_eq!(AlertDescription::from_byte(115), Some(AlertDescription::UnknownPskIdentity));
        assert_eq!(AlertDescription::from_byte(255), None);
        assert_eq!(AlertLevel::from_byte(2), Some(AlertLevel::Fatal));
        assert_eq!(AlertLevel::from_byte(0), None);
    }
}
