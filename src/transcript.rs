use byteorder::{BigEndian, ByteOrder};
use sha2::{Digest, Sha256};

use machine::handshake::HANDSHAKE_HEADER_LENGTH;

/// `Transcript` keeps the running hash of every handshake message issued
/// or received, for Finished computation. Messages are absorbed with their
/// full handshake header, normalised as if unfragmented: `fragment_offset`
/// zero and `fragment_length` equal to `length`, so both sides hash the
/// same bytes regardless of how records were cut.
#[derive(Clone)]
pub struct Transcript {
    digest: Sha256,
}

impl Transcript {
    pub fn new() -> Self {
        Transcript { digest: Sha256::new() }
    }

    pub fn absorb(&mut self, msg_type: u8, message_seq: u16, body: &[u8]) {
        let mut header = [0; HANDSHAKE_HEADER_LENGTH];
        header[0] = msg_type;
        BigEndian::write_u24(&mut header[1..4], body.len() as u32);
        BigEndian::write_u16(&mut header[4..6], message_seq);
        // fragment_offset (bytes 6..9) stays zero
        BigEndian::write_u24(&mut header[9..12], body.len() as u32);

        self.digest.update(&header);
        self.digest.update(body);
    }

    // reset discards everything absorbed so far; used when a cookie
    // exchange restarts the hello phase.
    pub fn reset(&mut self) {
        self.digest = Sha256::new();
    }

    /// `current` returns the hash over everything absorbed so far without
    /// disturbing the running state.
    pub fn current(&self) -> [u8; 32] {
        let mut out = [0; 32];
        out.copy_from_slice(&self.digest.clone().finalize());
        out
    }
}
