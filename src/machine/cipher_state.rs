use aes::Aes128;
use byteorder::{BigEndian, ByteOrder};
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U12, U8};
use ccm::Ccm;
use zeroize::Zeroize;

use error::Error;
use record::{ContentType, RecordHeader};

// TLS_PSK_WITH_AES_128_CCM_8 record protection parameters.
pub const KEY_LENGTH: usize = 16;
pub const IV_LENGTH: usize = 4;
pub const EXPLICIT_NONCE_LENGTH: usize = 8;
pub const TAG_LENGTH: usize = 8;

// per-record overhead a protected payload adds on the wire.
pub const SEAL_OVERHEAD: usize = EXPLICIT_NONCE_LENGTH + TAG_LENGTH;

const NONCE_LENGTH: usize = IV_LENGTH + EXPLICIT_NONCE_LENGTH;
const ASSOCIATED_DATA_LENGTH: usize = 13;

type Aes128Ccm8 = Ccm<Aes128, U8, U12>;

/// `CipherState` encapsulates one write (or read) direction of the record
/// protection: the AES-128 key and the 4-byte implicit salt the CCM nonce
/// is built from. The explicit part of the nonce is the record's
/// `epoch || sequence`, so the state itself carries no counter.
pub struct CipherState {
    key: [u8; KEY_LENGTH],
    salt: [u8; IV_LENGTH],
}

impl CipherState {
    pub fn new(key: [u8; KEY_LENGTH], salt: [u8; IV_LENGTH]) -> Self {
        CipherState { key: key, salt: salt }
    }

    fn nonce(&self, explicit: &[u8]) -> [u8; NONCE_LENGTH] {
        let mut nonce = [0; NONCE_LENGTH];
        nonce[..IV_LENGTH].copy_from_slice(&self.salt);
        nonce[IV_LENGTH..].copy_from_slice(explicit);
        nonce
    }

    /// `seal` protects one record payload, producing the wire form
    /// `explicit_nonce(8) || ciphertext || tag(8)`. The associated data
    /// binds the sequence number, content type, version and plaintext
    /// length per the TLS 1.2 AEAD construction.
    pub fn seal(
        &self,
        sequence: &[u8; 8],
        content_type: ContentType,
        version: [u8; 2],
        plain: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if plain.len() > 0xffff {
            return Err(Error::BufferTooShort);
        }
        let nonce = self.nonce(&sequence[..]);
        let ad = associated_data(sequence, content_type, version, plain.len() as u16);

        let mut out = Vec::with_capacity(SEAL_OVERHEAD + plain.len());
        out.extend_from_slice(&sequence[..]);
        out.extend_from_slice(plain);

        let cipher = Aes128Ccm8::new(GenericArray::from_slice(&self.key));
        let tag = cipher
            .encrypt_in_place_detached(
                GenericArray::from_slice(&nonce),
                &ad,
                &mut out[EXPLICIT_NONCE_LENGTH..],
            )
            .map_err(|_| Error::BadRecord)?;
        out.extend_from_slice(tag.as_slice());
        Ok(out)
    }

    /// `open` verifies and strips one protected payload. The nonce comes
    /// from the explicit field carried on the wire; the associated data is
    /// rebuilt from the record header. A tag mismatch (the compare is
    /// constant-time inside the AEAD) is `BadRecord`.
    pub fn open(&self, header: &RecordHeader, payload: &[u8]) -> Result<Vec<u8>, Error> {
        if payload.len() < SEAL_OVERHEAD {
            return Err(Error::BadRecord);
        }
        let (explicit, rest) = payload.split_at(EXPLICIT_NONCE_LENGTH);
        let (body, tag) = rest.split_at(rest.len() - TAG_LENGTH);

        let nonce = self.nonce(explicit);
        let ad = associated_data(
            &header.sequence_bytes(),
            header.content_type,
            header.version,
            body.len() as u16,
        );

        let mut plain = body.to_vec();
        let cipher = Aes128Ccm8::new(GenericArray::from_slice(&self.key));
        match cipher.decrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            &ad,
            &mut plain,
            GenericArray::from_slice(tag),
        ) {
            Ok(()) => Ok(plain),
            Err(_) => {
                plain.zeroize();
                Err(Error::BadRecord)
            }
        }
    }
}

impl Drop for CipherState {
    fn drop(&mut self) {
        self.key.zeroize();
        self.salt.zeroize();
    }
}

// associated_data is `seq_num(8) || type(1) || version(2) || length(2)`,
// with length counting the plaintext.
fn associated_data(
    sequence: &[u8; 8],
    content_type: ContentType,
    version: [u8; 2],
    length: u16,
) -> [u8; ASSOCIATED_DATA_LENGTH] {
    let mut ad = [0; ASSOCIATED_DATA_LENGTH];
    ad[..8].copy_from_slice(&sequence[..]);
    ad[8] = content_type as u8;
    ad[9..11].copy_from_slice(&version);
    BigEndian::write_u16(&mut ad[11..13], length);
    ad
}
