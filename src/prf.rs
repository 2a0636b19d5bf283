use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

pub const MASTER_SECRET_LENGTH: usize = 48;
pub const RANDOM_LENGTH: usize = 32;
pub const VERIFY_DATA_LENGTH: usize = 12;

pub const LABEL_CLIENT_FINISHED: &'static [u8] = b"client finished";
pub const LABEL_SERVER_FINISHED: &'static [u8] = b"server finished";
const LABEL_MASTER_SECRET: &'static [u8] = b"master secret";
const LABEL_KEY_EXPANSION: &'static [u8] = b"key expansion";

// key material sizes for TLS_PSK_WITH_AES_128_CCM_8: the AEAD suite uses
// no MAC keys, 16-byte write keys and 4-byte implicit IVs.
pub const WRITE_KEY_LENGTH: usize = 16;
pub const WRITE_IV_LENGTH: usize = 4;
const KEY_BLOCK_LENGTH: usize = 2 * (WRITE_KEY_LENGTH + WRITE_IV_LENGTH);

fn hmac_sha256(secret: &[u8], chunks: &[&[u8]]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .expect("hmac accepts keys of any length");
    for chunk in chunks {
        mac.update(chunk);
    }
    let mut out = [0; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

// p_sha256 is the iterated HMAC construction from RFC 5246 section 5:
//
//   A(0) = seed, A(i) = HMAC(secret, A(i-1))
//   P_SHA256(secret, seed) = HMAC(secret, A(1) || seed) ||
//                            HMAC(secret, A(2) || seed) || ...
//
// truncated to the length of `out`.
fn p_sha256(secret: &[u8], seed: &[u8], out: &mut [u8]) {
    let mut a = hmac_sha256(secret, &[seed]);
    let mut filled = 0;
    while filled < out.len() {
        let mut block = hmac_sha256(secret, &[&a[..], seed]);
        let take = ::std::cmp::min(block.len(), out.len() - filled);
        out[filled..filled + take].copy_from_slice(&block[..take]);
        filled += take;
        block.zeroize();
        a = hmac_sha256(secret, &[&a[..]]);
    }
    a.zeroize();
}

/// `prf` is the TLS 1.2 pseudo-random function:
/// `PRF(secret, label, seed) = P_SHA256(secret, label || seed)`.
pub fn prf(secret: &[u8], label: &[u8], seed: &[u8], out: &mut [u8]) {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);
    p_sha256(secret, &label_seed, out);
}

/// `psk_premaster` builds the pre-master secret for a plain PSK key
/// exchange: `uint16(N) || 0*N || uint16(N) || psk` with N the key length.
/// The caller owns the buffer and must scrub it after deriving the master
/// secret.
pub fn psk_premaster(psk: &[u8]) -> Vec<u8> {
    let n = psk.len();
    let mut out = Vec::with_capacity(4 + 2 * n);
    out.push((n >> 8) as u8);
    out.push(n as u8);
    out.extend(::std::iter::repeat(0).take(n));
    out.push((n >> 8) as u8);
    out.push(n as u8);
    out.extend_from_slice(psk);
    out
}

/// `master_secret` derives the 48-byte master secret from the pre-master
/// secret and both hello randoms.
pub fn master_secret(
    premaster: &[u8],
    client_random: &[u8; RANDOM_LENGTH],
    server_random: &[u8; RANDOM_LENGTH],
) -> [u8; MASTER_SECRET_LENGTH] {
    let mut seed = [0; 2 * RANDOM_LENGTH];
    seed[..RANDOM_LENGTH].copy_from_slice(client_random);
    seed[RANDOM_LENGTH..].copy_from_slice(server_random);

    let mut out = [0; MASTER_SECRET_LENGTH];
    prf(premaster, LABEL_MASTER_SECRET, &seed, &mut out);
    out
}

/// `KeyBlock` is the expanded traffic keying material, in the order the
/// key expansion emits it. The MAC keys of the block are zero-length for
/// an AEAD suite and do not appear.
pub struct KeyBlock {
    pub client_write_key: [u8; WRITE_KEY_LENGTH],
    pub server_write_key: [u8; WRITE_KEY_LENGTH],
    pub client_write_iv: [u8; WRITE_IV_LENGTH],
    pub server_write_iv: [u8; WRITE_IV_LENGTH],
}

impl Drop for KeyBlock {
    fn drop(&mut self) {
        self.client_write_key.zeroize();
        self.server_write_key.zeroize();
        self.client_write_iv.zeroize();
        self.server_write_iv.zeroize();
    }
}

/// `key_block` expands the master secret into the traffic keys. Note the
/// seed order flips relative to the master secret derivation: server
/// random first.
pub fn key_block(
    master: &[u8; MASTER_SECRET_LENGTH],
    client_random: &[u8; RANDOM_LENGTH],
    server_random: &[u8; RANDOM_LENGTH],
) -> KeyBlock {
    let mut seed = [0; 2 * RANDOM_LENGTH];
    seed[..RANDOM_LENGTH].copy_from_slice(server_random);
    seed[RANDOM_LENGTH..].copy_from_slice(client_random);

    let mut raw = [0; KEY_BLOCK_LENGTH];
    prf(&master[..], LABEL_KEY_EXPANSION, &seed, &mut raw);

    let mut block = KeyBlock {
        client_write_key: [0; WRITE_KEY_LENGTH],
        server_write_key: [0; WRITE_KEY_LENGTH],
        client_write_iv: [0; WRITE_IV_LENGTH],
        server_write_iv: [0; WRITE_IV_LENGTH],
    };
    block.client_write_key.copy_from_slice(&raw[..16]);
    block.server_write_key.copy_from_slice(&raw[16..32]);
    block.client_write_iv.copy_from_slice(&raw[32..36]);
    block.server_write_iv.copy_from_slice(&raw[36..40]);
    raw.zeroize();
    block
}

/// `verify_data` computes the 12-byte Finished payload over the transcript
/// hash, with `"client finished"` or `"server finished"` as the label.
pub fn verify_data(
    master: &[u8; MASTER_SECRET_LENGTH],
    label: &[u8],
    transcript_hash: &[u8; 32],
) -> [u8; VERIFY_DATA_LENGTH] {
    let mut out = [0; VERIFY_DATA_LENGTH];
    prf(&master[..], label, &transcript_hash[..], &mut out);
    out
}
