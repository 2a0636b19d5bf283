use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use context::Session;

pub const COOKIE_LENGTH: usize = 16;
const SECRET_LENGTH: usize = 12;

/// `CookieInput` is the ClientHello material a cookie binds, borrowed
/// straight from the parsed message. Together with the client address it
/// makes the cookie useless to any other endpoint.
pub struct CookieInput<'a> {
    pub client_random: &'a [u8],
    pub version: [u8; 2],
    pub cipher_suites: &'a [u8],
    pub compression_methods: &'a [u8],
}

/// `CookieJar` holds the rotating server secret the stateless cookie
/// exchange is keyed by. Cookies are never stored; each ClientHello is
/// recomputed against the current secret, falling back to the previous
/// one for a grace window of one rotation.
pub struct CookieJar {
    secret: [u8; SECRET_LENGTH],
    previous: Option<[u8; SECRET_LENGTH]>,
    refreshed_at: Option<Instant>,
    lifetime: Duration,
}

impl CookieJar {
    pub fn new(lifetime: Duration) -> Self {
        let mut secret = [0; SECRET_LENGTH];
        rand::thread_rng().fill_bytes(&mut secret);
        CookieJar {
            secret: secret,
            previous: None,
            refreshed_at: None,
            lifetime: lifetime,
        }
    }

    // rotate swaps in a fresh secret once the current one outlived its
    // ceiling; the old secret stays valid for one more lifetime.
    fn rotate(&mut self, now: Instant) {
        match self.refreshed_at {
            None => self.refreshed_at = Some(now),
            Some(at) => {
                if now.duration_since(at) > self.lifetime {
                    let mut fresh = [0; SECRET_LENGTH];
                    rand::thread_rng().fill_bytes(&mut fresh);
                    self.previous = Some(self.secret);
                    self.secret = fresh;
                    self.refreshed_at = Some(now);
                    debug!("cookie secret rotated");
                }
            }
        }
    }

    fn compute(secret: &[u8], session: &Session, input: &CookieInput) -> [u8; COOKIE_LENGTH] {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret)
            .expect("hmac accepts keys of any length");
        mac.update(&session.canonical_bytes());
        mac.update(input.client_random);
        mac.update(&input.version);
        mac.update(input.cipher_suites);
        mac.update(input.compression_methods);

        let mut cookie = [0; COOKIE_LENGTH];
        cookie.copy_from_slice(&mac.finalize().into_bytes()[..COOKIE_LENGTH]);
        cookie
    }

    pub fn generate(&mut self, now: Instant, session: &Session, input: &CookieInput) -> [u8; COOKIE_LENGTH] {
        self.rotate(now);
        Self::compute(&self.secret, session, input)
    }

    /// `verify` recomputes the expected cookie and compares in constant
    /// time, against the current secret first and then the previous one.
    pub fn verify(&mut self, now: Instant, session: &Session, input: &CookieInput, presented: &[u8]) -> bool {
        if presented.len() != COOKIE_LENGTH {
            return false;
        }
        self.rotate(now);

        let current = Self::compute(&self.secret, session, input);
        if bool::from(current[..].ct_eq(presented)) {
            return true;
        }
        match self.previous {
            Some(ref secret) => {
                let grace = Self::compute(secret, session, input);
                bool::from(grace[..].ct_eq(presented))
            }
            None => false,
        }
    }
}

impl Drop for CookieJar {
    fn drop(&mut self) {
        self.secret.zeroize();
        if let Some(ref mut secret) = self.previous {
            secret.zeroize();
        }
    }
}
