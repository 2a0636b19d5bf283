use codec::{Cursor, Writer};
use error::Error;
use prf::RANDOM_LENGTH;

pub const HANDSHAKE_HEADER_LENGTH: usize = 12;
pub const MAX_COOKIE_LENGTH: usize = 32;

// the single mandatory suite, by its IANA value.
pub const CIPHER_SUITE_PSK_AES_128_CCM_8: u16 = 0xc0a8;
pub const COMPRESSION_NULL: u8 = 0;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    HelloRequest = 0,
    ClientHello = 1,
    ServerHello = 2,
    HelloVerifyRequest = 3,
    ServerHelloDone = 14,
    ClientKeyExchange = 16,
    Finished = 20,
}

impl HandshakeType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(HandshakeType::HelloRequest),
            1 => Some(HandshakeType::ClientHello),
            2 => Some(HandshakeType::ServerHello),
            3 => Some(HandshakeType::HelloVerifyRequest),
            14 => Some(HandshakeType::ServerHelloDone),
            16 => Some(HandshakeType::ClientKeyExchange),
            20 => Some(HandshakeType::Finished),
            _ => None,
        }
    }
}

/// `HandshakeHeader` is the 12-byte DTLS handshake header:
/// `msg_type(1) || length(3) || message_seq(2) || fragment_offset(3) ||
/// fragment_length(3)`.
#[derive(Debug, Clone)]
pub struct HandshakeHeader {
    pub msg_type: HandshakeType,
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

impl HandshakeHeader {
    // complete builds the header of an unfragmented message.
    pub fn complete(msg_type: HandshakeType, message_seq: u16, length: u32) -> Self {
        HandshakeHeader {
            msg_type: msg_type,
            length: length,
            message_seq: message_seq,
            fragment_offset: 0,
            fragment_length: length,
        }
    }

    pub fn parse(cur: &mut Cursor) -> Result<Self, Error> {
        let msg_type = HandshakeType::from_byte(cur.read_u8()?).ok_or(Error::BadRecord)?;
        let length = cur.read_u24()?;
        let message_seq = cur.read_u16()?;
        let fragment_offset = cur.read_u24()?;
        let fragment_length = cur.read_u24()?;

        Ok(HandshakeHeader {
            msg_type: msg_type,
            length: length,
            message_seq: message_seq,
            fragment_offset: fragment_offset,
            fragment_length: fragment_length,
        })
    }

    pub fn encode(&self, w: &mut Writer) {
        w.write_u8(self.msg_type as u8);
        w.write_u24(self.length);
        w.write_u16(self.message_seq);
        w.write_u24(self.fragment_offset);
        w.write_u24(self.fragment_length);
    }

    // is_complete tells whether the fragment spans the whole message;
    // anything else is dropped, reassembly is not supported.
    pub fn is_complete(&self) -> bool {
        self.fragment_offset == 0 && self.fragment_length == self.length
    }
}

/// `ClientHello` parses the hello body, keeping the vector fields
/// borrowed so the cookie computation can consume them verbatim.
/// Unknown trailing data (extensions) is tolerated and ignored.
pub struct ClientHello<'a> {
    pub version: [u8; 2],
    pub random: &'a [u8],
    pub session_id: &'a [u8],
    pub cookie: &'a [u8],
    pub cipher_suites: &'a [u8],
    pub compression_methods: &'a [u8],
}

impl<'a> ClientHello<'a> {
    pub fn parse(body: &'a [u8]) -> Result<Self, Error> {
        let mut cur = Cursor::new(body);
        let raw_version = cur.read_bytes(2)?;
        let mut version = [0; 2];
        version.copy_from_slice(raw_version);
        let random = cur.read_bytes(RANDOM_LENGTH)?;
        let session_id = cur.read_vec8()?;
        let cookie = cur.read_vec8()?;
        if cookie.len() > MAX_COOKIE_LENGTH {
            return Err(Error::BadRecord);
        }
        let cipher_suites = cur.read_vec16()?;
        if cipher_suites.is_empty() || cipher_suites.len() % 2 != 0 {
            return Err(Error::BadRecord);
        }
        let compression_methods = cur.read_vec8()?;
        if compression_methods.is_empty() {
            return Err(Error::BadRecord);
        }

        Ok(ClientHello {
            version: version,
            random: random,
            session_id: session_id,
            cookie: cookie,
            cipher_suites: cipher_suites,
            compression_methods: compression_methods,
        })
    }

    pub fn offers_suite(&self, suite: u16) -> bool {
        self.cipher_suites
            .chunks(2)
            .any(|pair| (pair[0] as u16) << 8 | pair[1] as u16 == suite)
    }

    pub fn offers_null_compression(&self) -> bool {
        self.compression_methods.contains(&COMPRESSION_NULL)
    }

    pub fn encode(version: [u8; 2], random: &[u8; RANDOM_LENGTH], cookie: &[u8]) -> Vec<u8> {
        let mut w = Writer::with_capacity(2 + RANDOM_LENGTH + 3 + cookie.len() + 5);
        w.write_bytes(&version);
        w.write_bytes(&random[..]);
        w.write_u8(0); // empty session id
        w.write_vec8(cookie).expect("cookie fits its length prefix");
        w.write_u16(2);
        w.write_u16(CIPHER_SUITE_PSK_AES_128_CCM_8);
        w.write_u8(1);
        w.write_u8(COMPRESSION_NULL);
        w.into_vec()
    }
}

/// `ServerHello` carries the server random and the chosen suite. The
/// session id is parsed past and discarded; resumption is not supported.
pub struct ServerHello {
    pub version: [u8; 2],
    pub random: [u8; RANDOM_LENGTH],
    pub cipher_suite: u16,
    pub compression: u8,
}

impl ServerHello {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let mut cur = Cursor::new(body);
        let raw_version = cur.read_bytes(2)?;
        let mut version = [0; 2];
        version.copy_from_slice(raw_version);
        let mut random = [0; RANDOM_LENGTH];
        random.copy_from_slice(cur.read_bytes(RANDOM_LENGTH)?);
        let _session_id = cur.read_vec8()?;
        let cipher_suite = cur.read_u16()?;
        let compression = cur.read_u8()?;

        Ok(ServerHello {
            version: version,
            random: random,
            cipher_suite: cipher_suite,
            compression: compression,
        })
    }

    pub fn encode(version: [u8; 2], random: &[u8; RANDOM_LENGTH]) -> Vec<u8> {
        let mut w = Writer::with_capacity(2 + RANDOM_LENGTH + 1 + 3);
        w.write_bytes(&version);
        w.write_bytes(&random[..]);
        w.write_u8(0); // empty session id
        w.write_u16(CIPHER_SUITE_PSK_AES_128_CCM_8);
        w.write_u8(COMPRESSION_NULL);
        w.into_vec()
    }
}

/// `HelloVerifyRequest` is the stateless cookie demand:
/// `version(2) || cookie_length(1) || cookie`.
pub struct HelloVerifyRequest<'a> {
    pub version: [u8; 2],
    pub cookie: &'a [u8],
}

impl<'a> HelloVerifyRequest<'a> {
    pub fn parse(body: &'a [u8]) -> Result<Self, Error> {
        let mut cur = Cursor::new(body);
        let raw_version = cur.read_bytes(2)?;
        let mut version = [0; 2];
        version.copy_from_slice(raw_version);
        let cookie = cur.read_vec8()?;
        if cookie.len() > MAX_COOKIE_LENGTH {
            return Err(Error::BadRecord);
        }

        Ok(HelloVerifyRequest {
            version: version,
            cookie: cookie,
        })
    }

    pub fn encode(version: [u8; 2], cookie: &[u8]) -> Vec<u8> {
        let mut w = Writer::with_capacity(3 + cookie.len());
        w.write_bytes(&version);
        w.write_vec8(cookie).expect("cookie fits its length prefix");
        w.into_vec()
    }
}

// the PSK ClientKeyExchange body is the identity as opaque<0..2^16-1>.
pub fn encode_client_key_exchange(identity: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(2 + identity.len());
    w.write_vec16(identity).expect("identity fits its length prefix");
    w.into_vec()
}

pub fn parse_client_key_exchange(body: &[u8]) -> Result<&[u8], Error> {
    let mut cur = Cursor::new(body);
    let identity = cur.read_vec16()?;
    if !cur.is_empty() {
        return Err(Error::BadRecord);
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{Cursor, Writer};

    #[test]
    fn handshake_header_round_trip() {
        let header = HandshakeHeader::complete(HandshakeType::ClientHello, 1, 58);
        assert!(header.is_complete());

        let mut w = Writer::new();
        header.encode(&mut w);
        let raw = w.into_vec();
        assert_eq!(raw.len(), HANDSHAKE_HEADER_LENGTH);

        let parsed = HandshakeHeader::parse(&mut Cursor::new(&raw)).unwrap();
        assert_eq!(parsed.msg_type, HandshakeType::ClientHello);
        assert_eq!(parsed.length, 58);
        assert_eq!(parsed.message_seq, 1);
        assert_eq!(parsed.fragment_offset, 0);
        assert_eq!(parsed.fragment_length, 58);
    }

    #[test]
    fn fragment_is_incomplete() {
        let mut header = HandshakeHeader::complete(HandshakeType::ClientHello, 0, 100);
        header.fragment_length = 60;
        assert!(!header.is_complete());
        header.fragment_length = 100;
        header.fragment_offset = 40;
        assert!(!header.is_complete());
    }

    #[test]
    fn client_hello_round_trip() {
        let random = [9u8; 32];
        let cookie = [3u8; 16];
        let body = ClientHello::encode([0xfe, 0xfd], &random, &cookie);

        let hello = ClientHello::parse(&body).unwrap();
        assert_eq!(hello.version, [0xfe, 0xfd]);
        assert_eq!(hello.random, &random[..]);
        assert_eq!(hello.session_id, b"");
        assert_eq!(hello.cookie, &cookie[..]);
        assert!(hello.offers_suite(CIPHER_SUITE_PSK_AES_128_CCM_8));
        assert!(!hello.offers_suite(0x1301));
        assert!(hello.offers_null_compression());
    }

    #[test]
    fn client_hello_rejects_oversized_cookie() {
        let random = [9u8; 32];
        let cookie = [3u8; 33];
        let body = ClientHello::encode([0xfe, 0xfd], &random, &cookie);
        assert!(ClientHello::parse(&body).is_err());
    }

    #[test]
    fn server_hello_round_trip() {
        let random = [5u8; 32];
        let body = ServerHello::encode([0xfe, 0xfd], &random);

        let hello = ServerHello::parse(&body).unwrap();
        assert_eq!(hello.version, [0xfe, 0xfd]);
        assert_eq!(hello.random, random);
        assert_eq!(hello.cipher_suite, CIPHER_SUITE_PSK_AES_128_CCM_8);
        assert_eq!(hello.compression, COMPRESSION_NULL);
    }

    #[test]
    fn hello_verify_round_trip() {
        let body = HelloVerifyRequest::encode([0xfe, 0xfd], &[7; 16]);
        let hvr = HelloVerifyRequest::parse(&body).unwrap();
        assert_eq!(hvr.version, [0xfe, 0xfd]);
        assert_eq!(hvr.cookie, &[7; 16][..]);
    }

    #[test]
    fn key_exchange_round_trip() {
        let body = encode_client_key_exchange(b"Client_identity");
        assert_eq!(parse_client_key_exchange(&body).unwrap(), b"Client_identity");

        // trailing garbage is rejected
        let mut long = body.clone();
        long.push(0);
        assert!(parse_client_key_exchange(&long).is_err());
    }
}
