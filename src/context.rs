use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use zeroize::Zeroize;

use codec::{Cursor, Writer};
use cookie::{CookieInput, CookieJar};
use error::{AlertDescription, AlertLevel, Error};
use machine::handshake::{
    ClientHello, HandshakeHeader, HandshakeType, HelloVerifyRequest, HANDSHAKE_HEADER_LENGTH,
};
use machine::{Peer, State};
use record::{ContentType, ProtocolVersion, RecordHeader, RECORD_HEADER_LENGTH};

/// `Session` identifies a remote endpoint: its address and port plus the
/// local interface the datagrams arrive on. Equality over the whole tuple
/// keys the peer registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Session {
    addr: SocketAddr,
    ifindex: u32,
}

impl Session {
    pub fn new(addr: SocketAddr) -> Self {
        Session {
            addr: addr,
            ifindex: 0,
        }
    }

    pub fn with_interface(addr: SocketAddr, ifindex: u32) -> Self {
        Session {
            addr: addr,
            ifindex: ifindex,
        }
    }

    pub fn address(&self) -> &SocketAddr {
        &self.addr
    }

    pub fn interface(&self) -> u32 {
        self.ifindex
    }

    // canonical_bytes is the stable byte form the cookie binds: address
    // octets, port and interface index, big-endian.
    pub(crate) fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22);
        match self.addr.ip() {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
        out.extend_from_slice(&self.addr.port().to_be_bytes());
        out.extend_from_slice(&self.ifindex.to_be_bytes());
        out
    }
}

/// `Psk` is an identity/key pair handed over by the application's key
/// store. The key is scrubbed when the value drops.
pub struct Psk {
    pub identity: Vec<u8>,
    pub key: Vec<u8>,
}

impl Psk {
    pub fn new(identity: &[u8], key: &[u8]) -> Self {
        Psk {
            identity: identity.to_vec(),
            key: key.to_vec(),
        }
    }
}

impl Drop for Psk {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// `Event` is what the engine reports through the event callback: the
/// handshake completing, a handshake giving up, or an alert closing the
/// peer. `code` flattens the event to the numeric registry: alert codes
/// stay below 256, engine events start at 256.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connected,
    HandshakeTimeout,
    Alert(AlertLevel, AlertDescription),
}

pub const EVENT_CONNECTED: u16 = 256;
pub const EVENT_HANDSHAKE_TIMEOUT: u16 = 257;

impl Event {
    pub fn code(&self) -> u16 {
        match self {
            &Event::Connected => EVENT_CONNECTED,
            &Event::HandshakeTimeout => EVENT_HANDSHAKE_TIMEOUT,
            &Event::Alert(_, description) => description as u16,
        }
    }

    // level is 0 for engine events, the alert level otherwise.
    pub fn level(&self) -> u8 {
        match self {
            &Event::Alert(level, _) => level as u8,
            _ => 0,
        }
    }
}

/// `Handler` is the capability record the application binds at context
/// creation. The engine performs no I/O of its own: datagrams leave
/// through `write`, verified plaintext arrives through `read`, and keys
/// come from `get_key`. All callbacks run synchronously on the caller's
/// stack and must not re-enter the context.
pub trait Handler {
    /// `write` transmits one datagram towards the session's endpoint.
    /// Short writes are not retried.
    fn write(&mut self, session: &Session, datagram: &[u8]) -> io::Result<usize>;

    /// `read` delivers verified application data.
    fn read(&mut self, session: &Session, data: &[u8]);

    /// `event` reports connection lifecycle notifications; the default
    /// discards them.
    fn event(&mut self, _session: &Session, _event: Event) {}

    /// `get_key` resolves PSK material. `None` asks for the local
    /// identity/key pair to present to a server; `Some` asks for the key
    /// matching an identity a client presented. A `None` result makes
    /// the engine fail the handshake with `unknown_psk_identity`.
    fn get_key(&mut self, session: &Session, identity: Option<&[u8]>) -> Option<Psk>;
}

/// `Config` collects the context-wide knobs, applied at creation.
#[derive(Debug, Clone)]
pub struct Config {
    pub version: ProtocolVersion,
    pub max_datagram: usize,
    pub cookie_lifetime: Duration,
    pub retransmit_initial: Duration,
    pub retransmit_ceiling: Duration,
    pub retransmit_limit: u8,
    pub idle_timeout: Option<Duration>,
    pub max_peers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: ProtocolVersion::Dtls12,
            max_datagram: 1400,
            cookie_lifetime: Duration::from_secs(3600),
            retransmit_initial: Duration::from_secs(1),
            retransmit_ceiling: Duration::from_secs(60),
            retransmit_limit: 7,
            idle_timeout: Some(Duration::from_secs(600)),
            max_peers: 64,
        }
    }
}

/// `Connect` is the outcome of `Context::connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connect {
    Started,
    Exists,
}

/// `Context` is the engine: it owns every peer, the cookie secret and the
/// handler, and multiplexes inbound datagrams by session. One context
/// serves both roles at once; peers created by `connect` run the client
/// handshake, peers created by a cookie-verified ClientHello run the
/// server one. Not safe for concurrent use; the application serialises
/// calls and drives time through the `now` arguments and
/// `check_retransmit`.
pub struct Context<H: Handler> {
    config: Config,
    handler: H,
    cookies: CookieJar,
    peers: HashMap<Session, Peer>,
}

impl<H: Handler> Context<H> {
    pub fn new(config: Config, handler: H) -> Self {
        let cookies = CookieJar::new(config.cookie_lifetime);
        Context {
            config: config,
            handler: handler,
            cookies: cookies,
            peers: HashMap::new(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub fn set_write_sequence(&mut self, session: &Session, sequence: u64) {
        if let Some(peer) = self.peers.get_mut(session) {
            peer.set_write_sequence(sequence);
        }
    }

    /// `state` reports the protocol state of a known session.
    pub fn state(&self, session: &Session) -> Option<State> {
        self.peers.get(session).map(Peer::state)
    }

    /// `peer_identity` is the PSK identity negotiated with a session.
    pub fn peer_identity(&self, session: &Session) -> Option<Vec<u8>> {
        self.peers
            .get(session)
            .and_then(|peer| peer.identity().map(|identity| identity.to_vec()))
    }

    /// `connect` starts a client handshake towards `session`, sending the
    /// initial ClientHello before returning.
    pub fn connect(&mut self, session: Session, now: Instant) -> Result<Connect, Error> {
        if self.peers.contains_key(&session) {
            return Ok(Connect::Exists);
        }
        if self.peers.len() >= self.config.max_peers {
            return Err(Error::ResourceExhausted);
        }
        let peer = Peer::client(session.clone(), &mut self.handler, &self.config, now);
        self.peers.insert(session, peer);
        Ok(Connect::Started)
    }

    /// `write` seals application data for a connected session and hands
    /// the datagram to the write callback.
    pub fn write(&mut self, session: &Session, data: &[u8]) -> Result<usize, Error> {
        let mut peer = self.peers.remove(session).ok_or(Error::UnknownPeer)?;
        let written = peer.write_application(&mut self.handler, &self.config, data);
        self.restore(session, peer);
        written
    }

    /// `close` starts an orderly shutdown of a session.
    pub fn close(&mut self, session: &Session, now: Instant) -> Result<(), Error> {
        let mut peer = self.peers.remove(session).ok_or(Error::UnknownPeer)?;
        peer.close(&mut self.handler, &self.config, now);
        self.restore(session, peer);
        Ok(())
    }

    /// `handle_message` feeds one received datagram into the engine. The
    /// records inside are processed in order; outbound records produced
    /// in response reach the write callback before this returns.
    /// Datagrams from unknown endpoints are only answered when they open
    /// with a ClientHello; the cookie exchange runs statelessly before
    /// any peer exists.
    pub fn handle_message(
        &mut self,
        session: &Session,
        datagram: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        if datagram.is_empty() {
            return Err(Error::BufferTooShort);
        }

        let mut peer = self.peers.remove(session);
        let mut cur = Cursor::new(datagram);
        while cur.remaining() >= RECORD_HEADER_LENGTH {
            let header = match RecordHeader::parse(&mut cur) {
                Ok(header) => header,
                Err(_) => {
                    match peer {
                        Some(ref mut peer) => peer.abort(&mut self.handler, &self.config),
                        None => trace!("unparseable record from unknown endpoint dropped"),
                    }
                    break;
                }
            };
            let payload = match cur.read_bytes(header.length as usize) {
                Ok(payload) => payload,
                Err(_) => {
                    match peer {
                        Some(ref mut peer) => peer.abort(&mut self.handler, &self.config),
                        None => trace!("truncated record from unknown endpoint dropped"),
                    }
                    break;
                }
            };
            match peer {
                Some(ref mut peer) => {
                    peer.handle_record(&mut self.handler, &self.config, now, &header, payload)
                }
                None => peer = self.stateless_client_hello(session, &header, payload, now),
            }
        }

        if let Some(peer) = peer {
            self.restore(session, peer);
        }
        Ok(())
    }

    /// `check_retransmit` is the timer tick: it fires due retransmissions
    /// with exponential backoff, expires closing peers, and evicts idle
    /// ones. The application calls this periodically with its clock.
    pub fn check_retransmit(&mut self, now: Instant) {
        let sessions: Vec<Session> = self.peers.keys().cloned().collect();
        for session in sessions {
            if let Some(mut peer) = self.peers.remove(&session) {
                peer.tick(&mut self.handler, &self.config, now);
                self.restore(&session, peer);
            }
        }
    }

    // restore puts a peer back into the registry unless it closed, in
    // which case dropping it scrubs its key material.
    fn restore(&mut self, session: &Session, peer: Peer) {
        if peer.is_closed() {
            debug!("peer destroyed");
        } else {
            self.peers.insert(session.clone(), peer);
        }
    }

    // stateless_client_hello runs the pre-peer path for an unknown
    // endpoint: anything but a complete ClientHello is dropped, a hello
    // without a valid cookie is answered statelessly, and a valid cookie
    // finally allocates the peer.
    fn stateless_client_hello(
        &mut self,
        session: &Session,
        header: &RecordHeader,
        payload: &[u8],
        now: Instant,
    ) -> Option<Peer> {
        if header.content_type != ContentType::Handshake || header.epoch != 0 {
            trace!("record from unknown endpoint dropped");
            return None;
        }
        let mut cur = Cursor::new(payload);
        let hs_header = match HandshakeHeader::parse(&mut cur) {
            Ok(header) => header,
            Err(_) => return None,
        };
        if hs_header.msg_type != HandshakeType::ClientHello || !hs_header.is_complete() {
            trace!("unknown endpoint did not open with a client hello");
            return None;
        }
        let body = match cur.read_bytes(hs_header.fragment_length as usize) {
            Ok(body) => body,
            Err(_) => return None,
        };
        let hello = match ClientHello::parse(body) {
            Ok(hello) => hello,
            Err(_) => return None,
        };

        let input = CookieInput {
            client_random: hello.random,
            version: hello.version,
            cipher_suites: hello.cipher_suites,
            compression_methods: hello.compression_methods,
        };
        if !hello.cookie.is_empty() && self.cookies.verify(now, session, &input, hello.cookie) {
            if self.peers.len() >= self.config.max_peers {
                warn!("peer table full, client hello dropped");
                return None;
            }
            Some(Peer::accept(
                session.clone(),
                &mut self.handler,
                &self.config,
                now,
                &hs_header,
                &hello,
                body,
            ))
        } else {
            let cookie = self.cookies.generate(now, session, &input);
            self.send_hello_verify(session, header, &hs_header, &cookie);
            None
        }
    }

    // send_hello_verify answers a cookie-less hello without allocating
    // anything: record sequence and message_seq echo the hello, per the
    // stateless exchange.
    fn send_hello_verify(
        &mut self,
        session: &Session,
        record: &RecordHeader,
        hello: &HandshakeHeader,
        cookie: &[u8],
    ) {
        let body = HelloVerifyRequest::encode(self.config.version.to_bytes(), cookie);
        let header =
            HandshakeHeader::complete(HandshakeType::HelloVerifyRequest, hello.message_seq, body.len() as u32);

        let mut message = Writer::with_capacity(HANDSHAKE_HEADER_LENGTH + body.len());
        header.encode(&mut message);
        message.write_bytes(&body);

        let record_header = RecordHeader {
            content_type: ContentType::Handshake,
            version: self.config.version.to_bytes(),
            epoch: 0,
            sequence: record.sequence,
            length: message.len() as u16,
        };
        let mut datagram = Writer::with_capacity(RECORD_HEADER_LENGTH + message.len());
        record_header.encode(&mut datagram);
        datagram.write_bytes(message.as_slice());

        debug!("hello verify request sent");
        if let Err(error) = self.handler.write(session, datagram.as_slice()) {
            debug!("write callback failed: {}", error);
        }
    }
}
