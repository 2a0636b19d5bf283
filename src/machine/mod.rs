pub mod cipher_state;
pub mod handshake;

use std::time::{Duration, Instant};

use hex;
use rand;
use rand::RngCore;
use zeroize::Zeroize;

use codec::{Cursor, Writer};
use context::{Config, Event, Handler, Session};
use error::{AlertDescription, AlertLevel, Error};
use prf;
use record::{pack_sequence, RecordHeader, ContentType, MAX_SEQUENCE_NUMBER, RECORD_HEADER_LENGTH};
use replay::ReplayWindow;
use transcript::Transcript;

use self::cipher_state::{CipherState, SEAL_OVERHEAD};
use self::handshake::{
    encode_client_key_exchange, parse_client_key_exchange, ClientHello, HandshakeHeader,
    HandshakeType, HelloVerifyRequest, ServerHello, CIPHER_SUITE_PSK_AES_128_CCM_8,
    HANDSHAKE_HEADER_LENGTH,
};

// out-of-order handshake messages ahead of the expected sequence are kept
// up to this bound; anything further out is dropped and recovered by
// retransmission.
const REORDER_LIMIT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// `State` is the per-peer protocol state. The server rests in
/// `ServerHello`, `KeyExchange` and `WaitFinished` while its flights are
/// in play; the client in `ClientHello`, `WaitServerHelloDone` and
/// `WaitServerFinished`. `Finished` is the instant between verifying the
/// peer's Finished and completing the final flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    ClientHello,
    WaitServerHelloDone,
    WaitServerFinished,
    ServerHello,
    KeyExchange,
    WaitFinished,
    Finished,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    PskWithAes128Ccm8,
}

impl CipherSuite {
    pub fn id(&self) -> u16 {
        match self {
            &CipherSuite::PskWithAes128Ccm8 => CIPHER_SUITE_PSK_AES_128_CCM_8,
        }
    }
}

// SecurityParameters is one generation of connection secrets. Two of
// these live in every peer: the current set and the pending set the
// handshake fills in; the index flips when the handshake completes.
struct SecurityParameters {
    suite: CipherSuite,
    client_random: [u8; prf::RANDOM_LENGTH],
    server_random: [u8; prf::RANDOM_LENGTH],
    master_secret: [u8; prf::MASTER_SECRET_LENGTH],
    client_write_key: [u8; prf::WRITE_KEY_LENGTH],
    server_write_key: [u8; prf::WRITE_KEY_LENGTH],
    client_write_iv: [u8; prf::WRITE_IV_LENGTH],
    server_write_iv: [u8; prf::WRITE_IV_LENGTH],
}

impl SecurityParameters {
    fn empty() -> Self {
        SecurityParameters {
            suite: CipherSuite::PskWithAes128Ccm8,
            client_random: [0; prf::RANDOM_LENGTH],
            server_random: [0; prf::RANDOM_LENGTH],
            master_secret: [0; prf::MASTER_SECRET_LENGTH],
            client_write_key: [0; prf::WRITE_KEY_LENGTH],
            server_write_key: [0; prf::WRITE_KEY_LENGTH],
            client_write_iv: [0; prf::WRITE_IV_LENGTH],
            server_write_iv: [0; prf::WRITE_IV_LENGTH],
        }
    }

    fn write_cipher(&self, role: Role) -> CipherState {
        match role {
            Role::Client => CipherState::new(self.client_write_key, self.client_write_iv),
            Role::Server => CipherState::new(self.server_write_key, self.server_write_iv),
        }
    }

    fn read_cipher(&self, role: Role) -> CipherState {
        match role {
            Role::Client => CipherState::new(self.server_write_key, self.server_write_iv),
            Role::Server => CipherState::new(self.client_write_key, self.client_write_iv),
        }
    }
}

impl Drop for SecurityParameters {
    fn drop(&mut self) {
        self.client_random.zeroize();
        self.server_random.zeroize();
        self.master_secret.zeroize();
        self.client_write_key.zeroize();
        self.server_write_key.zeroize();
        self.client_write_iv.zeroize();
        self.server_write_iv.zeroize();
    }
}

// HandshakeScratch is the transient per-handshake state, dropped once the
// peer is connected or destroyed.
struct HandshakeScratch {
    out_message_seq: u16,
    next_receive_seq: u16,
    transcript: Transcript,
    cookie: Vec<u8>,
    identity: Vec<u8>,
    reorder: Vec<(HandshakeHeader, Vec<u8>)>,
    pending_next_epoch: Option<(RecordHeader, Vec<u8>)>,
}

impl HandshakeScratch {
    fn new() -> Self {
        HandshakeScratch {
            out_message_seq: 0,
            next_receive_seq: 0,
            transcript: Transcript::new(),
            cookie: Vec::new(),
            identity: Vec::new(),
            reorder: Vec::new(),
            pending_next_epoch: None,
        }
    }
}

// one record of a flight, kept as plaintext so a retransmission can be
// sealed again under fresh record sequence numbers.
#[derive(Clone)]
struct FlightRecord {
    content_type: ContentType,
    epoch: u16,
    payload: Vec<u8>,
}

struct Flight {
    records: Vec<FlightRecord>,
    sent_at: Instant,
    interval: Duration,
    attempts: u8,
}

/// `Peer` drives one remote endpoint: the handshake state machine, the
/// record protection for both directions, anti-replay, and the
/// retransmission of the last outbound flight. It performs no I/O; every
/// datagram leaves through the handler passed into each call.
pub struct Peer {
    session: Session,
    role: Role,
    state: State,
    epoch: u16,
    read_epoch: u16,
    // record sequence counters, one for epoch 0 and one for the protected
    // epoch; retransmitted epoch-0 records keep drawing from the first.
    write_seq: [u64; 2],
    params: [SecurityParameters; 2],
    current: usize,
    read_cipher: Option<CipherState>,
    write_cipher: Option<CipherState>,
    replay: ReplayWindow,
    hs: HandshakeScratch,
    retransmit: Option<Flight>,
    last_activity: Instant,
    closing_deadline: Option<Instant>,
}

impl Peer {
    fn new(session: Session, role: Role, now: Instant) -> Self {
        Peer {
            session: session,
            role: role,
            state: State::Init,
            epoch: 0,
            read_epoch: 0,
            write_seq: [0; 2],
            params: [SecurityParameters::empty(), SecurityParameters::empty()],
            current: 0,
            read_cipher: None,
            write_cipher: None,
            replay: ReplayWindow::new(),
            hs: HandshakeScratch::new(),
            retransmit: None,
            last_activity: now,
            closing_deadline: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    #[cfg(test)]
    pub fn set_write_sequence(&mut self, sequence: u64) {
        self.write_seq[1] = sequence;
    }

    /// `identity` is the PSK identity negotiated with this peer, once the
    /// key exchange saw one.
    pub fn identity(&self) -> Option<&[u8]> {
        if self.hs.identity.is_empty() {
            None
        } else {
            Some(&self.hs.identity)
        }
    }

    fn pending(&self) -> usize {
        1 - self.current
    }

    // ---- client side -------------------------------------------------

    /// `client` creates a peer and sends the initial ClientHello with an
    /// empty cookie.
    pub fn client<H: Handler>(session: Session, h: &mut H, cfg: &Config, now: Instant) -> Self {
        let mut peer = Peer::new(session, Role::Client, now);
        rand::thread_rng().fill_bytes(&mut peer.params[1].client_random);
        peer.state = State::ClientHello;
        debug!("client handshake started");
        peer.send_client_hello(h, cfg, now);
        peer
    }

    fn send_client_hello<H: Handler>(&mut self, h: &mut H, cfg: &Config, now: Instant) {
        let body = ClientHello::encode(
            cfg.version.to_bytes(),
            &self.params[self.pending()].client_random,
            &self.hs.cookie,
        );
        let message = self.handshake_message(HandshakeType::ClientHello, &body, true);
        let records = vec![FlightRecord {
            content_type: ContentType::Handshake,
            epoch: 0,
            payload: message,
        }];
        self.send_flight(h, cfg, now, records);
    }

    fn on_hello_verify<H: Handler>(&mut self, h: &mut H, cfg: &Config, now: Instant, body: &[u8]) {
        let cookie = match HelloVerifyRequest::parse(body) {
            Ok(hvr) => hvr.cookie.to_vec(),
            Err(_) => {
                self.fatal(h, cfg, AlertDescription::DecodeError);
                return;
            }
        };
        debug!("cookie received, repeating hello");
        self.hs.cookie = cookie;
        // only the cookie-bearing hello counts towards Finished
        self.hs.transcript.reset();
        self.send_client_hello(h, cfg, now);
    }

    fn on_server_hello<H: Handler>(&mut self, h: &mut H, cfg: &Config, seq: u16, body: &[u8]) {
        let hello = match ServerHello::parse(body) {
            Ok(hello) => hello,
            Err(_) => {
                self.fatal(h, cfg, AlertDescription::DecodeError);
                return;
            }
        };
        if hello.version != cfg.version.to_bytes() {
            self.fatal(h, cfg, AlertDescription::ProtocolVersion);
            return;
        }
        if hello.cipher_suite != self.params[self.pending()].suite.id()
            || hello.compression != handshake::COMPRESSION_NULL
        {
            self.fatal(h, cfg, AlertDescription::HandshakeFailure);
            return;
        }
        let pending = self.pending();
        self.params[pending].server_random = hello.random;
        self.hs.transcript.absorb(HandshakeType::ServerHello as u8, seq, body);
        self.state = State::WaitServerHelloDone;
    }

    fn on_server_hello_done<H: Handler>(
        &mut self,
        h: &mut H,
        cfg: &Config,
        now: Instant,
        seq: u16,
        body: &[u8],
    ) {
        if !body.is_empty() {
            self.fatal(h, cfg, AlertDescription::DecodeError);
            return;
        }
        self.hs.transcript.absorb(HandshakeType::ServerHelloDone as u8, seq, body);

        let psk = match h.get_key(&self.session, None) {
            Some(psk) => psk,
            None => {
                debug!("no local psk to present");
                self.fatal(h, cfg, AlertDescription::UnknownPskIdentity);
                return;
            }
        };
        self.hs.identity = psk.identity.clone();
        self.derive_keys(&psk.key);

        let exchange_body = encode_client_key_exchange(&psk.identity);
        let exchange = self.handshake_message(HandshakeType::ClientKeyExchange, &exchange_body, true);

        let verify = prf::verify_data(
            &self.params[self.pending()].master_secret,
            prf::LABEL_CLIENT_FINISHED,
            &self.hs.transcript.current(),
        );
        let finished = self.handshake_message(HandshakeType::Finished, &verify[..], true);

        let records = vec![
            FlightRecord {
                content_type: ContentType::Handshake,
                epoch: 0,
                payload: exchange,
            },
            FlightRecord {
                content_type: ContentType::ChangeCipherSpec,
                epoch: 0,
                payload: vec![1],
            },
            FlightRecord {
                content_type: ContentType::Handshake,
                epoch: 1,
                payload: finished,
            },
        ];
        self.promote_write();
        self.send_flight(h, cfg, now, records);
        self.state = State::WaitServerFinished;
    }

    fn on_server_finished<H: Handler>(&mut self, h: &mut H, cfg: &Config, seq: u16, body: &[u8]) {
        let expected = prf::verify_data(
            &self.params[self.pending()].master_secret,
            prf::LABEL_SERVER_FINISHED,
            &self.hs.transcript.current(),
        );
        if !verify_data_matches(body, &expected) {
            debug!("server finished does not verify");
            self.fatal(h, cfg, AlertDescription::DecryptError);
            return;
        }
        self.hs.transcript.absorb(HandshakeType::Finished as u8, seq, body);
        self.retransmit = None;
        self.complete(h);
    }

    // ---- server side -------------------------------------------------

    /// `accept` creates a server peer from a ClientHello whose cookie
    /// already verified, and answers with the ServerHello flight. The
    /// stateless pre-cookie exchange never reaches this point.
    pub fn accept<H: Handler>(
        session: Session,
        h: &mut H,
        cfg: &Config,
        now: Instant,
        header: &HandshakeHeader,
        hello: &ClientHello,
        body: &[u8],
    ) -> Self {
        let mut peer = Peer::new(session, Role::Server, now);
        if hello.version != cfg.version.to_bytes() {
            peer.fatal(h, cfg, AlertDescription::ProtocolVersion);
            return peer;
        }
        if !hello.offers_suite(peer.params[1].suite.id()) || !hello.offers_null_compression() {
            debug!("no common cipher suite or compression");
            peer.fatal(h, cfg, AlertDescription::HandshakeFailure);
            return peer;
        }

        peer.params[1].client_random.copy_from_slice(hello.random);
        rand::thread_rng().fill_bytes(&mut peer.params[1].server_random);

        // our message numbering continues from the hello we are answering,
        // as if the stateless verify round had kept state
        peer.hs.out_message_seq = header.message_seq;
        peer.hs.next_receive_seq = header.message_seq + 1;
        peer.hs.transcript.absorb(HandshakeType::ClientHello as u8, header.message_seq, body);

        debug!("client hello accepted, sending server hello");
        let hello_body = ServerHello::encode(cfg.version.to_bytes(), &peer.params[1].server_random);
        let server_hello = peer.handshake_message(HandshakeType::ServerHello, &hello_body, true);
        let done = peer.handshake_message(HandshakeType::ServerHelloDone, &[], true);

        let records = vec![
            FlightRecord {
                content_type: ContentType::Handshake,
                epoch: 0,
                payload: server_hello,
            },
            FlightRecord {
                content_type: ContentType::Handshake,
                epoch: 0,
                payload: done,
            },
        ];
        peer.send_flight(h, cfg, now, records);
        peer.state = State::ServerHello;
        peer
    }

    fn on_client_key_exchange<H: Handler>(&mut self, h: &mut H, cfg: &Config, seq: u16, body: &[u8]) {
        let identity = match parse_client_key_exchange(body) {
            Ok(identity) => identity.to_vec(),
            Err(_) => {
                self.fatal(h, cfg, AlertDescription::DecodeError);
                return;
            }
        };
        let psk = match h.get_key(&self.session, Some(&identity)) {
            Some(psk) => psk,
            None => {
                debug!("unknown psk identity {} presented", hex::encode(&identity));
                self.fatal(h, cfg, AlertDescription::UnknownPskIdentity);
                return;
            }
        };
        self.hs.identity = identity;
        self.hs.transcript.absorb(HandshakeType::ClientKeyExchange as u8, seq, body);
        self.derive_keys(&psk.key);
        self.state = State::KeyExchange;
    }

    fn on_client_finished<H: Handler>(
        &mut self,
        h: &mut H,
        cfg: &Config,
        now: Instant,
        seq: u16,
        body: &[u8],
    ) {
        let expected = prf::verify_data(
            &self.params[self.pending()].master_secret,
            prf::LABEL_CLIENT_FINISHED,
            &self.hs.transcript.current(),
        );
        if !verify_data_matches(body, &expected) {
            debug!("client finished does not verify");
            self.fatal(h, cfg, AlertDescription::DecryptError);
            return;
        }
        self.hs.transcript.absorb(HandshakeType::Finished as u8, seq, body);
        self.state = State::Finished;

        let verify = prf::verify_data(
            &self.params[self.pending()].master_secret,
            prf::LABEL_SERVER_FINISHED,
            &self.hs.transcript.current(),
        );
        let finished = self.handshake_message(HandshakeType::Finished, &verify[..], true);

        let records = vec![
            FlightRecord {
                content_type: ContentType::ChangeCipherSpec,
                epoch: 0,
                payload: vec![1],
            },
            FlightRecord {
                content_type: ContentType::Handshake,
                epoch: 1,
                payload: finished,
            },
        ];
        self.promote_write();
        self.send_flight(h, cfg, now, records);
        self.complete(h);
    }

    // ---- record ingress ----------------------------------------------

    /// `handle_record` feeds one record from a datagram through the
    /// replay check, the record protection and the dispatch by content
    /// type. Failures follow the propagation policy: wrong-epoch,
    /// replayed and stale records are dropped silently; everything that
    /// indicates a broken peer raises a fatal alert and closes.
    pub fn handle_record<H: Handler>(
        &mut self,
        h: &mut H,
        cfg: &Config,
        now: Instant,
        header: &RecordHeader,
        payload: &[u8],
    ) {
        if self.state == State::Closed {
            return;
        }
        self.last_activity = now;

        if header.version != cfg.version.to_bytes() {
            self.fatal(h, cfg, AlertDescription::ProtocolVersion);
            return;
        }

        if header.epoch != self.read_epoch {
            if header.epoch == self.read_epoch + 1
                && self.awaiting_peer_cipher_spec()
                && self.hs.pending_next_epoch.is_none()
            {
                trace!("holding next-epoch record until the cipher spec changes");
                self.hs.pending_next_epoch = Some((header.clone(), payload.to_vec()));
            } else {
                trace!("dropping record for epoch {} (reading {})", header.epoch, self.read_epoch);
            }
            return;
        }

        let plain;
        let body = if self.read_epoch == 0 {
            payload
        } else {
            if let Err(error) = self.replay.check(header.sequence) {
                trace!("dropping record: {}", error);
                return;
            }
            let opened = match self.read_cipher {
                Some(ref cipher) => cipher.open(header, payload),
                None => return,
            };
            match opened {
                Ok(opened) => {
                    self.replay.commit(header.sequence);
                    plain = opened;
                }
                Err(_) => {
                    debug!("record failed authentication");
                    self.fatal(h, cfg, AlertDescription::BadRecordMac);
                    return;
                }
            }
            // protected application traffic proves the final flight
            // arrived; a retransmitted Finished proves the opposite
            if self.state == State::Connected
                && (header.content_type == ContentType::ApplicationData
                    || header.content_type == ContentType::Alert)
            {
                self.retransmit = None;
            }
            &plain[..]
        };

        if self.state == State::Closing && header.content_type != ContentType::Alert {
            return;
        }

        match header.content_type {
            ContentType::ChangeCipherSpec => self.on_change_cipher_spec(body),
            ContentType::Alert => self.on_alert(h, cfg, body),
            ContentType::Handshake => self.on_handshake_record(h, cfg, now, body),
            ContentType::ApplicationData => self.on_application_data(h, cfg, body),
        }

        self.flush_pending(h, cfg, now);
    }

    // flush_pending replays the held next-epoch record once the read
    // epoch caught up with it.
    fn flush_pending<H: Handler>(&mut self, h: &mut H, cfg: &Config, now: Instant) {
        let ready = match self.hs.pending_next_epoch {
            Some((ref header, _)) => header.epoch == self.read_epoch,
            None => false,
        };
        if ready {
            if let Some((header, payload)) = self.hs.pending_next_epoch.take() {
                trace!("replaying held next-epoch record");
                self.handle_record(h, cfg, now, &header, &payload);
            }
        }
    }

    fn awaiting_peer_cipher_spec(&self) -> bool {
        match (self.role, self.state) {
            (Role::Server, State::KeyExchange) => true,
            (Role::Client, State::WaitServerFinished) => self.read_epoch == 0,
            _ => false,
        }
    }

    fn on_change_cipher_spec(&mut self, body: &[u8]) {
        if body != &[1][..] {
            debug!("malformed change cipher spec dropped");
            return;
        }
        if !self.awaiting_peer_cipher_spec() {
            // duplicates from retransmitted flights land here
            trace!("change cipher spec dropped in state {:?}", self.state);
            return;
        }
        let role = self.role;
        let pending = self.pending();
        self.read_cipher = Some(self.params[pending].read_cipher(role));
        self.read_epoch += 1;
        self.replay.reset();
        debug!("read epoch advanced to {}", self.read_epoch);
        if self.role == Role::Server {
            self.state = State::WaitFinished;
        }
    }

    fn on_alert<H: Handler>(&mut self, h: &mut H, cfg: &Config, body: &[u8]) {
        if body.len() < 2 {
            debug!("malformed alert dropped");
            return;
        }
        let level = AlertLevel::from_byte(body[0]);
        let description = AlertDescription::from_byte(body[1]);
        match (level, description) {
            (Some(AlertLevel::Warning), Some(AlertDescription::CloseNotify)) => {
                debug!("close notify received");
                if self.state != State::Closing {
                    self.send_alert(h, cfg, AlertLevel::Warning, AlertDescription::CloseNotify);
                }
                self.retransmit = None;
                self.state = State::Closed;
                h.event(
                    &self.session,
                    Event::Alert(AlertLevel::Warning, AlertDescription::CloseNotify),
                );
            }
            (Some(AlertLevel::Fatal), Some(description)) => {
                debug!("fatal alert received: {:?}", description);
                self.retransmit = None;
                self.state = State::Closed;
                h.event(&self.session, Event::Alert(AlertLevel::Fatal, description));
            }
            (Some(AlertLevel::Warning), Some(description)) => {
                debug!("warning alert ignored: {:?}", description);
            }
            _ => debug!("unknown alert dropped"),
        }
    }

    fn on_application_data<H: Handler>(&mut self, h: &mut H, cfg: &Config, body: &[u8]) {
        if self.state != State::Connected {
            self.fatal(h, cfg, AlertDescription::UnexpectedMessage);
            return;
        }
        trace!("{} bytes of application data delivered", body.len());
        h.read(&self.session, body);
    }

    // ---- handshake ingress -------------------------------------------

    // on_handshake_record walks every complete handshake message packed
    // into one record.
    fn on_handshake_record<H: Handler>(&mut self, h: &mut H, cfg: &Config, now: Instant, body: &[u8]) {
        let mut cur = Cursor::new(body);
        while cur.remaining() >= HANDSHAKE_HEADER_LENGTH {
            let header = match HandshakeHeader::parse(&mut cur) {
                Ok(header) => header,
                Err(_) => {
                    self.fatal(h, cfg, AlertDescription::DecodeError);
                    return;
                }
            };
            let fragment = match cur.read_bytes(header.fragment_length as usize) {
                Ok(fragment) => fragment,
                Err(_) => {
                    self.fatal(h, cfg, AlertDescription::DecodeError);
                    return;
                }
            };
            if !header.is_complete() {
                debug!("fragmented handshake message dropped");
                continue;
            }
            self.on_handshake_message(h, cfg, now, &header, fragment);
            if self.state == State::Closed {
                return;
            }
        }
        if !cur.is_empty() {
            debug!("{} trailing bytes after handshake messages", cur.remaining());
        }
    }

    fn on_handshake_message<H: Handler>(
        &mut self,
        h: &mut H,
        cfg: &Config,
        now: Instant,
        header: &HandshakeHeader,
        body: &[u8],
    ) {
        let seq = header.message_seq;
        if seq > self.hs.next_receive_seq {
            let distance = (seq - self.hs.next_receive_seq) as usize;
            let already_held = self.hs.reorder.iter().any(|&(ref held, _)| held.message_seq == seq);
            if distance <= REORDER_LIMIT && self.hs.reorder.len() < REORDER_LIMIT && !already_held {
                trace!("buffering early handshake message {}", seq);
                self.hs.reorder.push((header.clone(), body.to_vec()));
            } else {
                trace!("dropping early handshake message {}", seq);
            }
            // a later message is progress: the peer has our flight
            self.retransmit = None;
            return;
        }
        if seq < self.hs.next_receive_seq {
            trace!("dropping old handshake message {}", seq);
            return;
        }

        self.retransmit = None;
        self.hs.next_receive_seq = seq + 1;
        self.process_handshake(h, cfg, now, header, body);

        // drain any buffered messages that became current
        loop {
            if self.state == State::Closed {
                return;
            }
            let position = self
                .hs
                .reorder
                .iter()
                .position(|&(ref held, _)| held.message_seq == self.hs.next_receive_seq);
            match position {
                Some(position) => {
                    let (held_header, held_body) = self.hs.reorder.remove(position);
                    self.hs.next_receive_seq = held_header.message_seq + 1;
                    self.process_handshake(h, cfg, now, &held_header, &held_body);
                }
                None => break,
            }
        }
    }

    fn process_handshake<H: Handler>(
        &mut self,
        h: &mut H,
        cfg: &Config,
        now: Instant,
        header: &HandshakeHeader,
        body: &[u8],
    ) {
        let seq = header.message_seq;
        match (self.role, self.state, header.msg_type) {
            (Role::Client, State::ClientHello, HandshakeType::HelloVerifyRequest) => {
                self.on_hello_verify(h, cfg, now, body)
            }
            (Role::Client, State::ClientHello, HandshakeType::ServerHello) => {
                self.on_server_hello(h, cfg, seq, body)
            }
            (Role::Client, State::WaitServerHelloDone, HandshakeType::ServerHelloDone) => {
                self.on_server_hello_done(h, cfg, now, seq, body)
            }
            (Role::Client, State::WaitServerFinished, HandshakeType::Finished) => {
                self.on_server_finished(h, cfg, seq, body)
            }
            (Role::Server, State::ServerHello, HandshakeType::ClientKeyExchange) => {
                self.on_client_key_exchange(h, cfg, seq, body)
            }
            (Role::Server, State::WaitFinished, HandshakeType::Finished) => {
                self.on_client_finished(h, cfg, now, seq, body)
            }
            (_, _, HandshakeType::HelloRequest) => {
                debug!("hello request ignored, renegotiation unsupported");
            }
            (role, state, msg_type) => {
                debug!("unexpected {:?} in state {:?} as {:?}", msg_type, state, role);
                self.fatal(h, cfg, AlertDescription::UnexpectedMessage);
            }
        }
    }

    // ---- egress ------------------------------------------------------

    // handshake_message frames a message under the next outbound
    // message_seq, absorbing it into the transcript unless excluded.
    fn handshake_message(&mut self, msg_type: HandshakeType, body: &[u8], absorb: bool) -> Vec<u8> {
        let header = HandshakeHeader::complete(msg_type, self.hs.out_message_seq, body.len() as u32);
        self.hs.out_message_seq += 1;
        if absorb {
            self.hs.transcript.absorb(msg_type as u8, header.message_seq, body);
        }
        let mut w = Writer::with_capacity(HANDSHAKE_HEADER_LENGTH + body.len());
        header.encode(&mut w);
        w.write_bytes(body);
        w.into_vec()
    }

    fn promote_write(&mut self) {
        let role = self.role;
        let pending = self.pending();
        self.write_cipher = Some(self.params[pending].write_cipher(role));
        self.epoch += 1;
        self.write_seq[1] = 0;
        debug!("write epoch advanced to {}", self.epoch);
    }

    fn complete<H: Handler>(&mut self, h: &mut H) {
        self.current = self.pending();
        self.state = State::Connected;
        self.hs.reorder.clear();
        debug!("handshake complete");
        h.event(&self.session, Event::Connected);
    }

    fn derive_keys(&mut self, psk: &[u8]) {
        let pending = self.pending();
        let (client_random, server_random) = {
            let params = &self.params[pending];
            (params.client_random, params.server_random)
        };

        let mut premaster = prf::psk_premaster(psk);
        let mut master = prf::master_secret(&premaster, &client_random, &server_random);
        premaster.zeroize();
        let block = prf::key_block(&master, &client_random, &server_random);

        let params = &mut self.params[pending];
        params.master_secret = master;
        params.client_write_key = block.client_write_key;
        params.server_write_key = block.server_write_key;
        params.client_write_iv = block.client_write_iv;
        params.server_write_iv = block.server_write_iv;
        master.zeroize();
    }

    fn send_flight<H: Handler>(
        &mut self,
        h: &mut H,
        cfg: &Config,
        now: Instant,
        records: Vec<FlightRecord>,
    ) {
        self.transmit(h, cfg, &records);
        self.retransmit = Some(Flight {
            records: records,
            sent_at: now,
            interval: cfg.retransmit_initial,
            attempts: 0,
        });
    }

    fn transmit<H: Handler>(&mut self, h: &mut H, cfg: &Config, records: &[FlightRecord]) {
        let mut datagram: Vec<u8> = Vec::new();
        for record in records {
            let bytes = match self.seal_record(cfg, record) {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!("record could not be sealed: {}", error);
                    continue;
                }
            };
            if !datagram.is_empty() && datagram.len() + bytes.len() > cfg.max_datagram {
                self.deliver(h, &datagram);
                datagram.clear();
            }
            datagram.extend_from_slice(&bytes);
        }
        if !datagram.is_empty() {
            self.deliver(h, &datagram);
        }
    }

    fn deliver<H: Handler>(&self, h: &mut H, datagram: &[u8]) {
        if let Err(error) = h.write(&self.session, datagram) {
            debug!("write callback failed: {}", error);
        }
    }

    fn seal_record(&mut self, cfg: &Config, record: &FlightRecord) -> Result<Vec<u8>, Error> {
        let slot = if record.epoch == 0 { 0 } else { 1 };
        let sequence = self.write_seq[slot];
        if sequence > MAX_SEQUENCE_NUMBER {
            return Err(Error::BadRecord);
        }
        self.write_seq[slot] = sequence + 1;

        let version = cfg.version.to_bytes();
        let payload = if record.epoch == 0 {
            record.payload.clone()
        } else {
            let sequence_bytes = pack_sequence(record.epoch, sequence);
            match self.write_cipher {
                Some(ref cipher) => {
                    cipher.seal(&sequence_bytes, record.content_type, version, &record.payload)?
                }
                None => return Err(Error::InvalidState),
            }
        };

        let header = RecordHeader {
            content_type: record.content_type,
            version: version,
            epoch: record.epoch,
            sequence: sequence,
            length: payload.len() as u16,
        };
        let mut w = Writer::with_capacity(RECORD_HEADER_LENGTH + payload.len());
        header.encode(&mut w);
        w.write_bytes(&payload);
        Ok(w.into_vec())
    }

    fn send_alert<H: Handler>(
        &mut self,
        h: &mut H,
        cfg: &Config,
        level: AlertLevel,
        description: AlertDescription,
    ) {
        let record = FlightRecord {
            content_type: ContentType::Alert,
            epoch: self.epoch,
            payload: vec![level as u8, description as u8],
        };
        match self.seal_record(cfg, &record) {
            Ok(bytes) => self.deliver(h, &bytes),
            Err(error) => debug!("alert could not be sent: {}", error),
        }
    }

    // fatal sends the mapped alert while write keys are still around,
    // then closes the peer and reports the event.
    fn fatal<H: Handler>(&mut self, h: &mut H, cfg: &Config, description: AlertDescription) {
        debug!("fatal: {:?}", description);
        self.send_alert(h, cfg, AlertLevel::Fatal, description);
        self.retransmit = None;
        self.state = State::Closed;
        h.event(&self.session, Event::Alert(AlertLevel::Fatal, description));
    }

    /// `abort` closes the peer over a condition detected outside the
    /// record dispatch, such as an unparseable record header.
    pub fn abort<H: Handler>(&mut self, h: &mut H, cfg: &Config) {
        self.fatal(h, cfg, AlertDescription::DecodeError);
    }

    // ---- application surface -----------------------------------------

    /// `write_application` seals one datagram of application data.
    /// Returns the number of payload bytes accepted.
    pub fn write_application<H: Handler>(
        &mut self,
        h: &mut H,
        cfg: &Config,
        data: &[u8],
    ) -> Result<usize, Error> {
        if self.state != State::Connected {
            return Err(Error::InvalidState);
        }
        if data.len() + RECORD_HEADER_LENGTH + SEAL_OVERHEAD > cfg.max_datagram {
            return Err(Error::BufferTooShort);
        }
        let record = FlightRecord {
            content_type: ContentType::ApplicationData,
            epoch: self.epoch,
            payload: data.to_vec(),
        };
        match self.seal_record(cfg, &record) {
            Ok(bytes) => {
                self.deliver(h, &bytes);
                Ok(data.len())
            }
            Err(error) => {
                // sequence space exhausted under this epoch
                self.fatal(h, cfg, AlertDescription::InternalError);
                Err(error)
            }
        }
    }

    /// `close` starts an orderly shutdown: send `close_notify`, wait for
    /// the peer's own or for the deadline.
    pub fn close<H: Handler>(&mut self, h: &mut H, cfg: &Config, now: Instant) {
        match self.state {
            State::Closing | State::Closed => return,
            _ => {}
        }
        debug!("closing");
        self.send_alert(h, cfg, AlertLevel::Warning, AlertDescription::CloseNotify);
        self.retransmit = None;
        self.state = State::Closing;
        self.closing_deadline = Some(now + cfg.retransmit_initial * 2);
    }

    // ---- timers ------------------------------------------------------

    /// `tick` drives the retransmission backoff, the closing deadline and
    /// the idle eviction. Called from the application's timer.
    pub fn tick<H: Handler>(&mut self, h: &mut H, cfg: &Config, now: Instant) {
        if self.state == State::Closed {
            return;
        }
        if let Some(deadline) = self.closing_deadline {
            if now >= deadline {
                debug!("close deadline reached");
                self.state = State::Closed;
                return;
            }
        }
        if let Some(idle) = cfg.idle_timeout {
            if self.state != State::Closing && now.duration_since(self.last_activity) >= idle {
                debug!("idle peer evicted");
                self.state = State::Closed;
                return;
            }
        }

        let due = match self.retransmit {
            Some(ref flight) => now.duration_since(flight.sent_at) >= flight.interval,
            None => false,
        };
        if !due {
            return;
        }

        let exhausted = match self.retransmit {
            Some(ref flight) => flight.attempts >= cfg.retransmit_limit,
            None => false,
        };
        if exhausted {
            self.retransmit = None;
            if self.state != State::Connected {
                debug!("handshake timed out");
                self.state = State::Closed;
                h.event(&self.session, Event::HandshakeTimeout);
            }
            return;
        }

        let records = match self.retransmit {
            Some(ref mut flight) => {
                flight.attempts += 1;
                flight.sent_at = now;
                flight.interval = ::std::cmp::min(flight.interval * 2, cfg.retransmit_ceiling);
                flight.records.clone()
            }
            None => return,
        };
        debug!("retransmitting flight of {} records", records.len());
        self.transmit(h, cfg, &records);
    }
}

fn verify_data_matches(presented: &[u8], expected: &[u8; prf::VERIFY_DATA_LENGTH]) -> bool {
    use subtle::ConstantTimeEq;

    presented.len() == expected.len() && bool::from(presented.ct_eq(&expected[..]))
}
