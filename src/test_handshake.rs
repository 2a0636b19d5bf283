use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use codec::Cursor;
use context::{Config, Connect, Context, Event, Handler, Psk, Session};
use error::{AlertDescription, AlertLevel, Error};
use machine::handshake::{ClientHello, HandshakeHeader, HandshakeType};
use machine::State;
use record::{ContentType, RecordHeader, MAX_SEQUENCE_NUMBER};

const PSK_IDENTITY: &'static [u8] = b"Client_identity";
const PSK_KEY: &'static [u8] = b"secretPSK";

struct TestHandler {
    out: Vec<Vec<u8>>,
    reads: Vec<Vec<u8>>,
    events: Vec<Event>,
}

impl TestHandler {
    fn new() -> Self {
        TestHandler {
            out: Vec::new(),
            reads: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl Handler for TestHandler {
    fn write(&mut self, _session: &Session, datagram: &[u8]) -> io::Result<usize> {
        self.out.push(datagram.to_vec());
        Ok(datagram.len())
    }

    fn read(&mut self, _session: &Session, data: &[u8]) {
        self.reads.push(data.to_vec());
    }

    fn event(&mut self, _session: &Session, event: Event) {
        self.events.push(event);
    }

    fn get_key(&mut self, _session: &Session, identity: Option<&[u8]>) -> Option<Psk> {
        match identity {
            None => Some(Psk::new(PSK_IDENTITY, PSK_KEY)),
            Some(identity) if identity == PSK_IDENTITY => Some(Psk::new(identity, PSK_KEY)),
            Some(_) => None,
        }
    }
}

// the client addresses the server's endpoint, the server sees the
// client's; cookies bind to the latter.
fn pair() -> (Context<TestHandler>, Context<TestHandler>, Session, Session) {
    let server_addr: SocketAddr = "192.0.2.2:5684".parse().unwrap();
    let client_addr: SocketAddr = "192.0.2.1:40001".parse().unwrap();
    let client = Context::new(Config::default(), TestHandler::new());
    let server = Context::new(Config::default(), TestHandler::new());
    (client, server, Session::new(server_addr), Session::new(client_addr))
}

fn take_one(handler: &mut TestHandler) -> Vec<u8> {
    assert_eq!(handler.out.len(), 1, "expected exactly one datagram");
    handler.out.remove(0)
}

fn records(datagram: &[u8]) -> Vec<(RecordHeader, Vec<u8>)> {
    let mut cur = Cursor::new(datagram);
    let mut out = Vec::new();
    while !cur.is_empty() {
        let header = RecordHeader::parse(&mut cur).unwrap();
        let payload = cur.read_bytes(header.length as usize).unwrap().to_vec();
        out.push((header, payload));
    }
    out
}

fn handshake_message(payload: &[u8]) -> (HandshakeHeader, Vec<u8>) {
    let mut cur = Cursor::new(payload);
    let header = HandshakeHeader::parse(&mut cur).unwrap();
    let body = cur.read_bytes(header.fragment_length as usize).unwrap().to_vec();
    (header, body)
}

// shuttle queued datagrams until both sides fall quiet.
fn pump(
    client: &mut Context<TestHandler>,
    server: &mut Context<TestHandler>,
    to_server: &Session,
    from_client: &Session,
    now: Instant,
) {
    loop {
        let from_client_out: Vec<Vec<u8>> = client.handler_mut().out.drain(..).collect();
        let from_server_out: Vec<Vec<u8>> = server.handler_mut().out.drain(..).collect();
        if from_client_out.is_empty() && from_server_out.is_empty() {
            break;
        }
        for datagram in from_client_out {
            server.handle_message(from_client, &datagram, now).unwrap();
        }
        for datagram in from_server_out {
            client.handle_message(to_server, &datagram, now).unwrap();
        }
    }
}

fn establish() -> (Context<TestHandler>, Context<TestHandler>, Session, Session, Instant) {
    let now = Instant::now();
    let (mut client, mut server, to_server, from_client) = pair();
    assert_eq!(client.connect(to_server.clone(), now), Ok(Connect::Started));
    pump(&mut client, &mut server, &to_server, &from_client, now);
    assert_eq!(client.state(&to_server), Some(State::Connected));
    assert_eq!(server.state(&from_client), Some(State::Connected));
    (client, server, to_server, from_client, now)
}

#[test]
fn cookie_exchange() {
    let now = Instant::now();
    let (mut client, mut server, to_server, from_client) = pair();

    assert_eq!(client.connect(to_server.clone(), now), Ok(Connect::Started));
    let first_hello = take_one(client.handler_mut());

    // the opening hello carries an empty cookie
    let parsed = records(&first_hello);
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].0.content_type, ContentType::Handshake);
    assert_eq!(parsed[0].0.epoch, 0);
    let (hs, body) = handshake_message(&parsed[0].1);
    assert_eq!(hs.msg_type, HandshakeType::ClientHello);
    assert_eq!(hs.message_seq, 0);
    assert!(ClientHello::parse(&body).unwrap().cookie.is_empty());

    // the server answers statelessly: a 16-byte cookie, no peer
    server.handle_message(&from_client, &first_hello, now).unwrap();
    assert_eq!(server.peer_count(), 0);
    let verify = take_one(server.handler_mut());
    let parsed = records(&verify);
    assert_eq!(parsed.len(), 1);
    let (hs, body) = handshake_message(&parsed[0].1);
    assert_eq!(hs.msg_type, HandshakeType::HelloVerifyRequest);
    assert_eq!(hs.message_seq, 0);
    // body: version(2) || cookie_length(1) || cookie
    assert_eq!(body[2] as usize, 16);
    assert_eq!(body.len(), 3 + 16);
    let cookie = body[3..].to_vec();

    // the client repeats the hello, echoing the cookie
    client.handle_message(&to_server, &verify, now).unwrap();
    let second_hello = take_one(client.handler_mut());
    let parsed = records(&second_hello);
    let (hs, body) = handshake_message(&parsed[0].1);
    assert_eq!(hs.message_seq, 1);
    assert_eq!(ClientHello::parse(&body).unwrap().cookie, &cookie[..]);

    // now the server allocates the peer and proceeds
    server.handle_message(&from_client, &second_hello, now).unwrap();
    assert_eq!(server.peer_count(), 1);
    assert_eq!(server.state(&from_client), Some(State::ServerHello));

    let flight = take_one(server.handler_mut());
    let parsed = records(&flight);
    assert_eq!(parsed.len(), 2);
    let (hs, _) = handshake_message(&parsed[0].1);
    assert_eq!(hs.msg_type, HandshakeType::ServerHello);
    assert_eq!(hs.message_seq, 1);
    let (hs, _) = handshake_message(&parsed[1].1);
    assert_eq!(hs.msg_type, HandshakeType::ServerHelloDone);
    assert_eq!(hs.message_seq, 2);
}

#[test]
fn full_psk_handshake() {
    let (client, server, to_server, from_client, _) = establish();

    assert_eq!(client.handler().events, vec![Event::Connected]);
    assert_eq!(server.handler().events, vec![Event::Connected]);
    assert_eq!(Event::Connected.code(), 256);

    // the server learnt the identity the client presented
    assert_eq!(server.peer_identity(&from_client), Some(PSK_IDENTITY.to_vec()));
    assert_eq!(client.peer_identity(&to_server), Some(PSK_IDENTITY.to_vec()));
}

#[test]
fn application_echo() {
    let (mut client, mut server, to_server, from_client, now) = establish();

    assert_eq!(client.write(&to_server, b"ping"), Ok(4));
    let ping = take_one(client.handler_mut());

    // epoch 1, sequence 1: the Finished message used sequence 0
    let parsed = records(&ping);
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].0.content_type, ContentType::ApplicationData);
    assert_eq!(parsed[0].0.epoch, 1);
    assert_eq!(parsed[0].0.sequence, 1);
    // nothing of the plaintext shows on the wire
    assert!(!parsed[0].1.windows(4).any(|window| window == &b"ping"[..]));

    server.handle_message(&from_client, &ping, now).unwrap();
    assert_eq!(server.handler().reads, vec![b"ping".to_vec()]);

    assert_eq!(server.write(&from_client, b"ping"), Ok(4));
    let pong = take_one(server.handler_mut());
    let parsed = records(&pong);
    assert_eq!(parsed[0].0.epoch, 1);
    assert_eq!(parsed[0].0.sequence, 1);

    client.handle_message(&to_server, &pong, now).unwrap();
    assert_eq!(client.handler().reads, vec![b"ping".to_vec()]);
}

#[test]
fn replayed_record_is_dropped() {
    let (mut client, mut server, to_server, from_client, now) = establish();

    client.write(&to_server, b"ping").unwrap();
    let ping = take_one(client.handler_mut());

    server.handle_message(&from_client, &ping, now).unwrap();
    assert_eq!(server.handler().reads.len(), 1);

    // the identical ciphertext again: silently dropped, no event, no alert
    server.handle_message(&from_client, &ping, now).unwrap();
    assert_eq!(server.handler().reads.len(), 1);
    assert!(server.handler().out.is_empty());
    assert_eq!(server.state(&from_client), Some(State::Connected));
}

#[test]
fn flipped_tag_is_fatal() {
    let (mut client, mut server, to_server, from_client, now) = establish();

    client.write(&to_server, b"ping").unwrap();
    let mut ping = take_one(client.handler_mut());
    let last = ping.len() - 1;
    ping[last] ^= 0x01;

    server.handle_message(&from_client, &ping, now).unwrap();

    // the peer is gone and the failure was reported both ways
    assert_eq!(server.state(&from_client), None);
    assert_eq!(
        server.handler().events,
        vec![
            Event::Connected,
            Event::Alert(AlertLevel::Fatal, AlertDescription::BadRecordMac),
        ],
    );

    // the outgoing alert closes the client end too
    let alert = take_one(server.handler_mut());
    let parsed = records(&alert);
    assert_eq!(parsed[0].0.content_type, ContentType::Alert);
    client.handle_message(&to_server, &alert, now).unwrap();
    assert_eq!(client.state(&to_server), None);
    assert_eq!(
        client.handler().events,
        vec![
            Event::Connected,
            Event::Alert(AlertLevel::Fatal, AlertDescription::BadRecordMac),
        ],
    );
}

#[test]
fn sequence_exhaustion_is_fatal() {
    let (mut client, mut server, to_server, from_client, now) = establish();

    // the last valid sequence number still seals and verifies
    client.set_write_sequence(&to_server, MAX_SEQUENCE_NUMBER);
    assert_eq!(client.write(&to_server, b"ping"), Ok(4));
    let ping = take_one(client.handler_mut());
    let parsed = records(&ping);
    assert_eq!(parsed[0].0.sequence, MAX_SEQUENCE_NUMBER);
    server.handle_message(&from_client, &ping, now).unwrap();
    assert_eq!(server.handler().reads, vec![b"ping".to_vec()]);

    // one past it exhausts the epoch: the write fails, the peer closes
    // and reports internal_error
    assert_eq!(client.write(&to_server, b"ping"), Err(Error::BadRecord));
    assert_eq!(client.state(&to_server), None);
    assert!(client
        .handler()
        .events
        .contains(&Event::Alert(AlertLevel::Fatal, AlertDescription::InternalError)));
    // the exhausted epoch cannot seal the alert record itself, so
    // nothing more reaches the wire
    assert!(client.handler().out.is_empty());
}

#[test]
fn dropped_finished_is_retransmitted() {
    let now = Instant::now();
    let (mut client, mut server, to_server, from_client) = pair();

    // run the handshake by hand up to the server's final flight
    client.connect(to_server.clone(), now).unwrap();
    let hello = take_one(client.handler_mut());
    server.handle_message(&from_client, &hello, now).unwrap();
    let verify = take_one(server.handler_mut());
    client.handle_message(&to_server, &verify, now).unwrap();
    let hello = take_one(client.handler_mut());
    server.handle_message(&from_client, &hello, now).unwrap();
    let server_flight = take_one(server.handler_mut());
    client.handle_message(&to_server, &server_flight, now).unwrap();
    let client_flight = take_one(client.handler_mut());
    server.handle_message(&from_client, &client_flight, now).unwrap();

    // the server finished; its {CCS, Finished} flight gets lost
    assert_eq!(server.state(&from_client), Some(State::Connected));
    let lost = take_one(server.handler_mut());
    let lost_records = records(&lost);
    assert_eq!(lost_records.len(), 2);
    assert_eq!(lost_records[0].0.content_type, ContentType::ChangeCipherSpec);
    assert_eq!(lost_records[1].0.content_type, ContentType::Handshake);
    assert_eq!(lost_records[1].0.epoch, 1);
    assert_eq!(lost_records[1].0.sequence, 0);

    // nothing happens before the backoff expires
    server.check_retransmit(now + Duration::from_millis(500));
    assert!(server.handler().out.is_empty());

    // after a second the flight is repeated with fresh record sequence
    // numbers
    server.check_retransmit(now + Duration::from_millis(1100));
    let again = take_one(server.handler_mut());
    let again_records = records(&again);
    assert_eq!(again_records.len(), 2);
    assert_eq!(again_records[0].0.content_type, ContentType::ChangeCipherSpec);
    assert!(again_records[0].0.sequence > lost_records[0].0.sequence);
    assert_eq!(again_records[0].1, lost_records[0].1);
    assert_eq!(again_records[1].0.epoch, 1);
    assert_eq!(again_records[1].0.sequence, 1);

    // the retransmission still completes the client: same message_seq
    // under the fresh record numbers
    client
        .handle_message(&to_server, &again, now + Duration::from_millis(1100))
        .unwrap();
    assert_eq!(client.state(&to_server), Some(State::Connected));
    assert_eq!(client.handler().events, vec![Event::Connected]);
}

#[test]
fn fragmented_handshake_is_dropped() {
    let now = Instant::now();
    let (mut client, mut server, to_server, from_client) = pair();

    client.connect(to_server.clone(), now).unwrap();
    let mut hello = take_one(client.handler_mut());

    // shrink fragment_length below length: bytes 22..25 of the datagram
    // (record header 13 + handshake header offset 9)
    let body_len = hello.len() - 13 - 12;
    let short = (body_len - 1) as u32;
    hello[22] = (short >> 16) as u8;
    hello[23] = (short >> 8) as u8;
    hello[24] = short as u8;
    // keep the record length honest by trimming one byte off the tail
    let record_len = hello.len() - 13 - 1;
    hello[11] = (record_len >> 8) as u8;
    hello[12] = record_len as u8;
    hello.truncate(hello.len() - 1);

    server.handle_message(&from_client, &hello, now).unwrap();
    assert_eq!(server.peer_count(), 0);
    assert!(server.handler().out.is_empty());
}

#[test]
fn orderly_close() {
    let (mut client, mut server, to_server, from_client, now) = establish();

    client.close(&to_server, now).unwrap();
    assert_eq!(client.state(&to_server), Some(State::Closing));
    let notify = take_one(client.handler_mut());

    server.handle_message(&from_client, &notify, now).unwrap();
    assert_eq!(server.state(&from_client), None);
    assert!(server
        .handler()
        .events
        .contains(&Event::Alert(AlertLevel::Warning, AlertDescription::CloseNotify)));

    let reply = take_one(server.handler_mut());
    client.handle_message(&to_server, &reply, now).unwrap();
    assert_eq!(client.state(&to_server), None);
}

#[test]
fn idle_peers_are_evicted() {
    let (mut client, mut server, to_server, from_client, now) = establish();

    let idle = Config::default().idle_timeout.unwrap();
    let later = now + idle + Duration::from_secs(1);
    client.check_retransmit(later);
    server.check_retransmit(later);
    assert_eq!(client.state(&to_server), None);
    assert_eq!(server.state(&from_client), None);
    assert_eq!(client.peer_count(), 0);
    assert_eq!(server.peer_count(), 0);
}

#[test]
fn handshake_gives_up_eventually() {
    let now = Instant::now();
    let (mut client, _server, to_server, _from_client) = pair();

    client.connect(to_server.clone(), now).unwrap();
    client.handler_mut().out.clear();

    // fire every backoff deadline; the intervals double from 1s and the
    // attempt ceiling is 7
    let mut at = now;
    for _ in 0..16 {
        at = at + Duration::from_secs(70);
        client.check_retransmit(at);
    }
    assert_eq!(client.state(&to_server), None);
    assert!(client.handler().events.contains(&Event::HandshakeTimeout));
}

#[test]
fn api_misuse_is_reported() {
    let now = Instant::now();
    let (mut client, _server, to_server, _from_client) = pair();

    // unknown peers
    assert_eq!(client.write(&to_server, b"x"), Err(Error::UnknownPeer));
    assert_eq!(client.close(&to_server, now), Err(Error::UnknownPeer));
    assert_eq!(client.handle_message(&to_server, &[], now), Err(Error::BufferTooShort));

    // writing before the handshake finished
    client.connect(to_server.clone(), now).unwrap();
    assert_eq!(client.connect(to_server.clone(), now), Ok(Connect::Exists));
    assert_eq!(client.write(&to_server, b"x"), Err(Error::InvalidState));

    // oversized payloads
    let (mut a, mut b, to_b, from_a, _now) = establish();
    let huge = vec![0u8; Config::default().max_datagram];
    assert_eq!(a.write(&to_b, &huge), Err(Error::BufferTooShort));
    assert_eq!(b.write(&from_a, &huge), Err(Error::BufferTooShort));
}

#[test]
fn records_for_unknown_peers_are_ignored() {
    let now = Instant::now();
    let (mut client, mut server, to_server, from_client) = pair();

    // application data from nowhere: no reply, no peer
    let mut datagram = vec![23, 0xfe, 0xfd, 0, 1, 0, 0, 0, 0, 0, 0, 0, 4];
    datagram.extend_from_slice(b"junk");
    server.handle_message(&from_client, &datagram, now).unwrap();
    assert_eq!(server.peer_count(), 0);
    assert!(server.handler().out.is_empty());

    // a full handshake still works afterwards
    client.connect(to_server.clone(), now).unwrap();
    pump(&mut client, &mut server, &to_server, &from_client, now);
    assert_eq!(server.state(&from_client), Some(State::Connected));
}
