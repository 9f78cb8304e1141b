use std::{
    net::SocketAddr,
    sync::Mutex,
    time::Instant,
};

use anyhow::Result;
use bytes::BytesMut;
use radius_proxy_service::{
    Code, ProxyHandler, RequestAction, Service, ServiceOptions,
    peers::{ClientConfig, EXACT_HOST, ServerConfig, Transport},
    realm::Realm,
};

use codec::{
    HEADER_SIZE,
    attributes::{self, MESSAGE_AUTHENTICATOR, REPLY_MESSAGE, USER_NAME, USER_PASSWORD},
    crypto,
};

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

impl Events {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.0.lock().unwrap())
    }

    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct Handler(Events);

impl ProxyHandler for Handler {
    fn on_request_forwarded(&self, _: &ClientConfig, server: &ServerConfig, username: &[u8]) {
        self.0.push(format!(
            "forwarded:{}:{}",
            server.name,
            String::from_utf8_lossy(username)
        ));
    }

    fn on_realm_refused(&self, realm: &str, _: &[u8]) {
        self.0.push(format!("refused:{realm}"));
    }

    fn on_request_expired(&self, server: &ServerConfig, _: u8) {
        self.0.push(format!("expired:{}", server.name));
    }

    fn on_status_lost(&self, server: &ServerConfig, lost: u8) {
        self.0.push(format!("lost:{}:{lost}", server.name));
    }

    fn on_status_alive(&self, server: &ServerConfig) {
        self.0.push(format!("alive:{}", server.name));
    }
}

fn client(name: &str, secret: &[u8]) -> ClientConfig {
    ClientConfig {
        name: name.to_string(),
        transport: Transport::Udp,
        host: "10.0.0.1".to_string(),
        addrs: vec!["10.0.0.1".parse().unwrap()],
        prefix_len: EXACT_HOST,
        secret: secret.to_vec(),
        tls: None,
        certificate_cn: None,
        certificate_uri: None,
        rewrite_in: None,
        rewrite_user: None,
    }
}

fn server(name: &str, secret: &[u8], port: u16) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        transport: Transport::Udp,
        host: "10.1.0.1".to_string(),
        addrs: vec![SocketAddr::new("10.1.0.1".parse().unwrap(), port)],
        secret: secret.to_vec(),
        tls: None,
        certificate_cn: None,
        certificate_uri: None,
        rewrite_out: None,
        status_server: false,
    }
}

fn realm(name: &str, pattern: &str, servers: Vec<usize>, message: Option<&str>) -> Realm {
    Realm {
        name: name.to_string(),
        pattern: Realm::compile(pattern).unwrap(),
        message: message.map(|it| it.to_string()),
        servers,
    }
}

fn access_request(id: u8, username: &[u8], password: &[u8], secret: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[Code::AccessRequest.into(), id, 0, HEADER_SIZE as u8]);
    buf.extend_from_slice(&[0x42u8; 16]);

    attributes::append(&mut buf, USER_NAME, username).unwrap();

    let mut padded = password.to_vec();
    padded.resize(16, 0);
    crypto::password_encrypt(&mut padded, secret, &[0x42u8; 16]).unwrap();
    attributes::append(&mut buf, USER_PASSWORD, &padded).unwrap();

    let range = attributes::append(&mut buf, MESSAGE_AUTHENTICATOR, &[0u8; 16]).unwrap();
    crypto::set_message_authenticator(&mut buf, secret, range, None).unwrap();

    buf
}

fn access_accept(forwarded: &[u8], secret: &[u8]) -> BytesMut {
    let mut reply = BytesMut::new();
    reply.extend_from_slice(&[Code::AccessAccept.into(), forwarded[1], 0, HEADER_SIZE as u8]);
    reply.extend_from_slice(&forwarded[4..20]);
    crypto::sign_response(&mut reply, secret);

    reply
}

const SOURCE: &str = "10.0.0.1:40000";

#[test]
fn test_udp_happy_path() -> Result<()> {
    let service = Service::new(ServiceOptions {
        clients: vec![client("nas", b"c")],
        servers: vec![server("home", b"s", 1812)],
        realms: vec![realm("example.org", "example.org", vec![0], None)],
        handler: Handler::default(),
    });

    let now = Instant::now();
    let source: SocketAddr = SOURCE.parse()?;
    let mut request = access_request(7, b"alice@example.org", b"password", b"c");

    let action = service.process_request(0, 1, source, now, &mut request);
    let RequestAction::Forward(0) = action else {
        anyhow::bail!("expected the request to be forwarded");
    };

    assert_eq!(
        service.handler().0.take(),
        vec!["forwarded:home:alice@example.org"]
    );

    // The writer wake performs the first send.
    let sweep = service.sweep(0, now);
    assert_eq!(sweep.pending.len(), 1);
    let (upstream_id, forwarded) = &sweep.pending[0];

    // The forwarded packet is re-keyed for the upstream hop: its
    // message authenticator verifies under "s" and the password
    // decrypts under "s" with the unchanged request authenticator.
    assert_eq!(forwarded[1], *upstream_id);
    let range = attributes::find(forwarded, MESSAGE_AUTHENTICATOR).unwrap();
    assert!(crypto::check_message_authenticator(forwarded, b"s", range, None));

    let range = attributes::find(forwarded, USER_PASSWORD).unwrap();
    let mut password = forwarded[range].to_vec();
    crypto::password_decrypt(&mut password, b"s", &[0x42u8; 16])?;
    assert_eq!(&password[..8], b"password");

    // The upstream answers; the reply comes back in the client's
    // frame of reference.
    let mut reply = access_accept(forwarded, b"s");
    let reply = service.process_response(0, &mut reply).unwrap();

    assert_eq!(reply.client, 1);
    assert_eq!(reply.addr, source);
    assert_eq!(reply.bytes[0], u8::from(Code::AccessAccept));
    assert_eq!(reply.bytes[1], 7);
    assert!(crypto::validate_response(&reply.bytes, b"c", &[0x42u8; 16]));

    // The slot is gone: a second copy of the same reply is
    // unsolicited.
    let mut replay = access_accept(forwarded, b"s");
    assert!(service.process_response(0, &mut replay).is_none());

    Ok(())
}

#[test]
fn test_realm_miss_with_reject_message() -> Result<()> {
    let service = Service::new(ServiceOptions {
        clients: vec![client("nas", b"c")],
        servers: vec![],
        realms: vec![realm("default", "*", vec![], Some("no route"))],
        handler: Handler::default(),
    });

    let mut request = access_request(9, b"bob@nowhere", b"x", b"c");
    let action = service.process_request(0, 1, SOURCE.parse()?, Instant::now(), &mut request);

    let RequestAction::Reply(reply) = action else {
        anyhow::bail!("expected a direct reject");
    };

    assert_eq!(reply[0], u8::from(Code::AccessReject));
    assert_eq!(reply[1], 9);
    assert!(crypto::validate_response(&reply, b"c", &[0x42u8; 16]));

    let range = attributes::find(&reply, REPLY_MESSAGE).unwrap();
    assert_eq!(&reply[range], b"no route");

    let range = attributes::find(&reply, MESSAGE_AUTHENTICATOR).unwrap();
    assert!(crypto::check_message_authenticator(
        &reply,
        b"c",
        range,
        Some(&[0x42u8; 16])
    ));

    assert_eq!(service.handler().0.take(), vec!["refused:default"]);

    Ok(())
}

#[test]
fn test_unknown_realm_is_dropped() -> Result<()> {
    let service = Service::new(ServiceOptions {
        clients: vec![client("nas", b"c")],
        servers: vec![server("home", b"s", 1812)],
        realms: vec![realm("example.org", "example.org", vec![0], None)],
        handler: Handler::default(),
    });

    let mut request = access_request(1, b"bob@nowhere", b"x", b"c");
    let action = service.process_request(0, 1, SOURCE.parse()?, Instant::now(), &mut request);
    assert!(matches!(action, RequestAction::Drop));

    Ok(())
}

#[test]
fn test_retransmit_until_expiry() -> Result<()> {
    let service = Service::new(ServiceOptions {
        clients: vec![client("nas", b"c")],
        servers: vec![server("home", b"s", 1812)],
        realms: vec![realm("example.org", "example.org", vec![0], None)],
        handler: Handler::default(),
    });

    let now = Instant::now();
    let mut request = access_request(7, b"alice@example.org", b"pw", b"c");
    service.process_request(0, 1, SOURCE.parse()?, now, &mut request);
    service.handler().0.take();

    let interval = radius_proxy_service::REQUEST_EXPIRY / radius_proxy_service::REQUEST_RETRIES as u32;

    let mut clock = now;
    for _ in 0..radius_proxy_service::REQUEST_RETRIES {
        let sweep = service.sweep(0, clock);
        assert_eq!(sweep.pending.len(), 1);
        assert!(sweep.next_deadline.is_some());
        clock += interval;
    }

    let sweep = service.sweep(0, clock);
    assert!(sweep.pending.is_empty());
    assert_eq!(service.handler().0.take(), vec!["expired:home"]);

    Ok(())
}

#[test]
fn test_duplicate_suppression() -> Result<()> {
    let service = Service::new(ServiceOptions {
        clients: vec![client("nas", b"c")],
        servers: vec![server("home", b"s", 1812)],
        realms: vec![realm("example.org", "example.org", vec![0], None)],
        handler: Handler::default(),
    });

    let now = Instant::now();
    let source: SocketAddr = SOURCE.parse()?;

    let mut first = access_request(7, b"alice@example.org", b"pw", b"c");
    assert!(matches!(
        service.process_request(0, 1, source, now, &mut first),
        RequestAction::Forward(0)
    ));

    let mut second = access_request(7, b"alice@example.org", b"pw", b"c");
    assert!(matches!(
        service.process_request(0, 1, source, now, &mut second),
        RequestAction::Drop
    ));

    // One slot, one upstream packet.
    assert_eq!(service.sweep(0, now).pending.len(), 1);

    // The same id from a different source address is a different
    // request, not a duplicate.
    let mut third = access_request(7, b"alice@example.org", b"pw", b"c");
    assert!(matches!(
        service.process_request(0, 1, "10.0.0.1:40001".parse()?, now, &mut third),
        RequestAction::Forward(0)
    ));

    Ok(())
}

#[test]
fn test_status_probe_deadness_and_failover() -> Result<()> {
    let service = Service::new(ServiceOptions {
        clients: vec![client("nas", b"c")],
        servers: vec![server("primary", b"s1", 1812), server("fallback", b"s2", 1812)],
        realms: vec![realm("example.org", "example.org", vec![0, 1], None)],
        handler: Handler::default(),
    });

    // Both healthy: the first configured server wins.
    assert_eq!(service.select_server(&service.realms()[0]), Some(0));

    // A probe goes out and nothing comes back.
    let now = Instant::now();
    assert!(service.make_status_request(0, now));

    let sweep = service.sweep(0, now);
    assert_eq!(sweep.pending.len(), 1);
    let (_, probe) = &sweep.pending[0];
    assert_eq!(probe[0], u8::from(Code::StatusServer));
    let range = attributes::find(probe, MESSAGE_AUTHENTICATOR).unwrap();
    assert!(crypto::check_message_authenticator(probe, b"s1", range, None));

    service.sweep(0, now + radius_proxy_service::REQUEST_EXPIRY);
    assert_eq!(service.handler().0.take(), vec!["lost:primary:1"]);
    assert_eq!(service.state(0).lost_status(), 1);

    // Routing now prefers the untainted fallback.
    assert_eq!(service.select_server(&service.realms()[0]), Some(1));

    // An answered probe clears the strike and is never forwarded.
    assert!(service.make_status_request(0, now));
    let sweep = service.sweep(0, now);
    let (_, probe) = &sweep.pending[0];

    let mut reply = access_accept(probe, b"s1");
    assert!(service.process_response(0, &mut reply).is_none());
    assert_eq!(service.state(0).lost_status(), 0);
    assert_eq!(service.handler().0.take(), vec!["alive:primary"]);
    assert_eq!(service.select_server(&service.realms()[0]), Some(0));

    Ok(())
}

#[test]
fn test_status_server_answered_locally() -> Result<()> {
    let service = Service::new(ServiceOptions {
        clients: vec![client("nas", b"c")],
        servers: vec![server("home", b"s", 1812)],
        realms: vec![realm("example.org", "example.org", vec![0], None)],
        handler: Handler::default(),
    });

    let mut probe = BytesMut::new();
    probe.extend_from_slice(&[Code::StatusServer.into(), 3, 0, HEADER_SIZE as u8]);
    probe.extend_from_slice(&[0x11u8; 16]);
    let range = attributes::append(&mut probe, MESSAGE_AUTHENTICATOR, &[0u8; 16]).unwrap();
    crypto::set_message_authenticator(&mut probe, b"c", range, None).unwrap();

    let action = service.process_request(0, 1, SOURCE.parse()?, Instant::now(), &mut probe);
    let RequestAction::Reply(reply) = action else {
        anyhow::bail!("expected a local status answer");
    };

    assert_eq!(reply[0], u8::from(Code::AccessAccept));
    assert_eq!(reply[1], 3);
    assert!(crypto::validate_response(&reply, b"c", &[0x11u8; 16]));

    let range = attributes::find(&reply, MESSAGE_AUTHENTICATOR).unwrap();
    assert!(crypto::check_message_authenticator(
        &reply,
        b"c",
        range,
        Some(&[0x11u8; 16])
    ));

    Ok(())
}

#[test]
fn test_bad_reply_authenticator_keeps_slot() -> Result<()> {
    let service = Service::new(ServiceOptions {
        clients: vec![client("nas", b"c")],
        servers: vec![server("home", b"s", 1812)],
        realms: vec![realm("example.org", "example.org", vec![0], None)],
        handler: Handler::default(),
    });

    let now = Instant::now();
    let mut request = access_request(7, b"alice@example.org", b"pw", b"c");
    service.process_request(0, 1, SOURCE.parse()?, now, &mut request);

    let sweep = service.sweep(0, now);
    let (_, forwarded) = &sweep.pending[0];

    // A forged reply bounces off without consuming the slot.
    let mut forged = access_accept(forwarded, b"wrong");
    assert!(service.process_response(0, &mut forged).is_none());

    // The genuine reply still lands.
    let mut genuine = access_accept(forwarded, b"s");
    assert!(service.process_response(0, &mut genuine).is_some());

    Ok(())
}

#[test]
fn test_username_rewrite_roundtrip() -> Result<()> {
    let mut nas = client("nas", b"c");
    nas.rewrite_user = Some(radius_proxy_service::rewrite::UserRewrite {
        pattern: regex::bytes::RegexBuilder::new("^([^@]+)@example\\.com$")
            .case_insensitive(true)
            .build()?,
        replacement: b"${1}@example.org".to_vec(),
    });

    let service = Service::new(ServiceOptions {
        clients: vec![nas],
        servers: vec![server("home", b"s", 1812)],
        realms: vec![realm("example.org", "example.org", vec![0], None)],
        handler: Handler::default(),
    });

    let now = Instant::now();
    let mut request = access_request(7, b"alice@example.com", b"pw", b"c");
    let action = service.process_request(0, 1, SOURCE.parse()?, now, &mut request);
    assert!(matches!(action, RequestAction::Forward(0)));

    // Routing and forwarding saw the rewritten name.
    let sweep = service.sweep(0, now);
    let (_, forwarded) = &sweep.pending[0];
    let range = attributes::find(forwarded, USER_NAME).unwrap();
    assert_eq!(&forwarded[range], b"alice@example.org");

    // The reply carries the rewritten name; the client gets back
    // exactly what it sent.
    let mut reply = BytesMut::new();
    reply.extend_from_slice(&[Code::AccessAccept.into(), forwarded[1], 0, HEADER_SIZE as u8]);
    reply.extend_from_slice(&forwarded[4..20]);
    attributes::append(&mut reply, USER_NAME, b"alice@example.org").unwrap();
    crypto::sign_response(&mut reply, b"s");

    let reply = service.process_response(0, &mut reply).unwrap();
    let range = attributes::find(&reply.bytes, USER_NAME).unwrap();
    assert_eq!(&reply.bytes[range], b"alice@example.com");
    assert!(crypto::validate_response(&reply.bytes, b"c", &[0x42u8; 16]));

    Ok(())
}

#[test]
fn test_purged_client_reply_is_dropped() -> Result<()> {
    let service = Service::new(ServiceOptions {
        clients: vec![client("nas", b"c")],
        servers: vec![server("home", b"s", 1812)],
        realms: vec![realm("example.org", "example.org", vec![0], None)],
        handler: Handler::default(),
    });

    let now = Instant::now();
    let mut request = access_request(7, b"alice@example.org", b"pw", b"c");
    service.process_request(0, 1, SOURCE.parse()?, now, &mut request);

    let sweep = service.sweep(0, now);
    let (_, forwarded) = &sweep.pending[0];
    let mut reply = access_accept(forwarded, b"s");

    // The TLS connection behind client key 1 went away.
    service.purge_client(1);

    assert!(service.process_response(0, &mut reply).is_none());

    Ok(())
}
