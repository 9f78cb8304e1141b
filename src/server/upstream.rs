use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use anyhow::{Context as _, Result};
use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpSocket, TcpStream, UdpSocket},
    sync::{
        Mutex,
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    },
    time::sleep,
};
use tokio_rustls::{TlsConnector, client::TlsStream, rustls::pki_types::ServerName};

use codec::{MAX_PACKET_SIZE, Packet};
use service::{
    STATUS_SERVER_PERIOD,
    peers::{Transport, unmap},
};

use crate::{
    server::{
        ProxyEnv,
        cert::{self, TlsContext},
    },
    statistics::Stats,
};

/// Bring up the per-upstream peer sessions.
///
/// UDP upstreams share one client socket per address family and are
/// demultiplexed by source address; each upstream additionally gets a
/// writer task that owns its retransmission timing and Status-Server
/// probing. TLS upstreams get a session object the writer sends
/// through, reconnecting as needed.
pub async fn start(
    env: &Arc<ProxyEnv>,
    contexts: &AHashMap<String, Arc<TlsContext>>,
    source_udp: Option<SocketAddr>,
    source_tls: Option<SocketAddr>,
) -> Result<()> {
    let servers = env.service.servers();

    let mut routes = AHashMap::new();
    for (index, server) in servers.iter().enumerate() {
        if server.transport == Transport::Udp {
            for addr in &server.addrs {
                routes.insert(SocketAddr::new(unmap(addr.ip()), addr.port()), index);
            }
        }
    }

    let routes = Arc::new(routes);

    let need_v4 = routes.keys().any(|it| it.is_ipv4());
    let need_v6 = routes.keys().any(|it| it.is_ipv6());

    let udp4 = match need_v4 {
        false => None,
        true => {
            let bind = source_udp
                .filter(|it| it.is_ipv4())
                .unwrap_or("0.0.0.0:0".parse().unwrap());
            let socket = Arc::new(UdpSocket::bind(bind).await.context("udp client socket")?);
            tokio::spawn(demux_reader(env.clone(), socket.clone(), routes.clone()));
            Some(socket)
        }
    };

    let udp6 = match need_v6 {
        false => None,
        true => {
            let bind = source_udp
                .filter(|it| it.is_ipv6())
                .unwrap_or("[::]:0".parse().unwrap());
            let socket = Arc::new(UdpSocket::bind(bind).await.context("udp client socket")?);
            tokio::spawn(demux_reader(env.clone(), socket.clone(), routes.clone()));
            Some(socket)
        }
    };

    for (index, server) in servers.iter().enumerate() {
        let target = server
            .addrs
            .first()
            .copied()
            .with_context(|| format!("server {:?} has no address", server.name))?;

        let sink = match server.transport {
            Transport::Udp => {
                let socket = match unmap(target.ip()).is_ipv4() {
                    true => udp4.clone(),
                    false => udp6.clone(),
                };

                let Some(socket) = socket else {
                    continue;
                };

                UpstreamSink::Udp { socket, target }
            }
            Transport::Tls => {
                let Some(context) = server.tls.as_ref().and_then(|it| contexts.get(it)) else {
                    continue;
                };

                let (session, sessions) = TlsSession::new(
                    env.clone(),
                    index,
                    target,
                    context.connector.clone(),
                    source_tls,
                )?;

                let session = Arc::new(session);
                tokio::spawn(reader_loop(session.clone(), sessions));
                UpstreamSink::Tls(session)
            }
        };

        tokio::spawn(writer(env.clone(), index, sink));
    }

    Ok(())
}

enum UpstreamSink {
    Udp {
        socket: Arc<UdpSocket>,
        target: SocketAddr,
    },
    Tls(Arc<TlsSession>),
}

impl UpstreamSink {
    async fn send(&self, bytes: &[u8]) -> bool {
        match self {
            Self::Udp { socket, target } => match socket.send_to(bytes, *target).await {
                Ok(_) => true,
                Err(e) => {
                    log::warn!("udp send failed: target={target}, err={e}");
                    false
                }
            },
            Self::Tls(session) => TlsSession::send(session, bytes).await,
        }
    }
}

/// One task per upstream: waits for new work or the nearest deadline,
/// then lets the request table decide what to (re)send. Emits a
/// Status-Server probe whenever the period ran out.
async fn writer(env: Arc<ProxyEnv>, index: usize, sink: UpstreamSink) {
    let waker = env.wakers[index].clone();
    let (name, transport, status_server) = {
        let server = &env.service.servers()[index];
        (server.name.clone(), server.transport, server.status_server)
    };

    let reporter = env.statistics.get_reporter(transport);
    let mut next_status = status_server.then(|| Instant::now() + STATUS_SERVER_PERIOD);

    loop {
        let now = Instant::now();

        if let Some(at) = next_status {
            if now >= at {
                env.service.make_status_request(index, now);
                next_status = Some(now + STATUS_SERVER_PERIOD);
            }
        }

        let sweep = env.service.sweep(index, now);
        for (id, bytes) in sweep.pending {
            log::debug!("sending request: server={name}, id={id}");
            if sink.send(&bytes).await {
                reporter.send(&[Stats::SendBytes(bytes.len()), Stats::SendPkts(1)]);
            }
        }

        let deadline = match (sweep.next_deadline, next_status) {
            (Some(retry), Some(status)) => Some(retry.min(status)),
            (retry, status) => retry.or(status),
        };

        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = waker.notified() => {}
                    _ = tokio::time::sleep_until(at.into()) => {}
                }
            }
            None => waker.notified().await,
        }
    }
}

/// Shared demux reader of one UDP client socket: replies from every
/// UDP upstream of this family arrive here and find their server by
/// source address.
async fn demux_reader(
    env: Arc<ProxyEnv>,
    socket: Arc<UdpSocket>,
    routes: Arc<AHashMap<SocketAddr, usize>>,
) {
    let reporter = env.statistics.get_reporter(Transport::Udp);
    let mut buffer = BytesMut::zeroed(MAX_PACKET_SIZE);

    loop {
        let (size, address) = match socket.recv_from(&mut buffer).await {
            Ok(it) => it,
            Err(e) => {
                log::warn!("udp receive failed: err={e}");
                continue;
            }
        };

        let from = SocketAddr::new(unmap(address.ip()), address.port());
        let Some(&server) = routes.get(&from) else {
            log::debug!("datagram from unknown server: source={address}");
            continue;
        };

        reporter.send(&[Stats::ReceivedBytes(size), Stats::ReceivedPkts(1)]);

        let declared = match Packet::wire_size(&buffer[..size.min(buffer.len())]) {
            Ok(it) if it <= size => it,
            _ => {
                log::debug!("reply with bogus length field: source={address}");
                continue;
            }
        };

        if declared < size {
            log::debug!("discarding {} trailing bytes: source={address}", size - declared);
        }

        let mut packet = BytesMut::from(&buffer[..declared]);
        if let Some(reply) = env.service.process_response(server, &mut packet) {
            env.router.send(reply);
        }
    }
}

/// Upstream RadSec session.
///
/// Sends block until the session is up; reconnection attempts are
/// serialized, and a task that finds someone else already reconnected
/// since its snapshot simply retries its write.
struct TlsSession {
    env: Arc<ProxyEnv>,
    index: usize,
    target: SocketAddr,
    source: Option<SocketAddr>,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    writer: Mutex<Option<WriteHalf<TlsStream<TcpStream>>>>,
    /// Established read halves on their way to the session's reader
    /// task.
    sessions: UnboundedSender<ReadHalf<TlsStream<TcpStream>>>,
    lock: Mutex<()>,
    last_connect_try: parking_lot::Mutex<Instant>,
}

impl TlsSession {
    fn new(
        env: Arc<ProxyEnv>,
        index: usize,
        target: SocketAddr,
        connector: TlsConnector,
        source: Option<SocketAddr>,
    ) -> Result<(Self, UnboundedReceiver<ReadHalf<TlsStream<TcpStream>>>)> {
        let host = env.service.servers()[index].host.clone();
        let server_name = ServerName::try_from(host)
            .with_context(|| format!("server {:?}: bad tls name", env.service.servers()[index].name))?;

        let (sessions, receiver) = unbounded_channel();

        let session = Self {
            // Far enough in the past that the first connect starts at
            // once instead of backing off.
            last_connect_try: parking_lot::Mutex::new(
                Instant::now()
                    .checked_sub(Duration::from_secs(60))
                    .unwrap_or_else(Instant::now),
            ),
            writer: Mutex::new(None),
            lock: Mutex::new(()),
            env,
            index,
            target,
            source,
            server_name,
            connector,
            sessions,
        };

        Ok((session, receiver))
    }

    fn name(&self) -> &str {
        &self.env.service.servers()[self.index].name
    }

    async fn send(session: &Arc<Self>, bytes: &[u8]) -> bool {
        loop {
            {
                let mut writer = session.writer.lock().await;
                if let Some(stream) = writer.as_mut() {
                    match stream.write_all(bytes).await {
                        Ok(()) => return true,
                        Err(e) => {
                            log::warn!("tls send failed: server={}, err={e}", session.name());
                            *writer = None;
                        }
                    }
                }
            }

            let snapshot = *session.last_connect_try.lock();
            Self::connect(session, snapshot).await;
        }
    }

    /// Serialized per server: when another task already reconnected
    /// since the caller's snapshot, there is nothing left to do.
    async fn connect(session: &Arc<Self>, since: Instant) {
        let _guard = session.lock.lock().await;
        if *session.last_connect_try.lock() > since {
            return;
        }

        loop {
            let state = session.env.service.state(session.index);
            let elapsed = session.last_connect_try.lock().elapsed();

            // Quick turnaround when the session just died or was
            // considered up, then a pause growing with the outage, up
            // to a minute.
            if state.connection_ok() || elapsed < Duration::from_secs(2) {
                sleep(Duration::from_secs(2)).await;
            } else if elapsed < Duration::from_secs(60) {
                sleep(elapsed).await;
            }

            *session.last_connect_try.lock() = Instant::now();
            state.set_connection_ok(false);

            match session.dial().await {
                Ok(stream) => {
                    let identity_ok = {
                        let server = &session.env.service.servers()[session.index];
                        stream
                            .get_ref()
                            .1
                            .peer_certificates()
                            .and_then(|it| it.first())
                            .map(|it| {
                                cert::verify_identity(
                                    it,
                                    &server.host,
                                    server.certificate_cn.as_ref(),
                                    server.certificate_uri.as_ref(),
                                )
                            })
                            .unwrap_or(false)
                    };

                    // Handshake done but the identity refused: throw
                    // the session away and keep backing off.
                    if !identity_ok {
                        log::warn!(
                            "server certificate does not match its config: server={}",
                            session.name()
                        );

                        continue;
                    }

                    let (read, write) = tokio::io::split(stream);
                    *session.writer.lock().await = Some(write);
                    state.set_connection_ok(true);

                    let _ = session.sessions.send(read);

                    log::info!(
                        "connected to server: server={}, target={}",
                        session.name(),
                        session.target
                    );

                    return;
                }
                Err(e) => {
                    log::warn!(
                        "connect failed: server={}, target={}, err={e}",
                        session.name(),
                        session.target
                    );
                }
            }
        }
    }

    async fn dial(&self) -> Result<TlsStream<TcpStream>> {
        let socket = match self.target.is_ipv4() {
            true => TcpSocket::new_v4()?,
            false => TcpSocket::new_v6()?,
        };

        if let Some(source) = self.source {
            socket.bind(source)?;
        }

        let stream = socket.connect(self.target).await?;
        stream.set_nodelay(true)?;

        Ok(self.connector.connect(self.server_name.clone(), stream).await?)
    }

}

/// The session's reader task: correlates replies for the lifetime of
/// each connection the session establishes, and drives the
/// reconnection loop when one dies, so an idle session comes back
/// without waiting for the next outbound request.
async fn reader_loop(
    session: Arc<TlsSession>,
    mut sessions: UnboundedReceiver<ReadHalf<TlsStream<TcpStream>>>,
) {
    let reporter = session.env.statistics.get_reporter(Transport::Tls);

    while let Some(mut read) = sessions.recv().await {
        loop {
            let mut header = [0u8; 4];
            if read.read_exact(&mut header).await.is_err() {
                break;
            }

            let Ok(size) = Packet::wire_size(&header) else {
                log::warn!(
                    "unframeable tls packet from server: server={}",
                    session.name()
                );

                break;
            };

            let mut packet = BytesMut::zeroed(size);
            packet[..4].copy_from_slice(&header);
            if read.read_exact(&mut packet[4..]).await.is_err() {
                break;
            }

            reporter.send(&[Stats::ReceivedBytes(size), Stats::ReceivedPkts(1)]);

            if let Some(reply) = session
                .env
                .service
                .process_response(session.index, &mut packet)
            {
                session.env.router.send(reply);
            }
        }

        *session.writer.lock().await = None;
        session.env.wakers[session.index].notify_one();

        log::info!("server connection closed: server={}", session.name());

        let snapshot = *session.last_connect_try.lock();
        TlsSession::connect(&session, snapshot).await;
    }
}
