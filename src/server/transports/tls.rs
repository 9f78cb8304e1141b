use std::{net::SocketAddr, sync::Arc, time::Instant};

use ahash::AHashMap;
use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::server::TlsStream;

use codec::{MAX_PACKET_SIZE, Packet};
use service::{
    RequestAction, Reply,
    peers::{self, Transport},
};

use crate::{
    server::{
        ProxyEnv,
        cert::{self, TlsContext},
    },
    statistics::Stats,
};

/// tls server
///
/// Accepts RadSec connections, binds each to the client config whose
/// identity rules the presented certificate satisfies, and serves it
/// with a reader and a writer task until either side ends the
/// session.
pub async fn listener(
    listen: SocketAddr,
    env: &Arc<ProxyEnv>,
    contexts: &AHashMap<String, Arc<TlsContext>>,
) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;

    let env = env.clone();
    let contexts = contexts.clone();
    tokio::spawn(async move {
        while let Ok((socket, address)) = listener.accept().await {
            let Some(first) =
                peers::find_client(env.service.clients(), Transport::Tls, address.ip(), 0)
            else {
                log::warn!("connection from unknown client: source={address}");
                continue;
            };

            let env = env.clone();
            let contexts = contexts.clone();
            tokio::spawn(async move {
                if let Err(e) = socket.set_nodelay(true) {
                    log::error!("tls socket set nodelay failed!: addr={address}, err={e}");
                }

                // Several configs may share the address; they all
                // handshake under the first one's context, then the
                // certificate decides which config the connection
                // belongs to.
                let clients = env.service.clients();
                let Some(context) = clients[first].tls.as_ref().and_then(|it| contexts.get(it))
                else {
                    return;
                };

                let Ok(stream) = context.acceptor.accept(socket).await else {
                    log::warn!("tls handshake failed: source={address}");
                    return;
                };

                let matched = {
                    let Some(peer) = stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .and_then(|it| it.first())
                    else {
                        log::warn!("tls client presented no certificate: source={address}");
                        return;
                    };

                    let mut cursor = first;
                    loop {
                        let config = &clients[cursor];
                        if cert::verify_identity(
                            peer,
                            &config.host,
                            config.certificate_cn.as_ref(),
                            config.certificate_uri.as_ref(),
                        ) {
                            break Some(cursor);
                        }

                        match peers::find_client(clients, Transport::Tls, address.ip(), cursor + 1)
                        {
                            Some(next) => cursor = next,
                            None => break None,
                        }
                    }
                };

                let Some(client) = matched else {
                    log::warn!("certificate does not match any tls client: source={address}");
                    return;
                };

                log::info!(
                    "tls client connected: source={address}, client={}, interface={local_addr}",
                    clients[client].name
                );

                serve(&env, stream, address, client).await;
            });
        }

        log::error!("tls server close: interface={local_addr}");
    });

    log::info!("radius proxy listening: listen={listen}, transport=TLS");

    Ok(())
}

async fn serve(env: &Arc<ProxyEnv>, stream: TlsStream<TcpStream>, address: SocketAddr, client: usize) {
    let key = env.keys.next();
    let mut receiver = env.router.register(key);
    let reporter = env.statistics.get_reporter(Transport::Tls);

    let (mut read, mut write) = tokio::io::split(stream);

    let writer_reporter = env.statistics.get_reporter(Transport::Tls);
    let writer = tokio::spawn(async move {
        while let Some(reply) = receiver.recv().await {
            if write.write_all(&reply.bytes).await.is_err() {
                break;
            }

            writer_reporter.send(&[Stats::SendBytes(reply.bytes.len()), Stats::SendPkts(1)]);
        }

        // The queue being closed means the instance is draining; say
        // goodbye properly.
        let _ = write.shutdown().await;
    });

    loop {
        // Length-prefixed framing: the four byte header names how
        // many bytes still belong to the packet.
        let mut header = [0u8; 4];
        if read.read_exact(&mut header).await.is_err() {
            break;
        }

        let size = match Packet::wire_size(&header) {
            Ok(it) if it <= MAX_PACKET_SIZE => it,
            _ => {
                log::warn!("unframeable tls packet, closing: source={address}");
                break;
            }
        };

        let mut packet = BytesMut::zeroed(size);
        packet[..4].copy_from_slice(&header);
        if read.read_exact(&mut packet[4..]).await.is_err() {
            break;
        }

        reporter.send(&[Stats::ReceivedBytes(size), Stats::ReceivedPkts(1)]);

        match env
            .service
            .process_request(client, key, address, Instant::now(), &mut packet)
        {
            RequestAction::Reply(bytes) => env.router.send(Reply {
                client: key,
                addr: address,
                bytes,
            }),
            RequestAction::Forward(server) => env.wakers[server].notify_one(),
            RequestAction::Drop => reporter.send(&[Stats::DroppedPkts(1)]),
        }
    }

    // Draining: close the queue (which ends the writer), clear our
    // outstanding request slots, then let the connection go.
    env.router.remove(key);
    env.service.purge_client(key);
    let _ = writer.await;

    log::info!("tls client disconnected: source={address}");
}
