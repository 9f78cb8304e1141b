use std::{net::SocketAddr, sync::Arc, time::Instant};

use ahash::AHashMap;
use bytes::BytesMut;
use tokio::net::UdpSocket;

use codec::{HEADER_SIZE, MAX_PACKET_SIZE, Packet};
use service::{
    RequestAction, Reply,
    peers::{self, Transport},
};

use crate::{
    server::ProxyEnv,
    statistics::Stats,
};

/// udp server
///
/// One listener socket serves the whole client population: the reader
/// task validates, routes, and queues datagrams, while the writer
/// task drains the socket's shared reply queue back to the recorded
/// source addresses.
pub async fn listener(listen: SocketAddr, env: &Arc<ProxyEnv>, accounting: bool) -> Result<(), anyhow::Error> {
    let socket = Arc::new(UdpSocket::bind(listen).await?);
    let local_addr = socket.local_addr()?;

    // The socket is the client instance for every UDP peer behind it:
    // one shared reply queue, drained by one writer.
    let key = env.keys.next();
    let mut receiver = env.router.register(key);

    let writer = socket.clone();
    let reporter = env.statistics.get_reporter(Transport::Udp);
    tokio::spawn(async move {
        while let Some(reply) = receiver.recv().await {
            if let Err(e) = writer.send_to(&reply.bytes, reply.addr).await {
                log::warn!("udp reply send failed: to={}, err={e}", reply.addr);
            } else {
                reporter.send(&[Stats::SendBytes(reply.bytes.len()), Stats::SendPkts(1)]);
            }
        }
    });

    let env = env.clone();
    let reporter = env.statistics.get_reporter(Transport::Udp);
    tokio::spawn(async move {
        // Client instances come into being on their first datagram and
        // stay for the lifetime of the process.
        let mut clients: AHashMap<std::net::IpAddr, usize> = AHashMap::new();
        let mut buffer = BytesMut::zeroed(MAX_PACKET_SIZE);

        loop {
            let (size, address) = match socket.recv_from(&mut buffer).await {
                Ok(it) => it,
                Err(e) => {
                    log::warn!("udp receive failed: interface={local_addr}, err={e}");
                    continue;
                }
            };

            reporter.send(&[Stats::ReceivedBytes(size), Stats::ReceivedPkts(1)]);

            if size < HEADER_SIZE {
                reporter.send(&[Stats::DroppedPkts(1)]);
                continue;
            }

            let client = match clients.get(&address.ip()) {
                Some(&it) => it,
                None => {
                    match peers::find_client(env.service.clients(), Transport::Udp, address.ip(), 0)
                    {
                        Some(it) => {
                            log::info!(
                                "new udp client: source={address}, client={}",
                                env.service.clients()[it].name
                            );

                            clients.insert(address.ip(), it);
                            it
                        }
                        None => {
                            log::warn!("datagram from unknown client: source={address}");
                            reporter.send(&[Stats::DroppedPkts(1)]);
                            continue;
                        }
                    }
                }
            };

            // The declared length is authoritative; datagram bytes
            // past it are not part of the packet.
            let declared = match Packet::wire_size(&buffer[..size]) {
                Ok(it) if it <= size => it,
                _ => {
                    log::debug!("datagram with bogus length field: source={address}");
                    reporter.send(&[Stats::DroppedPkts(1)]);
                    continue;
                }
            };

            if declared < size {
                log::debug!(
                    "discarding {} trailing bytes: source={address}",
                    size - declared
                );
            }

            let mut packet = BytesMut::from(&buffer[..declared]);
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
    });

    log::info!(
        "radius proxy listening: listen={listen}, transport=UDP{}",
        if accounting { " (accounting)" } else { "" }
    );

    Ok(())
}
