use std::{net::SocketAddr, time::Instant};

use bytes::{Bytes, BytesMut};
use codec::{
    AUTHENTICATOR_RANGE, Attributes, Code, HEADER_SIZE, Packet,
    attributes::{
        self, MESSAGE_AUTHENTICATOR, MS_MPPE_RECV_KEY, MS_MPPE_SEND_KEY, REPLY_MESSAGE,
        TUNNEL_PASSWORD, USER_NAME, USER_PASSWORD, VENDOR_MICROSOFT, VENDOR_SPECIFIC,
    },
    crypto,
};

use crate::{
    ProxyHandler, Service,
    peers::Transport,
    request::{ClientKey, REQUEST_EXPIRY, REQUEST_RETRIES, RequestOrigin},
};

/// What the transport should do with an inbound request.
pub enum RequestAction {
    /// Answer the sender directly with these bytes.
    Reply(Bytes),
    /// Queued to the given upstream, wake its writer.
    Forward(usize),
    /// Unroutable or unauthentic, forget it. Never answered.
    Drop,
}

/// A packet on its way back to a client instance.
pub struct Reply {
    pub client: ClientKey,
    /// Where the original datagram came from; UDP replies go back
    /// there.
    pub addr: SocketAddr,
    pub bytes: Bytes,
}

/// Retransmission work for one upstream writer wake.
pub struct Sweep {
    pub pending: Vec<(u8, Bytes)>,
    pub next_deadline: Option<Instant>,
}

impl<H> Service<H>
where
    H: ProxyHandler,
{
    /// The inbound half of the proxy: validate, rewrite, route, park
    /// in the upstream's request table, and re-encrypt everything the
    /// next hop must be able to read.
    pub fn process_request(
        &self,
        client: usize,
        key: ClientKey,
        source: SocketAddr,
        now: Instant,
        buf: &mut BytesMut,
    ) -> RequestAction {
        let config = &self.clients()[client];

        let (code, origid, authenticator) = {
            let mut cache = Attributes::default();
            let packet = match Packet::decode(buf, &mut cache) {
                Ok(it) => it,
                Err(e) => {
                    log::debug!("dropping malformed request: source={source}, err={e}");
                    return RequestAction::Drop;
                }
            };

            if packet.odd_trailer() {
                log::warn!("request with stray trailing byte: source={source}");
            }

            (packet.code(), packet.id(), packet.authenticator())
        };

        if !code.is_request() {
            log::debug!("dropping non-request code from client: source={source}, code={code:?}");
            return RequestAction::Drop;
        }

        if code == Code::AccountingRequest
            && !crypto::validate_accounting_request(buf, &config.secret)
        {
            log::warn!("accounting request with bad signature: source={source}");
            return RequestAction::Drop;
        }

        if let Some(range) = attributes::find(buf, MESSAGE_AUTHENTICATOR) {
            if !crypto::check_message_authenticator(buf, &config.secret, range, None) {
                log::warn!("request with bad message authenticator: source={source}");
                return RequestAction::Drop;
            }
        }

        // Status-Server terminates here; it has no User-Name to route
        // on and exists to probe us, not anything behind us.
        if code == Code::StatusServer {
            return match status_reply(origid, &authenticator, &config.secret) {
                Some(bytes) => RequestAction::Reply(bytes),
                None => RequestAction::Drop,
            };
        }

        if let Some(rewrite) = &config.rewrite_in {
            rewrite.apply(buf);
        }

        let original_username = match &config.rewrite_user {
            Some(rewrite) => rewrite.apply(buf),
            None => None,
        };

        let Some(range) = attributes::find(buf, USER_NAME) else {
            log::debug!("request without a username: source={source}");
            return RequestAction::Drop;
        };

        let username = buf[range].to_vec();

        let Some(realm) = self.route(&username) else {
            self.handler().on_route_missing(&username);
            log::info!(
                "no realm for user, dropping: source={source}, username={:?}",
                String::from_utf8_lossy(&username)
            );

            return RequestAction::Drop;
        };

        let Some(server) = self.select_server(realm) else {
            if code == Code::AccessRequest {
                if let Some(message) = &realm.message {
                    self.handler().on_realm_refused(&realm.name, &username);
                    return match reject_reply(buf, origid, &authenticator, message, &config.secret)
                    {
                        Some(bytes) => RequestAction::Reply(bytes),
                        None => RequestAction::Drop,
                    };
                }
            }

            log::info!(
                "realm has nowhere to forward to, dropping: realm={}, source={source}",
                realm.name
            );

            return RequestAction::Drop;
        };

        let server_config = &self.servers()[server];
        let state = self.state(server);

        let mut table = state.table().lock();
        if table.contains(key, source, origid) {
            log::debug!("duplicate request, already in flight: source={source}, id={origid}");
            return RequestAction::Drop;
        }

        let Some(id) = table.free_id() else {
            log::warn!(
                "request table full, dropping: server={}, source={source}",
                server_config.name
            );

            return RequestAction::Drop;
        };

        buf[1] = id;

        // Re-encrypt the hop-confidential attributes under the
        // upstream secret. The request authenticator stays as the
        // client chose it, so both keystreams hang off the same seed.
        for kind in [USER_PASSWORD, TUNNEL_PASSWORD] {
            if let Some(range) = attributes::find(buf, kind) {
                if let Err(e) = crypto::password_recrypt(
                    &mut buf[range],
                    &config.secret,
                    &server_config.secret,
                    &authenticator,
                ) {
                    log::warn!("unable to re-encrypt password attribute: source={source}, err={e}");
                    return RequestAction::Drop;
                }
            }
        }

        if code == Code::AccountingRequest {
            // The accounting authenticator is a signature over the
            // packet with the field zeroed, and the message
            // authenticator digest wants exactly those zeros.
            buf[AUTHENTICATOR_RANGE].fill(0);
            if let Some(range) = attributes::find(buf, MESSAGE_AUTHENTICATOR) {
                let _ = crypto::set_message_authenticator(buf, &server_config.secret, range, None);
            }

            crypto::sign_accounting_request(buf, &server_config.secret);
        } else if let Some(range) = attributes::find(buf, MESSAGE_AUTHENTICATOR) {
            let _ = crypto::set_message_authenticator(buf, &server_config.secret, range, None);
        }

        let (max_tries, interval) = retry_schedule(server_config.transport, false);
        table.insert(
            id,
            Some(RequestOrigin {
                client,
                key,
                source,
                id: origid,
                authenticator,
                username: original_username,
            }),
            false,
            Bytes::copy_from_slice(buf),
            now,
            max_tries,
            interval,
        );

        drop(table);

        self.handler()
            .on_request_forwarded(config, server_config, &username);

        RequestAction::Forward(server)
    }

    /// The outbound half: correlate a reply with its slot, check its
    /// integrity, undo every transformation the request suffered, and
    /// hand it back towards the originating client.
    pub fn process_response(&self, server: usize, buf: &mut BytesMut) -> Option<Reply> {
        let server_config = &self.servers()[server];

        let code = {
            let mut cache = Attributes::default();
            let packet = match Packet::decode(buf, &mut cache) {
                Ok(it) => it,
                Err(e) => {
                    log::debug!(
                        "dropping malformed reply: server={}, err={e}",
                        server_config.name
                    );

                    return None;
                }
            };

            if packet.odd_trailer() {
                log::warn!("reply with stray trailing byte: server={}", server_config.name);
            }

            packet.code()
        };

        if !code.is_response() {
            log::debug!(
                "dropping non-response code from server: server={}, code={code:?}",
                server_config.name
            );

            return None;
        }

        let id = buf[1];
        let state = self.state(server);

        let (origin, status, sent_authenticator) = {
            let mut table = state.table().lock();

            let Some(sent_authenticator) = table.sent_authenticator(id) else {
                log::debug!(
                    "unsolicited or already answered reply: server={}, id={id}",
                    server_config.name
                );

                return None;
            };

            if !crypto::validate_response(buf, &server_config.secret, &sent_authenticator) {
                log::warn!(
                    "reply with bad authenticator: server={}, id={id}",
                    server_config.name
                );

                return None;
            }

            if let Some(range) = attributes::find(buf, MESSAGE_AUTHENTICATOR) {
                if !crypto::check_message_authenticator(
                    buf,
                    &server_config.secret,
                    range,
                    Some(&sent_authenticator),
                ) {
                    log::warn!(
                        "reply with bad message authenticator: server={}, id={id}",
                        server_config.name
                    );

                    return None;
                }
            }

            let (origin, status) = table.complete(id)?;
            (origin, status, sent_authenticator)
        };

        // Any authentic reply proves the upstream is alive.
        state.set_connection_ok(true);
        if state.clear_lost_status() > 0 {
            self.handler().on_status_alive(server_config);
        }

        // Probe answers update liveness and go no further.
        if status {
            return None;
        }

        let Some(origin) = origin else {
            log::debug!(
                "reply for a departed client, dropping: server={}, id={id}",
                server_config.name
            );

            return None;
        };

        let client_config = &self.clients()[origin.client];

        if let Some(rewrite) = &server_config.rewrite_out {
            rewrite.apply(buf);
        }

        if let Err(e) = recrypt_mppe_keys(
            buf,
            &server_config.secret,
            &sent_authenticator,
            &client_config.secret,
            &origin.authenticator,
        ) {
            log::warn!(
                "unable to re-encrypt key attributes, dropping reply: server={}, err={e}",
                server_config.name
            );

            return None;
        }

        if let Some(username) = &origin.username {
            if let Some(range) = attributes::find(buf, USER_NAME) {
                if let Err(e) = attributes::resize(buf, range, username) {
                    log::warn!("unable to restore original username: err={e}");
                    return None;
                }
            }
        }

        // Put the packet back into the client's frame of reference:
        // its id, its request authenticator, its shared secret.
        buf[1] = origin.id;
        buf[AUTHENTICATOR_RANGE].copy_from_slice(&origin.authenticator);

        if let Some(range) = attributes::find(buf, MESSAGE_AUTHENTICATOR) {
            if crypto::set_message_authenticator(buf, &client_config.secret, range, None).is_err() {
                return None;
            }
        }

        crypto::sign_response(buf, &client_config.secret);

        self.handler().on_reply_forwarded(server_config, code);

        Some(Reply {
            client: origin.key,
            addr: origin.source,
            bytes: Bytes::copy_from_slice(buf),
        })
    }

    /// One writer wake: recycle, retransmit, expire, and report the
    /// nearest deadline. Liveness bookkeeping for lost probes happens
    /// here because only the sweep notices them.
    pub fn sweep(&self, server: usize, now: Instant) -> Sweep {
        let server_config = &self.servers()[server];
        let state = self.state(server);

        let outcome = state.table().lock().sweep(now);

        for (id, status) in outcome.expired {
            if status {
                let lost = state.bump_lost_status();
                self.handler().on_status_lost(server_config, lost);
            } else {
                self.handler().on_request_expired(server_config, id);
            }
        }

        Sweep {
            pending: outcome.pending,
            next_deadline: outcome.next_deadline,
        }
    }

    /// Park a synthesized Status-Server probe in the table; the next
    /// sweep sends it. Returns false when no slot is free.
    pub fn make_status_request(&self, server: usize, now: Instant) -> bool {
        let config = &self.servers()[server];

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 18);
        buf.extend_from_slice(&[Code::StatusServer.into(), 0, 0, HEADER_SIZE as u8]);

        let authenticator: [u8; 16] = rand::random();
        buf.extend_from_slice(&authenticator);

        let Ok(range) = attributes::append(&mut buf, MESSAGE_AUTHENTICATOR, &[0u8; 16]) else {
            return false;
        };

        let mut table = self.state(server).table().lock();
        let Some(id) = table.free_id() else {
            log::warn!("request table full, skipping status probe: server={}", config.name);
            return false;
        };

        buf[1] = id;
        if crypto::set_message_authenticator(&mut buf, &config.secret, range, None).is_err() {
            return false;
        }

        let (_, interval) = retry_schedule(config.transport, true);
        table.insert(id, None, true, buf.freeze(), now, 1, interval);

        true
    }

    /// A client instance went away: null out its slot back references
    /// across every upstream so late replies die quietly.
    pub fn purge_client(&self, key: ClientKey) {
        for index in 0..self.servers().len() {
            let purged = self.state(index).table().lock().purge_client(key);
            if purged > 0 {
                log::debug!(
                    "cleared requests of departed client: server={}, count={purged}",
                    self.servers()[index].name
                );
            }
        }
    }
}

/// Per-transport retry schedule. Stream upstreams get one try over
/// the whole window, datagram upstreams split it across retries, and
/// probes never retry.
fn retry_schedule(transport: Transport, status: bool) -> (u8, std::time::Duration) {
    let interval = match transport {
        Transport::Udp => REQUEST_EXPIRY / REQUEST_RETRIES as u32,
        Transport::Tls => REQUEST_EXPIRY,
    };

    let max_tries = match (status, transport) {
        (true, _) => 1,
        (_, Transport::Tls) => 1,
        (_, Transport::Udp) => REQUEST_RETRIES,
    };

    (max_tries, interval)
}

/// Signed Access-Accept for a Status-Server probe aimed at us.
fn status_reply(id: u8, authenticator: &[u8; 16], secret: &[u8]) -> Option<Bytes> {
    let mut reply = BytesMut::with_capacity(HEADER_SIZE + 18);
    reply.extend_from_slice(&[Code::AccessAccept.into(), id, 0, HEADER_SIZE as u8]);
    reply.extend_from_slice(authenticator);

    let range = attributes::append(&mut reply, MESSAGE_AUTHENTICATOR, &[0u8; 16]).ok()?;
    crypto::set_message_authenticator(&mut reply, secret, range, None).ok()?;
    crypto::sign_response(&mut reply, secret);

    Some(reply.freeze())
}

/// Signed Access-Reject carrying the realm's reject text.
fn reject_reply(
    request: &[u8],
    id: u8,
    authenticator: &[u8; 16],
    message: &str,
    secret: &[u8],
) -> Option<Bytes> {
    let mut reply = BytesMut::with_capacity(HEADER_SIZE + 2 + message.len());
    reply.extend_from_slice(&[Code::AccessReject.into(), id, 0, HEADER_SIZE as u8]);
    reply.extend_from_slice(authenticator);

    attributes::append(&mut reply, REPLY_MESSAGE, message.as_bytes()).ok()?;

    // Mirror a Message-Authenticator when the request carried one.
    if attributes::find(request, MESSAGE_AUTHENTICATOR).is_some() {
        let range = attributes::append(&mut reply, MESSAGE_AUTHENTICATOR, &[0u8; 16]).ok()?;
        crypto::set_message_authenticator(&mut reply, secret, range, None).ok()?;
    }

    crypto::sign_response(&mut reply, secret);

    Some(reply.freeze())
}

/// Walk every Microsoft vendor attribute and re-wrap the MPPE session
/// keys for the next hop. Broken vendor payloads are left alone.
fn recrypt_mppe_keys(
    buf: &mut BytesMut,
    old_secret: &[u8],
    old_authenticator: &[u8; 16],
    new_secret: &[u8],
    new_authenticator: &[u8; 16],
) -> Result<(), codec::Error> {
    let mut targets = Vec::new();
    for (kind, range) in attributes::iter(buf) {
        if kind != VENDOR_SPECIFIC {
            continue;
        }

        let Ok((vendor, subattributes)) = attributes::vendor_subattributes(buf, range) else {
            log::warn!("vendor attribute with broken sub-attributes left as is");
            continue;
        };

        if vendor != VENDOR_MICROSOFT {
            continue;
        }

        for (sub, value) in subattributes {
            if sub == MS_MPPE_SEND_KEY || sub == MS_MPPE_RECV_KEY {
                targets.push(value);
            }
        }
    }

    for range in targets {
        crypto::keywrap_recrypt(
            &mut buf[range],
            old_secret,
            old_authenticator,
            new_secret,
            new_authenticator,
        )?;
    }

    Ok(())
}
