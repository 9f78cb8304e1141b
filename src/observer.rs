use service::{
    Code, ProxyHandler,
    peers::{ClientConfig, ServerConfig},
};

/// Turns engine events into log lines. The engine itself only logs
/// the packets it drops; everything that moves forward is narrated
/// here.
pub struct Observer;

impl ProxyHandler for Observer {
    fn on_request_forwarded(&self, client: &ClientConfig, server: &ServerConfig, username: &[u8]) {
        log::debug!(
            "forwarding request: client={}, server={}, username={:?}",
            client.name,
            server.name,
            String::from_utf8_lossy(username)
        );
    }

    fn on_reply_forwarded(&self, server: &ServerConfig, code: Code) {
        log::debug!("forwarding reply: server={}, code={:?}", server.name, code);
    }

    fn on_realm_refused(&self, realm: &str, username: &[u8]) {
        log::info!(
            "rejecting request, realm has no servers: realm={realm}, username={:?}",
            String::from_utf8_lossy(username)
        );
    }

    fn on_request_expired(&self, server: &ServerConfig, id: u8) {
        log::warn!("no reply from server, giving up: server={}, id={id}", server.name);
    }

    fn on_status_lost(&self, server: &ServerConfig, lost: u8) {
        log::warn!(
            "status probe unanswered, server possibly dead: server={}, lost={lost}",
            server.name
        );
    }

    fn on_status_alive(&self, server: &ServerConfig) {
        log::info!("server answering again: server={}", server.name);
    }
}
