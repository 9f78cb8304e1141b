pub mod forwarding;
pub mod peers;
pub mod realm;
pub mod request;
pub mod rewrite;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

use self::{
    peers::{ClientConfig, ServerConfig, Transport},
    realm::Realm,
    request::RequestTable,
};

pub use self::{
    forwarding::{Reply, RequestAction, Sweep},
    request::{ClientKey, REQUEST_EXPIRY, REQUEST_RETRIES, STATUS_SERVER_PERIOD},
};

pub use codec::Code;

/// Engine events the hosting process may want to surface. All methods
/// default to doing nothing, implementors pick what they care about.
#[allow(unused_variables)]
pub trait ProxyHandler: Send + Sync {
    /// An accepted request was queued to an upstream server.
    fn on_request_forwarded(&self, client: &ClientConfig, server: &ServerConfig, username: &[u8]) {
    }

    /// A validated reply is on its way back to the originating client.
    fn on_reply_forwarded(&self, server: &ServerConfig, code: Code) {}

    /// A realm without forwarding candidates answered with its
    /// configured reject message.
    fn on_realm_refused(&self, realm: &str, username: &[u8]) {}

    /// No realm matched the User-Name.
    fn on_route_missing(&self, username: &[u8]) {}

    /// An upstream stayed silent for a whole retry cycle.
    fn on_request_expired(&self, server: &ServerConfig, id: u8) {}

    /// A Status-Server probe went unanswered.
    fn on_status_lost(&self, server: &ServerConfig, lost: u8) {}

    /// A previously missed upstream answered again.
    fn on_status_alive(&self, server: &ServerConfig) {}
}

/// Mutable runtime companion of a `ServerConfig`: the in-flight
/// request table and the liveness bookkeeping the realm router reads.
pub struct ServerState {
    table: Mutex<RequestTable>,
    connection_ok: AtomicBool,
    lost_status: AtomicU8,
}

impl ServerState {
    fn new(connection_ok: bool) -> Self {
        Self {
            table: Mutex::new(RequestTable::new()),
            connection_ok: AtomicBool::new(connection_ok),
            lost_status: AtomicU8::new(0),
        }
    }

    pub fn connection_ok(&self) -> bool {
        self.connection_ok.load(Ordering::Relaxed)
    }

    pub fn set_connection_ok(&self, ok: bool) {
        self.connection_ok.store(ok, Ordering::Relaxed);
    }

    pub fn lost_status(&self) -> u8 {
        self.lost_status.load(Ordering::Relaxed)
    }

    /// Saturating bump, returning the new count. 255 means "long
    /// gone" and stays there.
    fn bump_lost_status(&self) -> u8 {
        let _ = self
            .lost_status
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |it| {
                Some(it.saturating_add(1))
            });

        self.lost_status.load(Ordering::Relaxed)
    }

    fn clear_lost_status(&self) -> u8 {
        self.lost_status.swap(0, Ordering::Relaxed)
    }

    pub(crate) fn table(&self) -> &Mutex<RequestTable> {
        &self.table
    }
}

pub struct ServiceOptions<H> {
    pub clients: Vec<ClientConfig>,
    pub servers: Vec<ServerConfig>,
    pub realms: Vec<Realm>,
    pub handler: H,
}

/// The proxy engine: an immutable view of the configured peers and
/// realms plus the per-upstream runtime state. One value is built at
/// startup and shared by every transport task.
pub struct Service<H> {
    clients: Vec<ClientConfig>,
    servers: Vec<ServerConfig>,
    realms: Vec<Realm>,
    states: Vec<ServerState>,
    handler: H,
}

impl<H> Service<H>
where
    H: ProxyHandler,
{
    pub fn new(options: ServiceOptions<H>) -> Self {
        // UDP upstreams are connectionless and considered reachable
        // until probes say otherwise; TLS upstreams earn the flag on
        // their first completed handshake.
        let states = options
            .servers
            .iter()
            .map(|it| ServerState::new(it.transport == Transport::Udp))
            .collect();

        Self {
            clients: options.clients,
            servers: options.servers,
            realms: options.realms,
            handler: options.handler,
            states,
        }
    }

    pub fn clients(&self) -> &[ClientConfig] {
        &self.clients
    }

    pub fn servers(&self) -> &[ServerConfig] {
        &self.servers
    }

    pub fn realms(&self) -> &[Realm] {
        &self.realms
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn state(&self, server: usize) -> &ServerState {
        &self.states[server]
    }

    /// First realm whose pattern matches the User-Name wins.
    pub fn route(&self, username: &[u8]) -> Option<&Realm> {
        self.realms.iter().find(|it| it.pattern.is_match(username))
    }

    /// Best forwarding candidate of a realm.
    ///
    /// Prefer any server that looks alive and has no missed probes,
    /// then the one with the fewest missed probes, and finally the
    /// first configured one so retries can bring a dead set back.
    pub fn select_server(&self, realm: &Realm) -> Option<usize> {
        for &index in &realm.servers {
            let state = &self.states[index];
            if state.connection_ok() && state.lost_status() == 0 {
                return Some(index);
            }
        }

        realm
            .servers
            .iter()
            .copied()
            .filter(|&it| self.states[it].lost_status() > 0)
            .min_by_key(|&it| self.states[it].lost_status())
            .or(realm.servers.first().copied())
    }
}
