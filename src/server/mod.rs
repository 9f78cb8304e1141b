pub mod cert;
pub mod transports;
pub mod upstream;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use ahash::AHashMap;
use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::{
    Notify,
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

use service::{ClientKey, Reply, Service, ServiceOptions};

use crate::{config::Setup, observer::Observer, statistics::Statistics};

/// Routes finished replies to the queue of the client instance they
/// belong to.
///
/// Each transport registers a queue per client instance (one per UDP
/// listener socket, one per accepted TLS connection) and drains it
/// from its writer task. Sending to a vanished instance discards the
/// reply and garbage-collects the entry.
#[derive(Clone)]
pub struct ReplyRouter(Arc<RwLock<AHashMap<ClientKey, UnboundedSender<Reply>>>>);

impl Default for ReplyRouter {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(AHashMap::with_capacity(64))))
    }
}

impl ReplyRouter {
    /// Open the reply queue of a new client instance.
    pub fn register(&self, key: ClientKey) -> UnboundedReceiver<Reply> {
        let (sender, receiver) = unbounded_channel();
        self.0.write().insert(key, sender);
        receiver
    }

    /// Enqueue a reply for its client instance. Nothing happens when
    /// the instance is already gone.
    pub fn send(&self, reply: Reply) {
        let key = reply.client;
        let mut is_destroyed = false;

        {
            if let Some(sender) = self.0.read().get(&key) {
                if sender.send(reply).is_err() {
                    is_destroyed = true;
                }
            }
        }

        if is_destroyed {
            self.remove(key);
        }
    }

    /// Close a client instance's queue, waking and ending its writer.
    pub fn remove(&self, key: ClientKey) {
        drop(self.0.write().remove(&key))
    }
}

/// Hands out process-unique client instance keys. Keys are never
/// reused, so a stale slot reference can only miss, not misdeliver.
#[derive(Default)]
pub struct ClientKeys(AtomicU64);

impl ClientKeys {
    pub fn next(&self) -> ClientKey {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Shared environment of every transport and peer session task.
pub struct ProxyEnv {
    pub service: Arc<Service<Observer>>,
    pub router: ReplyRouter,
    pub statistics: Statistics,
    pub keys: ClientKeys,
    /// One waker per upstream; transports ring it after queueing a
    /// request so the writer task picks the work up.
    pub wakers: Vec<Arc<Notify>>,
}

/// Bootstrap the proxy: build the engine, bring up the upstream peer
/// sessions, then the listeners.
pub async fn start(setup: Setup, statistics: &Statistics) -> Result<()> {
    let contexts = cert::build_contexts(&setup.tls)?;

    let service = Arc::new(Service::new(ServiceOptions {
        clients: setup.clients,
        servers: setup.servers,
        realms: setup.realms,
        handler: Observer,
    }));

    let wakers = (0..service.servers().len())
        .map(|_| Arc::new(Notify::new()))
        .collect();

    let env = Arc::new(ProxyEnv {
        service,
        router: ReplyRouter::default(),
        statistics: statistics.clone(),
        keys: ClientKeys::default(),
        wakers,
    });

    upstream::start(&env, &contexts, setup.source_udp, setup.source_tls).await?;

    if let Some(listen) = setup.listen_udp {
        transports::udp::listener(listen, &env, false).await?;
    }

    if let Some(listen) = setup.listen_accounting_udp {
        transports::udp::listener(listen, &env, true).await?;
    }

    if let Some(listen) = setup.listen_tls {
        transports::tls::listener(listen, &env, &contexts).await?;
    }

    Ok(())
}
