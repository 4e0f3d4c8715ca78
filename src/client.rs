//! The client: torrents, the shared monitor, and connection tasks.
//!
//! All mutable state of every torrent sits behind one mutex, the
//! [`Monitor`]. Anything that may unblock a waiter notifies the monitor's
//! condition variable, which readers, the verifier threads and
//! [`Torrent::verify_data`] wait on. Async tasks lock only around
//! synchronous state changes and never across an `.await`.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::bandwidth::RateLimiter;
use crate::config::ClientConfig;
use crate::connection::pump::run_reader;
use crate::connection::writer::run_writer;
use crate::connection::{ConnHandles, ConnId};
use crate::constants::CHUNK_SIZE;
use crate::error::{ConnError, Error};
use crate::manager::{
    establish_outgoing, receive_handshake, BoxStream, DhtPinger, Dialer, Established, Obfuscator,
    TcpDialer,
};
use crate::peer::Peer;
use crate::protocol::{FrameReader, FrameWriter};
use crate::storage::{FileStorage, MemoryStorage, StorageProvider, TorrentLayout};
use crate::torrent::{Torrent, TorrentState};
use crate::types::{InfoHash, PeerId};
use crate::verifier;

pub(crate) struct ClientState {
    pub(crate) torrents: HashMap<InfoHash, TorrentState>,
    pub(crate) closed: bool,
}

/// The client lock and its condition variable.
pub(crate) struct Monitor {
    state: Mutex<ClientState>,
    pub(crate) event: Arc<Condvar>,
}

impl Monitor {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ClientState {
                torrents: HashMap::new(),
                closed: false,
            }),
            event: Arc::new(Condvar::new()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock()
    }
}

/// Client-wide collaborators and settings shared by every torrent.
pub(crate) struct ClientContext {
    pub(crate) config: ClientConfig,
    pub(crate) peer_id: PeerId,
    pub(crate) upload_limiter: Arc<RateLimiter>,
    pub(crate) runtime: Option<Handle>,
    pub(crate) monitor: Weak<Monitor>,
    pub(crate) event: Arc<Condvar>,
    pub(crate) dialers: Vec<Arc<dyn Dialer>>,
    pub(crate) obfuscator: Option<Arc<dyn Obfuscator>>,
    pub(crate) dht: Option<Arc<dyn DhtPinger>>,
    bad_ips: Mutex<HashSet<IpAddr>>,
    doppelgangers: Mutex<HashSet<SocketAddr>>,
    next_conn_id: AtomicU64,
    next_reader_id: AtomicU64,
    next_torrent_instance: AtomicU64,
}

impl ClientContext {
    pub(crate) fn is_banned(&self, ip: IpAddr) -> bool {
        self.bad_ips.lock().contains(&ip)
    }

    pub(crate) fn ban_ip(&self, ip: IpAddr) {
        if self.bad_ips.lock().insert(ip) {
            info!(%ip, "banned peer ip");
        }
    }

    pub(crate) fn is_doppelganger(&self, addr: &SocketAddr) -> bool {
        self.doppelgangers.lock().contains(addr)
    }

    pub(crate) fn add_doppelganger(&self, addr: SocketAddr) {
        debug!(%addr, "address is ourselves");
        self.doppelgangers.lock().insert(addr);
    }

    pub(crate) fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_reader_id(&self) -> u64 {
        self.next_reader_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_torrent_instance(&self) -> u64 {
        self.next_torrent_instance.fetch_add(1, Ordering::Relaxed)
    }

    /// A context with no runtime and no monitor: nothing is ever dialed.
    #[cfg(test)]
    pub(crate) fn for_tests(config: ClientConfig) -> Arc<Self> {
        Self::for_tests_with(config, Vec::new(), None)
    }

    /// A context attached to `monitor` and to the current runtime, if any.
    #[cfg(test)]
    pub(crate) fn for_tests_in(config: ClientConfig, monitor: &Arc<Monitor>) -> Arc<Self> {
        Arc::new(Self {
            peer_id: config.peer_id.unwrap_or_else(PeerId::generate),
            upload_limiter: RateLimiter::new(config.upload_rate_limit),
            config,
            runtime: Handle::try_current().ok(),
            monitor: Arc::downgrade(monitor),
            event: monitor.event.clone(),
            dialers: Vec::new(),
            obfuscator: None,
            dht: None,
            bad_ips: Mutex::new(HashSet::new()),
            doppelgangers: Mutex::new(HashSet::new()),
            next_conn_id: AtomicU64::new(0),
            next_reader_id: AtomicU64::new(0),
            next_torrent_instance: AtomicU64::new(0),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests_with(
        config: ClientConfig,
        dialers: Vec<Arc<dyn Dialer>>,
        obfuscator: Option<Arc<dyn Obfuscator>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_id: config.peer_id.unwrap_or_else(PeerId::generate),
            upload_limiter: RateLimiter::new(config.upload_rate_limit),
            config,
            runtime: None,
            monitor: Weak::new(),
            event: Arc::new(Condvar::new()),
            dialers,
            obfuscator,
            dht: None,
            bad_ips: Mutex::new(HashSet::new()),
            doppelgangers: Mutex::new(HashSet::new()),
            next_conn_id: AtomicU64::new(0),
            next_reader_id: AtomicU64::new(0),
            next_torrent_instance: AtomicU64::new(0),
        })
    }
}

/// What a torrent is added from.
#[derive(Clone)]
pub struct TorrentSpec {
    pub info_hash: InfoHash,
    pub layout: TorrentLayout,
    /// Request size. Defaults to 16 KiB.
    pub chunk_size: Option<u32>,
    /// Overrides the client's storage for this torrent.
    pub storage: Option<Arc<dyn StorageProvider>>,
}

impl TorrentSpec {
    pub fn new(info_hash: InfoHash, layout: TorrentLayout) -> Self {
        Self {
            info_hash,
            layout,
            chunk_size: None,
            storage: None,
        }
    }
}

/// Configures optional collaborators before creating a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    dialers: Vec<Arc<dyn Dialer>>,
    obfuscator: Option<Arc<dyn Obfuscator>>,
    dht: Option<Arc<dyn DhtPinger>>,
    storage: Option<Arc<dyn StorageProvider>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            dialers: Vec::new(),
            obfuscator: None,
            dht: None,
            storage: None,
        }
    }

    /// Adds a transport. Without any, peers are dialed over TCP.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialers.push(dialer);
        self
    }

    pub fn obfuscator(mut self, obfuscator: Arc<dyn Obfuscator>) -> Self {
        self.obfuscator = Some(obfuscator);
        self
    }

    pub fn dht(mut self, dht: Arc<dyn DhtPinger>) -> Self {
        self.dht = Some(dht);
        self
    }

    /// Default storage for added torrents. Files under `data_dir` if set,
    /// memory otherwise.
    pub fn storage(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Creates the client. Networking runs on the tokio runtime current at
    /// this call; without one, peers are never dialed.
    pub fn build(self) -> Client {
        let monitor = Arc::new(Monitor::new());
        let mut dialers = self.dialers;
        if dialers.is_empty() {
            dialers.push(Arc::new(TcpDialer));
        }
        let storage: Arc<dyn StorageProvider> = match (self.storage, &self.config.data_dir) {
            (Some(storage), _) => storage,
            (None, Some(dir)) => Arc::new(FileStorage::new(dir.clone())),
            (None, None) => Arc::new(MemoryStorage::new()),
        };
        let ctx = Arc::new(ClientContext {
            peer_id: self.config.peer_id.unwrap_or_else(PeerId::generate),
            upload_limiter: RateLimiter::new(self.config.upload_rate_limit),
            config: self.config,
            runtime: Handle::try_current().ok(),
            monitor: Arc::downgrade(&monitor),
            event: monitor.event.clone(),
            dialers,
            obfuscator: self.obfuscator,
            dht: self.dht,
            bad_ips: Mutex::new(HashSet::new()),
            doppelgangers: Mutex::new(HashSet::new()),
            next_conn_id: AtomicU64::new(0),
            next_reader_id: AtomicU64::new(0),
            next_torrent_instance: AtomicU64::new(0),
        });
        let (shutdown, _) = watch::channel(false);
        Client {
            monitor,
            ctx,
            storage,
            shutdown,
            verifiers: Mutex::new(Vec::new()),
        }
    }
}

/// A swarm client holding any number of torrents.
pub struct Client {
    monitor: Arc<Monitor>,
    ctx: Arc<ClientContext>,
    storage: Arc<dyn StorageProvider>,
    shutdown: watch::Sender<bool>,
    verifiers: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        ClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn peer_id(&self) -> PeerId {
        self.ctx.peer_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    /// Starts accepting peers on the configured listen address, or an
    /// ephemeral port. Returns the bound address.
    pub async fn listen(&self) -> Result<SocketAddr, Error> {
        let addr = self
            .ctx
            .config
            .listen_addr
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!(addr = %bound, "listening for peers");
        tokio::spawn(accept_loop(
            listener,
            self.monitor.clone(),
            self.ctx.clone(),
            self.shutdown.subscribe(),
        ));
        Ok(bound)
    }

    /// Hands the client a stream accepted by some other transport.
    pub fn accept_stream(&self, stream: BoxStream, addr: SocketAddr, network: &'static str) {
        if self.ctx.is_banned(addr.ip()) {
            trace!(%addr, "refusing banned peer");
            return;
        }
        tokio::spawn(incoming_connection(
            self.monitor.clone(),
            self.ctx.clone(),
            stream,
            addr,
            network,
        ));
    }

    /// Adds a torrent. Returns the handle and whether it was newly added;
    /// adding a known info hash returns the existing torrent.
    pub fn add_torrent(&self, spec: TorrentSpec) -> Result<(Torrent, bool), Error> {
        let info_hash = spec.info_hash;
        let instance;
        {
            let mut state = self.monitor.lock();
            if state.closed {
                return Err(Error::ClientClosed);
            }
            if state.torrents.contains_key(&info_hash) {
                return Ok((Torrent::new(self.monitor.clone(), info_hash), false));
            }
            let provider = spec.storage.unwrap_or_else(|| self.storage.clone());
            let storage = provider.open_torrent(info_hash, &spec.layout)?;
            let chunk_size = spec.chunk_size.filter(|&c| c > 0).unwrap_or(CHUNK_SIZE);
            let t = TorrentState::new(
                self.ctx.clone(),
                info_hash,
                spec.layout,
                storage,
                chunk_size,
                None,
            );
            instance = t.instance;
            state.torrents.insert(info_hash, t);
        }

        match verifier::spawn(self.monitor.clone(), info_hash, instance) {
            Ok(handle) => {
                let mut verifiers = self.verifiers.lock();
                // threads of dropped torrents have exited on their own
                verifiers.retain(|h| !h.is_finished());
                verifiers.push(handle);
            }
            Err(e) => {
                let mut state = self.monitor.lock();
                if let Some(mut t) = state.torrents.remove(&info_hash) {
                    t.close();
                }
                return Err(e.into());
            }
        }
        info!(torrent = %info_hash, "torrent added");
        Ok((Torrent::new(self.monitor.clone(), info_hash), true))
    }

    pub fn torrent(&self, info_hash: InfoHash) -> Option<Torrent> {
        let state = self.monitor.lock();
        state
            .torrents
            .contains_key(&info_hash)
            .then(|| Torrent::new(self.monitor.clone(), info_hash))
    }

    pub fn torrents(&self) -> Vec<Torrent> {
        let state = self.monitor.lock();
        state
            .torrents
            .keys()
            .map(|&ih| Torrent::new(self.monitor.clone(), ih))
            .collect()
    }

    /// Closes and removes a torrent. Returns false if it was unknown.
    pub fn drop_torrent(&self, info_hash: InfoHash) -> bool {
        let mut state = self.monitor.lock();
        match state.torrents.remove(&info_hash) {
            Some(mut t) => {
                t.close();
                info!(torrent = %info_hash, "torrent dropped");
                true
            }
            None => false,
        }
    }

    /// Refuses the address from now on and drops its connections.
    pub fn ban_ip(&self, ip: IpAddr) {
        self.ctx.ban_ip(ip);
        let mut state = self.monitor.lock();
        for t in state.torrents.values_mut() {
            let banned: Vec<ConnId> = t
                .conns
                .values()
                .filter(|c| c.info.addr.ip() == ip)
                .map(|c| c.id)
                .collect();
            for id in banned {
                t.drop_connection(id, "banned");
            }
        }
    }

    /// Closes every torrent and stops accepting peers.
    pub fn close(&self) {
        {
            let mut state = self.monitor.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            for (_, mut t) in state.torrents.drain() {
                t.close();
            }
            self.monitor.event.notify_all();
        }
        self.shutdown.send_replace(true);
        for handle in self.verifiers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("verifier thread panicked");
            }
        }
        info!("client closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer_id", &self.ctx.peer_id)
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    monitor: Arc<Monitor>,
    ctx: Arc<ClientContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                if ctx.is_banned(addr.ip()) {
                    trace!(%addr, "refusing banned peer");
                    continue;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    trace!(%addr, error = %e, "set_nodelay failed");
                }
                tokio::spawn(incoming_connection(
                    monitor.clone(),
                    ctx.clone(),
                    Box::new(stream),
                    addr,
                    "tcp",
                ));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("accept loop stopped");
}

/// An admitted connection, ready for its tasks.
struct Admitted {
    info_hash: InfoHash,
    id: ConnId,
    handles: ConnHandles,
    reader: FrameReader<ReadHalf<BoxStream>>,
    writer: FrameWriter<WriteHalf<BoxStream>>,
}

fn admit(t: &mut TorrentState, est: Established) -> Option<Admitted> {
    let addr = est.info.addr;
    match t.add_connection(est.info) {
        Ok((id, handles)) => {
            t.send_initial_messages(id);
            Some(Admitted {
                info_hash: est.info_hash,
                id,
                handles,
                reader: est.reader,
                writer: est.writer,
            })
        }
        Err(rejection) => {
            debug!(torrent = %t.info_hash, %addr, %rejection, "connection rejected");
            None
        }
    }
}

/// Dials a peer from a torrent's reserve and runs the connection.
pub(crate) async fn outgoing_connection(
    monitor: Arc<Monitor>,
    ctx: Arc<ClientContext>,
    info_hash: InfoHash,
    peer: Peer,
    dial_timeout: Duration,
) {
    let result = establish_outgoing(&ctx, info_hash, &peer, dial_timeout).await;
    let admitted = {
        let mut state = monitor.lock();
        let Some(t) = state.torrents.get_mut(&info_hash) else {
            return;
        };
        let admitted = match result {
            Ok(est) => admit(t, est),
            Err(e) => {
                trace!(torrent = %info_hash, addr = %peer.addr, error = %e, "outgoing connection failed");
                None
            }
        };
        t.no_longer_half_open(&peer.addr);
        admitted
    };
    if let Some(admitted) = admitted {
        run_connection(monitor, ctx, admitted).await;
    }
}

async fn incoming_connection(
    monitor: Arc<Monitor>,
    ctx: Arc<ClientContext>,
    stream: BoxStream,
    addr: SocketAddr,
    network: &'static str,
) {
    let skeys: Vec<InfoHash> = monitor.lock().torrents.keys().copied().collect();
    let handshake = receive_handshake(&ctx, stream, addr, network, skeys);
    let est = match tokio::time::timeout(ctx.config.handshake_timeout, handshake).await {
        Ok(Ok(est)) => est,
        Ok(Err(e)) => {
            trace!(%addr, error = %e, "incoming handshake failed");
            return;
        }
        Err(_) => {
            trace!(%addr, "incoming handshake timed out");
            return;
        }
    };
    let admitted = {
        let mut state = monitor.lock();
        let Some(t) = state.torrents.get_mut(&est.info_hash) else {
            return;
        };
        admit(t, est)
    };
    if let Some(admitted) = admitted {
        run_connection(monitor, ctx, admitted).await;
    }
}

/// Runs the writer task and the reader until either ends, then drops the
/// connection.
async fn run_connection(monitor: Arc<Monitor>, ctx: Arc<ClientContext>, conn: Admitted) {
    let Admitted {
        info_hash,
        id,
        handles,
        reader,
        writer,
    } = conn;

    let writer_task = {
        let monitor = monitor.clone();
        let outbox = handles.outbox.clone();
        let closed = handles.closed.clone();
        let keepalive = ctx.config.keepalive_interval;
        tokio::spawn(async move {
            if let Err(e) = run_writer(outbox, writer, keepalive, closed).await {
                debug!(conn = %id, error = %e, "write failed");
                let mut state = monitor.lock();
                if let Some(t) = state.torrents.get_mut(&info_hash) {
                    t.drop_connection(id, "write error");
                }
            }
        })
    };

    let result = run_reader(
        monitor.clone(),
        info_hash,
        id,
        reader,
        handles.closed,
        ctx.config.read_timeout(),
    )
    .await;
    let reason = match &result {
        Ok(()) => "closed".to_string(),
        Err(ConnError::Violation(v)) => {
            warn!(conn = %id, violation = %v, "protocol violation");
            format!("protocol violation: {}", v)
        }
        Err(e) => e.to_string(),
    };
    {
        let mut state = monitor.lock();
        if let Some(t) = state.torrents.get_mut(&info_hash) {
            t.drop_connection(id, &reason);
        }
    }
    if writer_task.await.is_err() {
        debug!(conn = %id, "writer task aborted");
    }
}
