//! Established peer connections.
//!
//! A [`PeerConn`] holds everything the torrent knows about one peer: choke
//! and interest flags in both directions, outstanding requests, the pieces
//! the peer claims, and counters used for eviction and upload decisions. It
//! lives inside the torrent state under the client lock.
//!
//! Each connection runs two tasks. The reader ([`pump`]) decodes messages
//! and applies them under the lock; the writer ([`writer`]) drains the
//! connection's [`Outbox`] to the socket and emits keepalives.

pub(crate) mod pump;
pub(crate) mod writer;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::bitmap::Bitmap;
use crate::constants::{BASE_REQUEST_PIPELINE, DEFAULT_PEER_MAX_REQUESTS};
use crate::peer::PeerSource;
use crate::protocol::{ExtensionBits, Message, Request};
use crate::types::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ConnId(pub(crate) u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-connection transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStats {
    pub chunks_sent: u64,
    pub bytes_uploaded: u64,
    pub useful_chunks_received: u64,
    pub unwanted_chunks_received: u64,
    pub useful_bytes_downloaded: u64,
    /// Pieces this peer contributed to that later passed verification.
    pub good_pieces_dirtied: u64,
    /// Pieces this peer contributed to that later failed verification.
    pub bad_pieces_dirtied: u64,
    pub bytes_read: u64,
}

impl ConnStats {
    /// Good minus bad pieces dirtied; higher is more trusted.
    pub(crate) fn net_good_pieces_dirtied(&self) -> i64 {
        self.good_pieces_dirtied as i64 - self.bad_pieces_dirtied as i64
    }

    pub(crate) fn add(&mut self, other: &ConnStats) {
        self.chunks_sent += other.chunks_sent;
        self.bytes_uploaded += other.bytes_uploaded;
        self.useful_chunks_received += other.useful_chunks_received;
        self.unwanted_chunks_received += other.unwanted_chunks_received;
        self.useful_bytes_downloaded += other.useful_bytes_downloaded;
        self.good_pieces_dirtied += other.good_pieces_dirtied;
        self.bad_pieces_dirtied += other.bad_pieces_dirtied;
        self.bytes_read += other.bytes_read;
    }
}

/// Outbound messages waiting for the writer task.
///
/// Posting never touches the socket. A cancel for a request that is still
/// queued removes the request instead of sending both.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    queue: Mutex<VecDeque<Message>>,
    wake: Notify,
    bytes_written: AtomicU64,
    cancels_coalesced: AtomicU64,
}

impl Outbox {
    /// Queues a message and wakes the writer. Returns false if the message
    /// cancelled a still-queued request instead.
    pub(crate) fn post(&self, msg: Message) -> bool {
        {
            let mut queue = self.queue.lock();
            if let Message::Cancel(req) = &msg {
                let queued = queue
                    .iter()
                    .rposition(|m| matches!(m, Message::Request(r) if r == req));
                if let Some(pos) = queued {
                    queue.remove(pos);
                    self.cancels_coalesced.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
            queue.push_back(msg);
        }
        self.wake.notify_one();
        true
    }

    /// Drops a queued, unsent piece message for `req`.
    pub(crate) fn remove_piece(&self, req: &Request) -> bool {
        let mut queue = self.queue.lock();
        let pos = queue.iter().position(|m| {
            matches!(m, Message::Piece { index, begin, data }
                if *index == req.index && *begin == req.begin && data.len() as u32 == req.length)
        });
        pos.map(|p| queue.remove(p)).is_some()
    }

    pub(crate) fn drain(&self) -> VecDeque<Message> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn notified(&self) {
        self.wake.notified().await
    }

    pub(crate) fn record_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn cancels_coalesced(&self) -> u64 {
        self.cancels_coalesced.load(Ordering::Relaxed)
    }
}

/// What the handshake established about a peer.
#[derive(Debug, Clone)]
pub(crate) struct ConnInfo {
    pub(crate) addr: SocketAddr,
    pub(crate) peer_id: PeerId,
    pub(crate) source: PeerSource,
    pub(crate) outgoing: bool,
    pub(crate) encrypted: bool,
    pub(crate) network: &'static str,
    /// Extensions both sides advertised.
    pub(crate) extensions: ExtensionBits,
}

/// The halves of a connection owned by its tasks.
pub(crate) struct ConnHandles {
    pub(crate) outbox: std::sync::Arc<Outbox>,
    pub(crate) closed: watch::Receiver<bool>,
}

pub(crate) struct PeerConn {
    pub(crate) id: ConnId,
    pub(crate) info: ConnInfo,

    // Our side
    pub(crate) am_choking: bool,
    pub(crate) am_interested: bool,
    pub(crate) requests: HashSet<Request>,
    pub(crate) sent_haves: Option<Bitmap>,
    pub(crate) upload_retry_pending: bool,

    // Their side
    pub(crate) peer_choking: bool,
    pub(crate) peer_interested: bool,
    pub(crate) peer_requests: VecDeque<Request>,
    pub(crate) peer_pieces: Bitmap,
    pub(crate) peer_has_all: bool,
    /// Received a bitfield, have-all, have-none or have.
    pub(crate) peer_sent_have_info: bool,
    pub(crate) peer_max_requests: usize,
    pub(crate) peer_extension_ids: HashMap<String, u8>,
    pub(crate) peer_client: Option<String>,
    pub(crate) allowed_fast: HashSet<u32>,
    pub(crate) suggested: VecDeque<u32>,

    /// Random piece order used when requests are not strictly sequential.
    pub(crate) inclination: Vec<u32>,
    /// Pieces this peer sent chunks for since their last verification.
    pub(crate) touched_pieces: HashSet<u32>,

    pub(crate) stats: ConnStats,
    pub(crate) connected_at: Instant,
    pub(crate) last_message_received: Instant,
    pub(crate) last_useful_chunk_received: Option<Instant>,
    pub(crate) last_chunk_sent: Option<Instant>,

    pub(crate) outbox: std::sync::Arc<Outbox>,
    closed: watch::Sender<bool>,
}

impl PeerConn {
    pub(crate) fn new(id: ConnId, info: ConnInfo) -> (Self, ConnHandles) {
        let outbox = std::sync::Arc::new(Outbox::default());
        let (closed, closed_rx) = watch::channel(false);
        let now = Instant::now();
        let conn = Self {
            id,
            info,
            am_choking: true,
            am_interested: false,
            requests: HashSet::new(),
            sent_haves: None,
            upload_retry_pending: false,
            peer_choking: true,
            peer_interested: false,
            peer_requests: VecDeque::new(),
            peer_pieces: Bitmap::new(),
            peer_has_all: false,
            peer_sent_have_info: false,
            peer_max_requests: DEFAULT_PEER_MAX_REQUESTS,
            peer_extension_ids: HashMap::new(),
            peer_client: None,
            allowed_fast: HashSet::new(),
            suggested: VecDeque::new(),
            inclination: Vec::new(),
            touched_pieces: HashSet::new(),
            stats: ConnStats::default(),
            connected_at: now,
            last_message_received: now,
            last_useful_chunk_received: None,
            last_chunk_sent: None,
            outbox: outbox.clone(),
            closed,
        };
        (
            conn,
            ConnHandles {
                outbox,
                closed: closed_rx,
            },
        )
    }

    pub(crate) fn supports_fast(&self) -> bool {
        self.info.extensions.supports_fast()
    }

    pub(crate) fn supports_extended(&self) -> bool {
        self.info.extensions.supports_extended()
    }

    pub(crate) fn peer_has_piece(&self, index: u32) -> bool {
        self.peer_has_all || self.peer_pieces.contains(index)
    }

    /// Whether a request for `index` would be served despite a choke.
    pub(crate) fn can_request_piece(&self, index: u32) -> bool {
        !self.peer_choking || self.allowed_fast.contains(&index)
    }

    pub(crate) fn is_suggested(&self, index: u32) -> bool {
        self.suggested.contains(&index)
    }

    /// How many requests to keep outstanding: the peer's advertised limit,
    /// bounded by a base pipeline plus the chunks this peer has usefully
    /// delivered beyond the ones it wasted.
    pub(crate) fn nominal_max_requests(&self) -> usize {
        let earned = self.stats.useful_chunks_received as i64
            - self.stats.unwanted_chunks_received as i64;
        let cap = (BASE_REQUEST_PIPELINE as i64).max(earned) as usize;
        self.peer_max_requests.clamp(1, cap.max(1))
    }

    /// Useful bytes per second since the connection was established.
    pub(crate) fn download_rate(&self) -> f64 {
        let secs = self.connected_at.elapsed().as_secs_f64().max(1e-3);
        self.stats.useful_bytes_downloaded as f64 / secs
    }

    pub(crate) fn post(&self, msg: Message) {
        self.outbox.post(msg);
    }

    /// Sends a have unless the peer was already told about the piece.
    pub(crate) fn send_have(&mut self, index: u32) {
        let Some(sent) = self.sent_haves.as_mut() else {
            return;
        };
        if sent.insert(index) {
            self.outbox.post(Message::Have { piece: index });
        }
    }

    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
        self.outbox.wake();
    }
}

impl fmt::Debug for PeerConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConn")
            .field("id", &self.id)
            .field("addr", &self.info.addr)
            .field("peer_id", &self.info.peer_id)
            .field("am_choking", &self.am_choking)
            .field("peer_choking", &self.peer_choking)
            .field("requests", &self.requests.len())
            .finish()
    }
}
