//! The read side of a connection.
//!
//! [`run_reader`] decodes messages off the lock, then applies each one to
//! the torrent state under the lock. Chunk payloads are written to storage
//! after the lock is released; the pending-write counter on the piece keeps
//! verification from hashing a piece while a write to it is in flight.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::ConnId;
use crate::bitmap::Bitmap;
use crate::client::Monitor;
use crate::constants::{
    HANDSHAKE_EXTENDED_ID, MAX_PEER_REQUESTS, MAX_SUGGESTED_PIECES, METADATA_EXTENDED_ID,
    PEX_EXTENDED_ID,
};
use crate::error::ConnError;
use crate::peer::{Peer, PeerSource};
use crate::piece::PendingWrites;
use crate::protocol::{ExtendedHandshake, FrameReader, Message, PexMessage, ProtocolError, Request};
use crate::storage::{PieceStorage, StorageError};
use crate::torrent::TorrentState;
use crate::types::InfoHash;

/// A received chunk on its way to storage.
pub(crate) struct ChunkWrite {
    pub(crate) req: Request,
    data: Bytes,
    storage: Arc<dyn PieceStorage>,
    pending: Arc<PendingWrites>,
}

impl std::fmt::Debug for ChunkWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkWrite")
            .field("req", &self.req)
            .field("len", &self.data.len())
            .finish()
    }
}

impl ChunkWrite {
    /// Writes the chunk and releases its pending-write count. Blocking.
    pub(crate) fn write(self) -> (Request, Result<(), StorageError>) {
        let result = self
            .storage
            .write_at(&self.data, self.req.begin as u64)
            .and_then(|n| {
                if n == self.data.len() {
                    Ok(())
                } else {
                    Err(StorageError::OutOfBounds {
                        piece: self.req.index,
                        offset: self.req.begin as u64,
                        length: self.data.len(),
                    })
                }
            });
        self.pending.decrement();
        (self.req, result)
    }
}

/// Reads and applies messages until the connection closes or fails.
pub(crate) async fn run_reader<R>(
    monitor: Arc<Monitor>,
    info_hash: InfoHash,
    id: ConnId,
    mut reader: FrameReader<R>,
    mut closed: watch::Receiver<bool>,
    read_timeout: Duration,
) -> Result<(), ConnError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if *closed.borrow() {
            return Ok(());
        }
        let (msg, wire_len) = tokio::select! {
            _ = closed.changed() => return Ok(()),
            read = tokio::time::timeout(read_timeout, reader.read_message()) => {
                read.map_err(|_| ConnError::Timeout)??
            }
        };

        let write = {
            let mut state = monitor.lock();
            let Some(t) = state.torrents.get_mut(&info_hash) else {
                return Ok(());
            };
            let Some(conn) = t.conns.get_mut(&id) else {
                return Ok(());
            };
            conn.last_message_received = Instant::now();
            conn.stats.bytes_read += wire_len as u64;
            t.handle_message(id, msg)?
        };

        if let Some(write) = write {
            let (req, result) = tokio::task::spawn_blocking(move || write.write())
                .await
                .map_err(|e| ProtocolError::Io(std::io::Error::other(e)))?;
            let mut state = monitor.lock();
            if let Some(t) = state.torrents.get_mut(&info_hash) {
                t.chunk_written(id, req, result);
            }
        }
    }
}

impl TorrentState {
    /// Applies one message from the peer. Returns a chunk to write when the
    /// message delivered wanted data.
    pub(crate) fn handle_message(
        &mut self,
        id: ConnId,
        msg: Message,
    ) -> Result<Option<ChunkWrite>, ConnError> {
        let num_pieces = self.num_pieces();
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(None);
        };
        if msg.is_fast_only() && !conn.supports_fast() {
            return Err(ConnError::violation(format!(
                "{:?} without fast extension",
                msg
            )));
        }
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                conn.peer_choking = true;
                let dropped: Vec<Request> = conn.requests.iter().copied().collect();
                for req in dropped {
                    self.forget_request(id, req);
                }
                self.update_requests(id);
            }
            Message::Unchoke => {
                conn.peer_choking = false;
                self.update_requests(id);
            }
            Message::Interested => {
                conn.peer_interested = true;
                self.upload(id);
            }
            Message::NotInterested => {
                conn.peer_interested = false;
                self.choke_peer(id);
            }
            Message::Have { piece } => {
                if piece >= num_pieces {
                    return Err(ConnError::violation(format!("have for piece {}", piece)));
                }
                conn.peer_sent_have_info = true;
                if !conn.peer_has_all && conn.peer_pieces.insert(piece) {
                    self.update_requests(id);
                }
            }
            Message::Bitfield(bits) => {
                if conn.peer_sent_have_info {
                    return Err(ConnError::violation("unexpected bitfield"));
                }
                if bits.len() != (num_pieces as usize).div_ceil(8) {
                    return Err(ConnError::violation(format!(
                        "bitfield of {} bytes for {} pieces",
                        bits.len(),
                        num_pieces
                    )));
                }
                conn.peer_sent_have_info = true;
                conn.peer_pieces = Bitmap::from_wire(&bits, num_pieces);
                self.update_requests(id);
            }
            Message::HaveAll => {
                if conn.peer_sent_have_info {
                    return Err(ConnError::violation("unexpected have all"));
                }
                conn.peer_sent_have_info = true;
                conn.peer_has_all = true;
                self.update_requests(id);
            }
            Message::HaveNone => {
                if conn.peer_sent_have_info {
                    return Err(ConnError::violation("unexpected have none"));
                }
                conn.peer_sent_have_info = true;
                conn.peer_has_all = false;
                conn.peer_pieces.clear();
            }
            Message::Request(req) => self.peer_sent_request(id, req)?,
            Message::Cancel(req) => self.peer_sent_cancel(id, req),
            Message::Piece { index, begin, data } => {
                return Ok(self.received_chunk(id, index, begin, data));
            }
            Message::Port(port) => {
                let addr = SocketAddr::new(conn.info.addr.ip(), port);
                if let Some(dht) = &self.ctx.dht {
                    dht.ping(addr);
                }
            }
            Message::Suggest { piece } => {
                if piece < num_pieces && !conn.suggested.contains(&piece) {
                    conn.suggested.push_back(piece);
                    if conn.suggested.len() > MAX_SUGGESTED_PIECES {
                        conn.suggested.pop_front();
                    }
                    self.update_requests(id);
                }
            }
            Message::Reject(req) => {
                if self.forget_request(id, req) {
                    self.update_requests(id);
                } else {
                    trace!(conn = %id, ?req, "reject for a request we did not make");
                }
            }
            Message::AllowedFast { piece } => {
                if piece < num_pieces && conn.allowed_fast.insert(piece) {
                    self.update_requests(id);
                }
            }
            Message::Extended { id: ext_id, payload } => self.handle_extended(id, ext_id, payload)?,
        }
        Ok(None)
    }

    fn handle_extended(&mut self, id: ConnId, ext_id: u8, payload: Bytes) -> Result<(), ConnError> {
        match ext_id {
            HANDSHAKE_EXTENDED_ID => {
                let hs = ExtendedHandshake::decode(&payload)?;
                let Some(conn) = self.conns.get_mut(&id) else {
                    return Ok(());
                };
                for name in hs.disabled {
                    conn.peer_extension_ids.remove(&name);
                }
                conn.peer_extension_ids.extend(hs.extensions);
                if hs.client.is_some() {
                    conn.peer_client = hs.client;
                }
                if let Some(reqq) = hs.reqq.filter(|&n| n > 0) {
                    conn.peer_max_requests = usize::try_from(reqq).unwrap_or(usize::MAX);
                }
                debug!(conn = %id, client = ?conn.peer_client, reqq = conn.peer_max_requests, "extended handshake");
                self.update_requests(id);
            }
            PEX_EXTENDED_ID => {
                if self.ctx.config.disable_pex {
                    return Ok(());
                }
                let pex = PexMessage::decode(&payload)?;
                trace!(conn = %id, added = pex.added.len(), "peer exchange");
                let peers: Vec<Peer> = pex
                    .added
                    .into_iter()
                    .map(|p| Peer {
                        supports_encryption: p.supports_encryption,
                        ..Peer::new(p.addr, PeerSource::Pex)
                    })
                    .collect();
                self.add_peers(peers);
            }
            METADATA_EXTENDED_ID => {
                trace!(conn = %id, "ignoring metadata message");
            }
            other => {
                trace!(conn = %id, ext_id = other, "ignoring unknown extended message");
            }
        }
        Ok(())
    }

    pub(crate) fn received_chunk(
        &mut self,
        id: ConnId,
        index: u32,
        begin: u32,
        data: Bytes,
    ) -> Option<ChunkWrite> {
        let req = Request::new(index, begin, data.len() as u32);
        let valid = self.pieces.is_chunk(&req);
        if valid {
            self.forget_request(id, req);
        }
        let wanted = valid && self.want_chunk(&req);
        let conn = self.conns.get_mut(&id)?;
        if !wanted {
            trace!(conn = %id, ?req, "unwanted chunk");
            conn.stats.unwanted_chunks_received += 1;
            return None;
        }

        conn.stats.useful_chunks_received += 1;
        conn.stats.useful_bytes_downloaded += req.length as u64;
        conn.last_useful_chunk_received = Some(Instant::now());
        conn.touched_pieces.insert(index);
        self.update_fastest_conn(id);

        self.pieces.mark_dirty(index, self.pieces.chunk_index(begin));
        let piece = self.pieces.get(index);
        piece.pending_writes.increment();
        let write = ChunkWrite {
            req,
            data,
            storage: piece.storage.clone(),
            pending: piece.pending_writes.clone(),
        };

        for other in self.conn_ids() {
            if other != id && self.conns[&other].requests.contains(&req) {
                self.cancel_request(other, req);
                self.update_requests(other);
            }
        }
        self.upload(id);
        self.update_requests(id);
        self.publish_piece_change(index);
        Some(write)
    }

    fn update_fastest_conn(&mut self, id: ConnId) {
        let rate = |id: &ConnId| self.conns.get(id).map(|c| c.download_rate());
        let faster = match self.fastest_conn.as_ref().and_then(rate) {
            Some(best) => rate(&id).is_some_and(|r| r > best),
            None => true,
        };
        if faster {
            self.fastest_conn = Some(id);
        }
    }

    /// Finishes a chunk write: queues the piece for hashing once every chunk
    /// is in, or reopens the chunk if the write failed.
    pub(crate) fn chunk_written(
        &mut self,
        id: ConnId,
        req: Request,
        result: Result<(), StorageError>,
    ) {
        let index = req.index;
        match result {
            Ok(()) => {
                if self.pieces.all_dirty(index) && !self.pieces.complete(index) {
                    self.queue_piece_check(index);
                }
            }
            Err(e) => {
                warn!(conn = %id, piece = index, error = %e, "error writing chunk");
                self.pieces
                    .unmark_dirty(index, self.pieces.chunk_index(req.begin));
                self.update_piece_completion(index);
                let having: Vec<ConnId> = self
                    .conn_ids()
                    .into_iter()
                    .filter(|c| self.conns[c].peer_has_piece(index))
                    .collect();
                for c in having {
                    self.update_requests(c);
                }
            }
        }
        self.publish_piece_change(index);
        self.broadcast();
    }

    /// Queues the messages that open an established connection: extended
    /// handshake, our piece set, and our DHT port.
    pub(crate) fn send_initial_messages(&mut self, id: ConnId) {
        let num_pieces = self.num_pieces();
        let completed = self.pieces.completed().clone();
        let config = &self.ctx.config;
        let dht_port = config.dht_port.filter(|_| self.ctx.dht.is_some());
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };

        if conn.supports_extended() {
            let mut hs = ExtendedHandshake {
                client: Some(config.client_name.clone()),
                reqq: Some(MAX_PEER_REQUESTS as i64),
                ..Default::default()
            };
            if !config.disable_pex {
                hs.extensions.insert("ut_pex".into(), PEX_EXTENDED_ID);
            }
            match hs.encode() {
                Ok(payload) => conn.post(Message::Extended {
                    id: HANDSHAKE_EXTENDED_ID,
                    payload,
                }),
                Err(e) => warn!(conn = %id, error = %e, "failed to encode extended handshake"),
            }
        }

        let have = completed.len() as u32;
        if conn.supports_fast() && have == num_pieces {
            conn.post(Message::HaveAll);
        } else if conn.supports_fast() && have == 0 {
            conn.post(Message::HaveNone);
        } else if have > 0 {
            conn.post(Message::Bitfield(completed.to_wire(num_pieces)));
        }
        conn.sent_haves = Some(completed);

        if let Some(port) = dht_port.filter(|_| conn.info.extensions.supports_dht()) {
            conn.post(Message::Port(port));
        }
    }
}
