use super::*;
use crate::config::ClientConfig;
use crate::connection::{ConnHandles, ConnInfo};
use crate::peer::PeerSource;
use crate::protocol::{ExtensionBits, Message};
use crate::storage::{MemoryStorage, StorageProvider};
use crate::types::PeerId;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::net::{IpAddr, Ipv4Addr};

pub(crate) const DATA: &[u8] = b"hello, swarm!";

pub(crate) fn layout_for(data: &[u8], piece_length: u64) -> TorrentLayout {
    let hashes = data
        .chunks(piece_length as usize)
        .map(|piece| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&Sha1::digest(piece));
            hash
        })
        .collect();
    TorrentLayout::single_file("data", data.len() as u64, piece_length, hashes).unwrap()
}

/// A torrent over `data` whose storage already holds the bytes if `have`.
pub(crate) fn torrent_with(
    config: ClientConfig,
    data: &[u8],
    piece_length: u64,
    chunk_size: u32,
    have: bool,
) -> (TorrentState, MemoryStorage) {
    state_in(ClientContext::for_tests(config), data, piece_length, chunk_size, have)
}

/// Like [`torrent_with`], on a given context.
pub(crate) fn state_in(
    ctx: Arc<ClientContext>,
    data: &[u8],
    piece_length: u64,
    chunk_size: u32,
    have: bool,
) -> (TorrentState, MemoryStorage) {
    let layout = layout_for(data, piece_length);
    let info_hash = InfoHash([7; 20]);
    let storage = MemoryStorage::new();
    let contents = if have {
        data.to_vec()
    } else {
        vec![0; data.len()]
    };
    storage.preload(info_hash, &layout, contents, have);
    let opened = storage.open_torrent(info_hash, &layout).unwrap();
    let t = TorrentState::new(ctx, info_hash, layout, opened, chunk_size, Some(1));
    (t, storage)
}

/// A client monitor and a context bound to it. Timers run on the current
/// runtime if there is one.
pub(crate) fn monitored(config: ClientConfig) -> (Arc<Monitor>, Arc<ClientContext>) {
    let monitor = Arc::new(Monitor::new());
    let ctx = ClientContext::for_tests_in(config, &monitor);
    (monitor, ctx)
}

/// Adds a torrent over `data` to the monitor and returns its info hash.
pub(crate) fn add_to(
    monitor: &Monitor,
    ctx: &Arc<ClientContext>,
    data: &[u8],
    piece_length: u64,
    chunk_size: u32,
    have: bool,
) -> InfoHash {
    let (t, _) = state_in(ctx.clone(), data, piece_length, chunk_size, have);
    let info_hash = t.info_hash;
    monitor.lock().torrents.insert(info_hash, t);
    info_hash
}

/// An empty torrent that wants every piece.
pub(crate) fn leecher(data: &[u8], piece_length: u64, chunk_size: u32) -> TorrentState {
    let (mut t, _) = torrent_with(ClientConfig::default(), data, piece_length, chunk_size, false);
    t.download_pieces(0, t.num_pieces());
    t
}

/// A complete torrent that keeps uploading.
pub(crate) fn seeder(data: &[u8], piece_length: u64, chunk_size: u32) -> TorrentState {
    let config = ClientConfig {
        seed: true,
        ..Default::default()
    };
    torrent_with(config, data, piece_length, chunk_size, true).0
}

pub(crate) fn peer_info(n: u8, fast: bool) -> ConnInfo {
    ConnInfo {
        addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 6881),
        peer_id: PeerId([n; 20]),
        source: PeerSource::Direct,
        outgoing: true,
        encrypted: false,
        network: "tcp",
        extensions: if fast {
            ExtensionBits::ours(false)
        } else {
            ExtensionBits::default()
        },
    }
}

/// Inserts a connection, bypassing admission.
pub(crate) fn connect(t: &mut TorrentState, n: u8, fast: bool) -> (ConnId, ConnHandles) {
    t.insert_conn(peer_info(n, fast))
}

/// Takes everything queued for the peer.
pub(crate) fn sent(handles: &ConnHandles) -> Vec<Message> {
    handles.outbox.drain().into_iter().collect()
}

pub(crate) fn sent_requests(msgs: &[Message]) -> Vec<Request> {
    msgs.iter()
        .filter_map(|m| match m {
            Message::Request(r) => Some(*r),
            _ => None,
        })
        .collect()
}

#[test]
fn test_new_torrent_reads_completion_from_storage() {
    let t = seeder(DATA, 5, 5);
    assert!(t.pieces.all_complete());
    assert!(t.seeding());
    assert!(!t.need_data());

    let (t, _) = torrent_with(ClientConfig::default(), DATA, 5, 5, false);
    assert_eq!(t.pieces.num_complete(), 0);
    assert!(!t.need_data());
}

#[test]
fn test_download_and_cancel_pieces() {
    let mut t = leecher(DATA, 5, 5);
    assert_eq!(t.pieces.pending().collect::<Vec<_>>(), vec![0, 1, 2]);

    t.cancel_pieces(1, 2);
    assert_eq!(t.pieces.pending().collect::<Vec<_>>(), vec![0, 2]);
    assert_eq!(t.pieces.priority(1), PiecePriority::None);
}

#[test]
fn test_cancel_pieces_withdraws_requests() {
    let mut t = leecher(DATA, 5, 5);
    let (id, handles) = connect(&mut t, 1, false);
    t.handle_message(id, Message::Bitfield(Bytes::from_static(&[0xe0])))
        .unwrap();
    t.handle_message(id, Message::Unchoke).unwrap();
    assert_eq!(t.conns[&id].requests.len(), 3);
    sent(&handles);

    t.cancel_pieces(0, 3);
    let msgs = sent(&handles);
    assert!(t.conns[&id].requests.is_empty());
    assert!(t.pending_requests.is_empty());
    assert!(msgs.contains(&Message::Cancel(Request::new(0, 0, 5))));
    assert!(msgs.contains(&Message::NotInterested));
}

#[test]
fn test_piece_state_changes_published_once() {
    let (mut t, _) = torrent_with(ClientConfig::default(), DATA, 5, 5, false);
    let mut events = t.subscribe_piece_changes();

    t.download_pieces(0, 1);
    let change = events.try_recv().unwrap();
    assert_eq!(change.index, 0);
    assert_eq!(change.state.priority, PiecePriority::Normal);

    t.download_pieces(0, 1);
    assert!(events.try_recv().is_err());
}

#[test]
fn test_completion_follows_storage_without_stale_cache() {
    let (mut t, _) = torrent_with(ClientConfig::default(), DATA, 5, 5, false);
    let storage = t.pieces.get(1).storage.clone();

    storage.mark_complete().unwrap();
    assert!(t.update_piece_completion(1));
    assert!(t.pieces.complete(1));

    storage.mark_not_complete().unwrap();
    assert!(t.update_piece_completion(1));
    assert!(!t.pieces.complete(1));
    assert!(!t.update_piece_completion(1));
}

#[test]
fn test_reader_ranges_set_priorities() {
    let mut t = leecher(DATA, 5, 5);
    t.readers.insert(0, (6, 12));
    t.update_reader_priorities();
    assert_eq!(t.pieces.priority(0), PiecePriority::Normal);
    assert_eq!(t.pieces.priority(1), PiecePriority::Now);
    assert_eq!(t.pieces.priority(2), PiecePriority::Readahead);
    assert_eq!(t.pieces.pending().collect::<Vec<_>>(), vec![1, 2, 0]);

    t.readers.clear();
    t.update_reader_priorities();
    assert_eq!(t.pieces.priority(1), PiecePriority::Normal);
}

#[test]
fn test_completed_piece_has_no_priority() {
    let mut t = leecher(DATA, 5, 5);
    t.pieces.get(0).storage.mark_complete().unwrap();
    t.update_piece_completion(0);
    assert_eq!(t.pieces.priority(0), PiecePriority::None);
    assert_eq!(t.pieces.pending().collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn test_add_peers_skips_banned_and_self() {
    // nothing wanted, so peers stay in the reserve instead of being dialed
    let (mut t, _) = torrent_with(ClientConfig::default(), DATA, 5, 5, false);
    let banned: SocketAddr = "10.0.0.9:6881".parse().unwrap();
    t.ctx.ban_ip(banned.ip());
    let mut me = Peer::new("10.0.0.8:6881".parse().unwrap(), PeerSource::Direct);
    me.id = Some(t.ctx.peer_id);

    t.add_peers([
        Peer::new(banned, PeerSource::Tracker),
        me,
        Peer::new("10.0.0.7:6881".parse().unwrap(), PeerSource::Pex),
    ]);
    assert_eq!(t.reserve.len(), 1);
    assert_eq!(t.stats().pending_peers, 1);
}

#[test]
fn test_stats_keep_closed_connections() {
    let mut t = leecher(DATA, 5, 5);
    let (id, _handles) = connect(&mut t, 1, false);
    t.conns.get_mut(&id).unwrap().stats.useful_chunks_received = 3;
    assert!(t.drop_connection(id, "test"));

    let stats = t.stats();
    assert_eq!(stats.active_peers, 0);
    assert_eq!(stats.conns.useful_chunks_received, 3);
}

#[test]
fn test_close_closes_connections() {
    let mut t = leecher(DATA, 5, 5);
    let (_, handles) = connect(&mut t, 1, false);
    t.close();
    assert!(t.is_closed());
    assert!(t.conns.is_empty());
    assert!(*handles.closed.borrow());
}
