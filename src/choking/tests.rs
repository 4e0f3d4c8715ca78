use super::*;
use crate::config::ClientConfig;
use crate::torrent::tests::{add_to, connect, monitored, seeder, sent, torrent_with, DATA};
use std::time::Duration;

#[test]
fn test_seeder_serves_interested_peer() {
    let mut t = seeder(DATA, 5, 5);
    let (id, handles) = connect(&mut t, 1, true);
    t.handle_message(id, Message::Interested).unwrap();
    t.handle_message(id, Message::Request(Request::new(1, 0, 5)))
        .unwrap();

    assert_eq!(
        sent(&handles),
        vec![
            Message::Unchoke,
            Message::Piece {
                index: 1,
                begin: 0,
                data: Bytes::from_static(b", swa"),
            },
        ]
    );
    let stats = t.conns[&id].stats;
    assert_eq!(stats.chunks_sent, 1);
    assert_eq!(stats.bytes_uploaded, 5);
    assert!(t.conns[&id].last_chunk_sent.is_some());
}

#[test]
fn test_no_upload_never_unchokes() {
    let config = ClientConfig {
        no_upload: true,
        seed: true,
        ..Default::default()
    };
    let (mut t, _) = torrent_with(config, DATA, 5, 5, true);
    let (id, handles) = connect(&mut t, 1, true);
    t.handle_message(id, Message::Interested).unwrap();
    t.handle_message(id, Message::Request(Request::new(0, 0, 5)))
        .unwrap();

    assert!(t.conns[&id].am_choking);
    assert_eq!(sent(&handles), vec![Message::Reject(Request::new(0, 0, 5))]);
}

#[test]
fn test_leecher_upload_limited_by_slack() {
    let config = ClientConfig {
        upload_slack: 5,
        ..Default::default()
    };
    let (mut t, _) = torrent_with(config, DATA, 5, 5, true);
    t.pieces.get(2).storage.mark_not_complete().unwrap();
    t.update_piece_completion(2);
    t.download_pieces(0, 3);
    assert!(!t.seeding());

    let (id, handles) = connect(&mut t, 1, true);
    t.handle_message(id, Message::Have { piece: 2 }).unwrap();
    t.handle_message(id, Message::Interested).unwrap();
    t.handle_message(id, Message::Request(Request::new(0, 0, 5)))
        .unwrap();
    t.handle_message(id, Message::Request(Request::new(1, 0, 5)))
        .unwrap();

    let msgs = sent(&handles);
    assert!(msgs.contains(&Message::Unchoke));
    assert!(msgs.contains(&Message::Choke));
    assert!(msgs.contains(&Message::Reject(Request::new(1, 0, 5))));
    assert_eq!(t.conns[&id].stats.chunks_sent, 1);
    assert!(t.conns[&id].am_choking);
}

#[test]
fn test_request_while_choked() {
    let mut t = seeder(DATA, 5, 5);
    let (fast, fast_handles) = connect(&mut t, 1, true);
    let (plain, plain_handles) = connect(&mut t, 2, false);
    let req = Request::new(0, 0, 5);

    t.handle_message(fast, Message::Request(req)).unwrap();
    t.handle_message(plain, Message::Request(req)).unwrap();

    assert_eq!(sent(&fast_handles), vec![Message::Reject(req)]);
    assert!(sent(&plain_handles).is_empty());
    assert!(t.conns[&plain].peer_requests.is_empty());
}

#[test]
fn test_request_while_not_interested_is_violation() {
    let mut t = seeder(DATA, 5, 5);
    let (id, _handles) = connect(&mut t, 1, false);
    t.conns.get_mut(&id).unwrap().am_choking = false;

    let err = t
        .handle_message(id, Message::Request(Request::new(0, 0, 5)))
        .unwrap_err();
    assert!(matches!(err, ConnError::Violation(_)));
}

#[test]
fn test_out_of_bounds_request_is_violation() {
    let mut t = seeder(DATA, 5, 5);
    let (id, _handles) = connect(&mut t, 1, false);
    t.handle_message(id, Message::Interested).unwrap();

    for req in [
        Request::new(3, 0, 1),
        Request::new(2, 2, 2),
        Request::new(0, 0, 0),
        Request::new(0, 0, MAX_REQUEST_LENGTH + 1),
    ] {
        assert!(t.peer_sent_request(id, req).is_err(), "{:?}", req);
    }
}

#[test]
fn test_cancel_pulls_unsent_piece() {
    let mut t = seeder(DATA, 5, 5);
    let (id, handles) = connect(&mut t, 1, true);
    t.handle_message(id, Message::Interested).unwrap();
    let req = Request::new(0, 0, 5);
    t.handle_message(id, Message::Request(req)).unwrap();
    t.handle_message(id, Message::Cancel(req)).unwrap();

    assert_eq!(sent(&handles), vec![Message::Unchoke, Message::Reject(req)]);
    assert_eq!(t.conns[&id].stats.chunks_sent, 0);
    assert_eq!(t.conns[&id].stats.bytes_uploaded, 0);
}

#[test]
fn test_not_interested_chokes() {
    let mut t = seeder(DATA, 5, 5);
    let (id, handles) = connect(&mut t, 1, false);
    t.handle_message(id, Message::Interested).unwrap();
    t.handle_message(id, Message::NotInterested).unwrap();

    assert_eq!(sent(&handles), vec![Message::Unchoke, Message::Choke]);
    assert!(t.conns[&id].am_choking);
}

fn piece_indices(msgs: &[Message]) -> Vec<u32> {
    msgs.iter()
        .filter_map(|m| match m {
            Message::Piece { index, .. } => Some(*index),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_upload_resumes() {
    // a 20000 byte burst refilling at 10000 bytes a second
    let (monitor, ctx) = monitored(ClientConfig {
        seed: true,
        upload_rate_limit: 10_000,
        ..Default::default()
    });
    let data = vec![9u8; 40_000];
    let info_hash = add_to(&monitor, &ctx, &data, 10_000, 10_000, true);

    let (busy, busy_handles, other, other_handles) = {
        let mut state = monitor.lock();
        let t = state.torrents.get_mut(&info_hash).unwrap();
        let (busy, busy_handles) = connect(t, 1, false);
        let (other, other_handles) = connect(t, 2, false);
        t.handle_message(busy, Message::Interested).unwrap();
        for index in 0..3 {
            t.handle_message(busy, Message::Request(Request::new(index, 0, 8_000)))
                .unwrap();
        }
        (busy, busy_handles, other, other_handles)
    };
    assert_eq!(piece_indices(&sent(&busy_handles)), vec![0, 1]);
    {
        let state = monitor.lock();
        let conn = &state.torrents[&info_hash].conns[&busy];
        assert!(conn.upload_retry_pending);
        assert_eq!(conn.peer_requests.len(), 1);
    }

    // the deferred connection does not hold up others
    {
        let mut state = monitor.lock();
        let t = state.torrents.get_mut(&info_hash).unwrap();
        t.handle_message(other, Message::Interested).unwrap();
        t.handle_message(other, Message::Request(Request::new(3, 0, 2_000)))
            .unwrap();
    }
    assert_eq!(piece_indices(&sent(&other_handles)), vec![3]);
    assert!(piece_indices(&sent(&busy_handles)).is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(piece_indices(&sent(&busy_handles)), vec![2]);
    let state = monitor.lock();
    let conn = &state.torrents[&info_hash].conns[&busy];
    assert!(!conn.upload_retry_pending);
    assert!(conn.peer_requests.is_empty());
    assert_eq!(conn.stats.chunks_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn test_request_larger_than_burst_is_served() {
    let (monitor, ctx) = monitored(ClientConfig {
        seed: true,
        upload_rate_limit: 1_000,
        ..Default::default()
    });
    let data = vec![3u8; 64 * 1024];
    let info_hash = add_to(&monitor, &ctx, &data, 32 * 1024, 32 * 1024, true);

    let (id, handles) = {
        let mut state = monitor.lock();
        let t = state.torrents.get_mut(&info_hash).unwrap();
        let (id, handles) = connect(t, 1, false);
        t.handle_message(id, Message::Interested).unwrap();
        for index in 0..2 {
            t.handle_message(id, Message::Request(Request::new(index, 0, 32 * 1024)))
                .unwrap();
        }
        (id, handles)
    };
    assert_eq!(piece_indices(&sent(&handles)), vec![0]);

    // the 16 KiB bucket must refill past the 16 KiB debt
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(piece_indices(&sent(&handles)).is_empty());
    tokio::time::sleep(Duration::from_secs(13)).await;
    assert_eq!(piece_indices(&sent(&handles)), vec![1]);

    let state = monitor.lock();
    assert_eq!(state.torrents[&info_hash].conns[&id].stats.chunks_sent, 2);
}
