use super::*;
use crate::types::{InfoHash, PeerId};
use bytes::Bytes;
use std::net::SocketAddr;

#[test]
fn test_message_frames() {
    let have = Message::Have { piece: 7 }.encode();
    assert_eq!(have.as_ref(), &[0, 0, 0, 5, 4, 0, 0, 0, 7]);

    let keepalive = Message::KeepAlive.encode();
    assert_eq!(keepalive.as_ref(), &[0, 0, 0, 0]);

    let req = Message::Request(Request::new(1, 16384, 16384));
    assert_eq!(req.wire_len(), 17);
    assert_eq!(req.encode().len(), 17);
}

#[test]
fn test_decode_body() {
    let body = Bytes::from_static(&[7, 0, 0, 0, 2, 0, 0, 0, 4, b'a', b'b']);
    let msg = Message::decode(body).unwrap();
    assert_eq!(
        msg,
        Message::Piece {
            index: 2,
            begin: 4,
            data: Bytes::from_static(b"ab"),
        }
    );
    assert_eq!(Message::decode(Bytes::new()).unwrap(), Message::KeepAlive);
}

#[test]
fn test_decode_rejects_bad_lengths() {
    let short_have = Bytes::from_static(&[4, 0, 0]);
    assert!(matches!(
        Message::decode(short_have),
        Err(ProtocolError::BadLength { kind: "have", .. })
    ));

    let fat_choke = Bytes::from_static(&[0, 1]);
    assert!(Message::decode(fat_choke).is_err());

    assert!(matches!(
        Message::decode(Bytes::from_static(&[42])),
        Err(ProtocolError::UnknownMessageId(42))
    ));
}

#[test]
fn test_fast_only_messages() {
    assert!(Message::HaveAll.is_fast_only());
    assert!(Message::Reject(Request::new(0, 0, 1)).is_fast_only());
    assert!(!Message::Have { piece: 0 }.is_fast_only());
    assert!(!Message::Cancel(Request::new(0, 0, 1)).is_fast_only());
}

#[test]
fn test_handshake_header() {
    let ih = InfoHash([3u8; 20]);
    let hs = Handshake::new(ExtensionBits::ours(true), ih, PeerId::generate());
    let encoded = hs.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);

    let (bits, parsed) = decode_header(&encoded[..HANDSHAKE_HEADER_LEN]).unwrap();
    assert_eq!(parsed, ih);
    assert!(bits.supports_fast());
    assert!(bits.supports_extended());
    assert!(bits.supports_dht());

    let mut bad = encoded.to_vec();
    bad[1] = b'X';
    assert!(decode_header(&bad).is_err());
}

#[test]
fn test_extension_bits_intersect() {
    let plain = ExtensionBits::default();
    let both = ExtensionBits::ours(false).intersect(plain);
    assert!(!both.supports_fast());
    assert!(ExtensionBits::ours(false)
        .intersect(ExtensionBits::ours(true))
        .supports_fast());
}

#[test]
fn test_extended_handshake() {
    let mut hs = ExtendedHandshake {
        client: Some("test 1.0".into()),
        reqq: Some(500),
        ..Default::default()
    };
    hs.extensions.insert("ut_pex".into(), 1);
    let decoded = ExtendedHandshake::decode(&hs.encode().unwrap()).unwrap();
    assert_eq!(decoded, hs);
}

#[test]
fn test_extended_handshake_skips_disabled_extensions() {
    let raw = b"d1:md11:ut_metadatai3e6:ut_pexi0eee";
    let hs = ExtendedHandshake::decode(raw).unwrap();
    assert_eq!(hs.extensions.get("ut_metadata"), Some(&3));
    assert!(!hs.extensions.contains_key("ut_pex"));
    assert_eq!(hs.disabled, vec!["ut_pex".to_string()]);
}

#[test]
fn test_pex_decode_added() {
    // one v4 peer 10.0.0.1:6881 flagged as a seed with encryption
    let mut raw = b"d5:added6:".to_vec();
    raw.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
    raw.extend_from_slice(b"7:added.f1:");
    raw.push(0x03);
    raw.push(b'e');

    let msg = PexMessage::decode(&raw).unwrap();
    assert_eq!(msg.added.len(), 1);
    let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    assert_eq!(msg.added[0].addr, addr);
    assert!(msg.added[0].seed);
    assert!(msg.added[0].supports_encryption);
}

#[tokio::test]
async fn test_frame_reader_splits_handshake_and_messages() {
    let (client, mut server) = tokio::io::duplex(1024);
    let ih = InfoHash([9u8; 20]);
    let id = PeerId::generate();

    let mut wire = Handshake::new(ExtensionBits::ours(false), ih, id).encode().to_vec();
    wire.extend_from_slice(&Message::Unchoke.encode());
    wire.extend_from_slice(&Message::Have { piece: 3 }.encode());
    tokio::io::AsyncWriteExt::write_all(&mut server, &wire)
        .await
        .unwrap();
    drop(server);

    let mut reader = FrameReader::new(client);
    let (_, got_ih) = reader.read_handshake_header().await.unwrap();
    assert_eq!(got_ih, ih);
    assert_eq!(reader.read_peer_id().await.unwrap(), id);
    assert_eq!(reader.read_message().await.unwrap().0, Message::Unchoke);
    assert_eq!(
        reader.read_message().await.unwrap(),
        (Message::Have { piece: 3 }, 9)
    );
    assert!(matches!(
        reader.read_message().await,
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_frame_reader_rejects_oversized() {
    let (client, mut server) = tokio::io::duplex(64);
    tokio::io::AsyncWriteExt::write_all(&mut server, &[0x7f, 0, 0, 0])
        .await
        .unwrap();
    let mut reader = FrameReader::new(client);
    assert!(matches!(
        reader.read_message().await,
        Err(ProtocolError::MessageTooLarge(_))
    ));
}

#[tokio::test]
async fn test_frame_writer_buffers_until_flush() {
    let (client, server) = tokio::io::duplex(1024);
    let mut writer = FrameWriter::new(client);
    let n = writer.write_message(&Message::Interested).await.unwrap();
    assert_eq!(n, 5);
    writer.flush().await.unwrap();

    let mut reader = FrameReader::new(server);
    assert_eq!(reader.read_message().await.unwrap().0, Message::Interested);
}
