use super::*;
use crate::config::ClientConfig;
use crate::connection::ConnInfo;
use crate::protocol::{HANDSHAKE_LEN, Handshake};
use crate::torrent::tests::{connect, leecher, peer_info, torrent_with, DATA};
use crate::types::PeerId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const OUR_ID: PeerId = PeerId([5; 20]);
const TORRENT: InfoHash = InfoHash([7; 20]);

fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 6881))
}

fn config() -> ClientConfig {
    ClientConfig {
        peer_id: Some(OUR_ID),
        ..Default::default()
    }
}

fn handshake_err<T>(result: Result<T, HandshakeError>) -> HandshakeError {
    match result {
        Ok(_) => panic!("handshake unexpectedly succeeded"),
        Err(e) => e,
    }
}

/// Opens an in-memory stream at once and hands it out after a delay. The far
/// end is kept so tests can see whether the near end was dropped.
struct MockDialer {
    network: &'static str,
    delay: Duration,
    fail: bool,
    far_ends: Arc<Mutex<Vec<DuplexStream>>>,
}

impl MockDialer {
    fn new(network: &'static str, delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            network,
            delay,
            fail,
            far_ends: Arc::default(),
        })
    }
}

impl Dialer for MockDialer {
    fn network(&self) -> &'static str {
        self.network
    }

    fn dial(&self, _addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxStream>> {
        let (delay, fail, far_ends) = (self.delay, self.fail, self.far_ends.clone());
        Box::pin(async move {
            let (near, far) = tokio::io::duplex(4096);
            far_ends.lock().push(far);
            tokio::time::sleep(delay).await;
            if fail {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            Ok(Box::new(near) as BoxStream)
        })
    }
}

/// Dials a scripted peer that answers the handshake with fixed values.
struct PeerDialer {
    info_hash: InfoHash,
    peer_id: PeerId,
    dials: AtomicUsize,
}

impl PeerDialer {
    fn new(info_hash: InfoHash, peer_id: PeerId) -> Arc<Self> {
        Arc::new(Self {
            info_hash,
            peer_id,
            dials: AtomicUsize::new(0),
        })
    }
}

impl Dialer for PeerDialer {
    fn network(&self) -> &'static str {
        "mock"
    }

    fn dial(&self, _addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxStream>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let reply = Handshake::new(ExtensionBits::ours(false), self.info_hash, self.peer_id).encode();
        Box::pin(async move {
            let (near, mut far) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let mut theirs = [0u8; HANDSHAKE_LEN];
                if far.read_exact(&mut theirs).await.is_ok() {
                    let _ = far.write_all(&reply).await;
                    let _ = far.read(&mut [0u8; 1]).await;
                }
            });
            Ok(Box::new(near) as BoxStream)
        })
    }
}

/// Never finds a shared secret.
struct FailingObfuscator;

impl Obfuscator for FailingObfuscator {
    fn initiate(
        &self,
        _stream: BoxStream,
        _info_hash: InfoHash,
    ) -> BoxFuture<'static, Result<BoxStream, HandshakeError>> {
        Box::pin(async { Err(HandshakeError::NoMatchingSecret) })
    }

    fn accept(
        &self,
        stream: BoxStream,
        _skeys: Vec<InfoHash>,
    ) -> BoxFuture<'static, Result<(BoxStream, bool), HandshakeError>> {
        Box::pin(async move { Ok((stream, false)) })
    }
}

#[test]
fn test_reduced_dial_timeout() {
    let min = Duration::from_secs(5);
    let nominal = Duration::from_secs(30);
    assert_eq!(reduced_dial_timeout(min, nominal, 80, 0), nominal);
    assert_eq!(reduced_dial_timeout(min, nominal, 80, 79), nominal);
    assert_eq!(reduced_dial_timeout(min, nominal, 80, 160), Duration::from_secs(10));
    assert_eq!(reduced_dial_timeout(min, nominal, 80, 10_000), min);
    assert_eq!(reduced_dial_timeout(min, nominal, 0, 1), Duration::from_secs(15));
}

#[test]
fn test_enabled_dialers_respect_config() {
    let dialers: Vec<Arc<dyn Dialer>> = vec![
        MockDialer::new("tcp", Duration::ZERO, false),
        MockDialer::new("utp", Duration::ZERO, false),
    ];
    let ctx = ClientContext::for_tests_with(
        ClientConfig {
            disable_tcp: true,
            ..Default::default()
        },
        dialers.clone(),
        None,
    );
    let enabled = enabled_dialers(&ctx);
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].network(), "utp");

    let ctx = ClientContext::for_tests_with(
        ClientConfig {
            disable_overlay: true,
            ..Default::default()
        },
        dialers,
        None,
    );
    assert_eq!(enabled_dialers(&ctx)[0].network(), "tcp");
}

#[tokio::test(start_paused = true)]
async fn test_dial_first_takes_fastest_transport() {
    let slow = MockDialer::new("tcp", Duration::from_secs(2), false);
    let fast = MockDialer::new("utp", Duration::from_secs(1), false);
    let dialers: Vec<Arc<dyn Dialer>> = vec![slow.clone(), fast.clone()];

    let (_stream, network) = dial_first(&dialers, addr(1), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(network, "utp");
    assert_eq!(fast.far_ends.lock().len(), 1);

    // the slower attempt was cancelled mid-dial and its stream dropped
    let mut slow_far = slow.far_ends.lock().pop().unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(slow_far.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dial_first_closes_losing_stream() {
    let tcp = MockDialer::new("tcp", Duration::from_secs(1), false);
    let utp = MockDialer::new("utp", Duration::from_secs(1), false);
    let dialers: Vec<Arc<dyn Dialer>> = vec![tcp.clone(), utp.clone()];

    let (mut stream, network) = dial_first(&dialers, addr(1), Duration::from_secs(10))
        .await
        .unwrap();
    let (winner, loser) = if network == "tcp" { (tcp, utp) } else { (utp, tcp) };
    let mut winner_far = winner.far_ends.lock().pop().unwrap();
    let mut loser_far = loser.far_ends.lock().pop().unwrap();
    assert!(winner.far_ends.lock().is_empty());
    assert!(loser.far_ends.lock().is_empty());

    let mut buf = [0u8; 1];
    assert_eq!(loser_far.read(&mut buf).await.unwrap(), 0);

    stream.write_all(b"x").await.unwrap();
    winner_far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"x");
}

#[tokio::test(start_paused = true)]
async fn test_dial_first_skips_failed_transport() {
    let dialers: Vec<Arc<dyn Dialer>> = vec![
        MockDialer::new("tcp", Duration::ZERO, true),
        MockDialer::new("utp", Duration::from_secs(1), false),
    ];
    let (_stream, network) = dial_first(&dialers, addr(1), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(network, "utp");
}

#[tokio::test(start_paused = true)]
async fn test_dial_first_errors() {
    let failing: Vec<Arc<dyn Dialer>> = vec![MockDialer::new("tcp", Duration::ZERO, true)];
    let err = handshake_err(dial_first(&failing, addr(1), Duration::from_secs(1)).await);
    assert!(matches!(err, HandshakeError::DialFailed(a) if a == addr(1)));

    let slow: Vec<Arc<dyn Dialer>> = vec![MockDialer::new("tcp", Duration::from_secs(60), false)];
    let err = handshake_err(dial_first(&slow, addr(1), Duration::from_secs(1)).await);
    assert!(matches!(err, HandshakeError::Timeout));

    let err = handshake_err(dial_first(&[], addr(1), Duration::from_secs(1)).await);
    assert!(matches!(err, HandshakeError::NoTransport));
}

#[tokio::test]
async fn test_establish_outgoing() {
    let remote = PeerId([1; 20]);
    let dialer = PeerDialer::new(TORRENT, remote);
    let ctx = ClientContext::for_tests_with(config(), vec![dialer.clone() as Arc<dyn Dialer>], None);
    let peer = Peer::new(addr(1), PeerSource::Tracker);

    let est = establish_outgoing(&ctx, TORRENT, &peer, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(est.info_hash, TORRENT);
    assert_eq!(est.info.peer_id, remote);
    assert_eq!(est.info.network, "mock");
    assert_eq!(est.info.source, PeerSource::Tracker);
    assert!(est.info.outgoing);
    assert!(!est.info.encrypted);
    assert!(est.info.extensions.supports_fast());
    assert!(!est.info.extensions.supports_dht());
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_establish_outgoing_rejects_bad_peers() {
    let peer = Peer::new(addr(1), PeerSource::Tracker);

    let ctx = ClientContext::for_tests_with(
        config(),
        vec![PeerDialer::new(InfoHash([8; 20]), PeerId([1; 20])) as Arc<dyn Dialer>],
        None,
    );
    let err = handshake_err(establish_outgoing(&ctx, TORRENT, &peer, Duration::from_secs(5)).await);
    assert!(matches!(err, HandshakeError::InfoHashMismatch));

    let ctx = ClientContext::for_tests_with(config(), vec![PeerDialer::new(TORRENT, OUR_ID) as Arc<dyn Dialer>], None);
    let err = handshake_err(establish_outgoing(&ctx, TORRENT, &peer, Duration::from_secs(5)).await);
    assert!(matches!(err, HandshakeError::Doppelganger));
    assert!(ctx.is_doppelganger(&addr(1)));
}

#[tokio::test]
async fn test_encryption_falls_back_to_plaintext() {
    let dialer = PeerDialer::new(TORRENT, PeerId([1; 20]));
    let ctx = ClientContext::for_tests_with(
        config(),
        vec![dialer.clone() as Arc<dyn Dialer>],
        Some(Arc::new(FailingObfuscator)),
    );
    let peer = Peer::new(addr(1), PeerSource::Direct);

    let est = establish_outgoing(&ctx, TORRENT, &peer, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!est.info.encrypted);
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_required_encryption_without_obfuscator() {
    let dialer = PeerDialer::new(TORRENT, PeerId([1; 20]));
    let ctx = ClientContext::for_tests_with(
        ClientConfig {
            encryption: EncryptionPolicy::Required,
            ..config()
        },
        vec![dialer.clone() as Arc<dyn Dialer>],
        None,
    );
    let peer = Peer::new(addr(1), PeerSource::Direct);
    let err = handshake_err(establish_outgoing(&ctx, TORRENT, &peer, Duration::from_secs(5)).await);
    assert!(matches!(err, HandshakeError::EncryptionRequired));
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_receive_handshake() {
    let ctx = ClientContext::for_tests(config());
    let remote = PeerId([1; 20]);

    let (near, mut far) = tokio::io::duplex(4096);
    far.write_all(&Handshake::new(ExtensionBits::ours(false), TORRENT, remote).encode())
        .await
        .unwrap();
    let est = receive_handshake(&ctx, Box::new(near), addr(1), "tcp", vec![TORRENT])
        .await
        .unwrap();
    assert_eq!(est.info.peer_id, remote);
    assert_eq!(est.info.source, PeerSource::Incoming);
    assert!(!est.info.outgoing);

    let mut reply = [0u8; HANDSHAKE_LEN];
    far.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[28..48], TORRENT.as_bytes());
    assert_eq!(&reply[48..], OUR_ID.as_bytes());
}

#[tokio::test]
async fn test_receive_handshake_unknown_torrent() {
    let ctx = ClientContext::for_tests(config());
    let (near, mut far) = tokio::io::duplex(4096);
    far.write_all(&Handshake::new(ExtensionBits::default(), InfoHash([8; 20]), PeerId([1; 20])).encode())
        .await
        .unwrap();
    let err = handshake_err(receive_handshake(&ctx, Box::new(near), addr(1), "tcp", vec![TORRENT]).await);
    assert!(matches!(err, HandshakeError::UnknownTorrent));
}

fn incoming(n: u8, peer_id: PeerId) -> ConnInfo {
    ConnInfo {
        peer_id,
        outgoing: false,
        ..peer_info(n, false)
    }
}

#[test]
fn test_duplicate_peer_id_resolution() {
    let (mut t, _) = torrent_with(config(), DATA, 5, 5, false);
    t.download_pieces(0, 3);
    // our id is higher, so only the remote's outgoing connection survives
    let remote = PeerId([1; 20]);
    let (first, _h) = t
        .add_connection(ConnInfo {
            outgoing: true,
            ..incoming(1, remote)
        })
        .unwrap();

    let err = t
        .add_connection(ConnInfo {
            outgoing: true,
            ..incoming(2, remote)
        })
        .map(|(id, _)| id)
        .unwrap_err();
    assert_eq!(err, Rejection::Duplicate);

    let (second, _h) = t.add_connection(incoming(3, remote)).unwrap();
    assert!(!t.conns.contains_key(&first));
    assert!(t.conns.contains_key(&second));
}

#[test]
fn test_admission_when_full() {
    let mut t = leecher(DATA, 5, 5);
    t.max_established_conns = 1;
    let (first, _h) = connect(&mut t, 1, false);

    let err = t
        .add_connection(incoming(2, PeerId([2; 20])))
        .map(|(id, _)| id)
        .unwrap_err();
    assert_eq!(err, Rejection::Full);

    t.conns.get_mut(&first).unwrap().stats.unwanted_chunks_received = UNWANTED_CHUNKS_EVICTION;
    assert_eq!(t.worst_bad_conn(), Some(first));
    let (second, _h) = t.add_connection(incoming(2, PeerId([2; 20]))).unwrap();
    assert!(!t.conns.contains_key(&first));
    assert!(t.conns.contains_key(&second));
}

#[test]
fn test_admission_rejected_when_not_accepting() {
    let (mut t, _) = torrent_with(config(), DATA, 5, 5, false);
    let err = t
        .add_connection(incoming(1, PeerId([1; 20])))
        .map(|(id, _)| id)
        .unwrap_err();
    assert_eq!(err, Rejection::NotAccepting);
    assert!(!t.want_conns());

    t.download_pieces(0, 1);
    assert!(t.want_conns());
    t.close();
    assert!(!t.want_conns());
    let err = t
        .add_connection(incoming(1, PeerId([1; 20])))
        .map(|(id, _)| id)
        .unwrap_err();
    assert_eq!(err, Rejection::Closed);
}

#[test]
fn test_lowering_limit_evicts_worst_first() {
    let mut t = leecher(DATA, 5, 5);
    let (a, _ha) = connect(&mut t, 1, false);
    let (b, _hb) = connect(&mut t, 2, false);
    let (c, _hc) = connect(&mut t, 3, false);
    t.conns.get_mut(&b).unwrap().peer_has_all = true;

    assert_eq!(t.set_max_established_conns(1), config().established_conns_per_torrent);
    assert_eq!(t.conns.len(), 1);
    assert!(t.conns.contains_key(&b));
    assert!(!t.conns.contains_key(&a) && !t.conns.contains_key(&c));
    assert!(!t.want_conns());
}

#[test]
fn test_dropped_connection_releases_requests() {
    let mut t = leecher(DATA, 5, 5);
    let (id, handles) = connect(&mut t, 1, false);
    t.conns.get_mut(&id).unwrap().peer_has_all = true;
    t.conns.get_mut(&id).unwrap().peer_choking = false;
    t.update_requests(id);
    assert_eq!(t.pending_requests.len(), 3);

    assert!(t.drop_connection(id, "test"));
    assert!(!t.drop_connection(id, "test"));
    assert!(t.pending_requests.is_empty());
    assert!(*handles.closed.borrow());
}
