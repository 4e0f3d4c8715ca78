//! Protocol constants and tuning parameters.
//!
//! Defaults follow common client behaviour; most can be overridden through
//! [`ClientConfig`](crate::ClientConfig).

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client version string sent as `v` in the extended handshake.
pub const CLIENT_NAME: &str = "rswarm 0.1.0";

// ============================================================================
// Chunks and messages
// ============================================================================

/// Standard chunk size (16 KiB).
pub const CHUNK_SIZE: u32 = 16384;

/// Largest chunk a peer may request from us (BEP-3 suggests 128 KiB at most).
pub const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

/// Largest framed message accepted from a peer.
pub const MAX_MESSAGE_LENGTH: usize = 256 * 1024;

// ============================================================================
// Request pipelining
// ============================================================================

/// Requests we assume a peer accepts before it tells us otherwise (`reqq`).
pub const DEFAULT_PEER_MAX_REQUESTS: usize = 250;

/// Pipeline depth every connection is trusted with regardless of history.
pub const BASE_REQUEST_PIPELINE: usize = 64;

/// Pending peer requests we queue before ignoring (or rejecting) more.
pub const MAX_PEER_REQUESTS: usize = 250;

// ============================================================================
// Connection limits
// ============================================================================

/// Established connections per torrent.
pub const ESTABLISHED_CONNS_PER_TORRENT: usize = 80;

/// Dial attempts in flight per torrent.
pub const HALF_OPEN_CONNS_PER_TORRENT: usize = 80;

/// Most peers kept in a torrent's reserve.
pub const TORRENT_PEERS_HIGH_WATER: usize = 200;

/// Connections must be at least this old before eviction for slowness.
pub const EVICTION_GRACE: Duration = Duration::from_secs(60);

/// Unwanted chunks after which a connection is evicted outright if it has
/// also sent more unwanted than useful chunks.
pub const UNWANTED_CHUNKS_EVICTION: u64 = 6;

/// Cap on suggested pieces remembered per connection.
pub const MAX_SUGGESTED_PIECES: usize = 32;

/// Inclination buffers retained for reuse per torrent.
pub const INCLINATION_POOL_SIZE: usize = 64;

// ============================================================================
// Timeouts
// ============================================================================

/// Dial timeout when the reserve is small.
pub const NOMINAL_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Dial timeout floor when the reserve is large.
pub const MIN_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Limit on the whole handshake exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Idle interval after which a keepalive is written.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

// ============================================================================
// Upload
// ============================================================================

/// Bytes we serve beyond what a peer has given us while leeching.
pub const UPLOAD_SLACK: u64 = 100 * 1024;

// ============================================================================
// Readers
// ============================================================================

/// Default readahead for new readers.
pub const DEFAULT_READAHEAD: u64 = 5 * 1024 * 1024;

// ============================================================================
// Extension protocol
// ============================================================================

/// Extended message id of the extension handshake (BEP-10).
pub const HANDSHAKE_EXTENDED_ID: u8 = 0;

/// Local id we assign to `ut_pex`.
pub const PEX_EXTENDED_ID: u8 = 1;

/// Local id we assign to `ut_metadata`.
pub const METADATA_EXTENDED_ID: u8 = 2;
