//! rswarm - A peer-to-peer swarm engine
//!
//! This library implements the core of a BitTorrent-style client: it decides
//! which chunks to request from which peers, runs the peer wire state
//! machine, decides whom to upload to, verifies pieces, and manages the
//! connection pool. Metainfo parsing and peer discovery are left to the
//! embedding application, which supplies a [`TorrentLayout`] and feeds peers
//! through [`Torrent::add_peers`].
//!
//! # Modules
//!
//! - [`protocol`] - BEP-3/6/10/11 wire codec and framing
//! - [`storage`] - Storage traits, in-memory and file-backed storage
//! - [`bandwidth`] - Upload rate limiting
//! - [`peer`] - Peer addresses and the dial reserve
//! - [`manager`] - Transports, dialing and stream obfuscation hooks
//!
//! # Example
//!
//! ```no_run
//! use rswarm::{Client, ClientConfig, InfoHash, Peer, PeerSource, TorrentLayout, TorrentSpec};
//! use std::io::Read;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(ClientConfig::default());
//! let layout = TorrentLayout::single_file("data.bin", 13, 5, vec![[0u8; 20]; 3])?;
//! let (torrent, _) = client.add_torrent(TorrentSpec::new(InfoHash([1; 20]), layout))?;
//! torrent.add_peers([Peer::new("10.0.0.2:6881".parse()?, PeerSource::Direct)])?;
//! torrent.download_all()?;
//!
//! let mut reader = torrent.new_reader()?;
//! let data = tokio::task::spawn_blocking(move || {
//!     let mut buf = Vec::new();
//!     reader.read_to_end(&mut buf).map(|_| buf)
//! })
//! .await??;
//! # Ok(())
//! # }
//! ```

pub mod bandwidth;
mod bitmap;
mod choking;
mod client;
pub mod config;
mod connection;
pub mod constants;
pub mod error;
pub mod manager;
pub mod peer;
mod piece;
pub mod protocol;
mod reader;
mod scheduler;
pub mod storage;
mod torrent;
mod types;
mod verifier;

pub use bitmap::Bitmap;
pub use client::{Client, ClientBuilder, TorrentSpec};
pub use config::{ClientConfig, EncryptionPolicy, RequestOrdering};
pub use connection::ConnStats;
pub use error::{ConnError, Error, HandshakeError};
pub use manager::{BoxStream, DhtPinger, Dialer, Obfuscator, PeerStream, TcpDialer};
pub use peer::{Peer, PeerSource};
pub use piece::{PiecePriority, PieceState, PieceStateRun};
pub use reader::Reader;
pub use storage::{
    FileEntry, FileStorage, MemoryStorage, PieceDescriptor, PieceStorage, StorageError,
    StorageProvider, TorrentLayout, TorrentStorage,
};
pub use torrent::{PieceStateChange, Torrent, TorrentStats};
pub use types::{InfoHash, PeerId};
