//! Client configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;
use crate::types::PeerId;

/// How connections use stream obfuscation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionPolicy {
    /// Never obfuscate.
    Disabled,
    /// Try obfuscated first, fall back to plaintext.
    #[default]
    Preferred,
    /// Try plaintext first, fall back to obfuscated.
    PreferPlaintext,
    /// Only obfuscated connections.
    Required,
}

impl EncryptionPolicy {
    /// The obfuscation setting of each handshake attempt, in order.
    pub fn attempts(self, obfuscation_available: bool) -> Vec<bool> {
        match (self, obfuscation_available) {
            (EncryptionPolicy::Required, false) => vec![],
            (EncryptionPolicy::Required, true) => vec![true],
            (_, false) | (EncryptionPolicy::Disabled, _) => vec![false],
            (EncryptionPolicy::Preferred, true) => vec![true, false],
            (EncryptionPolicy::PreferPlaintext, true) => vec![false, true],
        }
    }
}

/// How pieces of equal priority are ordered when choosing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestOrdering {
    /// Strict piece order when a reader is active and this connection is
    /// the only one or the fastest one; per-connection random order
    /// otherwise.
    #[default]
    Heuristic,
    /// Always use the connection's random inclination.
    Biased,
    /// Always use strict piece order.
    Unbiased,
}

/// Client-wide settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address to accept peers on. `None` disables listening.
    pub listen_addr: Option<SocketAddr>,
    /// Fixed peer id. Generated when `None`.
    pub peer_id: Option<PeerId>,
    /// Directory for file storage. In-memory storage when `None`.
    pub data_dir: Option<PathBuf>,
    /// Never upload.
    pub no_upload: bool,
    /// Keep uploading after all pieces are complete.
    pub seed: bool,
    /// Upload bytes per second. Zero is unlimited.
    pub upload_rate_limit: u64,
    /// Do not dial over TCP.
    pub disable_tcp: bool,
    /// Do not dial over non-TCP transports.
    pub disable_overlay: bool,
    /// Ignore and do not advertise peer exchange.
    pub disable_pex: bool,
    pub encryption: EncryptionPolicy,
    pub established_conns_per_torrent: usize,
    pub half_open_conns_per_torrent: usize,
    /// Most peers kept in reserve per torrent.
    pub torrent_peers_high_water: usize,
    /// Dial timeout with an empty reserve.
    pub nominal_dial_timeout: Duration,
    /// Dial timeout floor.
    pub min_dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub request_ordering: RequestOrdering,
    /// Bytes served beyond what a leeching peer has sent us.
    pub upload_slack: u64,
    /// Local DHT port announced to peers that support it.
    pub dht_port: Option<u16>,
    /// Sent as `v` in the extended handshake.
    pub client_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            peer_id: None,
            data_dir: None,
            no_upload: false,
            seed: false,
            upload_rate_limit: 0,
            disable_tcp: false,
            disable_overlay: false,
            disable_pex: false,
            encryption: EncryptionPolicy::default(),
            established_conns_per_torrent: ESTABLISHED_CONNS_PER_TORRENT,
            half_open_conns_per_torrent: HALF_OPEN_CONNS_PER_TORRENT,
            torrent_peers_high_water: TORRENT_PEERS_HIGH_WATER,
            nominal_dial_timeout: NOMINAL_DIAL_TIMEOUT,
            min_dial_timeout: MIN_DIAL_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            request_ordering: RequestOrdering::default(),
            upload_slack: UPLOAD_SLACK,
            dht_port: None,
            client_name: CLIENT_NAME.to_string(),
        }
    }
}

impl ClientConfig {
    /// Idle time after which a silent peer is dropped.
    pub fn read_timeout(&self) -> Duration {
        self.keepalive_interval * 2 + Duration::from_secs(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_attempts() {
        assert_eq!(EncryptionPolicy::Preferred.attempts(true), vec![true, false]);
        assert_eq!(EncryptionPolicy::Preferred.attempts(false), vec![false]);
        assert_eq!(EncryptionPolicy::PreferPlaintext.attempts(true), vec![false, true]);
        assert_eq!(EncryptionPolicy::Disabled.attempts(true), vec![false]);
        assert!(EncryptionPolicy::Required.attempts(false).is_empty());
    }

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.established_conns_per_torrent, 80);
        assert_eq!(cfg.upload_slack, 100 * 1024);
        assert!(cfg.read_timeout() > cfg.keepalive_interval);
    }
}
