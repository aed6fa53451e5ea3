//! This module defines types used to configure the engine and its parts.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::{error::*, NodeId, Sha1Hash, PIECE_LEN};

/// The smallest id a node in the configured peer set may have.
pub const MIN_NODE_ID: NodeId = 10;
/// The largest id a node in the configured peer set may have.
pub const MAX_NODE_ID: NodeId = 99;

/// The maximum number of peer connections (inbound and outbound combined) a
/// session keeps at once.
pub const MAX_PEERS: usize = 8;
/// The maximum number of in-flight REQUESTs a single peer connection may have
/// outstanding at once.
pub const MAX_PENDING_REQUESTS: usize = 5;
/// The number of outbound connect attempts made to a configured peer before
/// its slot is abandoned for the remainder of the session.
pub const MAX_RETRIES: usize = 3;
/// The default port the session's listening socket and all peer addresses
/// use.
pub const DEFAULT_PORT: u16 = 45501;

/// The global configuration for a single-torrent engine session.
///
/// Unlike most BitTorrent engines, a `Session` here drives exactly one
/// torrent, so there is no separate engine-wide/per-torrent split: this is
/// the only configuration type.
#[derive(Clone, Debug)]
pub struct Conf {
    /// This node's identity, used both to derive `self`'s peer id and to
    /// compute the configured peer set.
    pub self_id: NodeId,
    /// The torrent's 20 byte content fingerprint.
    pub info_hash: Sha1Hash,
    /// The number of pieces in the torrent.
    pub num_pieces: usize,
    /// The fixed piece length. Always [`PIECE_LEN`]; kept as a field (rather
    /// than reading the constant everywhere) so tests can exercise small
    /// piece counts without allocating 16 KiB buffers.
    pub piece_len: u32,
    /// The maximum number of simultaneous peer connections.
    pub max_peers: usize,
    /// The maximum number of in-flight REQUESTs per peer connection.
    pub max_pending_requests: usize,
    /// The number of outbound connect retries per configured peer.
    pub max_retries: usize,
    /// The port both the listening socket and all peer addresses use.
    pub port: u16,
}

impl Conf {
    /// Returns a configuration with reasonable defaults for everything except
    /// the values that must come from the session's identity and the torrent
    /// being served: `self_id`, `info_hash`, `num_pieces`.
    pub fn new(self_id: NodeId, info_hash: Sha1Hash, num_pieces: usize) -> Result<Self> {
        if self_id < MIN_NODE_ID || self_id > MAX_NODE_ID {
            return Err(Error::InvalidSessionUri(format!(
                "self id {} outside [{}, {}]",
                self_id, MIN_NODE_ID, MAX_NODE_ID
            )));
        }
        Ok(Self {
            self_id,
            info_hash,
            num_pieces,
            piece_len: PIECE_LEN,
            max_peers: MAX_PEERS,
            max_pending_requests: MAX_PENDING_REQUESTS,
            max_retries: MAX_RETRIES,
            port: DEFAULT_PORT,
        })
    }

    /// Parses a `bt://<id>` session URI together with a 40 character hex
    /// info-hash string into a `Conf`.
    pub fn from_uri(uri: &str, info_hash_hex: &str, num_pieces: usize) -> Result<Self> {
        let host = uri
            .strip_prefix("bt://")
            .ok_or_else(|| Error::InvalidSessionUri(uri.to_string()))?;
        let self_id: NodeId = host
            .parse()
            .map_err(|_| Error::InvalidSessionUri(uri.to_string()))?;
        let info_hash = parse_info_hash(info_hash_hex)?;
        Self::new(self_id, info_hash, num_pieces)
    }

    /// The address a node with the given id binds to, or is dialed at:
    /// `192.168.4.<id>:<port>`.
    pub fn addr_for_id(&self, id: NodeId) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 4, id)), self.port)
    }

    /// This session's own listening address.
    pub fn bind_addr(&self) -> SocketAddr {
        self.addr_for_id(self.self_id)
    }

    /// The configured peer set: `peer_id = self_id + k + 1` for
    /// `k in [0, max_peers)`. `None` stands in for a slot whose id would
    /// exceed [`MAX_NODE_ID`], i.e. there is no peer configured for it.
    pub fn peer_targets(&self) -> Vec<Option<NodeId>> {
        (0..self.max_peers as u32)
            .map(|k| {
                let candidate = self.self_id as u32 + k + 1;
                if candidate > MAX_NODE_ID as u32 {
                    None
                } else {
                    Some(candidate as NodeId)
                }
            })
            .collect()
    }
}

/// Decodes a 40 character hex string into a 20 byte info-hash.
pub fn parse_info_hash(hex_str: &str) -> Result<Sha1Hash> {
    let bytes = hex::decode(hex_str).map_err(|_| Error::InvalidInfoHash)?;
    if bytes.len() != 20 {
        return Err(Error::InvalidInfoHash);
    }
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&bytes);
    Ok(info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_info_hash() {
        let hex_str = "0".repeat(40);
        assert_eq!(parse_info_hash(&hex_str).unwrap(), [0u8; 20]);
    }

    #[test]
    fn rejects_wrong_length_info_hash() {
        assert!(parse_info_hash("abcd").is_err());
    }

    #[test]
    fn rejects_non_hex_info_hash() {
        let bad = "g".repeat(40);
        assert!(parse_info_hash(&bad).is_err());
    }

    #[test]
    fn peer_targets_wrap_with_sentinel() {
        let conf = Conf::new(97, [0u8; 20], 4).unwrap();
        let targets = conf.peer_targets();
        assert_eq!(targets[0], Some(98));
        assert_eq!(targets[1], Some(99));
        assert_eq!(targets[2], None);
    }

    #[test]
    fn addr_for_id_uses_reference_subnet() {
        let conf = Conf::new(10, [0u8; 20], 4).unwrap();
        assert_eq!(conf.addr_for_id(11).to_string(), "192.168.4.11:45501");
    }

    #[test]
    fn rejects_self_id_out_of_range() {
        assert!(Conf::new(9, [0u8; 20], 4).is_err());
        assert!(Conf::new(100, [0u8; 20], 4).is_err());
    }

    #[test]
    fn from_uri_parses_scheme() {
        let conf = Conf::from_uri("bt://42", &"a".repeat(40), 4).unwrap();
        assert_eq!(conf.self_id, 42);
    }
}
