// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

mod counter;
pub mod conf;
pub mod delivery;
pub mod error;
mod peer;
mod piece_picker;
mod piece_store;
pub mod session;

use bitvec::prelude::{BitVec, Msb0};

pub use session::Session;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// A node's identity within the configured peer set, in `[10, 99]` (spec §6).
pub type NodeId = u8;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long. Used here only as the torrent's
/// info-hash; no hash is ever computed by this crate (piece verification is
/// not implemented, see DESIGN.md open question 1).
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer (ours, or a
/// remote's, once their handshake and bitfield/have announcements arrive).
///
/// It is a compact bool vector of most significant bits to least significant
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// The fixed length of a piece, and thus of the single block that makes it
/// up (spec §3: block size equals piece size in this engine, so there is no
/// sub-piece block windowing).
pub const PIECE_LEN: u32 = 0x4000;

/// A single in-flight or served request's coordinates on the wire. Used for
/// both REQUEST and CANCEL payloads, and to describe the bytes of a PIECE
/// message.
///
/// `begin` and `len` are carried generically (as BEP-3 requires) even though
/// this engine's scheduler only ever issues `begin = 0, len = PIECE_LEN`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece this request/response concerns.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The requested (or delivered) length in bytes.
    pub len: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_len_is_16_kib() {
        assert_eq!(PIECE_LEN, 16 * 1024);
    }
}
