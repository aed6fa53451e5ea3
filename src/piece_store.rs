//! An in-memory store of completed piece bytes.
//!
//! The engine this is derived from serves a single in-memory boot image
//! rather than files on a mounted filesystem, so completed pieces are kept
//! around for the lifetime of the session purely so that inbound REQUESTs
//! for them can be honoured. There is no verification against a piece hash
//! (the source doesn't do this either; see DESIGN.md).

use bytes::Bytes;

use crate::{error::*, PieceIndex};

/// Holds every piece we currently have, indexed by piece index.
#[derive(Debug)]
pub(crate) struct PieceStore {
    pieces: Vec<Option<Bytes>>,
}

impl PieceStore {
    /// Creates an empty store sized for `num_pieces` pieces.
    pub fn new(num_pieces: usize) -> Self {
        Self {
            pieces: vec![None; num_pieces],
        }
    }

    /// Records a completed piece's bytes, overwriting whatever (if anything)
    /// was stored there before.
    pub fn insert(&mut self, index: PieceIndex, bytes: Bytes) -> Result<()> {
        let slot = self
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex(index))?;
        *slot = Some(bytes);
        Ok(())
    }

    /// Returns the bytes of `index` at `[begin, begin + len)`, if we have the
    /// piece and the range is in bounds. Used to answer REQUESTs.
    pub fn get(&self, index: PieceIndex, begin: u32, len: u32) -> Option<Bytes> {
        let piece = self.pieces.get(index)?.as_ref()?;
        let begin = begin as usize;
        let end = begin.checked_add(len as usize)?;
        if end > piece.len() {
            return None;
        }
        Some(piece.slice(begin..end))
    }

    /// Whether we currently hold the bytes for `index`.
    pub fn has(&self, index: PieceIndex) -> bool {
        matches!(self.pieces.get(index), Some(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves_a_piece() {
        let mut store = PieceStore::new(2);
        store.insert(0, Bytes::from_static(b"hello world")).unwrap();
        assert!(store.has(0));
        assert!(!store.has(1));
        assert_eq!(store.get(0, 0, 5).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(store.get(0, 6, 5).unwrap(), Bytes::from_static(b"world"));
    }

    #[test]
    fn out_of_range_read_returns_none() {
        let mut store = PieceStore::new(1);
        store.insert(0, Bytes::from_static(b"short")).unwrap();
        assert!(store.get(0, 0, 100).is_none());
    }

    #[test]
    fn missing_piece_returns_none() {
        let store = PieceStore::new(1);
        assert!(store.get(0, 0, 1).is_none());
    }

    #[test]
    fn rejects_out_of_range_index_on_insert() {
        let mut store = PieceStore::new(1);
        assert!(store.insert(5, Bytes::new()).is_err());
    }
}
