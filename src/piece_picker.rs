//! The piece bitmap and work queue shared between every peer connection of a
//! session.
//!
//! Unlike a rarest-first piece picker, this one hands out pieces strictly in
//! ascending index order: pieces enter a FIFO queue as they become known
//! missing (at construction, and whenever a peer announces a piece we don't
//! have), and `pick_piece` simply pops the front of that queue. A piece index
//! is, at all times, in exactly one of three states: held (`have` bit set),
//! queued (`queued` bit set, waiting in `queue`), or unseen (neither bit set,
//! because no peer has announced it yet).

use std::collections::VecDeque;

use crate::{error::*, Bitfield, PieceIndex};

/// The piece bitmap and FIFO work queue for a single torrent.
#[derive(Debug)]
pub(crate) struct PiecePicker {
    /// Pieces we have fully received (and, per the upstream engine this is
    /// derived from, not verified against any hash).
    have: Bitfield,
    /// Pieces currently sitting in `queue`, kept so a piece already queued is
    /// never queued a second time (spec's work queue is a set, not a
    /// multiset).
    queued: Bitfield,
    /// Indices waiting to be picked, oldest first.
    queue: VecDeque<PieceIndex>,
}

impl PiecePicker {
    /// Creates a picker for a torrent of `num_pieces` pieces. Every piece
    /// starts out queued (spec §3: the work queue's "initial content is
    /// [0..N)"), since a piece index must always be in exactly one of
    /// `have` or `queue`, never neither (spec §8).
    pub fn new(num_pieces: usize) -> Self {
        Self {
            have: Bitfield::repeat(false, num_pieces),
            queued: Bitfield::repeat(true, num_pieces),
            queue: (0..num_pieces).collect(),
        }
    }

    /// The number of pieces in the torrent.
    pub fn len(&self) -> usize {
        self.have.len()
    }

    /// Whether every piece has been received.
    pub fn is_complete(&self) -> bool {
        self.have.all()
    }

    /// Whether any piece is waiting to be picked. Used to decide whether to
    /// declare interest in a peer without disturbing the queue's order the
    /// way popping and re-pushing a piece would.
    pub fn has_queued_pieces(&self) -> bool {
        !self.queue.is_empty()
    }

    /// A read-only view of the have bitmap, sent out as our BITFIELD on
    /// handshake completion.
    pub fn have_bitfield(&self) -> &Bitfield {
        &self.have
    }

    /// Whether we already have the given piece.
    pub fn have(&self, index: PieceIndex) -> bool {
        self.have[index]
    }

    /// Registers a remote peer's availability bitmap: every piece the peer
    /// has that we neither have nor have already queued is pushed onto the
    /// work queue.
    pub fn register_bitfield(&mut self, bitfield: &Bitfield) -> Result<()> {
        if bitfield.len() != self.have.len() {
            return Err(Error::InvalidPieceIndex(bitfield.len()));
        }
        for index in bitfield.iter_ones() {
            self.register_have_announcement(index)?;
        }
        Ok(())
    }

    /// Registers a single HAVE announcement from a remote peer, enqueuing the
    /// piece if we neither have it nor have it queued already.
    pub fn register_have_announcement(&mut self, index: PieceIndex) -> Result<()> {
        if index >= self.have.len() {
            return Err(Error::InvalidPieceIndex(index));
        }
        if self.have[index] || self.queued[index] {
            return Ok(());
        }
        self.queued.set(index, true);
        self.queue.push_back(index);
        Ok(())
    }

    /// Pops the next piece to request, if any is queued.
    pub fn pick_piece(&mut self) -> Option<PieceIndex> {
        self.queue.pop_front().map(|index| {
            self.queued.set(index, false);
            index
        })
    }

    /// Marks a piece as fully received. If it was queued (it shouldn't be,
    /// since `pick_piece` removes it before the request is even sent, but a
    /// piece may also arrive unsolicited) its queued bit is cleared too.
    pub fn mark_have(&mut self, index: PieceIndex) -> Result<()> {
        if index >= self.have.len() {
            return Err(Error::InvalidPieceIndex(index));
        }
        self.have.set(index, true);
        self.queued.set(index, false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_every_piece_queued() {
        // spec §3: the work queue's initial content is [0..N); every index
        // must be in `have` xor `queue`, never neither (spec §8).
        let mut picker = PiecePicker::new(4);
        assert!(!picker.is_complete());
        assert!(picker.has_queued_pieces());
        let mut picked = Vec::new();
        while let Some(index) = picker.pick_piece() {
            picked.push(index);
        }
        assert_eq!(picked, vec![0, 1, 2, 3]);
    }

    #[test]
    fn have_announcement_for_already_queued_piece_is_noop() {
        let mut picker = PiecePicker::new(4);
        picker.register_have_announcement(2).unwrap();
        picker.register_have_announcement(2).unwrap();
        let picked: Vec<_> = std::iter::from_fn(|| picker.pick_piece()).collect();
        // piece 2 appears exactly once, not duplicated by the re-announcement
        assert_eq!(picked.iter().filter(|&&i| i == 2).count(), 1);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut picker = PiecePicker::new(4);
        assert_eq!(picker.pick_piece(), Some(0));
        assert_eq!(picker.pick_piece(), Some(1));
        assert_eq!(picker.pick_piece(), Some(2));
        assert_eq!(picker.pick_piece(), Some(3));
        assert_eq!(picker.pick_piece(), None);
    }

    #[test]
    fn having_a_piece_removes_it_from_the_queue() {
        let mut picker = PiecePicker::new(4);
        picker.mark_have(1).unwrap();
        picker.register_have_announcement(1).unwrap();
        let picked: Vec<_> = std::iter::from_fn(|| picker.pick_piece()).collect();
        assert_eq!(picked, vec![0, 2, 3]);
    }

    #[test]
    fn bitfield_registration_does_not_duplicate_already_queued_pieces() {
        let mut picker = PiecePicker::new(4);
        let mut bitfield = Bitfield::repeat(false, 4);
        bitfield.set(0, true);
        bitfield.set(3, true);
        picker.register_bitfield(&bitfield).unwrap();
        let picked: Vec<_> = std::iter::from_fn(|| picker.pick_piece()).collect();
        assert_eq!(picked, vec![0, 1, 2, 3]);
    }

    #[test]
    fn rejects_out_of_range_piece_index() {
        let mut picker = PiecePicker::new(4);
        assert!(picker.register_have_announcement(4).is_err());
        assert!(picker.mark_have(10).is_err());
    }

    #[test]
    fn is_complete_once_all_pieces_have() {
        let mut picker = PiecePicker::new(2);
        picker.mark_have(0).unwrap();
        assert!(!picker.is_complete());
        picker.mark_have(1).unwrap();
        assert!(picker.is_complete());
    }

    #[test]
    fn marking_have_clears_queued_bit() {
        let mut picker = PiecePicker::new(4);
        picker.mark_have(1).unwrap();
        let picked: Vec<_> = std::iter::from_fn(|| picker.pick_piece()).collect();
        assert!(!picked.contains(&1));
    }
}
