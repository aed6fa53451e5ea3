//! Hands completed piece bytes upward to whatever external consumer drives
//! this session (e.g. the boot loader flow assembling an image in memory).
//!
//! That consumer is deliberately out of scope here: all this module defines
//! is the record it receives and the channel it receives it on, mirroring
//! the alert channel the disk task uses to notify a torrent of completed
//! writes.

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::PieceIndex;

/// A single block of bytes ready to be written into the final image, along
/// with its absolute byte offset.
#[derive(Clone, Debug)]
pub struct DeliveredBlock {
    /// The piece this block belongs to.
    pub piece_index: PieceIndex,
    /// The offset of this block from the start of the torrent, i.e.
    /// `piece_index * piece_len + begin`.
    pub absolute_offset: u64,
    /// The block's bytes.
    pub bytes: Bytes,
}

/// The sending half of the delivery channel, held by the session and cloned
/// into every peer task that may complete a piece.
pub type DeliverySender = UnboundedSender<DeliveredBlock>;
/// The receiving half, handed to the external consumer.
pub type DeliveryReceiver = UnboundedReceiver<DeliveredBlock>;

/// Creates a fresh delivery channel.
pub fn channel() -> (DeliverySender, DeliveryReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_a_block() {
        let (tx, mut rx) = channel();
        tx.send(DeliveredBlock {
            piece_index: 2,
            absolute_offset: 2 * 0x4000,
            bytes: Bytes::from_static(b"hi"),
        })
        .unwrap();
        let block = rx.recv().await.unwrap();
        assert_eq!(block.piece_index, 2);
        assert_eq!(block.absolute_offset, 0x8000);
    }
}
