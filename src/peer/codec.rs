//! The wire codecs for the two phases of a peer connection: the fixed-size
//! handshake frame, and the length-prefixed message frames that follow it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, Bitfield, BlockInfo, NodeId, PieceIndex, PeerId, Sha1Hash};

/// The protocol string every handshake must carry.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// `pstrlen(1) + pstr(19) + reserved(8) + info_hash(20) + peer_id(20)`.
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// The initial 68 byte frame exchanged by both sides before any other
/// message may be sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0u8; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Encodes and decodes [`Handshake`]s. Used only for the first frame on a
/// connection; afterwards the socket is handed over to a [`PeerCodec`]
/// (see the codec-swap in `peer::PeerSession::start`).
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let pstrlen = buf[0] as usize;
        if pstrlen != 19 {
            return Err(Error::InvalidHandshake);
        }

        let mut prot = [0u8; 19];
        prot.copy_from_slice(&buf[1..20]);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        buf.advance(HANDSHAKE_LEN);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The wire identifier of a post-handshake message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageId {
    fn from_u8(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::Port),
            _ => Err(Error::Framing(format!("unknown message id {}", id))),
        }
    }
}

/// A post-handshake peer-wire message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { piece_index: PieceIndex, begin: u32, data: Vec<u8> },
    Cancel(BlockInfo),
    Port(u16),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have(_) => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
            Message::Port(_) => Some(MessageId::Port),
        }
    }
}

/// Encodes and decodes post-handshake peer-wire messages.
///
/// `Decoder::decode` is the receive reassembler: it is called every time
/// more bytes arrive, and must cope with a message's header and body
/// arriving in arbitrarily small fragments across many calls. It does this
/// by keeping the two pieces of state a partial frame needs between calls:
/// the frame's declared length (`rx_len`, once the 4 byte prefix has fully
/// arrived) and, for variable-length frames, the message id once it too has
/// arrived (`rx_id`). `remaining` tracks how many more payload bytes must
/// accumulate in `buf` before the frame is complete.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PeerCodec {
    rx_len: Option<u32>,
    rx_id: Option<MessageId>,
}

const LEN_PREFIX_LEN: usize = 4;
const ID_LEN: usize = 1;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            let len = match self.rx_len {
                Some(len) => len,
                None => {
                    if buf.len() < LEN_PREFIX_LEN {
                        return Ok(None);
                    }
                    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    buf.advance(LEN_PREFIX_LEN);
                    self.rx_len = Some(len);
                    len
                }
            };

            if len == 0 {
                // keep-alive: no id, no payload
                self.rx_len = None;
                return Ok(Some(Message::KeepAlive));
            }

            let id = match self.rx_id {
                Some(id) => id,
                None => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let id = MessageId::from_u8(buf[0])?;
                    buf.advance(ID_LEN);
                    self.rx_id = Some(id);
                    id
                }
            };

            let payload_len = len as usize - ID_LEN;
            if buf.len() < payload_len {
                return Ok(None);
            }

            let payload = buf.split_to(payload_len);
            self.rx_len = None;
            self.rx_id = None;

            let msg = match id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => {
                    if payload.len() != 4 {
                        return Err(Error::Framing("malformed have payload".into()));
                    }
                    let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    Message::Have(index as PieceIndex)
                }
                MessageId::Bitfield => {
                    Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
                }
                MessageId::Request | MessageId::Cancel => {
                    if payload.len() != 12 {
                        return Err(Error::Framing("malformed request/cancel payload".into()));
                    }
                    let piece_index =
                        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                            as PieceIndex;
                    let begin =
                        u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                    let len =
                        u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
                    let block = BlockInfo { piece_index, begin, len };
                    if id == MessageId::Request {
                        Message::Request(block)
                    } else {
                        Message::Cancel(block)
                    }
                }
                MessageId::Piece => {
                    if payload.len() < 8 {
                        return Err(Error::Framing("malformed piece payload".into()));
                    }
                    let piece_index =
                        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                            as PieceIndex;
                    let begin =
                        u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                    let data = payload[8..].to_vec();
                    Message::Piece { piece_index, begin, data }
                }
                MessageId::Port => {
                    if payload.len() != 2 {
                        return Err(Error::Framing("malformed port payload".into()));
                    }
                    Message::Port(u16::from_be_bytes([payload[0], payload[1]]))
                }
            };

            return Ok(Some(msg));
        }
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have(index) => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.begin);
                buf.put_u32(block.len);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.begin);
                buf.put_u32(block.len);
            }
            Message::Piece { piece_index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(begin);
                buf.put_slice(&data);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

/// Recovers the node id a remote peer announced itself as, from its peer id
/// (spec §3: "`remote_id` (derived from first two bytes of the remote
/// peer-id once handshake arrives)"; for this engine's `-iP1000NN...-`
/// peer-id format those two identifying decimal digits sit right after the
/// fixed 7 byte `-iP1000` prefix `peer_id_for` always writes).
pub(crate) fn node_id_from_peer_id(peer_id: &PeerId) -> Option<NodeId> {
    let digits = std::str::from_utf8(&peer_id[7..9]).ok()?;
    digits.parse().ok()
}

/// Derives a 20 byte peer id for the given node, as `-iP1000<2-digit id><10
/// random ASCII digits>-`.
pub(crate) fn peer_id_for(node_id: NodeId) -> PeerId {
    use rand::Rng;

    let mut id = [0u8; 20];
    let prefix = format!("-iP1000{:02}", node_id);
    let prefix = prefix.as_bytes();
    id[..prefix.len()].copy_from_slice(prefix);

    let mut rng = rand::thread_rng();
    for slot in id[prefix.len()..19].iter_mut() {
        *slot = b'0' + rng.gen_range(0..10);
    }
    id[19] = b'-';
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn handshake_round_trips() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let mut buf = BytesMut::new();
        let mut codec = HandshakeCodec;
        codec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn handshake_rejects_bad_pstrlen() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[20u8; HANDSHAKE_LEN]);
        let mut codec = HandshakeCodec;
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn handshake_waits_for_more_bytes() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0u8; HANDSHAKE_LEN - 1]);
        let mut codec = HandshakeCodec;
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn keep_alive_round_trips() {
        let mut buf = BytesMut::new();
        let mut codec = PeerCodec::default();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
    }

    #[test]
    fn have_round_trips() {
        let mut buf = BytesMut::new();
        let mut codec = PeerCodec::default();
        codec.encode(Message::Have(7), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Have(7)));
    }

    #[test]
    fn request_round_trips() {
        let block = BlockInfo { piece_index: 3, begin: 0, len: 16384 };
        let mut buf = BytesMut::new();
        let mut codec = PeerCodec::default();
        codec.encode(Message::Request(block), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Request(block)));
    }

    #[test]
    fn piece_round_trips() {
        let mut buf = BytesMut::new();
        let mut codec = PeerCodec::default();
        let msg = Message::Piece { piece_index: 1, begin: 0, data: vec![1, 2, 3, 4] };
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn decode_handles_single_byte_at_a_time_fragmentation() {
        let block = BlockInfo { piece_index: 2, begin: 0, len: 16384 };
        let mut full = BytesMut::new();
        let mut encoder = PeerCodec::default();
        encoder.encode(Message::Request(block), &mut full).unwrap();

        let mut codec = PeerCodec::default();
        let mut buf = BytesMut::new();
        let mut result = None;
        for byte in full.iter() {
            buf.extend_from_slice(&[*byte]);
            result = codec.decode(&mut buf).unwrap();
            if result.is_some() {
                break;
            }
        }
        assert_eq!(result, Some(Message::Request(block)));
    }

    #[test]
    fn decode_returns_none_on_partial_length_prefix() {
        let mut codec = PeerCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_message_id() {
        let mut codec = PeerCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 1, 200]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn peer_id_has_expected_prefix_and_length() {
        let id = peer_id_for(42);
        assert_eq!(id.len(), 20);
        assert_eq!(&id[..9], b"-iP100042");
        assert_eq!(id[19], b'-');
    }

    #[test]
    fn node_id_round_trips_through_peer_id() {
        let id = peer_id_for(37);
        assert_eq!(node_id_from_peer_id(&id), Some(37));
    }

    #[test]
    fn node_id_from_peer_id_rejects_non_digits() {
        let mut id = peer_id_for(37);
        id[7] = b'z';
        assert_eq!(node_id_from_peer_id(&id), None);
    }
}
