pub(crate) mod codec;

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::Fuse;
use futures::{select, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::*,
    session::{Event, EventSender, SessionInfo},
    Bitfield, BlockInfo, NodeId, PeerId, PieceIndex,
};
use codec::{node_id_from_peer_id, Handshake, HandshakeCodec, Message, PeerCodec};

/// A single connection to one of the configured peers, in either direction.
pub(crate) struct PeerSession {
    info: Arc<SessionInfo>,
    event_tx: EventSender,
    cmd_port: Fuse<Receiver>,
    addr: SocketAddr,
    node_id: Option<NodeId>,
    status: Status,
    peer_info: Option<PeerInfo>,
    /// Pieces we have requested from this peer and are still waiting on.
    /// Since a block is always a whole piece here, this doubles as the
    /// request-pipelining window.
    pending_requests: Vec<PieceIndex>,
}

impl PeerSession {
    /// Creates an outbound session that will dial `addr`, the address of
    /// the configured peer `node_id`.
    pub fn outbound(
        info: Arc<SessionInfo>,
        addr: SocketAddr,
        node_id: NodeId,
        event_tx: EventSender,
    ) -> (Self, Sender) {
        let (cmd_tx, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                info,
                event_tx,
                cmd_port: cmd_port.fuse(),
                addr,
                node_id: Some(node_id),
                status: Status::default(),
                peer_info: None,
                pending_requests: Vec::new(),
            },
            cmd_tx,
        )
    }

    /// Creates a session for a connection accepted by the session's
    /// listener. `node_id` is derived from the remote's source address.
    pub fn inbound(
        info: Arc<SessionInfo>,
        addr: SocketAddr,
        node_id: NodeId,
        event_tx: EventSender,
    ) -> (Self, Sender) {
        let (cmd_tx, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                info,
                event_tx,
                cmd_port: cmd_port.fuse(),
                addr,
                node_id: Some(node_id),
                status: Status::default(),
                peer_info: None,
                pending_requests: Vec::new(),
            },
            cmd_tx,
        )
    }

    /// Dials `self.addr`, performs the handshake as the connecting side, and
    /// runs the session until it ends. The connect step is not retried here;
    /// callers that need the retry policy of spec §4.4 (the session's
    /// outbound connector) should instead establish the socket themselves
    /// and call [`Self::run_outbound`].
    pub async fn start_outbound(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);
        self.run_outbound(socket).await
    }

    /// Performs the handshake as the connecting side over an already
    /// connected `socket`, and runs the session until it ends.
    pub async fn run_outbound(&mut self, socket: TcpStream) -> Result<()> {
        let mut socket = Framed::new(socket, HandshakeCodec);
        self.status.state = State::Handshaking;
        self.report(Event::Handshaking(self.node_id.unwrap_or(0)));

        let handshake = Handshake::new(self.info.conf.info_hash, self.info.self_peer_id);
        log::info!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        let peer_handshake = socket
            .next()
            .await
            .ok_or_else(|| Error::Framing("connection closed before handshake".into()))??;
        self.validate_handshake(&peer_handshake)?;

        self.run_after_handshake(socket, peer_handshake).await
    }

    /// Accepts `socket`, waits for the remote's handshake first (it is the
    /// connecting side), replies, and runs the session until it ends.
    pub async fn start_inbound(&mut self, socket: TcpStream) -> Result<()> {
        log::info!("Handling inbound connection from {}", self.addr);
        self.status.state = State::Handshaking;
        self.report(Event::Handshaking(self.node_id.unwrap_or(0)));

        let mut socket = Framed::new(socket, HandshakeCodec);

        let peer_handshake = socket
            .next()
            .await
            .ok_or_else(|| Error::Framing("connection closed before handshake".into()))??;
        self.validate_handshake(&peer_handshake)?;

        let reply = Handshake::new(self.info.conf.info_hash, self.info.self_peer_id);
        log::info!("Sending handshake reply to peer {}", self.addr);
        socket.send(reply).await?;

        self.run_after_handshake(socket, peer_handshake).await
    }

    fn validate_handshake(&mut self, peer_handshake: &Handshake) -> Result<()> {
        log::info!("Received handshake from peer {}", self.addr);
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        if peer_handshake.info_hash != self.info.conf.info_hash {
            log::warn!("Peer {} handshake carried mismatched info hash", self.addr);
            return Err(Error::HandshakeMismatch);
        }

        // spec §3/§4.2: remote_id is derived from the peer-id once the
        // handshake arrives. We already assigned a node id at connect/accept
        // time (the outbound target we dialed, or the id implied by the
        // inbound socket's source address) so routing and HAVE broadcast
        // don't have to wait on the handshake; this cross-checks that
        // against what the peer itself claims, since on this closed,
        // address-assigned network the two should always agree.
        if let Some(claimed) = node_id_from_peer_id(&peer_handshake.peer_id) {
            if Some(claimed) != self.node_id {
                log::warn!(
                    "Peer {} claimed node id {} in its peer-id, expected {:?}",
                    self.addr,
                    claimed,
                    self.node_id
                );
            }
        }

        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            pieces: None,
        });
        Ok(())
    }

    /// Swaps the handshake codec for the peer-message codec (reusing its
    /// read/write buffers, since the peer may have already sent bytes past
    /// the handshake before we got around to switching codecs), sends the
    /// immediate post-handshake keep-alive, and enters the run loop.
    async fn run_after_handshake(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
        _peer_handshake: Handshake,
    ) -> Result<()> {
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec::default());
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        log::info!("Sending immediate keep-alive to peer {}", self.addr);
        socket.send(Message::KeepAlive).await?;

        self.status.state = State::AvailabilityExchange;
        log::info!("Peer {} session state: {:?}", self.addr, self.status.state);

        let our_bitfield = self.info.piece_picker.read().await.have_bitfield().clone();
        socket.send(Message::Bitfield(our_bitfield)).await?;

        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    self.info.counters.record_packet(0);
                    if self.status.state == State::AvailabilityExchange {
                        self.handle_availability_exchange(&mut sink, msg).await?;
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("Shutting down peer {} session", self.addr);
                            break;
                        }
                        Command::Have(index) => {
                            sink.send(Message::Have(index)).await?;
                        }
                    }
                }
                complete => break,
            }
        }

        self.report(Event::Disconnected(self.node_id.unwrap_or(0)));
        Ok(())
    }

    /// Handles the first message after the handshake. A BITFIELD here
    /// registers the peer's availability; the bitfield is optional (a peer
    /// with no pieces may omit it entirely), so anything else is simply
    /// handled as a `Connected`-state message instead of being rejected.
    async fn handle_availability_exchange(
        &mut self,
        sink: &mut Sink,
        msg: Message,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        match msg {
            Message::Bitfield(mut bitfield) => {
                log::info!("Handling peer {} bitfield", self.addr);
                let num_pieces = self.info.piece_picker.read().await.len();
                bitfield.resize(num_pieces, false);

                {
                    let mut picker = self.info.piece_picker.write().await;
                    picker.register_bitfield(&bitfield)?;
                }
                if let Some(peer_info) = &mut self.peer_info {
                    peer_info.pieces = Some(bitfield);
                }

                self.status.state = State::Connected;
                log::info!("Peer {} session state: {:?}", self.addr, self.status.state);

                self.maybe_declare_interest(sink).await?;
            }
            other => {
                log::warn!(
                    "Peer {} sent {:?} before/instead of bitfield",
                    self.addr,
                    other.id()
                );
                self.status.state = State::Connected;
                self.handle_msg(sink, other).await?;
            }
        }
        Ok(())
    }

    /// Handles any message once the session is in the `Connected` state.
    async fn handle_msg(&mut self, sink: &mut Sink, msg: Message) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                return Err(Error::ProtocolViolation(
                    "bitfield sent outside availability exchange".into(),
                ));
            }
            Message::KeepAlive => {
                log::trace!("Peer {} sent keep-alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                self.status.is_peer_interested = true;
            }
            Message::NotInterested => {
                self.status.is_peer_interested = false;
            }
            Message::Have(index) => {
                let became_interesting = {
                    let mut picker = self.info.piece_picker.write().await;
                    picker.register_have_announcement(index)?;
                    !picker.have(index)
                };
                if let Some(peer_info) = &mut self.peer_info {
                    if let Some(pieces) = &mut peer_info.pieces {
                        if index < pieces.len() {
                            pieces.set(index, true);
                        }
                    }
                }
                if became_interesting {
                    self.maybe_declare_interest(sink).await?;
                    self.make_requests(sink).await?;
                }
            }
            Message::Request(block) => {
                self.serve_request(sink, block).await?;
            }
            Message::Cancel(_) => {
                log::trace!("Peer {} sent cancel, ignoring (already pipelined)", self.addr);
            }
            Message::Piece { piece_index, begin, data } => {
                self.handle_piece_msg(sink, piece_index, begin, data).await?;
            }
            Message::Port(_) => {
                log::trace!("Peer {} sent port, DHT not supported", self.addr);
            }
        }
        Ok(())
    }

    /// Sends INTERESTED if the work queue is non-empty and we haven't
    /// already told the peer we're interested.
    async fn maybe_declare_interest(&mut self, sink: &mut Sink) -> Result<()> {
        if self.status.is_interested {
            return Ok(());
        }
        let has_queued_pieces = self.info.piece_picker.read().await.has_queued_pieces();
        if has_queued_pieces {
            log::info!("Interested in peer {}", self.addr);
            self.status.is_interested = true;
            sink.send(Message::Interested).await?;
        }
        Ok(())
    }

    /// Honours an inbound REQUEST from whatever we have stored, regardless
    /// of whether we currently have the peer choked.
    async fn serve_request(&mut self, sink: &mut Sink, block: BlockInfo) -> Result<()> {
        let data = {
            let store = self.info.piece_store.read().await;
            store.get(block.piece_index, block.begin, block.len)
        };
        match data {
            Some(bytes) => {
                log::debug!(
                    "Serving request for piece {} to peer {}",
                    block.piece_index,
                    self.addr
                );
                sink.send(Message::Piece {
                    piece_index: block.piece_index,
                    begin: block.begin,
                    data: bytes.to_vec(),
                })
                .await?;
            }
            None => {
                log::debug!(
                    "Peer {} requested piece {} we don't have",
                    self.addr,
                    block.piece_index
                );
            }
        }
        Ok(())
    }

    /// Fills the pipeline of outstanding requests up to the configured
    /// maximum by popping pieces off the shared work queue. A no-op while
    /// the peer has us choked: spec §4.3 only issues the next REQUEST "on
    /// UNCHOKE or successful PIECE reception", both of which imply we are
    /// currently unchoked.
    async fn make_requests(&mut self, sink: &mut Sink) -> Result<()> {
        if self.status.is_choked {
            return Ok(());
        }
        let max = self.info.conf.max_pending_requests;
        let piece_len = self.info.conf.piece_len;
        while self.pending_requests.len() < max {
            let picked = self.info.piece_picker.write().await.pick_piece();
            let index = match picked {
                Some(index) => index,
                None => break,
            };
            log::debug!("Requesting piece {} from peer {}", index, self.addr);
            self.pending_requests.push(index);
            sink.send(Message::Request(BlockInfo {
                piece_index: index,
                begin: 0,
                len: piece_len,
            }))
            .await?;
        }
        Ok(())
    }

    /// Stores a completed piece, updates the shared bitmap, hands the bytes
    /// upward, and reports completion to the session so it can broadcast a
    /// HAVE to our other peers.
    async fn handle_piece_msg(
        &mut self,
        sink: &mut Sink,
        piece_index: PieceIndex,
        begin: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let request_pos = self.pending_requests.iter().position(|i| *i == piece_index);
        let request_pos = match request_pos {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Peer {} sent unrequested piece {}",
                    self.addr,
                    piece_index
                );
                return Ok(());
            }
        };
        self.pending_requests.remove(request_pos);

        log::info!("Received piece {} from peer {}", piece_index, self.addr);
        let bytes = bytes::Bytes::from(data);

        {
            let mut store = self.info.piece_store.write().await;
            store.insert(piece_index, bytes.clone())?;
        }
        {
            let mut picker = self.info.piece_picker.write().await;
            picker.mark_have(piece_index)?;
        }
        self.info.counters.record_piece();

        let absolute_offset = piece_index as u64 * self.info.conf.piece_len as u64 + begin as u64;
        let _ = self.info.delivery_tx.send(crate::delivery::DeliveredBlock {
            piece_index,
            absolute_offset,
            bytes,
        });

        self.report(Event::PieceCompleted(self.node_id.unwrap_or(0), piece_index));

        self.make_requests(sink).await
    }

    fn report(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }
}

type Sink = futures::stream::SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// The channel on which the session sends a command to a peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Commands the session can send to a running peer session.
pub(crate) enum Command {
    /// Eventually shut down this peer session.
    Shutdown,
    /// Announce a newly completed piece to this peer.
    Have(PieceIndex),
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    /// If we're choked, the peer doesn't allow us to request pieces.
    is_choked: bool,
    /// If we're interested, the peer has pieces we don't have.
    is_interested: bool,
    /// If the peer is interested in us, they mean to request pieces we have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_interested: false,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    Disconnected,
    Connecting,
    Handshaking,
    /// Set once the handshake completes; left as soon as the first
    /// message (ideally a bitfield) arrives.
    AvailabilityExchange,
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to, known only once the
/// handshake has completed.
struct PeerInfo {
    peer_id: PeerId,
    pieces: Option<Bitfield>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Conf;
    use crate::counter::Counters;
    use crate::piece_picker::PiecePicker;
    use crate::piece_store::PieceStore;
    use tokio::sync::RwLock;

    fn test_info(num_pieces: usize) -> Arc<SessionInfo> {
        let conf = Conf::new(10, [1u8; 20], num_pieces).unwrap();
        Arc::new(SessionInfo {
            self_peer_id: codec::peer_id_for(conf.self_id),
            conf,
            piece_picker: RwLock::new(PiecePicker::new(num_pieces)),
            piece_store: RwLock::new(PieceStore::new(num_pieces)),
            counters: Counters::default(),
            delivery_tx: crate::delivery::channel().0,
        })
    }

    #[tokio::test]
    async fn outbound_and_inbound_handshake_over_loopback() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let info_a = test_info(4);
        let (event_tx_a, mut event_rx_a) = mpsc::unbounded_channel();
        let (mut outbound, _cmd_tx_a) =
            PeerSession::outbound(Arc::clone(&info_a), listen_addr, 11, event_tx_a);

        let info_b = test_info(4);
        let (event_tx_b, mut event_rx_b) = mpsc::unbounded_channel();

        let server = tokio::spawn(async move {
            let (socket, addr) = listener.accept().await.unwrap();
            let (mut inbound, _cmd_tx_b) =
                PeerSession::inbound(Arc::clone(&info_b), addr, 10, event_tx_b);
            let _ = inbound.start_inbound(socket).await;
        });

        let client = tokio::spawn(async move {
            let _ = outbound.start_outbound().await;
        });

        // both sides should report at least the handshaking event before
        // the (very short-lived, since we don't keep the sockets open past
        // the first exchange here) sessions wind down
        let _ = event_rx_a.recv().await;
        let _ = event_rx_b.recv().await;

        // give both tasks a chance to finish; no explicit join needed since
        // dropping the TcpStream causes a clean disconnect on both ends
        let _ = tokio::time::timeout(std::time::Duration::from_millis(200), client).await;
        let _ = tokio::time::timeout(std::time::Duration::from_millis(200), server).await;
    }
}
