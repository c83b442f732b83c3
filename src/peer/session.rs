use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::Framed;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use crate::{
    block::{BlockData, BlockInfo},
    disk::DiskCommand,
    torrent::{CommandToTorrent, TorrentContext},
    Bitfield,
    PeerId,
};
use super::{handshake::*, message::*, state::*, *};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Sent when the link has been quiet for this long, so the peer keeps it open.
const KEEP_ALIVE_INTERVAL: time::Duration = time::Duration::from_secs(90);

pub struct PeerSession {

    // The peer's address.
    address: SocketAddr,

    // Read-only state shared by all sessions of the download.
    ctx: Arc<TorrentContext>,

    // Commands to the session.
    peer_rx: PeerRx,

    // Handed out so the session can ask the torrent to stop it.
    peer_tx: PeerTx,

    // Requests sent to the peer but not yet answered, tagged with the time
    // they were issued so stale ones can be re-queued.
    outstanding: HashMap<BlockInfo, Instant>,

    // Pieces the peer claims to have.
    bitfield: Bitfield,

    state: SessionState,

    last_inbound: Instant,

    last_outbound: Instant,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, ctx.info.num_pieces as usize);

        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                outstanding: HashMap::new(),
                bitfield,
                state: SessionState::default(),
                last_inbound: Instant::now(),
                last_outbound: Instant::now(),
            },
            peer_tx,
        )
    }

    #[tracing::instrument(name = "peer", skip(self), fields(address = %self.address))]
    pub async fn start(&mut self) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        let stream = time::timeout(self.ctx.config.connect_timeout, TcpStream::connect(self.address))
            .await
            .map_err(|_| PeerError::Timeout)??;
        tracing::trace!("outbound connection successful");

        let mut socket = Framed::new(stream, HandshakeCodec);
        let remote_id = self.exchange_handshake(&mut socket).await?;
        tracing::info!("handshake successful, peer connected");
        self.ctx.torrent_tx.send(CommandToTorrent::PeerConnected {
            address: self.address,
            id: remote_id,
        })?;

        // Swap codecs without losing bytes the peer already sent.
        let socket = socket.map_codec(|_| MessageCodec);
        self.run(socket).await
    }

    // Reports the session's end to the torrent and gives its requests back
    // to the picker. Runs however the session ended.
    pub async fn disconnect(&mut self) {
        self.release_outstanding().await;
        self.ctx.picker.piece_picker.write().await.bitfield_drop(&self.bitfield);
        self.state.update(|state| state.conn_state = ConnState::Disconnected);
        self.ctx.torrent_tx.send(CommandToTorrent::PeerState {
            address: self.address,
            state: self.state,
        }).ok();
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>) -> Result<PeerId> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        tracing::trace!("send handshake");
        socket.send(Handshake::new(self.ctx.info_hash, self.ctx.client_id)).await?;

        match socket.next().await {
            Some(Ok(handshake)) => {
                if handshake.protocol != PROTOCOL {
                    return Err(PeerError::IncorrectProtocol);
                }
                if handshake.info_hash != self.ctx.info_hash {
                    return Err(PeerError::IncorrectInfoHash);
                }
                Ok(handshake.peer_id)
            },
            Some(Err(e)) => Err(e),
            None => Err(PeerError::NoHandshake),
        }
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Introducing);
        self.last_inbound = Instant::now();
        self.last_outbound = Instant::now();
        let (mut sink, mut stream) = socket.split();
        let mut ticker = time::interval(time::Duration::from_secs(1));

        loop { tokio::select! {

            // Message from peer.
            msg = stream.next() => match msg {
                Some(Ok(msg)) => {
                    self.last_inbound = Instant::now();
                    self.handle_msg(&mut sink, msg).await?;
                },
                Some(Err(e)) => return Err(e),
                None => return Err(PeerError::ConnectionClosed),
            },

            // Command from elsewhere in the download.
            Some(cmd) = self.peer_rx.recv() => match cmd {

                PeerCommand::PieceDone(idx) => self.handle_piece_done(&mut sink, idx).await?,

                PeerCommand::CancelBlock(block) => self.handle_cancel_block(&mut sink, block).await?,

                PeerCommand::Shutdown => {
                    tracing::info!("session shutdown");
                    return Ok(());
                },
            },

            t = ticker.tick() => self.tick(&mut sink, t.into_std()).await?,

        }}
    }

    // Logs and sends a message, tracking the send time for keep-alives.
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::debug!("send: {}", msg);
        self.last_outbound = Instant::now();
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::debug!("read: {}", msg);

        match msg {

            // A bitfield is only valid directly after the handshake.
            Message::Bitfield(bitfield) => {
                if self.state.conn_state != ConnState::Introducing {
                    tracing::error!("bitfield sent mid-session");
                    return Err(PeerError::InvalidMessage);
                }
                self.handle_bitfield(sink, bitfield).await?;
            },

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = true);
                    // Give pending requests back so other peers can take them.
                    self.release_outstanding().await;
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = false);
                    if self.state.interested {
                        self.make_requests(sink).await?;
                    }
                }
            },

            Message::Interested => self.state.update(|state| state.peer_interested = true),

            Message::NotInterested => self.state.update(|state| state.peer_interested = false),

            Message::Block(block) => {
                self.handle_block(block).await?;
                self.make_requests(sink).await?;
            },

            // We don't serve blocks, only download them.
            Message::Request(request) => tracing::trace!("ignoring request: {:?}", request),

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Cancel(block) => tracing::trace!("ignoring cancel: {:?}", block),

            Message::Unknown { id } => tracing::trace!("ignoring message with id {}", id),

        }

        if self.state.conn_state == ConnState::Introducing {
            self.state.update(|state| state.conn_state = ConnState::Ready);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {

        // Remove trailing bits.
        bitfield.resize(self.ctx.info.num_pieces as usize, false);
        tracing::info!("peer has {}/{} pieces", bitfield.count_ones(), self.ctx.info.num_pieces);

        if bitfield.not_any() {
            tracing::warn!("peer has no pieces, disconnecting");
            self.peer_tx.send(PeerCommand::Shutdown)?;
            return Ok(());
        }

        let interested = self.ctx.picker.piece_picker.write().await.bitfield_update(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {

        if idx >= self.ctx.info.num_pieces {
            tracing::error!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        // Already recorded.
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.state.update(|state| state.num_pieces += 1);

        let interested = self
            .ctx
            .picker
            .piece_picker
            .write()
            .await
            .increment_piece(idx as usize);

        self.update_interest(sink, interested).await
    }

    async fn handle_block(&mut self, block: BlockData) -> Result<()> {

        let info = BlockInfo::from_data(&block);
        if self.outstanding.remove(&info).is_none() {
            tracing::warn!("unexpected block: {:?}", info);
            return Ok(());
        }

        let is_duplicate = if let Some(partial) = self
            .ctx
            .picker
            .partial_pieces
            .read()
            .await
            .get(&info.piece_idx)
        {
            partial.write().await.received_block(&info)
        } else {
            // The piece completed or was abandoned while our request was in
            // flight. Nothing to record.
            tracing::trace!("block for retired piece: {:?}", info);
            return Ok(());
        };

        if is_duplicate {
            tracing::trace!("duplicate block: {:?}", info);
            return Ok(());
        }

        self.state.update(|state| state.throughput.down += block.data.len() as u64);
        self.ctx.disk_tx.send(DiskCommand::WriteBlock {
            block,
            from: self.address,
        })?;

        // In end game the same block may be in flight on several peers;
        // the torrent fans a cancel out to the rest.
        if self.ctx.picker.end_game().await {
            self.ctx.torrent_tx.send(CommandToTorrent::BlockReceived {
                block: info,
                from: self.address,
            })?;
        }

        Ok(())
    }

    // When a piece completes verification: cancel anything still in flight
    // for it, and advertise it to peers that lack it.
    async fn handle_piece_done(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        let done: Vec<BlockInfo> = self
            .outstanding
            .keys()
            .filter(|block| block.piece_idx == idx)
            .copied()
            .collect();
        for block in done {
            self.outstanding.remove(&block);
            self.send_message(sink, Message::Cancel(block)).await?;
        }

        if !self.bitfield[idx] {
            self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        }

        self.make_requests(sink).await
    }

    async fn handle_cancel_block(&mut self, sink: &mut MessageSink, block: BlockInfo) -> Result<()> {
        if self.outstanding.remove(&block).is_some() {
            self.send_message(sink, Message::Cancel(block)).await?;
        }
        Ok(())
    }

    // Queue requests up to the configured pipeline depth.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.peer_choking || !self.state.interested {
            return Ok(());
        }

        let current: HashSet<BlockInfo> = self.outstanding.keys().copied().collect();
        let requests = self
            .ctx
            .picker
            .pick_blocks(&current, self.ctx.config.pipeline_depth, &self.bitfield)
            .await;

        for block in requests {
            self.outstanding.insert(block, Instant::now());
            self.send_message(sink, Message::Request(block)).await?;
        }

        Ok(())
    }

    // Give all requested blocks back to the picker for other peers.
    async fn release_outstanding(&mut self) {
        if self.outstanding.is_empty() {
            return;
        }
        tracing::debug!("releasing {} requested blocks", self.outstanding.len());
        let partials = self.ctx.picker.partial_pieces.read().await;
        for (request, _) in self.outstanding.drain() {
            if let Some(partial) = partials.get(&request.piece_idx) {
                partial.write().await.free_block(&request);
            }
        }
    }

    // Re-queue requests the peer has sat on for too long.
    async fn expire_requests(&mut self, now: Instant) {
        let expired: Vec<BlockInfo> = self
            .outstanding
            .iter()
            .filter(|(_, issued)| now.duration_since(**issued) >= self.ctx.config.request_timeout)
            .map(|(block, _)| *block)
            .collect();
        if expired.is_empty() {
            return;
        }
        let partials = self.ctx.picker.partial_pieces.read().await;
        for request in expired {
            tracing::warn!("request timed out: {:?}", request);
            self.outstanding.remove(&request);
            if let Some(partial) = partials.get(&request.piece_idx) {
                partial.write().await.free_block(&request);
            }
        }
    }

    // If our interest in the peer changed, tell them.
    async fn update_interest(&mut self, sink: &mut MessageSink, interested: bool) -> Result<()> {
        if !self.state.interested && interested {
            self.state.update(|state| state.interested = true);
            self.send_message(sink, Message::Interested).await?;
        } else if self.state.interested && !interested {
            self.state.update(|state| state.interested = false);
        }
        Ok(())
    }

    async fn tick(&mut self, sink: &mut MessageSink, now: Instant) -> Result<()> {

        if now.duration_since(self.last_inbound) >= self.ctx.config.idle_timeout {
            tracing::warn!("disconnecting peer due to inactivity");
            return Err(PeerError::Timeout);
        }

        self.expire_requests(now).await;

        // Top the pipeline back up, e.g. after timed out requests were freed.
        if !self.state.peer_choking
            && self.state.interested
            && self.outstanding.len() < self.ctx.config.pipeline_depth
        {
            self.make_requests(sink).await?;
        }

        if now.duration_since(self.last_outbound) >= KEEP_ALIVE_INTERVAL {
            self.send_message(sink, Message::KeepAlive).await?;
        }

        if self.state.changed {
            self.ctx.torrent_tx.send(CommandToTorrent::PeerState {
                address: self.address,
                state: self.state,
            })?;
        }
        self.state.tick();

        Ok(())
    }
}
