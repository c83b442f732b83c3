use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::mpsc, task::JoinHandle, time};
use crate::{
    block::BlockInfo,
    config::Config,
    disk::{self, DiskCommand, DiskError, DiskTx},
    metainfo::{MetaInfo, TorrentInfo},
    peer::{state::{ConnState, SessionState}, PeerCommand, PeerHandle},
    picker::Picker,
    stats::{DownloadStats, PeerStats, PieceStats, ThroughputStats},
    tracker::{AnnounceParams, Event, TrackersHandle},
    DownloadEvent,
    EventTx,
    PeerId,
    Sha1Hash,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("no peers available, all candidates exhausted")]
    NoPeersAvailable,

    #[error("disk error: {0}")]
    Disk(#[from] DiskError),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("download task panicked")]
    Panicked,

}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

// Lifecycle of a whole download session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {

    #[default]
    Initializing,

    Downloading,

    Completed,

    Failed,

}

pub enum CommandToTorrent {

    // Sent by a peer task when its handshake succeeds.
    PeerConnected { address: SocketAddr, id: PeerId },

    // Periodic and terminal state reports from peer tasks.
    PeerState { address: SocketAddr, state: SessionState },

    // Addresses discovered by a tracker.
    Peers(Vec<SocketAddr>),

    // A block arrived during end game; duplicates get cancelled elsewhere.
    BlockReceived { block: BlockInfo, from: SocketAddr },

    // Sent by the disk task when a piece hashed correctly and was written.
    PieceVerified { idx: usize },

    // Sent by the disk task when a piece failed its hash.
    PieceRejected { idx: usize, peers: Vec<SocketAddr> },

    // The disk task could not write a verified piece.
    DiskFailure(DiskError),

    // User abort.
    Shutdown,

}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Read-only state shared with every peer session.
#[derive(Debug)]
pub struct TorrentContext {

    pub info_hash: Sha1Hash,

    pub client_id: PeerId,

    // Lets sessions pick the next blocks to download.
    pub picker: Picker,

    pub torrent_tx: TorrentTx,

    pub disk_tx: DiskTx,

    pub info: TorrentInfo,

    pub config: Config,

}

pub struct TorrentParams {

    pub metainfo: MetaInfo,

    // Addresses to seed the swarm with, typically from the caller's own
    // peer source. Trackers named in the metainfo add more over time.
    pub peers: Vec<SocketAddr>,

    pub config: Config,

    pub event_tx: EventTx,

}

// The swarm coordinator. Owns all peer sessions and is the single place
// where scheduling and verification results meet.
pub struct Torrent {

    ctx: Arc<TorrentContext>,

    // Peers we have sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Peers we know about but aren't connected to.
    available: Vec<SocketAddr>,

    trackers: TrackersHandle,

    torrent_rx: TorrentRx,

    event_tx: EventTx,

    state: TorrentState,

    num_verified: usize,

    start_time: Option<Instant>,

    run_duration: Duration,

    throughput: ThroughputStats,

    disk_handle: Option<JoinHandle<()>>,

}

impl Torrent {

    pub fn new(params: TorrentParams) -> Result<(Self, TorrentTx)> {

        let TorrentParams { metainfo, peers, config, event_tx } = params;
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (disk_handle, disk_tx) = disk::spawn_disk(&metainfo, &config, torrent_tx.clone())?;

        let info = TorrentInfo::new(&metainfo);
        let trackers = TrackersHandle::new(metainfo.tracker_urls());

        let ctx = Arc::new(TorrentContext {
            info_hash: metainfo.info_hash(),
            client_id: config.client_id,
            picker: Picker::new(
                info.num_pieces,
                info.piece_len,
                info.last_piece_len,
                config.end_game_threshold,
            ),
            torrent_tx: torrent_tx.clone(),
            disk_tx,
            info,
            config,
        });

        Ok((
            Torrent {
                ctx,
                peers: HashMap::new(),
                available: peers,
                trackers,
                torrent_rx,
                event_tx,
                state: TorrentState::Initializing,
                num_verified: 0,
                start_time: None,
                run_duration: Duration::default(),
                throughput: ThroughputStats::default(),
                disk_handle: Some(disk_handle),
            },
            torrent_tx,
        ))
    }

    pub async fn start(&mut self) -> Result<()> {
        self.start_time = Some(Instant::now());
        match self.run().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = TorrentState::Failed;
                tracing::error!("download failed: {}", e);
                self.event_tx.send(DownloadEvent::Failed { reason: e.to_string() }).ok();
                self.shutdown().await;
                Err(e)
            },
        }
    }

    #[tracing::instrument(skip_all, name = "torrent")]
    async fn run(&mut self) -> Result<()> {

        tracing::info!(
            "starting download of {} pieces from up to {} peers",
            self.ctx.info.num_pieces,
            self.available.len(),
        );
        self.state = TorrentState::Downloading;

        self.trackers.start(self.ctx.torrent_tx.clone()).await;
        self.trackers.announce(self.announce_params(Some(Event::Started)));
        self.connect_to_peers();

        if self.peers.is_empty() && self.trackers.is_empty() {
            return Err(TorrentError::NoPeersAvailable);
        }

        let mut ticker = time::interval(Duration::from_secs(1));
        let mut last_tick = None;

        loop { tokio::select! {

            now = ticker.tick() => self.tick(&mut last_tick, now.into_std()).await,

            Some(cmd) = self.torrent_rx.recv() => {
                if self.handle_command(cmd).await? {
                    break;
                }
            },

        }}

        Ok(())
    }

    // Returns true when the torrent loop should stop.
    async fn handle_command(&mut self, cmd: CommandToTorrent) -> Result<bool> {
        match cmd {

            CommandToTorrent::PeerConnected { address, id } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.id = Some(id);
                }
                Ok(false)
            },

            CommandToTorrent::PeerState { address, state } => {
                self.handle_peer_state(address, state)?;
                Ok(false)
            },

            CommandToTorrent::Peers(addresses) => {
                self.add_peers(addresses);
                Ok(false)
            },

            CommandToTorrent::BlockReceived { block, from } => {
                self.cancel_duplicates(block, from);
                Ok(false)
            },

            CommandToTorrent::PieceVerified { idx } => self.handle_piece_verified(idx).await,

            CommandToTorrent::PieceRejected { idx, peers } => {
                self.handle_piece_rejected(idx, peers).await;
                Ok(false)
            },

            CommandToTorrent::DiskFailure(e) => Err(e.into()),

            CommandToTorrent::Shutdown => {
                self.shutdown().await;
                Ok(true)
            },
        }
    }

    fn connect_to_peers(&mut self) {
        let max = self.ctx.config.min_max_peers.1 as usize;
        let count = self.available.len().min(max.saturating_sub(self.peers.len()));
        if count == 0 {
            return;
        }
        tracing::info!("connecting to {} peers", count);
        for address in self.available.drain(0..count) {
            self.peers.insert(address, PeerHandle::spawn(address, Arc::clone(&self.ctx)));
        }
    }

    fn add_peers(&mut self, addresses: Vec<SocketAddr>) {
        for address in addresses {
            if !self.peers.contains_key(&address) && !self.available.contains(&address) {
                self.available.push(address);
            }
        }
        self.connect_to_peers();
    }

    fn handle_peer_state(&mut self, address: SocketAddr, state: SessionState) -> Result<()> {

        if let Some(peer) = self.peers.get_mut(&address) {
            peer.state = state;
            self.throughput += &state.throughput;

            if state.conn_state == ConnState::Disconnected {
                self.peers.remove(&address);
                tracing::info!("peer {} disconnected, {} connected", address, self.peers.len());
                self.connect_to_peers();
            }
        }

        // With nobody connected, nobody left to try and nobody to ask for
        // more, the download cannot make progress.
        if self.peers.is_empty() && self.available.is_empty() && self.trackers.is_empty() {
            return Err(TorrentError::NoPeersAvailable);
        }
        Ok(())
    }

    // First block response wins in end game; everyone else cancels.
    fn cancel_duplicates(&self, block: BlockInfo, from: SocketAddr) {
        for (address, peer) in self.peers.iter() {
            if *address != from {
                peer.peer_tx.send(PeerCommand::CancelBlock(block)).ok();
            }
        }
    }

    async fn handle_piece_verified(&mut self, idx: usize) -> Result<bool> {

        self.ctx.picker.complete_piece(idx).await;
        self.num_verified += 1;
        let num_missing = self.ctx.info.num_pieces as usize - self.num_verified;
        tracing::info!("piece {} verified, {} pieces remain", idx, num_missing);

        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::PieceDone(idx)).ok();
        }

        if num_missing == 0 {
            tracing::info!("download complete");
            self.state = TorrentState::Completed;
            self.event_tx.send(DownloadEvent::Completed).ok();
            self.trackers.announce(self.announce_params(Some(Event::Completed)));
            self.shutdown().await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn handle_piece_rejected(&mut self, idx: usize, peers: Vec<SocketAddr>) {

        tracing::warn!("piece {} rejected, re-requesting from scratch", idx);
        self.ctx.picker.drop_partial(idx).await;
        self.event_tx.send(DownloadEvent::CorruptPiece { idx }).ok();

        // Charge everyone who contributed; repeat offenders get dropped.
        for address in peers {
            if let Some(peer) = self.peers.get_mut(&address) {
                peer.strikes += 1;
                if peer.strikes >= self.ctx.config.max_strikes {
                    tracing::warn!("peer {} served too many corrupt pieces, disconnecting", address);
                    peer.peer_tx.send(PeerCommand::Shutdown).ok();
                }
            }
        }
    }

    async fn shutdown(&mut self) {

        tracing::info!("disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::Shutdown).ok();
        }
        for (_, mut peer) in self.peers.drain() {
            if let Some(handle) = peer.session_handle.take() {
                if let Err(e) = handle.await {
                    tracing::warn!("peer task join error: {}", e);
                }
            }
        }

        self.trackers.announce(self.announce_params(Some(Event::Stopped)));
        self.trackers.shutdown().await;

        self.ctx.disk_tx.send(DiskCommand::Shutdown).ok();
        if let Some(handle) = self.disk_handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("disk task join error: {}", e);
            }
        }
    }

    fn announce_params(&self, event: Option<Event>) -> AnnounceParams {

        let num_peers = self.peers.len() + self.available.len();
        let (min_peers, max_peers) = self.ctx.config.min_max_peers;
        let num_want = if event == Some(Event::Stopped) || num_peers >= min_peers as usize {
            None
        } else {
            Some((max_peers as usize).saturating_sub(num_peers))
        };

        let left = self.ctx.info.total_len
            .saturating_sub(self.num_verified as u64 * self.ctx.info.piece_len as u64);

        AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            port: self.ctx.config.listen_port,
            uploaded: 0,
            downloaded: self.throughput.down.total(),
            left,
            event,
            num_want,
        }
    }

    async fn tick(&mut self, last_tick: &mut Option<Instant>, time: Instant) {

        let elapsed = last_tick
            .or(self.start_time)
            .map(|t| time.saturating_duration_since(t))
            .unwrap_or_default();
        self.run_duration += elapsed;
        *last_tick = Some(time);

        self.trackers.announce(self.announce_params(None));

        let stats = self.build_stats().await;
        self.event_tx.send(DownloadEvent::Stats(stats)).ok();
        self.throughput.reset();
    }

    async fn build_stats(&self) -> DownloadStats {

        let num_pending = self.ctx.picker.partial_pieces.read().await.len();
        let peers = self.peers
            .iter()
            .map(|(address, peer)| PeerStats {
                address: *address,
                state: peer.state,
            })
            .collect();

        DownloadStats {
            state: self.state,
            start_time: self.start_time,
            time_elapsed: self.run_duration,
            pieces: PieceStats {
                num_pieces: self.ctx.info.num_pieces as usize,
                num_pending,
                num_verified: self.num_verified,
            },
            peers,
            throughput: self.throughput,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_torrent(peers: Vec<SocketAddr>) -> (Torrent, TorrentTx, crate::EventRx, tempfile::TempDir) {
        let piece = vec![0u8; 0x4000];
        let digest: Sha1Hash = <sha1::Sha1 as sha1::Digest>::digest(&piece).into();

        let mut raw = Vec::new();
        raw.extend_from_slice(b"d4:infod");
        raw.extend_from_slice(format!("6:lengthi{}e", piece.len()).as_bytes());
        raw.extend_from_slice(b"4:name8:test.bin");
        raw.extend_from_slice(format!("12:piece lengthi{}e", piece.len()).as_bytes());
        raw.extend_from_slice(b"6:pieces20:");
        raw.extend_from_slice(&digest);
        raw.extend_from_slice(b"ee");
        let metainfo = MetaInfo::from_bytes(&raw).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (torrent, torrent_tx) = Torrent::new(TorrentParams {
            metainfo,
            peers,
            config,
            event_tx,
        }).unwrap();
        (torrent, torrent_tx, event_rx, dir)
    }

    #[tokio::test]
    async fn test_fails_without_any_peer_source() {
        let (mut torrent, _tx, mut event_rx, _dir) = test_torrent(vec![]);
        let res = torrent.start().await;
        assert!(matches!(res, Err(TorrentError::NoPeersAvailable)));
        match event_rx.recv().await {
            Some(DownloadEvent::Failed { .. }) => {},
            other => panic!("expected failure event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_announce_params_num_want() {
        let (torrent, _tx, _event_rx, _dir) = test_torrent(vec![]);

        let params = torrent.announce_params(Some(Event::Started));
        // Below the minimum, ask for enough to reach the maximum.
        assert_eq!(params.num_want, Some(torrent.ctx.config.min_max_peers.1 as usize));
        assert_eq!(params.left, 0x4000);

        let params = torrent.announce_params(Some(Event::Stopped));
        assert_eq!(params.num_want, None);
    }
}
