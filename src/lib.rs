use std::net::SocketAddr;
use tokio::sync::mpsc;

mod block;
mod config;
mod disk;
mod metainfo;
mod peer;
mod picker;
pub mod stats;
mod torrent;
mod tracker;

// Most commonly used block size - 16KiB.
const BLOCK_SIZE: usize = 0x4000;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20-byte SHA1 digest, used for piece hashes and the info hash.
pub type Sha1Hash = [u8; 20];

// 20-byte identifier exchanged in the handshake.
pub type PeerId = [u8; 20];

pub use config::Config;
pub use metainfo::{MetaInfo, MetaInfoError};
pub use peer::state::{ConnState, SessionState};
pub use stats::DownloadStats;
pub use torrent::{TorrentError, TorrentState};

use torrent::{CommandToTorrent, Torrent, TorrentParams, TorrentTx};

// Events the driver of a download receives.
#[derive(Debug)]
pub enum DownloadEvent {

    // All pieces have been verified and written out.
    Completed,

    // The download hit an unrecoverable error and has stopped.
    Failed { reason: String },

    // A completed piece failed hash verification and will be re-requested.
    CorruptPiece { idx: usize },

    // Sent every second while the download runs.
    Stats(DownloadStats),

}

type EventTx = mpsc::UnboundedSender<DownloadEvent>;
pub type EventRx = mpsc::UnboundedReceiver<DownloadEvent>;

// Spawns the disk and torrent tasks for a single download session.
// `peers` seeds the swarm with addresses to try; any trackers named in the
// metainfo are announced to for more. Must be called within a tokio runtime.
pub fn start_download(
    metainfo: MetaInfo,
    peers: Vec<SocketAddr>,
    config: Config,
) -> Result<(DownloadHandle, EventRx), TorrentError> {

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (mut torrent, torrent_tx) = Torrent::new(TorrentParams {
        metainfo,
        peers,
        config,
        event_tx,
    })?;

    let handle = tokio::spawn(async move { torrent.start().await });

    Ok((DownloadHandle { torrent_tx, handle }, event_rx))
}

// Handle returned to the user to interact with a running download.
pub struct DownloadHandle {

    torrent_tx: TorrentTx,

    handle: tokio::task::JoinHandle<Result<(), TorrentError>>,

}

impl DownloadHandle {

    // Aborts the download. Verified pieces already written remain on disk.
    pub fn shutdown(&self) {
        self.torrent_tx.send(CommandToTorrent::Shutdown).ok();
    }

    pub async fn join(self) -> Result<(), TorrentError> {
        self.handle.await.map_err(|_| TorrentError::Panicked)?
    }

}
