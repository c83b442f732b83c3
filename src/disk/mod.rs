use std::net::SocketAddr;
use tokio::{sync::mpsc, task::{self, JoinHandle}};
use tracing::Instrument;
use crate::{
    block::BlockData,
    config::Config,
    metainfo::MetaInfo,
    torrent::TorrentTx,
};

mod assembler;
mod store;

use assembler::Assembler;
pub use store::FileStore;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("io error: expected {expected} bytes, got {actual}")]
    IoSize {
        expected: usize,
        actual: usize,
    },

    // Usually a poisoned file lock.
    #[error("sync error: {0}")]
    Sync(String),

}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::Sync(e.to_string())
    }
}

type Result<T> = std::result::Result<T, DiskError>;
pub type DiskTx = mpsc::UnboundedSender<DiskCommand>;
type DiskRx = mpsc::UnboundedReceiver<DiskCommand>;

pub enum DiskCommand {

    // A block arrived from a peer; add it to its piece.
    WriteBlock {
        block: BlockData,
        from: SocketAddr,
    },

    Shutdown,

}

// Spawns the task that assembles blocks into pieces, verifies them and
// writes them out. Verification results flow back through torrent_tx.
pub fn spawn_disk(
    metainfo: &MetaInfo,
    config: &Config,
    torrent_tx: TorrentTx,
) -> Result<(JoinHandle<()>, DiskTx)> {

    // Multi-file torrents get their own directory, named by the torrent.
    let root = if metainfo.is_multi_file() {
        config.output_dir.join(metainfo.name())
    } else {
        config.output_dir.clone()
    };
    let store = FileStore::new(&metainfo.files(), &root)?;

    let (disk_tx, disk_rx) = mpsc::unbounded_channel();
    let mut assembler = Assembler::new(metainfo, store, torrent_tx, disk_rx);
    let handle = task::spawn(async move {
        assembler.run().await
    }.instrument(tracing::info_span!("disk")));

    Ok((handle, disk_tx))
}
