use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use crate::{block::BlockInfo, torrent::TorrentContext, PeerId};

mod handshake;
mod message;
mod session;
pub mod state;

pub use session::PeerSession;

use state::SessionState;

type Result<T, E = PeerError> = std::result::Result<T, E>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("message of {0} bytes exceeds cap")]
    MessageTooLong(usize),

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("connection timeout")]
    Timeout,

}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands a running peer session accepts.
pub enum PeerCommand {

    // A piece completed verification; advertise it or cancel requests for it.
    PieceDone(usize),

    // Another session already received this block, cancel our duplicate.
    CancelBlock(BlockInfo),

    // End the session safely.
    Shutdown,

}

pub struct PeerHandle {

    // Unique 20-byte id, learned during the handshake.
    pub id: Option<PeerId>,

    pub peer_tx: PeerTx,

    pub state: SessionState,

    // Corrupt pieces this peer has contributed to.
    pub strikes: u32,

    pub session_handle: Option<tokio::task::JoinHandle<Result<()>>>,

}

impl PeerHandle {

    // Spawns a session task for the address. The task reports its own
    // disconnection to the torrent, whatever way the session ends.
    pub fn spawn(address: SocketAddr, ctx: Arc<TorrentContext>) -> PeerHandle {

        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let handle = tokio::spawn(async move {
            let res = session.start().await;
            if let Err(e) = &res {
                tracing::warn!("peer session {} ended: {}", address, e);
            }
            session.disconnect().await;
            res
        });

        PeerHandle {
            id: None,
            peer_tx,
            state: SessionState::default(),
            strikes: 0,
            session_handle: Some(handle),
        }
    }
}
