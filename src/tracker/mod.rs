use std::{net::SocketAddr, time::Instant};
use tokio::task::JoinHandle;
use tracing::Instrument;
use url::Url;
use crate::{
    torrent::{CommandToTorrent, TorrentTx},
    PeerId,
    Sha1Hash,
};

mod http;
mod udp;
pub use http::HttpTracker;
pub use udp::UdpTracker;

type Result<T> = std::result::Result<T, TrackerError>;
pub type TrackerTx = tokio::sync::watch::Sender<Option<AnnounceParams>>;
pub type TrackerRx = tokio::sync::watch::Receiver<Option<AnnounceParams>>;

// Used when the tracker doesn't give us an interval of its own.
const DEFAULT_ANNOUNCE_INTERVAL: u64 = 60; // seconds

// Bound on a whole announce exchange.
const ANNOUNCE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("response error: {0}")]
    Response(String),

}

// One task per tracker url; all of them watch the same announce parameters
// and send discovered peers back to the torrent.
pub struct TrackersHandle {

    urls: Vec<Url>,

    handles: Vec<JoinHandle<()>>,

    tracker_rx: TrackerRx,

    tracker_tx: Option<TrackerTx>,

}

impl TrackersHandle {

    pub fn new(urls: Vec<Vec<Url>>) -> Self {
        let (tracker_tx, tracker_rx) = tokio::sync::watch::channel(None);
        Self {
            urls: urls.into_iter().flatten().collect(),
            handles: Vec::new(),
            tracker_rx,
            tracker_tx: Some(tracker_tx),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub async fn start(&mut self, torrent_tx: TorrentTx) {

        for url in self.urls.iter() {

            let mut tracker: Box<dyn Tracker> = match url.scheme() {
                "http" | "https" => Box::new(HttpTracker::new(url.clone())),
                "udp" => match UdpTracker::new(url.clone()).await {
                    Ok(tracker) => Box::new(tracker),
                    Err(e) => {
                        tracing::warn!("failed to set up udp tracker {}: {}", url, e);
                        continue;
                    },
                },
                scheme => {
                    tracing::warn!("unsupported tracker scheme: {}", scheme);
                    continue;
                },
            };

            let tx = torrent_tx.clone();
            let rx = self.tracker_rx.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = tracker.run(tx, rx).await {
                    tracing::error!("tracker error: {}", e);
                }
            }.instrument(tracing::info_span!("tracker", url = %url)));
            self.handles.push(handle);
        }
    }

    // Publishes fresh announce parameters; each tracker decides for itself
    // whether its interval allows another announce.
    pub fn announce(&self, params: AnnounceParams) {
        if let Some(tx) = &self.tracker_tx {
            tx.send_replace(Some(params));
        }
    }

    // Dropping the params channel winds the tracker tasks down once they
    // have processed the last value.
    pub async fn shutdown(&mut self) {
        self.tracker_tx.take();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("tracker join error: {}", e);
            }
        }
    }
}

#[async_trait::async_trait]
pub trait Tracker: Send + Sync {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>>;

    // Whether the tracker's minimum interval allows an announce now.
    fn can_announce(&self, time: Instant) -> bool;

    // Whether the tracker's regular interval asks for an announce now.
    fn should_announce(&self, time: Instant) -> bool;

    async fn run(&mut self, torrent_tx: TorrentTx, mut tracker_rx: TrackerRx) -> Result<()> {
        loop {

            if tracker_rx.changed().await.is_err() {
                // The torrent dropped the channel, we're done.
                return Ok(());
            }
            let params = *tracker_rx.borrow();
            let time = Instant::now();

            if let Some(params) = params {
                if params.event.is_some()
                || (params.num_want > Some(0) && self.can_announce(time))
                || self.should_announce(time) {

                    match self.announce(params).await {
                        Ok(peers) => {
                            tracing::info!("tracker provided {} peers", peers.len());
                            if torrent_tx.send(CommandToTorrent::Peers(peers)).is_err() {
                                return Ok(());
                            }
                        },
                        Err(e) => tracing::warn!("announce failed: {}", e),
                    }
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct AnnounceParams {

    pub info_hash: Sha1Hash,

    pub client_id: PeerId,

    // Port we could be reached on, reported to the tracker.
    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still needed for a complete download.
    pub left: u64,

    // Lifecycle events are announced immediately, regardless of intervals.
    pub event: Option<Event>,

    // How many peers we would like, None when we have enough.
    pub num_want: Option<usize>,

}

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum Event {

    #[default]
    Started,

    Completed,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Completed => write!(f, "completed"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}
