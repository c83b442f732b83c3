use std::{net::SocketAddr, time::{Duration, Instant}};
use crate::{peer::state::SessionState, torrent::TorrentState};

#[derive(Debug)]
pub struct DownloadStats {

    pub state: TorrentState,

    pub start_time: Option<Instant>,

    pub time_elapsed: Duration,

    pub pieces: PieceStats,

    pub peers: Vec<PeerStats>,

    pub throughput: ThroughputStats,

}

#[derive(Debug, Default, Clone, Copy)]
pub struct PieceStats {

    pub num_pieces: usize,

    // Pieces with at least one block in flight.
    pub num_pending: usize,

    pub num_verified: usize,

}

impl PieceStats {
    pub fn is_complete(&self) -> bool {
        self.num_verified == self.num_pieces
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PeerStats {

    pub address: SocketAddr,

    pub state: SessionState,

}

// Download volume counters. Upload isn't tracked, we don't serve blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputStats {

    pub down: Counter,

}

impl ThroughputStats {
    pub fn reset(&mut self) {
        self.down.reset();
    }
}

impl std::ops::AddAssign<&ThroughputStats> for ThroughputStats {
    fn add_assign(&mut self, other: &ThroughputStats) {
        self.down += other.down.round();
    }
}

// Counts bytes per one second round, keeping a smoothed rate.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    total: u64,
    round: u64,
    avg: f64,
}

impl Counter {

    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    // Folds the finished round into a moving average over 5 rounds.
    pub fn reset(&mut self) {
        self.avg = (self.avg * 4.0 / 5.0) + (self.round as f64 / 5.0);
        self.round = 0;
    }

    pub fn avg(&self) -> u64 {
        self.avg as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn round(&self) -> u64 {
        self.round
    }
}

impl std::ops::AddAssign<u64> for Counter {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_rounds() {
        let mut counter = Counter::default();
        counter += 100;
        counter += 50;
        assert_eq!(counter.round(), 150);
        assert_eq!(counter.total(), 150);

        counter.reset();
        assert_eq!(counter.round(), 0);
        assert_eq!(counter.total(), 150);
        assert_eq!(counter.avg(), 30);
    }
}
