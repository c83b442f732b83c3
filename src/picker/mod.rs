use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use crate::{block::BlockInfo, Bitfield};

pub mod partial_piece;
pub mod piece_picker;

use partial_piece::PartialPiece;
use piece_picker::PiecePicker;

// Decides which blocks each connection requests next. Piece-state
// transitions are serialized behind the two locks here.
#[derive(Debug)]
pub struct Picker {

    pub piece_picker: RwLock<PiecePicker>,

    pub partial_pieces: RwLock<HashMap<usize, RwLock<PartialPiece>>>,

    num_pieces: u32,

    piece_len: usize,

    last_piece_len: usize,

    // Duplicate requests are allowed once this few pieces are missing.
    end_game_threshold: usize,

}

impl Picker {

    pub fn new(num_pieces: u32, piece_len: usize, last_piece_len: usize, end_game_threshold: usize) -> Self {
        Self {
            piece_picker: RwLock::new(PiecePicker::new(num_pieces as usize)),
            partial_pieces: RwLock::new(HashMap::new()),
            num_pieces,
            piece_len,
            last_piece_len,
            end_game_threshold,
        }
    }

    pub async fn end_game(&self) -> bool {
        self.piece_picker.read().await.num_missing() <= self.end_game_threshold
    }

    // Fills a connection's spare pipeline capacity. Blocks from pieces
    // already underway come first, then blocks of freshly picked pieces.
    // A block is never handed to two connections unless end game is on.
    pub async fn pick_blocks(
        &self,
        current_requests: &HashSet<BlockInfo>,
        target_queue_len: usize,
        bf: &Bitfield,
    ) -> Vec<BlockInfo> {

        let mut requests = vec![];
        let mut remaining = target_queue_len.saturating_sub(current_requests.len());
        if remaining == 0 {
            return requests;
        }

        // Continue partially downloaded pieces the peer has.
        for partial_piece in self.partial_pieces.write().await.values_mut() {

            if remaining == 0 {
                return requests;
            }
            if !bf[partial_piece.read().await.idx] {
                continue;
            }

            remaining -= partial_piece
                .write()
                .await
                .pick_next_blocks(remaining, &mut requests, current_requests, false);
        }

        // Open new pieces.
        while remaining != 0 {
            let picked = self.piece_picker.write().await.pick_new_piece(bf);
            match picked {
                Some(idx) => {
                    tracing::trace!("picked piece {}", idx);
                    let len = if idx as u32 == self.num_pieces - 1 {
                        self.last_piece_len
                    } else {
                        self.piece_len
                    };
                    let mut partial_piece = PartialPiece::new(idx, len);
                    remaining -= partial_piece.pick_next_blocks(remaining, &mut requests, current_requests, false);
                    self.partial_pieces.write().await.insert(idx, partial_piece.into());
                },
                None => break,
            }
        }

        // Nothing free is left; in end game double up on blocks still in
        // flight elsewhere so one slow peer can't stall the finish.
        if remaining != 0 && self.end_game().await {
            // The connection must not end up with the same block twice, so
            // blocks picked earlier in this call count as already in flight.
            let mut in_flight = current_requests.clone();
            in_flight.extend(requests.iter().copied());

            for partial_piece in self.partial_pieces.write().await.values_mut() {
                if remaining == 0 {
                    break;
                }
                if !bf[partial_piece.read().await.idx] {
                    continue;
                }
                remaining -= partial_piece
                    .write()
                    .await
                    .pick_next_blocks(remaining, &mut requests, &in_flight, true);
            }
        }

        requests
    }

    // The piece was verified; it is no longer pickable in any form.
    pub async fn complete_piece(&self, idx: usize) {
        self.partial_pieces.write().await.remove(&idx);
        self.piece_picker.write().await.received_piece(idx);
    }

    // The piece failed verification; throw away all request state so it is
    // re-picked from scratch.
    pub async fn drop_partial(&self, idx: usize) {
        self.partial_pieces.write().await.remove(&idx);
        self.piece_picker.write().await.release_piece(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;
    use bitvec::prelude::*;

    #[tokio::test]
    async fn test_pick_blocks() {
        let picker = Picker::new(1028, 32_768, 32_768, 0);
        let bf = BitVec::repeat(true, 1028);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let requests_1 = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(requests_1.len(), 4);
        let requests_2 = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(requests_2.len(), 4);

        // Far from end game: no block is ever handed out twice.
        let mut seen: HashSet<BlockInfo> = HashSet::new();
        for request in requests_1.iter().chain(requests_2.iter()) {
            assert!(seen.insert(*request), "block picked twice: {:?}", request);
        }
    }

    #[tokio::test]
    async fn test_pick_blocks_end_game() {

        let picker = Picker::new(2, 32_768, 32_768, 2);
        let bf = BitVec::repeat(true, 2);
        picker.piece_picker.write().await.bitfield_update(&bf);

        // Pick all four blocks of the torrent.
        let requests_1 = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(requests_1.len(), 4);

        // End game: another connection may duplicate them.
        let requests_2 = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(requests_2.len(), 4);

        // But never blocks that connection already has in flight.
        let mut previous = HashSet::new();
        previous.insert(BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE });
        previous.insert(BlockInfo { piece_idx: 1, offset: 0, len: BLOCK_SIZE });
        let requests_3 = picker.pick_blocks(&previous, 4, &bf).await;
        assert_eq!(requests_3.len(), 2);
    }

    #[tokio::test]
    async fn test_no_duplicates_outside_end_game() {
        // Threshold 0 keeps end game off while pieces are missing.
        let picker = Picker::new(2, 32_768, 32_768, 0);
        let bf = BitVec::repeat(true, 2);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let requests_1 = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(requests_1.len(), 4);
        // Everything is in flight on the first connection.
        let requests_2 = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert!(requests_2.is_empty());
    }

    #[tokio::test]
    async fn test_no_picks_after_completion() {
        let picker = Picker::new(2, 32_768, 32_768, 5);
        let bf = BitVec::repeat(true, 2);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let _ = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        picker.complete_piece(0).await;
        picker.complete_piece(1).await;

        assert_eq!(picker.piece_picker.read().await.num_missing(), 0);
        assert!(picker.pick_blocks(&HashSet::new(), 4, &bf).await.is_empty());
    }
}
