use std::collections::HashSet;
use crate::{
    block::{block_len, num_blocks, BlockInfo},
    BLOCK_SIZE,
};

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {

    // Block has not been requested.
    #[default]
    Free,

    // Block has been requested from at least one peer.
    Requested,

    // Block has been received.
    Received,

}

// Request bookkeeping for a piece that has been started but not verified.
#[derive(Debug)]
pub struct PartialPiece {

    pub idx: usize,

    pub len: usize,

    pub blocks: Vec<BlockState>,

}

impl PartialPiece {

    pub fn new(idx: usize, len: usize) -> Self {
        Self {
            idx,
            len,
            blocks: vec![BlockState::default(); num_blocks(len) as usize],
        }
    }

    // Makes the block requestable again, e.g. after a timeout or disconnect.
    pub fn free_block(&mut self, block: &BlockInfo) {
        debug_assert_eq!(block.piece_idx, self.idx);
        let state = &mut self.blocks[block.idx_in_piece()];
        // A block another peer delivered in the meantime stays received.
        if *state == BlockState::Requested {
            *state = BlockState::Free;
        }
    }

    // Marks the block received. Returns whether it was already received,
    // which happens with end game duplicates and resent blocks.
    pub fn received_block(&mut self, block: &BlockInfo) -> bool {
        debug_assert_eq!(block.piece_idx, self.idx);
        let state = &mut self.blocks[block.idx_in_piece()];
        match *state {
            BlockState::Received => true,
            _ => {
                *state = BlockState::Received;
                false
            }
        }
    }

    // Picks up to num open blocks in offset order. In end game mode blocks
    // requested elsewhere may be picked again, except those in prev which
    // the calling connection already has in flight.
    pub fn pick_next_blocks(
        &mut self,
        num: usize,
        buf: &mut Vec<BlockInfo>,
        prev: &HashSet<BlockInfo>,
        end_game: bool,
    ) -> usize {

        let mut num_picked = 0;
        for (i, state) in self.blocks.iter_mut().enumerate() {
            if num_picked == num {
                break;
            }

            let block = BlockInfo {
                piece_idx: self.idx,
                offset: i * BLOCK_SIZE,
                len: block_len(self.len, i),
            };

            match *state {
                BlockState::Free => {
                    *state = BlockState::Requested;
                    buf.push(block);
                    num_picked += 1;
                },
                BlockState::Requested if end_game && !prev.contains(&block) => {
                    buf.push(block);
                    num_picked += 1;
                },
                _ => {},
            }
        }
        num_picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_in_offset_order() {
        let mut partial = PartialPiece::new(0, BLOCK_SIZE * 3);
        let mut buf = vec![];
        let picked = partial.pick_next_blocks(2, &mut buf, &HashSet::new(), false);
        assert_eq!(picked, 2);
        assert_eq!(buf[0].offset, 0);
        assert_eq!(buf[1].offset, BLOCK_SIZE);

        // Remaining block only.
        let mut buf = vec![];
        assert_eq!(partial.pick_next_blocks(8, &mut buf, &HashSet::new(), false), 1);
        assert_eq!(buf[0].offset, BLOCK_SIZE * 2);

        // Everything requested, nothing pickable outside end game.
        let mut buf = vec![];
        assert_eq!(partial.pick_next_blocks(8, &mut buf, &HashSet::new(), false), 0);
    }

    #[test]
    fn test_end_game_skips_own_requests() {
        let mut partial = PartialPiece::new(0, BLOCK_SIZE * 2);
        let mut buf = vec![];
        partial.pick_next_blocks(2, &mut buf, &HashSet::new(), false);

        // A second peer in end game may duplicate both requests.
        let mut dup = vec![];
        assert_eq!(partial.pick_next_blocks(8, &mut dup, &HashSet::new(), true), 2);

        // But not requests it already has in flight itself.
        let prev: HashSet<BlockInfo> = buf.iter().copied().collect();
        let mut dup = vec![];
        assert_eq!(partial.pick_next_blocks(8, &mut dup, &prev, true), 0);
    }

    #[test]
    fn test_free_and_receive() {
        let mut partial = PartialPiece::new(4, BLOCK_SIZE * 2);
        let mut buf = vec![];
        partial.pick_next_blocks(2, &mut buf, &HashSet::new(), false);

        partial.free_block(&buf[0]);
        assert_eq!(partial.blocks[0], BlockState::Free);

        assert!(!partial.received_block(&buf[1]));
        assert!(partial.received_block(&buf[1]));

        // Freeing a received block must not lose it.
        partial.free_block(&buf[1]);
        assert_eq!(partial.blocks[1], BlockState::Received);
    }
}
