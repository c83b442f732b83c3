use crate::BLOCK_SIZE;

// A block received from or sent to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {

    // Index of the piece the block belongs to.
    pub piece_idx: usize,

    // Byte offset of the block within the piece.
    pub offset: usize,

    pub data: Vec<u8>,

}

// Identifies a block without carrying its data, the unit of request bookkeeping.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {

    pub fn from_data(block: &BlockData) -> Self {
        Self {
            piece_idx: block.piece_idx,
            offset: block.offset,
            len: block.data.len(),
        }
    }

    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }
}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> u32 {
    ((piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE) as u32
}
