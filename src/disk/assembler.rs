use std::{collections::{HashMap, HashSet}, net::SocketAddr, sync::Arc};
use sha1::{Digest, Sha1};
use crate::{
    block::{num_blocks, BlockData},
    metainfo::{MetaInfo, TorrentInfo},
    torrent::{CommandToTorrent, TorrentTx},
    Sha1Hash,
    BLOCK_SIZE,
};
use super::{DiskCommand, DiskRx, FileStore};

// Collects blocks into per-piece buffers, hashes completed pieces and
// writes the good ones out. Owning all buffers in one task serializes
// block writes per piece without any locking.
pub struct Assembler {

    info: TorrentInfo,

    piece_hashes: Vec<Sha1Hash>,

    // In-flight piece buffers, keyed by piece index. A buffer exists from
    // the first block received until the piece is hashed.
    buffers: HashMap<usize, PieceBuf>,

    store: Arc<FileStore>,

    torrent_tx: TorrentTx,

    disk_rx: DiskRx,

}

#[derive(Debug)]
struct PieceBuf {

    // Expected hash from the metainfo.
    hash: Sha1Hash,

    len: usize,

    data: Vec<u8>,

    // Tracks which blocks have landed, so resent blocks don't double count.
    blocks_received: Vec<bool>,

    num_blocks_received: u32,

    // Peers that contributed blocks, charged if the piece turns out corrupt.
    peers: HashSet<SocketAddr>,

}

impl PieceBuf {

    fn new(hash: Sha1Hash, len: usize) -> Self {
        Self {
            hash,
            len,
            data: vec![0; len],
            blocks_received: vec![false; num_blocks(len) as usize],
            num_blocks_received: 0,
            peers: HashSet::new(),
        }
    }

    fn add_block(&mut self, block: &BlockData, from: SocketAddr) {
        let block_idx = block.offset / BLOCK_SIZE;
        if self.blocks_received[block_idx] {
            tracing::trace!("resent block in piece {} at offset {}", block.piece_idx, block.offset);
            return;
        }
        self.blocks_received[block_idx] = true;
        self.num_blocks_received += 1;
        self.data[block.offset..block.offset + block.data.len()].copy_from_slice(&block.data);
        // Only peers whose bytes actually landed in the buffer are charged
        // if the piece turns out corrupt.
        self.peers.insert(from);
    }

    fn is_complete(&self) -> bool {
        self.num_blocks_received as usize == self.blocks_received.len()
    }

    // Hash the whole piece and compare with the metainfo (computationally expensive).
    fn verify(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().as_slice() == self.hash
    }
}

impl Assembler {

    pub fn new(metainfo: &MetaInfo, store: FileStore, torrent_tx: TorrentTx, disk_rx: DiskRx) -> Self {
        Self {
            info: TorrentInfo::new(metainfo),
            piece_hashes: metainfo.piece_hashes(),
            buffers: HashMap::new(),
            store: Arc::new(store),
            torrent_tx,
            disk_rx,
        }
    }

    pub async fn run(&mut self) {
        while let Some(cmd) = self.disk_rx.recv().await {
            match cmd {
                DiskCommand::WriteBlock { block, from } => self.write_block(block, from),
                DiskCommand::Shutdown => break,
            }
        }
        tracing::debug!("disk task finished");
    }

    fn write_block(&mut self, block: BlockData, from: SocketAddr) {

        // Sessions only forward blocks they requested, but a buffer overrun
        // here would be unrecoverable, so bounds are checked again.
        let piece_idx = block.piece_idx;
        if piece_idx >= self.piece_hashes.len() {
            tracing::warn!("block for invalid piece {}", piece_idx);
            return;
        }
        let piece_len = self.info.piece_len(piece_idx);
        if block.offset % BLOCK_SIZE != 0 || block.offset + block.data.len() > piece_len {
            tracing::warn!("block out of bounds: piece {} offset {}", piece_idx, block.offset);
            return;
        }

        let piece = self.buffers.entry(piece_idx).or_insert_with(|| {
            tracing::trace!("opening buffer for piece {}", piece_idx);
            PieceBuf::new(self.piece_hashes[piece_idx], piece_len)
        });
        piece.add_block(&block, from);
        tracing::trace!(
            "piece {}: {}/{} blocks received",
            piece_idx,
            piece.num_blocks_received,
            piece.blocks_received.len(),
        );

        if !piece.is_complete() {
            return;
        }

        // All blocks are in: hash and write on a blocking thread, the
        // buffer is dropped either way.
        let piece = self.buffers.remove(&piece_idx).expect("buffer must exist");
        let offset = self.info.piece_offset(piece_idx);
        let store = Arc::clone(&self.store);
        let torrent_tx = self.torrent_tx.clone();

        tokio::task::spawn_blocking(move || {
            if piece.verify() {
                match store.write_piece(offset, &piece.data) {
                    Ok(()) => {
                        torrent_tx.send(CommandToTorrent::PieceVerified { idx: piece_idx }).ok();
                    },
                    Err(e) => {
                        tracing::error!("failed to write piece {}: {}", piece_idx, e);
                        torrent_tx.send(CommandToTorrent::DiskFailure(e)).ok();
                    },
                }
            } else {
                tracing::warn!("piece {} failed hash verification", piece_idx);
                torrent_tx.send(CommandToTorrent::PieceRejected {
                    idx: piece_idx,
                    peers: piece.peers.iter().copied().collect(),
                }).ok();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::sync::mpsc;
    use crate::torrent::TorrentRx;

    // Two pieces of two blocks each, with hashes matching the given data.
    fn test_assembler(piece_data: &[Vec<u8>]) -> (Assembler, TorrentRx, tempfile::TempDir) {
        let total_len: usize = piece_data.iter().map(|p| p.len()).sum();
        let mut pieces = Vec::new();
        for p in piece_data {
            let digest: Sha1Hash = Sha1::digest(p).into();
            pieces.extend_from_slice(&digest);
        }

        let mut raw = Vec::new();
        raw.extend_from_slice(b"d4:infod");
        raw.extend_from_slice(format!("6:lengthi{}e", total_len).as_bytes());
        raw.extend_from_slice(b"4:name8:test.bin");
        raw.extend_from_slice(format!("12:piece lengthi{}e", BLOCK_SIZE * 2).as_bytes());
        raw.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        raw.extend_from_slice(&pieces);
        raw.extend_from_slice(b"ee");
        let metainfo = MetaInfo::from_bytes(&raw).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(&[(PathBuf::from("test.bin"), total_len as u64)], dir.path()).unwrap();
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (_disk_tx, disk_rx) = mpsc::unbounded_channel::<DiskCommand>();
        (Assembler::new(&metainfo, store, torrent_tx, disk_rx), torrent_rx, dir)
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_block_is_idempotent() {
        let piece = vec![0x5a; BLOCK_SIZE * 2];
        let (mut assembler, _torrent_rx, _dir) = test_assembler(&[piece.clone(), piece]);

        let block = BlockData { piece_idx: 0, offset: 0, data: vec![0x5a; BLOCK_SIZE] };
        assembler.write_block(block.clone(), addr());
        assembler.write_block(block, addr());

        let buf = &assembler.buffers[&0];
        assert_eq!(buf.num_blocks_received, 1);
        assert!(!buf.is_complete());
    }

    #[tokio::test]
    async fn test_piece_verified_and_written() {
        let piece: Vec<u8> = (0..BLOCK_SIZE * 2).map(|i| (i % 251) as u8).collect();
        let (mut assembler, mut torrent_rx, dir) = test_assembler(&[piece.clone(), piece.clone()]);

        for piece_idx in 0..2 {
            assembler.write_block(
                BlockData { piece_idx, offset: 0, data: piece[..BLOCK_SIZE].to_vec() },
                addr(),
            );
            assembler.write_block(
                BlockData { piece_idx, offset: BLOCK_SIZE, data: piece[BLOCK_SIZE..].to_vec() },
                addr(),
            );
            match torrent_rx.recv().await.expect("verification result") {
                CommandToTorrent::PieceVerified { idx } => assert_eq!(idx, piece_idx),
                _ => panic!("expected piece verified"),
            }
            // Buffer is gone once hashed.
            assert!(!assembler.buffers.contains_key(&piece_idx));
        }

        let written = std::fs::read(dir.path().join("test.bin")).unwrap();
        assert_eq!(&written[..piece.len()], &piece[..]);
        assert_eq!(&written[piece.len()..], &piece[..]);
    }

    #[tokio::test]
    async fn test_corrupt_piece_discarded() {
        let piece = vec![0x5a; BLOCK_SIZE * 2];
        let (mut assembler, mut torrent_rx, _dir) = test_assembler(&[piece.clone(), piece]);

        let bad_peer = addr();
        assembler.write_block(
            BlockData { piece_idx: 0, offset: 0, data: vec![0xff; BLOCK_SIZE] },
            bad_peer,
        );
        assembler.write_block(
            BlockData { piece_idx: 0, offset: BLOCK_SIZE, data: vec![0xff; BLOCK_SIZE] },
            bad_peer,
        );

        match torrent_rx.recv().await.expect("verification result") {
            CommandToTorrent::PieceRejected { idx, peers } => {
                assert_eq!(idx, 0);
                assert_eq!(peers, vec![bad_peer]);
            },
            _ => panic!("expected piece rejected"),
        }
        // No partial bytes survive a failed verification.
        assert!(!assembler.buffers.contains_key(&0));
    }

    #[tokio::test]
    async fn test_out_of_bounds_block_dropped() {
        let piece = vec![0x5a; BLOCK_SIZE * 2];
        let (mut assembler, _torrent_rx, _dir) = test_assembler(&[piece.clone(), piece]);

        assembler.write_block(
            BlockData { piece_idx: 9, offset: 0, data: vec![0; BLOCK_SIZE] },
            addr(),
        );
        assembler.write_block(
            BlockData { piece_idx: 0, offset: BLOCK_SIZE * 2, data: vec![0; BLOCK_SIZE] },
            addr(),
        );
        assert!(assembler.buffers.is_empty());
    }
}
