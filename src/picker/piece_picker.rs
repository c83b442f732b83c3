use rand::Rng;
use crate::Bitfield;

// Piece selection follows rarest first: pieces advertised by the fewest
// connected peers are downloaded before common ones, which spreads rare
// data through the swarm and keeps the end of the download from bottling
// up on one peer. Ties are broken randomly so a swarm of clients doesn't
// pile onto the same piece.

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {

    // Number of connected peers that claim to have the piece.
    frequency: usize,

    // Whether the piece has an active PartialPiece.
    in_flight: bool,

}

#[derive(Debug)]
pub struct PiecePicker {

    // All pieces in the torrent, index aligned.
    pieces: Vec<PieceInfo>,

    // The pieces we have verified.
    have: Bitfield,

}

impl PiecePicker {

    pub fn new(num_pieces: usize) -> Self {
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have: Bitfield::repeat(false, num_pieces),
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn num_missing(&self) -> usize {
        self.have.count_zeros()
    }

    // Marks the piece verified. This transition is one way.
    pub fn received_piece(&mut self, idx: usize) {
        self.pieces[idx].in_flight = false;
        self.have.set(idx, true);
    }

    // Puts an abandoned piece back into the pickable pool.
    pub fn release_piece(&mut self, idx: usize) {
        self.pieces[idx].in_flight = false;
    }

    // Records a have message. Returns whether the piece makes the peer
    // interesting to us.
    pub fn increment_piece(&mut self, idx: usize) -> bool {
        debug_assert!(idx < self.pieces.len());
        self.pieces[idx].frequency += 1;
        !self.have[idx]
    }

    // Records a whole bitfield. Returns whether the peer has any piece we lack.
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        for (i, b) in bf.iter().enumerate() {
            if *b {
                self.pieces[i].frequency += 1;
                if !self.have[i] {
                    interested = true;
                }
            }
        }
        interested
    }

    // Removes a disconnected peer's bitfield from the frequency counts.
    pub fn bitfield_drop(&mut self, bf: &Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        for (i, b) in bf.iter().enumerate() {
            if *b {
                self.pieces[i].frequency = self.pieces[i].frequency.saturating_sub(1);
            }
        }
    }

    // Picks the rarest piece the peer has that isn't already in flight,
    // choosing randomly among equally rare candidates.
    pub fn pick_new_piece(&mut self, bf: &Bitfield) -> Option<usize> {

        let mut min_frequency = usize::MAX;
        let mut candidates = vec![];

        for (idx, piece) in self.pieces.iter().enumerate() {
            if self.have[idx] || piece.in_flight || piece.frequency == 0 || !bf[idx] {
                continue;
            }
            if piece.frequency < min_frequency {
                min_frequency = piece.frequency;
                candidates.clear();
            }
            if piece.frequency == min_frequency {
                candidates.push(idx);
            }
        }

        if candidates.is_empty() {
            return None;
        }
        let idx = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        self.pieces[idx].in_flight = true;
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitfield(bits: &[bool]) -> Bitfield {
        let mut bf = Bitfield::repeat(false, bits.len());
        for (i, b) in bits.iter().enumerate() {
            bf.set(i, *b);
        }
        bf
    }

    #[test]
    fn test_rarest_piece_first() {
        let mut picker = PiecePicker::new(3);
        // Two peers have pieces 0 and 1, only one has piece 2.
        picker.bitfield_update(&bitfield(&[true, true, false]));
        picker.bitfield_update(&bitfield(&[true, true, true]));

        let all = bitfield(&[true, true, true]);
        assert_eq!(picker.pick_new_piece(&all), Some(2));
        // Piece 2 is now in flight, the remaining picks share a frequency.
        let next = picker.pick_new_piece(&all).unwrap();
        assert!(next == 0 || next == 1);
    }

    #[test]
    fn test_pick_respects_peer_bitfield() {
        let mut picker = PiecePicker::new(2);
        picker.bitfield_update(&bitfield(&[true, true]));
        // The requesting peer only has piece 1.
        assert_eq!(picker.pick_new_piece(&bitfield(&[false, true])), Some(1));
        assert_eq!(picker.pick_new_piece(&bitfield(&[false, true])), None);
    }

    #[test]
    fn test_release_and_receive() {
        let mut picker = PiecePicker::new(1);
        picker.bitfield_update(&bitfield(&[true]));
        let all = bitfield(&[true]);

        assert_eq!(picker.pick_new_piece(&all), Some(0));
        assert_eq!(picker.pick_new_piece(&all), None);

        // Abandoned pieces become pickable again.
        picker.release_piece(0);
        assert_eq!(picker.pick_new_piece(&all), Some(0));

        picker.received_piece(0);
        assert_eq!(picker.num_missing(), 0);
        assert_eq!(picker.pick_new_piece(&all), None);
    }

    #[test]
    fn test_frequency_drop_on_disconnect() {
        let mut picker = PiecePicker::new(1);
        let bf = bitfield(&[true]);
        picker.bitfield_update(&bf);
        picker.bitfield_drop(&bf);
        // No connected peer has the piece any more.
        assert_eq!(picker.pick_new_piece(&bf), None);
    }
}
