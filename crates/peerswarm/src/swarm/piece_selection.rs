// Which piece to download next from a given peer.

use bitvec::slice::BitSlice;
use bitvec::order::Msb0;
use peerswarm_core::lengths::{Lengths, ValidPieceIndex};
use rand::{Rng, seq::IndexedRandom, seq::SliceRandom};

use crate::{piece_store::PieceBitsets, type_aliases::BF};

// Below this many missing pieces, pieces others are downloading are fair game too.
const FEW_PIECES_LEFT: usize = 3;

/// How many connected peers have each piece. Kept up to date as bitfields and
/// haves arrive and peers leave.
pub struct PieceAvailability {
    holders: Vec<u32>,
}

impl PieceAvailability {
    pub fn new(total_pieces: usize) -> Self {
        Self {
            holders: vec![0; total_pieces],
        }
    }

    pub fn holders(&self, index: ValidPieceIndex) -> u32 {
        self.holders.get(index.get() as usize).copied().unwrap_or(0)
    }

    pub fn add_bitfield(&mut self, bf: &BitSlice<u8, Msb0>) {
        for i in bf.iter_ones() {
            if let Some(h) = self.holders.get_mut(i) {
                *h += 1;
            }
        }
    }

    pub fn remove_bitfield(&mut self, bf: &BitSlice<u8, Msb0>) {
        for i in bf.iter_ones() {
            if let Some(h) = self.holders.get_mut(i) {
                *h = h.saturating_sub(1);
            }
        }
    }

    pub fn add_piece(&mut self, index: ValidPieceIndex) {
        if let Some(h) = self.holders.get_mut(index.get() as usize) {
            *h += 1;
        }
    }
}

/// Pieces the peer has that we still need. Pieces someone else is already
/// downloading are skipped, unless in end-game or almost done.
pub fn candidates(
    lengths: &Lengths,
    bitsets: &PieceBitsets,
    peer_has: &BF,
    endgame: bool,
) -> Vec<ValidPieceIndex> {
    let allow_requested = endgame || bitsets.remaining() < FEW_PIECES_LEFT;
    peer_has
        .iter_ones()
        .filter_map(|i| lengths.validate_piece_index(i as u32))
        .filter(|p| !bitsets.is_complete(*p))
        .filter(|p| allow_requested || !bitsets.is_actively_requested(*p))
        .collect()
}

/// Sort candidates: rarest first normally, most common first in end-game.
/// Ties are broken randomly.
pub fn order_candidates<R: Rng + ?Sized>(
    candidates: &mut [ValidPieceIndex],
    availability: &PieceAvailability,
    endgame: bool,
    rng: &mut R,
) {
    candidates.shuffle(rng);
    if endgame {
        candidates.sort_by_key(|p| std::cmp::Reverse(availability.holders(*p)));
    } else {
        candidates.sort_by_key(|p| availability.holders(*p));
    }
}

pub fn select_piece<R: Rng + ?Sized>(
    lengths: &Lengths,
    bitsets: &PieceBitsets,
    availability: &PieceAvailability,
    peer_has: &BF,
    known_peers: usize,
    endgame: bool,
    rng: &mut R,
) -> Option<ValidPieceIndex> {
    let mut c = candidates(lengths, bitsets, peer_has, endgame);
    if known_peers < 2 {
        // Nothing to compare rarity against.
        return c.choose(rng).copied();
    }
    order_candidates(&mut c, availability, endgame, rng);
    c.first().copied()
}
