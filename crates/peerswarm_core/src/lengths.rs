use crate::constants::BLOCK_SIZE;

/// A piece index checked against the [`Lengths`] it came from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidPieceIndex(u32);

impl ValidPieceIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInfo {
    pub piece_index: ValidPieceIndex,
    pub len: u32,
}

/// Piece geometry of one content item. Every piece has `piece_length` bytes
/// except the last one, which holds the remainder.
#[derive(Debug, Clone, Copy)]
pub struct Lengths {
    total_length: u64,
    piece_length: u32,
    total_pieces: u32,
}

impl Lengths {
    pub fn new(
        total_length: u64,
        piece_length: u32,
        block_length: Option<u32>,
    ) -> anyhow::Result<Self> {
        let block_length = block_length.unwrap_or(BLOCK_SIZE);
        if !block_length.is_power_of_two() {
            anyhow::bail!("block length {block_length} is not a power of 2");
        }
        // A block larger than a piece is fine: requests are cut at piece end.
        if total_length == 0 {
            anyhow::bail!("content is empty");
        }
        if piece_length == 0 {
            anyhow::bail!("piece length is 0");
        }
        let total_pieces = u32::try_from(total_length.div_ceil(piece_length as u64))
            .map_err(|_| anyhow::anyhow!("too many pieces for {total_length} bytes"))?;
        Ok(Self {
            total_length,
            piece_length,
            total_pieces,
        })
    }

    pub const fn total_length(&self) -> u64 {
        self.total_length
    }

    pub const fn total_pieces(&self) -> u32 {
        self.total_pieces
    }

    /// Bytes in a bitfield message for this content.
    pub const fn piece_bitfield_bytes(&self) -> usize {
        self.total_pieces.div_ceil(8) as usize
    }

    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index >= self.total_pieces {
            return None;
        }
        Some(ValidPieceIndex(index))
    }

    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.total_pieces - 1)
    }

    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        let offset = self.piece_offset(index);
        let left = self.total_length - offset;
        if left < self.piece_length as u64 {
            left as u32
        } else {
            self.piece_length
        }
    }

    /// Offset of the piece in the concatenation of all files.
    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_length as u64
    }

    pub fn iter_piece_infos(&self) -> impl Iterator<Item = PieceInfo> + use<> {
        let this = *self;
        (0..self.total_pieces).map(move |i| {
            let piece_index = ValidPieceIndex(i);
            PieceInfo {
                piece_index,
                len: this.piece_length(piece_index),
            }
        })
    }

    /// Check a block request from a peer. Peers may split pieces into blocks
    /// however they like, so only the range and its size are checked.
    pub fn validate_request(
        &self,
        index: u32,
        begin: u32,
        length: u32,
        max_length: u32,
    ) -> Option<(ValidPieceIndex, std::ops::Range<u32>)> {
        let piece = self.validate_piece_index(index)?;
        if length == 0 || length > max_length {
            return None;
        }
        let end = begin.checked_add(length)?;
        if end > self.piece_length(piece) {
            return None;
        }
        Some((piece, begin..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 4479 full pieces of 256 KiB and a short last one.
    fn big() -> Lengths {
        Lengths::new(1174243328, 262144, None).unwrap()
    }

    #[test]
    fn test_piece_counts() {
        let l = big();
        assert_eq!(l.total_pieces(), 4480);
        assert_eq!(l.piece_bitfield_bytes(), 560);
        assert_eq!(l.last_piece_id().get(), 4479);
        assert!(l.validate_piece_index(4479).is_some());
        assert!(l.validate_piece_index(4480).is_none());

        let l = Lengths::new(9 * 16384, 16384, None).unwrap();
        assert_eq!(l.piece_bitfield_bytes(), 2);
    }

    #[test]
    fn test_piece_lengths_and_offsets() {
        let l = big();
        let first = l.validate_piece_index(0).unwrap();
        let last = l.last_piece_id();
        assert_eq!(l.piece_length(first), 262144);
        assert_eq!(l.piece_length(last), 100352);
        assert_eq!(l.piece_offset(last), 4479 * 262144);

        let total: u64 = l.iter_piece_infos().map(|p| p.len as u64).sum();
        assert_eq!(total, l.total_length());

        // Exact multiple: the last piece is full.
        let l = Lengths::new(65536, 32768, Some(16384)).unwrap();
        assert_eq!(l.piece_length(l.last_piece_id()), 32768);
    }

    #[test]
    fn test_invalid_geometry() {
        assert!(Lengths::new(0, 32768, None).is_err());
        assert!(Lengths::new(100, 32768, Some(3000)).is_err());
        assert!(Lengths::new(100, 0, None).is_err());
    }

    #[test]
    fn test_pieces_smaller_than_a_block() {
        let l = Lengths::new(20000, 8192, Some(16384)).unwrap();
        assert_eq!(l.total_pieces(), 3);
        assert_eq!(l.piece_length(l.last_piece_id()), 3616);
        assert!(l.validate_request(0, 0, 8192, 16384).is_some());
    }

    #[test]
    fn test_validate_request() {
        let l = Lengths::new(40000, 32768, Some(16384)).unwrap();
        let max = 128 * 1024;
        let (p, range) = l.validate_request(0, 16384, 16384, max).unwrap();
        assert_eq!((p.get(), range), (0, 16384..32768));
        // Unusual but valid split.
        assert!(l.validate_request(0, 100, 1000, max).is_some());
        // The last piece has 7232 bytes.
        assert!(l.validate_request(1, 0, 7232, max).is_some());
        assert!(l.validate_request(1, 0, 7233, max).is_none());
        assert!(l.validate_request(2, 0, 1, max).is_none());
        assert!(l.validate_request(0, 0, 0, max).is_none());
        assert!(l.validate_request(0, u32::MAX, 2, max).is_none());
        assert!(l.validate_request(0, 0, 32768, 16384).is_none());
    }
}
