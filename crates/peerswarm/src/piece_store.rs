// Pieces of the content: where they live in the files, how to verify them, and
// the swarm-wide bitsets describing their state.

use anyhow::Context;
use peerswarm_core::{
    hash_id::Id20,
    lengths::{Lengths, ValidPieceIndex},
    metainfo::Metainfo,
};
use sha1w::{ISha1, Sha1};
use tracing::{debug, info, trace};

use crate::{storage::Storage, type_aliases::BF};

/// A contiguous part of a piece stored in one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    pub file_offset: u64,
    pub piece_offset: u32,
    pub len: u32,
}

#[derive(Debug, Clone)]
pub struct Piece {
    pub index: ValidPieceIndex,
    pub length: u32,
    pub hash: Id20,
    pub slices: Vec<FileSlice>,
}

impl Piece {
    /// Slices overlapping `begin..begin+len` of the piece, clipped to that range.
    fn slices_in_range(&self, begin: u32, len: u32) -> impl Iterator<Item = FileSlice> + '_ {
        let end = begin + len;
        self.slices.iter().filter_map(move |s| {
            let s_end = s.piece_offset + s.len;
            if s_end <= begin || s.piece_offset >= end {
                return None;
            }
            let from = s.piece_offset.max(begin);
            let to = s_end.min(end);
            Some(FileSlice {
                file_index: s.file_index,
                file_offset: s.file_offset + (from - s.piece_offset) as u64,
                piece_offset: from,
                len: to - from,
            })
        })
    }
}

fn hash_matches(expected: &Id20, data: &[u8]) -> bool {
    let mut h = Sha1::new();
    h.update(data);
    h.finish() == expected.0
}

/// Immutable piece layout plus access to the backing storage.
pub struct PieceStore {
    lengths: Lengths,
    pieces: Vec<Piece>,
    file_lengths: Vec<u64>,
    storage: Box<dyn Storage>,
}

impl PieceStore {
    pub fn new(
        metainfo: &Metainfo,
        lengths: Lengths,
        storage: Box<dyn Storage>,
    ) -> anyhow::Result<Self> {
        if lengths.total_length() != metainfo.total_length() {
            anyhow::bail!(
                "lengths total {} doesn't match files total {}",
                lengths.total_length(),
                metainfo.total_length()
            );
        }
        let file_lengths: Vec<u64> = metainfo.files.iter().map(|f| f.length).collect();

        let mut pieces = Vec::with_capacity(lengths.total_pieces() as usize);
        let mut file_index = 0usize;
        let mut file_start = 0u64;
        for info in lengths.iter_piece_infos() {
            let hash = *metainfo
                .piece_hash(info.piece_index.get())
                .with_context(|| format!("no hash for piece {}", info.piece_index))?;
            let piece_start = lengths.piece_offset(info.piece_index);
            let piece_end = piece_start + info.len as u64;
            let mut slices = Vec::new();
            let mut pos = piece_start;
            while pos < piece_end {
                let file_len = *file_lengths
                    .get(file_index)
                    .context("bug: pieces extend past the last file")?;
                let file_end = file_start + file_len;
                if pos >= file_end {
                    file_start = file_end;
                    file_index += 1;
                    continue;
                }
                let take = file_end.min(piece_end) - pos;
                slices.push(FileSlice {
                    file_index,
                    file_offset: pos - file_start,
                    piece_offset: (pos - piece_start) as u32,
                    len: take as u32,
                });
                pos += take;
            }
            pieces.push(Piece {
                index: info.piece_index,
                length: info.len,
                hash,
                slices,
            });
        }

        Ok(Self {
            lengths,
            pieces,
            file_lengths,
            storage,
        })
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn piece(&self, index: ValidPieceIndex) -> &Piece {
        // Indices are validated against the same Lengths the pieces were built from.
        &self.pieces[index.get() as usize]
    }

    pub fn read_block(
        &self,
        index: ValidPieceIndex,
        begin: u32,
        buf: &mut [u8],
    ) -> anyhow::Result<()> {
        let piece = self.piece(index);
        let len = buf.len() as u32;
        if begin.checked_add(len).is_none_or(|end| end > piece.length) {
            anyhow::bail!("range {begin}+{len} is outside of piece {index}");
        }
        for s in piece.slices_in_range(begin, len) {
            let from = (s.piece_offset - begin) as usize;
            self.storage
                .pread_exact(s.file_index, s.file_offset, &mut buf[from..from + s.len as usize])
                .with_context(|| {
                    format!(
                        "error reading {} bytes from file {} at {}",
                        s.len, s.file_index, s.file_offset
                    )
                })?;
        }
        Ok(())
    }

    pub fn read_piece(&self, index: ValidPieceIndex) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.piece(index).length as usize];
        self.read_block(index, 0, &mut buf)?;
        Ok(buf)
    }

    pub fn write_piece(&self, index: ValidPieceIndex, data: &[u8]) -> anyhow::Result<()> {
        let piece = self.piece(index);
        if data.len() != piece.length as usize {
            anyhow::bail!(
                "piece {index} is {} bytes, got {}",
                piece.length,
                data.len()
            );
        }
        for s in piece.slices.iter() {
            let from = s.piece_offset as usize;
            self.storage
                .pwrite_all(s.file_index, s.file_offset, &data[from..from + s.len as usize])
                .with_context(|| {
                    format!(
                        "error writing {} bytes to file {} at {}",
                        s.len, s.file_index, s.file_offset
                    )
                })?;
        }
        trace!(piece = %index, "written to storage");
        Ok(())
    }

    /// Pre-size every file, then hash every piece already on disk.
    /// Returns the bitfield of pieces that verified.
    pub fn initial_check(&self) -> anyhow::Result<BF> {
        for (file_id, len) in self.file_lengths.iter().copied().enumerate() {
            self.storage
                .ensure_file_length(file_id, len)
                .with_context(|| format!("error pre-sizing file {file_id} to {len} bytes"))?;
        }

        let mut have = BF::repeat(false, self.pieces.len());
        for piece in self.pieces.iter() {
            match self.read_piece(piece.index) {
                Ok(data) => {
                    if hash_matches(&piece.hash, &data) {
                        have.set(piece.index.get() as usize, true);
                    }
                }
                Err(e) => debug!(piece = %piece.index, "error reading piece: {e:#}"),
            }
        }
        info!(
            have = have.count_ones(),
            total = self.pieces.len(),
            "initial check finished"
        );
        Ok(have)
    }
}

/// Swarm-wide piece state. Owned by the coordinator and only touched under its lock.
pub struct PieceBitsets {
    complete: BF,
    actively_requested: BF,
    ever_requested: BF,
    sent_to_peer: BF,
}

impl PieceBitsets {
    pub fn new(total_pieces: usize) -> Self {
        Self {
            complete: BF::repeat(false, total_pieces),
            actively_requested: BF::repeat(false, total_pieces),
            ever_requested: BF::repeat(false, total_pieces),
            sent_to_peer: BF::repeat(false, total_pieces),
        }
    }

    pub fn with_complete(complete: BF) -> Self {
        let mut bits = Self::new(complete.len());
        bits.complete = complete;
        bits
    }

    pub fn total(&self) -> usize {
        self.complete.len()
    }

    pub fn complete(&self) -> &BF {
        &self.complete
    }

    pub fn actively_requested(&self) -> &BF {
        &self.actively_requested
    }

    pub fn ever_requested(&self) -> &BF {
        &self.ever_requested
    }

    pub fn sent_to_peer(&self) -> &BF {
        &self.sent_to_peer
    }

    pub fn is_complete(&self, index: ValidPieceIndex) -> bool {
        self.complete[index.get() as usize]
    }

    pub fn is_actively_requested(&self, index: ValidPieceIndex) -> bool {
        self.actively_requested[index.get() as usize]
    }

    pub fn completed_count(&self) -> usize {
        self.complete.count_ones()
    }

    pub fn remaining(&self) -> usize {
        self.complete.count_zeros()
    }

    pub fn all_complete(&self) -> bool {
        self.complete.all()
    }

    /// Every piece is either complete or was requested at some point.
    pub fn all_requested_or_complete(&self) -> bool {
        self.complete
            .iter()
            .zip(self.ever_requested.iter())
            .all(|(c, r)| *c || *r)
    }

    pub fn mark_requested(&mut self, index: ValidPieceIndex) {
        let i = index.get() as usize;
        self.actively_requested.set(i, true);
        self.ever_requested.set(i, true);
    }

    pub fn release(&mut self, index: ValidPieceIndex) {
        self.actively_requested.set(index.get() as usize, false);
    }

    /// Returns false if the piece was already complete.
    pub fn mark_complete(&mut self, index: ValidPieceIndex) -> bool {
        let i = index.get() as usize;
        self.actively_requested.set(i, false);
        !self.complete.replace(i, true)
    }

    pub fn mark_sent(&mut self, index: ValidPieceIndex) {
        self.sent_to_peer.set(index.get() as usize, true);
    }

    /// The bitfield message payload: MSB-first, spare bits zero.
    pub fn complete_as_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.complete.len().div_ceil(8)];
        for i in self.complete.iter_ones() {
            out[i / 8] |= 0x80 >> (i % 8);
        }
        out
    }
}

/// Blocks of one piece accumulated by the downloading connection.
pub struct PieceBuffer {
    index: ValidPieceIndex,
    hash: Id20,
    data: Vec<u8>,
}

impl PieceBuffer {
    pub fn new(index: ValidPieceIndex, length: u32, hash: Id20) -> Self {
        Self {
            index,
            hash,
            data: vec![0u8; length as usize],
        }
    }

    pub fn write_block(&mut self, begin: u32, block: &[u8]) -> anyhow::Result<()> {
        let (index, piece_len) = (self.index, self.data.len());
        let begin = begin as usize;
        let dst = begin
            .checked_add(block.len())
            .and_then(|end| self.data.get_mut(begin..end))
            .with_context(|| {
                format!(
                    "block {begin}+{} doesn't fit piece {index} of length {piece_len}",
                    block.len(),
                )
            })?;
        dst.copy_from_slice(block);
        Ok(())
    }

    /// Consume the buffer. Returns the data only if it hashes to the expected value.
    pub fn verify_and_take(self) -> Option<Vec<u8>> {
        if hash_matches(&self.hash, &self.data) {
            Some(self.data)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::tests::test_util::{InMemoryStorage, random_bytes};

    use super::*;

    fn make_store(files: &[(&str, &[u8])], piece_length: u32) -> (Metainfo, PieceStore) {
        let meta = Metainfo::from_content("", piece_length, files).unwrap();
        let lengths = meta.lengths(8192).unwrap();
        let storage = InMemoryStorage::new(&meta.files);
        let store = PieceStore::new(&meta, lengths, Box::new(storage)).unwrap();
        (meta, store)
    }

    #[test]
    fn test_piece_spanning_files() {
        let a = random_bytes(20000);
        let b = random_bytes(5000);
        let c = random_bytes(20000);
        let (_, store) = make_store(&[("a", &a[..]), ("b", &b[..]), ("c", &c[..])], 16384);
        let lengths = *store.lengths();
        assert_eq!(lengths.total_pieces(), 3);

        let p1 = store.piece(lengths.validate_piece_index(1).unwrap());
        assert_eq!(
            p1.slices,
            vec![
                FileSlice {
                    file_index: 0,
                    file_offset: 16384,
                    piece_offset: 0,
                    len: 3616
                },
                FileSlice {
                    file_index: 1,
                    file_offset: 0,
                    piece_offset: 3616,
                    len: 5000
                },
                FileSlice {
                    file_index: 2,
                    file_offset: 0,
                    piece_offset: 8616,
                    len: 7768
                },
            ]
        );
        let last = store.piece(lengths.last_piece_id());
        assert_eq!(last.length, 45000 - 32768);
    }

    #[test]
    fn test_zero_length_file_is_skipped() {
        let a = random_bytes(100);
        let c = random_bytes(100);
        let (_, store) = make_store(&[("a", &a[..]), ("empty", &[0u8; 0][..]), ("c", &c[..])], 16384);
        let p0 = store.piece(store.lengths().validate_piece_index(0).unwrap());
        let files: Vec<usize> = p0.slices.iter().map(|s| s.file_index).collect();
        assert_eq!(files, vec![0, 2]);
    }

    #[test]
    fn test_write_read() {
        let a = random_bytes(10000);
        let b = random_bytes(30000);
        let (_, store) = make_store(&[("a", &a[..]), ("b", &b[..])], 16384);
        let mut joined = a.clone();
        joined.extend_from_slice(&b);

        let idx = store.lengths().validate_piece_index(0).unwrap();
        store.write_piece(idx, &joined[..16384]).unwrap();
        assert_eq!(store.read_piece(idx).unwrap(), &joined[..16384]);

        let mut block = vec![0u8; 100];
        store.read_block(idx, 9950, &mut block).unwrap();
        assert_eq!(block, &joined[9950..10050]);
        assert!(store.read_block(idx, 16380, &mut block).is_err());
        assert!(store.write_piece(idx, &joined[..100]).is_err());
    }

    #[test]
    fn test_initial_check_finds_written_pieces() {
        let a = random_bytes(40000);
        let meta = Metainfo::from_content("", 16384, &[("a", &a[..])]).unwrap();
        let lengths = meta.lengths(16384).unwrap();
        let storage = Arc::new(InMemoryStorage::new(&meta.files));
        let store = PieceStore::new(&meta, lengths, Box::new(storage.clone())).unwrap();

        let have = store.initial_check().unwrap();
        assert_eq!(have.count_ones(), 0);

        let idx = lengths.validate_piece_index(2).unwrap();
        store.write_piece(idx, &a[32768..]).unwrap();
        let have = store.initial_check().unwrap();
        assert_eq!(have.iter_ones().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_piece_buffer() {
        let data = random_bytes(20000);
        let meta = Metainfo::from_content("", 32768, &[("a", &data[..])]).unwrap();
        let lengths = meta.lengths(16384).unwrap();
        let idx = lengths.validate_piece_index(0).unwrap();

        let mut buf = PieceBuffer::new(idx, 20000, meta.piece_hashes[0]);
        buf.write_block(0, &data[..16384]).unwrap();
        assert!(buf.write_block(16384, &data[..16384]).is_err());
        buf.write_block(16384, &data[16384..]).unwrap();
        assert_eq!(buf.verify_and_take().unwrap(), data);

        let mut bad = PieceBuffer::new(idx, 20000, meta.piece_hashes[0]);
        bad.write_block(0, &data[..16384]).unwrap();
        assert!(bad.verify_and_take().is_none());
    }

    #[test]
    fn test_bitsets() {
        let mut bits = PieceBitsets::new(10);
        let l = Lengths::new(10 * 16384, 16384, None).unwrap();
        let p3 = l.validate_piece_index(3).unwrap();
        bits.mark_requested(p3);
        assert!(bits.is_actively_requested(p3));
        assert!(bits.ever_requested()[3]);
        assert!(bits.mark_complete(p3));
        assert!(!bits.mark_complete(p3));
        assert!(!bits.is_actively_requested(p3));
        assert_eq!(bits.complete_as_bytes(), vec![0b0001_0000, 0]);
        assert!(!bits.all_requested_or_complete());
        assert_eq!(bits.remaining(), 9);
    }
}
