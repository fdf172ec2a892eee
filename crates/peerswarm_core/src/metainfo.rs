// What the engine needs to know about the content it's distributing.
//
// Parsing torrent files lives elsewhere; whatever parses them hands the result
// over as a Metainfo.

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha1w::{ISha1, Sha1};

use crate::{hash_id::Id20, lengths::Lengths};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info_hash: Id20,
    pub piece_length: u32,
    pub piece_hashes: Vec<Id20>,
    pub files: Vec<FileEntry>,
}

impl Metainfo {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Compute piece geometry, checking it against the number of hashes.
    pub fn lengths(&self, block_size: u32) -> anyhow::Result<Lengths> {
        let lengths = Lengths::new(self.total_length(), self.piece_length, Some(block_size))
            .context("invalid piece geometry")?;
        if lengths.total_pieces() as usize != self.piece_hashes.len() {
            anyhow::bail!(
                "expected {} piece hashes, got {}",
                lengths.total_pieces(),
                self.piece_hashes.len()
            );
        }
        Ok(lengths)
    }

    pub fn piece_hash(&self, index: u32) -> Option<&Id20> {
        self.piece_hashes.get(index as usize)
    }

    /// Build metainfo for in-memory content, hashing it piece by piece.
    /// The info hash is derived from the piece hashes.
    pub fn from_content(
        announce: impl Into<String>,
        piece_length: u32,
        files: &[(&str, &[u8])],
    ) -> anyhow::Result<Self> {
        if piece_length == 0 {
            anyhow::bail!("piece length can't be 0");
        }
        let mut piece_hashes = Vec::new();
        let mut current = Sha1::new();
        let mut in_current = 0u32;
        for (_, data) in files {
            let mut data = *data;
            while !data.is_empty() {
                let take = std::cmp::min((piece_length - in_current) as usize, data.len());
                current.update(&data[..take]);
                in_current += take as u32;
                data = &data[take..];
                if in_current == piece_length {
                    let full = std::mem::replace(&mut current, Sha1::new());
                    piece_hashes.push(Id20::new(full.finish()));
                    in_current = 0;
                }
            }
        }
        if in_current > 0 {
            piece_hashes.push(Id20::new(current.finish()));
        }

        let mut info = Sha1::new();
        for h in piece_hashes.iter() {
            info.update(&h.0);
        }

        Ok(Self {
            announce: announce.into(),
            info_hash: Id20::new(info.finish()),
            piece_length,
            piece_hashes,
            files: files
                .iter()
                .map(|(name, data)| FileEntry {
                    path: PathBuf::from(name),
                    length: data.len() as u64,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use sha1w::sha1_digest;

    use super::*;

    #[test]
    fn test_from_content_spanning_files() {
        let a = vec![1u8; 20000];
        let b = vec![2u8; 20000];
        let m = Metainfo::from_content("http://tracker/announce", 16384, &[("a", &a[..]), ("b", &b[..])])
            .unwrap();
        assert_eq!(m.total_length(), 40000);
        assert_eq!(m.piece_hashes.len(), 3);

        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        assert_eq!(m.piece_hashes[0].0, sha1_digest::<Sha1>(&joined[..16384]));
        assert_eq!(m.piece_hashes[1].0, sha1_digest::<Sha1>(&joined[16384..32768]));
        assert_eq!(m.piece_hashes[2].0, sha1_digest::<Sha1>(&joined[32768..]));

        let lengths = m.lengths(16384).unwrap();
        assert_eq!(lengths.total_pieces(), 3);
    }

    #[test]
    fn test_lengths_hash_count_mismatch() {
        let mut m = Metainfo::from_content("", 16384, &[("a", &[0u8; 100][..])]).unwrap();
        m.piece_hashes.push(Id20::default());
        assert!(m.lengths(16384).is_err());
    }
}
