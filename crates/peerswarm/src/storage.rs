use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use parking_lot::Mutex;
use peerswarm_core::metainfo::FileEntry;

/// Backing store for content files, addressed by file index and byte offset.
///
/// Implementations must be usable from several connections at once; the swarm
/// never holds its own lock while calling into storage.
pub trait Storage: Send + Sync {
    fn pread_exact(&self, file_id: usize, offset: u64, buf: &mut [u8]) -> anyhow::Result<()>;

    fn pwrite_all(&self, file_id: usize, offset: u64, buf: &[u8]) -> anyhow::Result<()>;

    /// Pre-size the file to its final length.
    fn ensure_file_length(&self, file_id: usize, length: u64) -> anyhow::Result<()>;
}

impl<T: Storage + ?Sized> Storage for std::sync::Arc<T> {
    fn pread_exact(&self, file_id: usize, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        (**self).pread_exact(file_id, offset, buf)
    }

    fn pwrite_all(&self, file_id: usize, offset: u64, buf: &[u8]) -> anyhow::Result<()> {
        (**self).pwrite_all(file_id, offset, buf)
    }

    fn ensure_file_length(&self, file_id: usize, length: u64) -> anyhow::Result<()> {
        (**self).ensure_file_length(file_id, length)
    }
}

pub struct FilesystemStorage {
    output_folder: PathBuf,
    files: Vec<Mutex<File>>,
}

impl FilesystemStorage {
    /// Open (creating if needed) every file under the output folder. Existing
    /// content is kept so an interrupted download can be resumed.
    pub fn open(output_folder: &Path, files: &[FileEntry]) -> anyhow::Result<Self> {
        let mut opened = Vec::with_capacity(files.len());
        for file in files {
            if file.path.is_absolute() {
                anyhow::bail!("file path {:?} must be relative", file.path);
            }
            let full_path = output_folder.join(&file.path);
            if let Some(parent) = full_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("error creating directory {parent:?}"))?;
            }
            let f = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&full_path)
                .with_context(|| format!("error opening {full_path:?} in read/write mode"))?;
            opened.push(Mutex::new(f));
        }
        Ok(Self {
            output_folder: output_folder.to_owned(),
            files: opened,
        })
    }

    pub fn output_folder(&self) -> &Path {
        &self.output_folder
    }

    fn file(&self, file_id: usize) -> anyhow::Result<&Mutex<File>> {
        self.files
            .get(file_id)
            .with_context(|| format!("no such file {file_id}"))
    }
}

impl Storage for FilesystemStorage {
    fn pread_exact(&self, file_id: usize, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let mut g = self.file(file_id)?.lock();
        g.seek(SeekFrom::Start(offset))?;
        Ok(g.read_exact(buf)?)
    }

    fn pwrite_all(&self, file_id: usize, offset: u64, buf: &[u8]) -> anyhow::Result<()> {
        let mut g = self.file(file_id)?.lock();
        g.seek(SeekFrom::Start(offset))?;
        Ok(g.write_all(buf)?)
    }

    fn ensure_file_length(&self, file_id: usize, length: u64) -> anyhow::Result<()> {
        let g = self.file(file_id)?.lock();
        let current = g.metadata()?.len();
        if current != length {
            g.set_len(length)
                .with_context(|| format!("error resizing file {file_id} to {length}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_storage_read_write() {
        let dir = tempfile::TempDir::with_prefix("peerswarm_storage").unwrap();
        let files = vec![
            FileEntry {
                path: "a.bin".into(),
                length: 10,
            },
            FileEntry {
                path: "sub/b.bin".into(),
                length: 20,
            },
        ];
        let s = FilesystemStorage::open(dir.path(), &files).unwrap();
        s.ensure_file_length(0, 10).unwrap();
        s.ensure_file_length(1, 20).unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("sub/b.bin")).unwrap().len(), 20);

        s.pwrite_all(1, 15, b"hello").unwrap();
        let mut buf = [0u8; 5];
        s.pread_exact(1, 15, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        let mut too_far = [0u8; 5];
        assert!(s.pread_exact(0, 8, &mut too_far).is_err());
        assert!(s.pread_exact(2, 0, &mut too_far).is_err());
    }

    #[test]
    fn test_absolute_paths_rejected() {
        let dir = tempfile::TempDir::with_prefix("peerswarm_storage").unwrap();
        let files = vec![FileEntry {
            path: "/etc/passwd".into(),
            length: 1,
        }];
        assert!(FilesystemStorage::open(dir.path(), &files).is_err());
    }
}
