//! Chunk sources: where outbound bytes come from
//!
//! The sender engine walks an ordered file list and reads chunks by
//! `(file_index, offset)`. The trait keeps the engine testable; `FileSet`
//! is the production implementation over the filesystem.

use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// One logical file in a transfer
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path on the sending side
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
}

/// Ordered sequence of readable files
///
/// The read future carries an explicit `Send` bound so engines generic
/// over a source can run inside spawned tasks.
pub trait ChunkSource: Send {
    /// The ordered file list
    fn files(&self) -> &[SourceFile];

    /// Read exactly `buf.len()` bytes of file `file_index` starting at
    /// `offset`. The engine never asks for a range beyond the file size.
    fn read_chunk(
        &mut self,
        file_index: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<()>> + Send;
}

/// Filesystem-backed chunk source
pub struct FileSet {
    files: Vec<SourceFile>,
    handles: Vec<Option<fs::File>>,
}

impl FileSet {
    /// Stat and register the given paths, preserving order.
    pub async fn open(paths: Vec<PathBuf>) -> io::Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let meta = fs::metadata(&path).await?;
            files.push(SourceFile {
                path,
                size: meta.len(),
            });
        }
        let handles = files.iter().map(|_| None).collect();
        Ok(Self { files, handles })
    }
}

impl ChunkSource for FileSet {
    fn files(&self) -> &[SourceFile] {
        &self.files
    }

    async fn read_chunk(
        &mut self,
        file_index: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<()> {
        let entry = self
            .files
            .get(file_index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file index out of range"))?;
        if self.handles[file_index].is_none() {
            self.handles[file_index] = Some(fs::File::open(&entry.path).await?);
        }
        let handle = self.handles[file_index]
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "handle vanished"))?;
        handle.seek(SeekFrom::Start(offset)).await?;
        handle.read_exact(buf).await?;
        Ok(())
    }
}

/// In-memory chunk source for tests and loopback transfers
pub struct BufferSource {
    files: Vec<SourceFile>,
    contents: Vec<Bytes>,
}

impl BufferSource {
    /// Build a source from named byte buffers.
    pub fn new(entries: Vec<(&str, Bytes)>) -> Self {
        let files = entries
            .iter()
            .map(|(name, bytes)| SourceFile {
                path: PathBuf::from(name),
                size: bytes.len() as u64,
            })
            .collect();
        let contents = entries.into_iter().map(|(_, bytes)| bytes).collect();
        Self { files, contents }
    }
}

impl ChunkSource for BufferSource {
    fn files(&self) -> &[SourceFile] {
        &self.files
    }

    async fn read_chunk(
        &mut self,
        file_index: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<()> {
        let content = self
            .contents
            .get(file_index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file index out of range"))?;
        let start = offset as usize;
        let end = start + buf.len();
        if end > content.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read beyond end of buffer",
            ));
        }
        buf.copy_from_slice(&content[start..end]);
        Ok(())
    }
}
