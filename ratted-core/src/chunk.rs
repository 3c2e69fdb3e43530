//! Upload source and chunking: read a file sequentially in server-dictated blocks.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::DEFAULT_CHUNK_SIZE;

/// Chunk size to use for a server-provided value. Absent or non-positive values use the default.
pub fn effective_chunk_size(server_value: Option<i64>) -> usize {
    match server_value {
        Some(n) if n > 0 => usize::try_from(n).unwrap_or(DEFAULT_CHUNK_SIZE),
        _ => DEFAULT_CHUNK_SIZE,
    }
}

/// Number of chunks a stream of `total_len` bytes splits into.
pub fn chunk_count(total_len: u64, chunk_size: usize) -> u64 {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE as u64
    } else {
        chunk_size as u64
    };
    total_len.div_ceil(size)
}

/// Sequential byte source with a known total length, opened once per session.
pub struct UploadSource {
    pub file_name: String,
    pub size: u64,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl UploadSource {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Ok(Self {
            file_name,
            size,
            reader: Box::new(file),
        })
    }

    pub fn from_reader(
        file_name: impl Into<String>,
        size: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            size,
            reader: Box::new(reader),
        }
    }

    /// Start reading in blocks of `chunk_size` bytes.
    pub fn into_chunks(self, chunk_size: usize) -> ChunkReader {
        ChunkReader {
            reader: self.reader,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSource")
            .field("file_name", &self.file_name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Yields full `chunk_size` blocks; only the last one may be shorter.
pub struct ChunkReader {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    chunk_size: usize,
    done: bool,
}

impl ChunkReader {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Next block, or `None` once the source is exhausted. Short reads are coalesced.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf))
    }
}
