//! Chunk sources for a session's image.

use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Where chunk bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Image file on disk
    File(PathBuf),
    /// No backing file: deterministic filler for dry runs
    Synthetic,
}

impl ImageSource {
    /// Opens a reader positioned at the start of the image.
    pub async fn open(&self) -> std::io::Result<ChunkReader> {
        let file = match self {
            Self::File(path) => Some(File::open(path).await?),
            Self::Synthetic => None,
        };
        Ok(ChunkReader { file, position: 0 })
    }

    /// One-off read, used for repairs.
    pub async fn read_chunk(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        self.open().await?.read_at(offset, len).await
    }
}

/// Sequential reader that seeks only when asked for a different offset.
#[derive(Debug)]
pub struct ChunkReader {
    file: Option<File>,
    position: u64,
}

impl ChunkReader {
    /// Reads exactly `len` bytes at `offset`. A file shorter than expected
    /// is an `UnexpectedEof` error.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let Some(file) = self.file.as_mut() else {
            return Ok(filler(offset, len));
        };
        if self.position != offset {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        self.position = offset + len as u64;
        Ok(buf)
    }
}

/// Filler byte at absolute offset `n` is `n mod 256`.
pub fn filler(offset: u64, len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| ((offset + i) % 256) as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filler_continues_across_chunks() {
        let joined = [filler(0, 300), filler(300, 300)].concat();
        assert_eq!(joined, filler(0, 600));
        assert_eq!(filler(255, 2), vec![255, 0]);
    }

    #[tokio::test]
    async fn test_file_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img");
        let contents: Vec<u8> = (0..1000u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(&path, &contents).unwrap();

        let source = ImageSource::File(path);
        let mut reader = source.open().await.unwrap();
        assert_eq!(reader.read_at(0, 400).await.unwrap(), &contents[..400]);
        assert_eq!(reader.read_at(400, 400).await.unwrap(), &contents[400..800]);
        assert_eq!(reader.read_at(800, 200).await.unwrap(), &contents[800..]);

        // Out-of-order read for a repair
        assert_eq!(source.read_chunk(400, 400).await.unwrap(), &contents[400..800]);
    }

    #[tokio::test]
    async fn test_short_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.img");
        std::fs::write(&path, [1u8; 10]).unwrap();

        let err = ImageSource::File(path).read_chunk(0, 20).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        assert!(ImageSource::File(PathBuf::from("/nonexistent/image.img")).open().await.is_err());
    }

    #[tokio::test]
    async fn test_synthetic_source() {
        let mut reader = ImageSource::Synthetic.open().await.unwrap();
        assert_eq!(reader.read_at(510, 4).await.unwrap(), vec![254, 255, 0, 1]);
    }
}
