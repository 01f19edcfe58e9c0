//! Uploaded videos persisted to scoped temporary files.
//!
use std::{
    fmt,
    io::{Read, Write},
    path::Path,
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

/// An uploaded video backed by a temporary file.
///
/// The file is removed when the value is dropped, i.e. when the pipeline run that consumed it
/// finishes or fails, or when an unclaimed upload is discarded.
pub struct UploadedVideo {
    file: NamedTempFile,
    format: &'static str,
    size: u64,
}

impl UploadedVideo {
    /// Create an empty temporary file in `dir` with the container's extension.
    pub fn create_in(dir: impl AsRef<Path>, format: &'static str) -> Result<Self> {
        let dir = dir.as_ref();
        let file = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(&format!(".{}", format))
            .tempfile_in(dir)
            .with_context(|| format!("failed to create upload file in {}", dir.display()))?;

        Ok(Self {
            file,
            format,
            size: 0,
        })
    }

    /// Persist everything `reader` yields into a new temporary file.
    pub fn copy_from(
        dir: impl AsRef<Path>,
        format: &'static str,
        reader: &mut impl Read,
    ) -> Result<Self> {
        let mut video = Self::create_in(dir, format)?;
        video.size = std::io::copy(reader, video.file.as_file_mut())?;
        video.finish()?;

        Ok(video)
    }

    /// Writer filling the file from async code without blocking the executor.
    pub fn async_writer(&mut self) -> Result<AsyncUploadWriter<'_>> {
        let file = self
            .file
            .reopen()
            .with_context(|| format!("failed to reopen {}", self.path().display()))?;

        Ok(AsyncUploadWriter {
            file: tokio::fs::File::from_std(file),
            video: self,
        })
    }

    /// Flush written data so a decoder opening the path sees all of it.
    fn finish(&mut self) -> Result<()> {
        self.file.as_file_mut().flush()?;
        self.file.as_file().sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn format(&self) -> &'static str {
        self.format
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Appends uploaded chunks to an [`UploadedVideo`] through `tokio::fs`.
pub struct AsyncUploadWriter<'a> {
    file: tokio::fs::File,
    video: &'a mut UploadedVideo,
}

impl AsyncUploadWriter<'_> {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.video.size += chunk.len() as u64;
        Ok(())
    }

    /// Flush and sync, so a decoder opening the path sees everything written.
    pub async fn finish(mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }
}

impl fmt::Debug for UploadedVideo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadedVideo")
            .field("path", &self.path())
            .field("format", &self.format)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_file_lives_as_long_as_the_video() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let mut video = UploadedVideo::create_in(dir.path(), "mkv")?;
        let mut writer = video.async_writer()?;
        writer.write_chunk(b"abc").await?;
        writer.write_chunk(b"def").await?;
        writer.finish().await?;

        let path = video.path().to_owned();
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("mkv"));
        assert_eq!(std::fs::read(&path)?, b"abcdef");
        assert_eq!(video.size(), 6);

        drop(video);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_copy_from_reader() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let mut reader = Cursor::new(vec![1_u8; 1000]);
        let video = UploadedVideo::copy_from(dir.path(), "mp4", &mut reader)?;

        assert_eq!(video.size(), 1000);
        assert_eq!(video.format(), "mp4");
        assert_eq!(std::fs::metadata(video.path())?.len(), 1000);
        Ok(())
    }
}
