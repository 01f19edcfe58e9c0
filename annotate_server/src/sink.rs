//! Display sinks: a multipart HTTP stream and a directory of JPEG files.
//!
use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, ColorType, RgbImage};
use tokio::sync::mpsc;

use crate::{
    jobs::JobBoard,
    pipeline::{DisplaySink, PipelineError},
};

/// Boundary separating the parts of the multipart stream.
pub const FRAME_BOUNDARY: &str = "frame";

/// Content type of a stream of frames replacing each other.
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const JPEG_QUALITY: u8 = 85;

/// Encode a frame as JPEG.
pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>> {
    let (width, height) = frame.dimensions();
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode(
        frame.as_raw(),
        width,
        height,
        ColorType::Rgb8,
    )?;

    Ok(buf.into_inner())
}

/// Wrap JPEG data as one part of a `multipart/x-mixed-replace` stream.
pub fn as_jpeg_stream_item(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        FRAME_BOUNDARY,
        jpeg.len()
    );
    Bytes::from([header.as_bytes(), jpeg, "\r\n".as_bytes()].concat())
}

/// Streams frames to an HTTP client and reports progress on the job board.
///
/// The channel should have capacity one so decoding is paced by the client. Sending blocks the
/// current thread; run the pipeline on a blocking thread.
pub struct MjpegSink {
    tx: mpsc::Sender<Bytes>,
    jobs: Arc<JobBoard>,
    id: String,
}

impl MjpegSink {
    pub fn new(tx: mpsc::Sender<Bytes>, jobs: Arc<JobBoard>, id: String) -> Self {
        Self { tx, jobs, id }
    }
}

impl DisplaySink for MjpegSink {
    fn show_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let jpeg = encode_jpeg(frame)?;
        self.tx
            .blocking_send(as_jpeg_stream_item(&jpeg))
            .map_err(|_| PipelineError::SinkClosed)?;
        self.jobs.record_frame(&self.id);

        Ok(())
    }

    fn show_message(&mut self, message: &str) -> Result<()> {
        log::info!("[{}] {}", self.id, message);
        self.jobs.set_message(&self.id, message);
        Ok(())
    }
}

/// Writes every displayed frame to `frame-<n>.jpg` in a directory.
pub struct DirectorySink {
    dir: PathBuf,
    counter: u64,
    messages: Vec<String>,
}

impl DirectorySink {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_owned();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        Ok(Self {
            dir,
            counter: 0,
            messages: vec![],
        })
    }

    /// Number of frames written.
    pub fn written(&self) -> u64 {
        self.counter
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

impl DisplaySink for DirectorySink {
    fn show_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let path = self.dir.join(format!("frame-{:05}.jpg", self.counter));
        std::fs::write(&path, encode_jpeg(frame)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        self.counter += 1;

        Ok(())
    }

    fn show_message(&mut self, message: &str) -> Result<()> {
        log::info!("{}", message);
        self.messages.push(message.to_owned());
        Ok(())
    }
}
