//! Decoding uploaded videos into sampled RGB frames.
//!
//! Decoding is delegated to `ffmpeg`, which resamples the video to a fixed number of frames per
//! second and writes raw `rgb24` pixels to its stdout. `ffprobe` supplies the frame size.
use std::{
    io::{ErrorKind, Read},
    path::Path,
    process::{Child, ChildStdout, Command, Stdio},
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;

/// Default number of frames sampled per second of video.
pub const DEFAULT_SAMPLING_RATE: u32 = 24;

/// One sampled frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Position in the sampled sequence, starting at zero.
    pub index: u64,
    /// Presentation time of the sample, `index / sampling_rate`.
    pub timestamp: Duration,
    pub image: RgbImage,
}

/// Lazily produced, temporally ordered sequence of frames.
pub trait FrameSource {
    /// Next frame, or `None` once the video is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Opens video files as frame sources.
pub trait VideoDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
}

/// Decoder backed by the `ffmpeg` and `ffprobe` executables.
#[derive(Clone, Debug)]
pub struct FfmpegDecoder {
    pub sampling_rate: u32,
}

impl FfmpegDecoder {
    pub fn new(sampling_rate: u32) -> Self {
        Self { sampling_rate }
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLING_RATE)
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegSource::open(path, self.sampling_rate)?))
    }
}

/// Frames read from a running `ffmpeg` process.
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    sampling_rate: u32,
    next_index: u64,
    finished: bool,
}

impl FfmpegSource {
    pub fn open(path: &Path, sampling_rate: u32) -> Result<Self> {
        if sampling_rate == 0 {
            bail!("sampling rate must be positive");
        }
        let (width, height) = probe_dimensions(path)?;
        log::debug!(
            "Decoding {} ({}x{}) at {} frames per second",
            path.display(),
            width,
            height,
            sampling_rate
        );

        // Rotation metadata is ignored so the raw frames match the probed size
        let mut child = Command::new("ffmpeg")
            .args(["-nostdin", "-v", "error", "-noautorotate", "-i"])
            .arg(path)
            .args(["-an", "-sn", "-vf"])
            .arg(format!("fps={}", sampling_rate))
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn ffmpeg")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;

        // Drain stderr on its own thread so a chatty decoder can't block on a full pipe
        let stderr = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut messages = String::new();
                stderr.read_to_string(&mut messages).ok();
                messages
            })
        });

        Ok(Self {
            child,
            stdout,
            stderr,
            width,
            height,
            sampling_rate,
            next_index: 0,
            finished: false,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Reap the process once its output is exhausted.
    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        let messages = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            bail!("ffmpeg exited with {}: {}", status, messages.trim());
        }
        if !messages.trim().is_empty() {
            log::warn!("ffmpeg reported: {}", messages.trim());
        }

        Ok(())
    }
}

impl FrameSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0_u8; self.frame_len()];
        let filled = read_full(&mut self.stdout, &mut buf).context("failed to read from ffmpeg")?;
        if filled == 0 {
            self.finish()?;
            return Ok(None);
        }
        if filled < buf.len() {
            self.finish()?;
            bail!(
                "truncated frame {}: got {} of {} bytes",
                self.next_index,
                filled,
                buf.len()
            );
        }

        let image = RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))?;
        let index = self.next_index;
        self.next_index += 1;

        Ok(Some(Frame {
            index,
            timestamp: sample_timestamp(index, self.sampling_rate),
            image,
        }))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if !self.finished {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

/// Presentation time of the sample at `index`.
pub fn sample_timestamp(index: u64, sampling_rate: u32) -> Duration {
    Duration::from_secs_f64(index as f64 / sampling_rate as f64)
}

/// Read until `buf` is full or the reader is exhausted, returning the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

fn probe_dimensions(path: &Path) -> Result<(u32, u32)> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=p=0:s=x",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .context("failed to run ffprobe")?;

    if !output.status.success() {
        bail!(
            "ffprobe failed on {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_dimensions(&String::from_utf8_lossy(&output.stdout))
        .with_context(|| format!("no video stream in {}", path.display()))
}

/// Parse `ffprobe` output of the form `1280x720`.
fn parse_dimensions(probe_output: &str) -> Result<(u32, u32)> {
    let line = probe_output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("empty probe output"))?;

    let mut values = line.split('x').filter(|value| !value.is_empty());
    let (width, height) = match (values.next(), values.next()) {
        (Some(width), Some(height)) => (width.parse::<u32>()?, height.parse::<u32>()?),
        _ => bail!("unexpected probe output {:?}", line),
    };
    if width == 0 || height == 0 {
        bail!("invalid frame size {}x{}", width, height);
    }

    Ok((width, height))
}
