//! The frame annotation pipeline.
//!
//! A run takes an uploaded video, decodes it into sampled frames, passes every frame through the
//! detector, renders each returned result and hands the rendered image to a [`DisplaySink`].
//! Everything happens one frame at a time on the calling thread, in temporal order.
use std::{sync::Arc, time::Duration};

use anyhow::Result;
use common::{COMPLETE_MESSAGE, IDLE_PROMPT};
use image::RgbImage;
use thiserror::Error;

use crate::{
    meter::RunMeter,
    nn::Detector,
    render::Annotator,
    upload::UploadedVideo,
    video::VideoDecoder,
};

/// Output slot showing the most recent annotated frame.
pub trait DisplaySink {
    /// Replace the displayed image with `frame`.
    fn show_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Show a text message to the user.
    fn show_message(&mut self, message: &str) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("detector returned no results for frame {0}")]
    EmptyDetection(u64),
    #[error("display sink is closed")]
    SinkClosed,
}

/// Counts of a finished run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunReport {
    /// Frames decoded and passed to the detector.
    pub frames: u64,
    /// Images sent to the display sink.
    pub updates: u64,
    /// Wall time from opening the video to the completion message.
    pub elapsed: Duration,
}

impl RunReport {
    /// Average frames per second over the whole run.
    pub fn frames_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

pub struct Pipeline {
    detector: Arc<dyn Detector>,
    decoder: Arc<dyn VideoDecoder>,
    annotator: Annotator,
}

impl Pipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        decoder: Arc<dyn VideoDecoder>,
        annotator: Annotator,
    ) -> Self {
        Self {
            detector,
            decoder,
            annotator,
        }
    }

    /// Annotate `video` frame by frame into `sink`.
    ///
    /// Without a video only the idle prompt is shown. The video's temporary file is released
    /// when this returns, whether the run succeeded or not.
    pub fn run(
        &self,
        video: Option<UploadedVideo>,
        sink: &mut dyn DisplaySink,
    ) -> Result<RunReport> {
        let Some(video) = video else {
            sink.show_message(IDLE_PROMPT)?;
            return Ok(RunReport::default());
        };

        log::info!(
            "Annotating {} ({} bytes, {})",
            video.path().display(),
            video.size(),
            video.format()
        );
        let label = video
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut meter = RunMeter::start(label);
        let mut source = self.decoder.open(video.path())?;
        let mut report = RunReport::default();

        while let Some(frame) = source.next_frame()? {
            log::debug!("Frame {} at {:?}", frame.index, frame.timestamp);

            let results = self.detector.detect(&frame.image)?;
            if results.is_empty() {
                return Err(PipelineError::EmptyDetection(frame.index).into());
            }

            for result in results.iter() {
                let annotated = result.render(&frame.image, &self.annotator);
                sink.show_frame(&annotated)?;
            }
            meter.tick(results.len() as u64);
            report.updates += results.len() as u64;
            report.frames += 1;
        }

        sink.show_message(COMPLETE_MESSAGE)?;
        report.elapsed = meter.elapsed();
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        nn::{Detection, DetectionResult},
        video::{sample_timestamp, Frame, FrameSource},
    };
    use anyhow::bail;
    use image::Rgb;
    use std::{
        path::{Path, PathBuf},
        sync::Mutex,
    };

    /// Frames whose red channel carries the frame index.
    struct CountingSource {
        total: u64,
        next: u64,
    }

    impl FrameSource for CountingSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if self.next == self.total {
                return Ok(None);
            }
            let index = self.next;
            self.next += 1;
            Ok(Some(Frame {
                index,
                timestamp: sample_timestamp(index, 24),
                image: RgbImage::from_pixel(4, 4, Rgb([index as u8, 0, 0])),
            }))
        }
    }

    struct CountingDecoder {
        frames: u64,
        opened: Mutex<Vec<PathBuf>>,
    }

    impl CountingDecoder {
        fn new(frames: u64) -> Self {
            Self {
                frames,
                opened: Mutex::new(vec![]),
            }
        }
    }

    impl VideoDecoder for CountingDecoder {
        fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
            assert!(path.exists(), "decoder must see the uploaded file");
            self.opened.lock().unwrap().push(path.to_owned());
            Ok(Box::new(CountingSource {
                total: self.frames,
                next: 0,
            }))
        }
    }

    /// Returns `per_frame` results, each with a single full-frame box.
    struct FixedDetector {
        per_frame: usize,
        fail_at: Option<u8>,
    }

    impl Detector for FixedDetector {
        fn detect(&self, frame: &RgbImage) -> Result<Vec<DetectionResult>> {
            if Some(frame[(0, 0)][0]) == self.fail_at {
                bail!("inference failed");
            }
            Ok((0..self.per_frame)
                .map(|class_id| {
                    let bbox = [1.0, 1.0, 3.0, 3.0];
                    DetectionResult::new(vec![Detection::new(bbox, class_id, 0.9)])
                })
                .collect())
        }
    }

    #[derive(Debug, PartialEq)]
    enum Shown {
        Frame(u8),
        Message(String),
    }

    #[derive(Default)]
    struct RecordingSink {
        shown: Vec<Shown>,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<u8> {
            self.shown
                .iter()
                .filter_map(|shown| match shown {
                    Shown::Frame(index) => Some(*index),
                    Shown::Message(_) => None,
                })
                .collect()
        }
    }

    impl DisplaySink for RecordingSink {
        fn show_frame(&mut self, frame: &RgbImage) -> Result<()> {
            self.shown.push(Shown::Frame(frame[(0, 0)][0]));
            Ok(())
        }

        fn show_message(&mut self, message: &str) -> Result<()> {
            self.shown.push(Shown::Message(message.to_owned()));
            Ok(())
        }
    }

    fn pipeline(
        decoder: Arc<CountingDecoder>,
        per_frame: usize,
        fail_at: Option<u8>,
    ) -> Pipeline {
        Pipeline::new(
            Arc::new(FixedDetector { per_frame, fail_at }),
            decoder,
            Annotator::boxes_only(),
        )
    }

    fn uploaded(dir: &Path) -> Result<UploadedVideo> {
        let mut content: &[u8] = b"not really a video";
        UploadedVideo::copy_from(dir, "mp4", &mut content)
    }

    #[test]
    fn test_no_video_shows_idle_prompt() -> Result<()> {
        let decoder = Arc::new(CountingDecoder::new(48));
        let mut sink = RecordingSink::default();

        let report = pipeline(decoder.clone(), 1, None).run(None, &mut sink)?;

        assert_eq!(report, RunReport::default());
        assert_eq!(sink.shown, vec![Shown::Message(IDLE_PROMPT.into())]);
        assert!(decoder.opened.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn test_one_update_per_frame_then_completion() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let decoder = Arc::new(CountingDecoder::new(48));
        let mut sink = RecordingSink::default();

        let report = pipeline(decoder, 1, None).run(Some(uploaded(dir.path())?), &mut sink)?;

        assert_eq!((report.frames, report.updates), (48, 48));
        assert_eq!(sink.frames(), (0..48).collect::<Vec<u8>>());
        assert_eq!(
            sink.shown.last(),
            Some(&Shown::Message(COMPLETE_MESSAGE.into()))
        );
        let messages = sink.shown.len() - sink.frames().len();
        assert_eq!(messages, 1);
        Ok(())
    }

    #[test]
    fn test_multiple_results_give_multiple_updates_per_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let decoder = Arc::new(CountingDecoder::new(2));
        let mut sink = RecordingSink::default();

        let report = pipeline(decoder, 3, None).run(Some(uploaded(dir.path())?), &mut sink)?;

        assert_eq!((report.frames, report.updates), (2, 6));
        assert_eq!(sink.frames(), vec![0, 0, 0, 1, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_empty_result_sequence_is_a_fault() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let decoder = Arc::new(CountingDecoder::new(5));
        let mut sink = RecordingSink::default();

        let err = pipeline(decoder, 0, None)
            .run(Some(uploaded(dir.path())?), &mut sink)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::EmptyDetection(0))
        ));
        assert!(sink.shown.is_empty());
        Ok(())
    }

    #[test]
    fn test_temp_file_is_released_after_success_and_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let decoder = Arc::new(CountingDecoder::new(10));

        let mut sink = RecordingSink::default();
        pipeline(decoder.clone(), 1, None).run(Some(uploaded(dir.path())?), &mut sink)?;

        let mut sink = RecordingSink::default();
        let failed =
            pipeline(decoder.clone(), 1, Some(3)).run(Some(uploaded(dir.path())?), &mut sink);

        assert!(failed.is_err());
        assert_eq!(sink.frames(), vec![0, 1, 2]);
        for path in decoder.opened.lock().unwrap().iter() {
            assert!(!path.exists());
        }
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }
}
