//! Command line options shared by the binaries.
//!
use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Args;

use crate::{
    nn::YoloModel,
    pipeline::Pipeline,
    render::Annotator,
    video::{FfmpegDecoder, DEFAULT_SAMPLING_RATE},
    weights::{ensure_weights, HttpFetcher},
};

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Path of the ONNX detector weights
    #[clap(long, default_value = "yolov5xu.onnx")]
    pub model_path: PathBuf,

    /// URL to download the weights from when they are missing
    #[clap(long)]
    pub model_url: Option<String>,

    /// Frames sampled per second of video
    #[clap(long, default_value_t = DEFAULT_SAMPLING_RATE)]
    pub sampling_rate: u32,

    /// Minimum class confidence of a detection
    #[clap(long, default_value_t = 0.25)]
    pub min_confidence: f32,

    /// Maximum overlap of two boxes of the same class
    #[clap(long, default_value_t = 0.7)]
    pub max_iou: f32,

    /// TrueType font for box labels, boxes are drawn without labels if omitted
    #[clap(long)]
    pub font_path: Option<PathBuf>,
}

impl ModelArgs {
    /// Fetch the weights if needed and build the pipeline around the loaded model.
    pub async fn build_pipeline(&self) -> Result<Pipeline> {
        let origin = ensure_weights(
            &self.model_path,
            self.model_url.as_deref(),
            &HttpFetcher::default(),
        )
        .await?;
        log::info!("Weights {}: {:?}", self.model_path.display(), origin);

        let model = YoloModel::load(&self.model_path, self.min_confidence, self.max_iou)?;
        let annotator = Annotator::from_config(self.font_path.as_deref())?;

        Ok(Pipeline::new(
            Arc::new(model),
            Arc::new(FfmpegDecoder::new(self.sampling_rate)),
            annotator,
        ))
    }
}
