//! Annotate uploaded videos with object detections and stream the frames to the browser.

pub mod cli;
pub mod endpoints;
pub mod jobs;
pub mod labels;
pub mod meter;
pub mod nn;
pub mod page;
pub mod pipeline;
pub mod render;
pub mod sink;
pub mod upload;
pub mod utils;
pub mod video;
pub mod weights;
