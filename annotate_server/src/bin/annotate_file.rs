//! Annotate a local video file into a directory of JPEG frames.
//!
use std::{fs::File, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use annotate_server::{cli::ModelArgs, sink::DirectorySink, upload::UploadedVideo};
use clap::Parser;
use common::accepted_extension;
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Video to annotate (mp4, mov, avi or mkv)
    video: PathBuf,

    /// Directory receiving `frame-<n>.jpg` files
    #[clap(long, default_value = "annotated")]
    out_dir: PathBuf,

    #[clap(flatten)]
    model: ModelArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let filename = args.video.to_string_lossy();
    let format = accepted_extension(&filename)
        .ok_or_else(|| anyhow!("{} is not an mp4, mov, avi or mkv file", filename))?;

    let pipeline = args.model.build_pipeline().await?;
    let mut sink = DirectorySink::create(&args.out_dir)?;

    let input_path = args.video.clone();
    let (report, written) = tokio::task::spawn_blocking(move || {
        let mut input = File::open(&input_path)
            .with_context(|| format!("failed to open {}", input_path.display()))?;
        let video = UploadedVideo::copy_from(std::env::temp_dir(), format, &mut input)?;
        let report = pipeline.run(Some(video), &mut sink)?;
        anyhow::Ok((report, sink.written()))
    })
    .await??;

    log::info!(
        "Annotated {} frames into {} images in {} ({:.1?}, {:.2} frames/s)",
        report.frames,
        written,
        args.out_dir.display(),
        report.elapsed,
        report.frames_per_second()
    );

    Ok(())
}
