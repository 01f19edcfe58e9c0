//! Annotate server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use annotate_server::{
    cli::ModelArgs,
    endpoints::{app, UploadSettings},
    jobs::{spawn_sweeper, JobBoard},
};
use clap::Parser;
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve the page and streams on
    #[clap(long, default_value = "127.0.0.1:3000")]
    server_address: String,

    /// Directory for uploaded videos, the system temp directory if omitted
    #[clap(long)]
    upload_dir: Option<PathBuf>,

    /// Largest accepted upload in MiB
    #[clap(long, default_value_t = 200)]
    max_upload_mb: usize,

    /// Seconds an upload waits for its stream before it is discarded
    #[clap(long, default_value_t = 600)]
    pending_ttl_secs: u64,

    /// Seconds the status of a finished run stays available
    #[clap(long, default_value_t = 600)]
    finished_ttl_secs: u64,

    #[clap(flatten)]
    model: ModelArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    // Detector is loaded once and shared by all runs
    let pipeline = Arc::new(args.model.build_pipeline().await?);
    let jobs = Arc::new(JobBoard::with_ttl(
        Duration::from_secs(args.pending_ttl_secs),
        Duration::from_secs(args.finished_ttl_secs),
    ));
    let settings = UploadSettings {
        upload_dir: args.upload_dir.unwrap_or_else(std::env::temp_dir),
        max_upload_bytes: args.max_upload_mb * 1024 * 1024,
    };
    log::info!("Storing uploads in {}", settings.upload_dir.display());

    spawn_sweeper(Arc::clone(&jobs), Duration::from_secs(30));

    // Serve HTTP server
    let app = app(pipeline, jobs, settings);
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
