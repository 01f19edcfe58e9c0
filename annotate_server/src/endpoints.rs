//! Endpoints of HTTP server.
//!
use std::{convert::Infallible, path::PathBuf, sync::Arc};

use axum::{
    body::StreamBody,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Query},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use common::{accepted_extension, protocol::JobStatus, IDLE_PROMPT};
use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    jobs::JobBoard,
    page::INDEX_HTML,
    pipeline::{Pipeline, PipelineError},
    sink::{MjpegSink, MJPEG_CONTENT_TYPE},
    upload::UploadedVideo,
};

/// Name of the multipart field carrying the video.
pub const VIDEO_FIELD: &str = "video";

/// Where and how large uploads may be stored.
#[derive(Clone, Debug)]
pub struct UploadSettings {
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
}

/// Search parameters available to streams.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{}", IDLE_PROMPT)]
    MissingVideo,
    #[error("unsupported video format {0:?}, accepted formats are mp4, mov, avi and mkv")]
    UnsupportedFormat(String),
    #[error("no upload named {0:?}. {}", IDLE_PROMPT)]
    UnknownUpload(String),
    #[error("invalid upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::MissingVideo => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::UnknownUpload(_) => StatusCode::NOT_FOUND,
            ApiError::Multipart(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(ref err) => {
                log::error!("Request failed: {:#}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// Build the router with all endpoints.
pub fn app(pipeline: Arc<Pipeline>, jobs: Arc<JobBoard>, settings: UploadSettings) -> Router {
    let body_limit = settings.max_upload_bytes;
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/upload", post(upload))
        .route("/stream", get(annotated_stream))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(pipeline))
        .layer(Extension(jobs))
        .layer(Extension(Arc::new(settings)))
}

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Receive a video and keep it until its stream is requested.
pub async fn upload(
    Extension(jobs): Extension<Arc<JobBoard>>,
    Extension(settings): Extension<Arc<UploadSettings>>,
    mut multipart: Multipart,
) -> Result<Json<JobStatus>, ApiError> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some(VIDEO_FIELD) {
            continue;
        }
        // Browsers send the field with an empty file name when nothing was chosen
        let filename = match field.file_name() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => return Err(ApiError::MissingVideo),
        };
        let format = accepted_extension(&filename)
            .ok_or_else(|| ApiError::UnsupportedFormat(filename.clone()))?;

        let mut video = UploadedVideo::create_in(&settings.upload_dir, format)?;
        let mut writer = video.async_writer()?;
        while let Some(chunk) = field.chunk().await? {
            writer.write_chunk(&chunk).await?;
        }
        writer.finish().await?;
        if video.is_empty() {
            return Err(ApiError::MissingVideo);
        }

        log::info!("Received {} ({} bytes)", &filename, video.size());
        return Ok(Json(jobs.register(video, &filename)));
    }

    Err(ApiError::MissingVideo)
}

/// Annotate a pending upload and stream the frames as they are produced.
pub async fn annotated_stream(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Extension(jobs): Extension<Arc<JobBoard>>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, ApiError> {
    let id = params.name.unwrap_or_default();
    let video = jobs
        .claim(&id)
        .ok_or_else(|| ApiError::UnknownUpload(id.clone()))?;
    log::info!("Stream for {} requested", &id);

    let (tx, rx) = mpsc::channel(1);
    tokio::task::spawn_blocking(move || {
        let mut sink = MjpegSink::new(tx, Arc::clone(&jobs), id.clone());
        match pipeline.run(Some(video), &mut sink) {
            Ok(report) => {
                log::info!(
                    "[{}] Done: {} frames, {} updates in {:.1?} ({:.2} frames/s)",
                    &id,
                    report.frames,
                    report.updates,
                    report.elapsed,
                    report.frames_per_second()
                );
                jobs.complete(&id);
            }
            Err(err) => match err.downcast_ref::<PipelineError>() {
                Some(PipelineError::SinkClosed) => {
                    log::warn!("[{}] Client went away, stopping", &id);
                    jobs.fail(&id, "stream closed by client");
                }
                _ => {
                    log::error!("[{}] Annotation failed: {:#}", &id, err);
                    jobs.fail(&id, &format!("{:#}", err));
                }
            },
        }
    });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let headers = [(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)];

    Ok((headers, body))
}

/// Progress of an upload.
pub async fn status(
    Extension(jobs): Extension<Arc<JobBoard>>,
    Query(params): Query<StreamParams>,
) -> Result<Json<JobStatus>, ApiError> {
    let id = params.name.unwrap_or_default();
    jobs.status(&id)
        .map(Json)
        .ok_or(ApiError::UnknownUpload(id))
}
