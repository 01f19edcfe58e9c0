//! Status messages exchanged over HTTP.
//!
use serde::{Deserialize, Serialize};

/// Lifecycle of one uploaded video.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Uploaded, waiting for a stream to be opened.
    Pending,
    /// Frames are being decoded, annotated and streamed.
    Running,
    /// All frames were shown.
    Complete,
    /// The run stopped on an error.
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

/// Status of one uploaded video as reported by `/status`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub state: JobState,
    /// Number of annotated frames sent to the display so far.
    pub frames: u64,
    /// Latest message for the user, if any.
    pub message: Option<String>,
}

impl JobStatus {
    pub fn pending(id: String) -> Self {
        Self {
            id,
            state: JobState::Pending,
            frames: 0,
            message: None,
        }
    }
}
