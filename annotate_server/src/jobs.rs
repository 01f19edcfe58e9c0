//! Registry of uploaded videos and the status of their runs.
//!
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant, SystemTime},
};

use common::protocol::{JobState, JobStatus};
use tokio::{task::JoinHandle, time::interval};

use crate::{upload::UploadedVideo, utils::hashed};

/// How long an upload waits for its stream before it is discarded.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(600);
/// How long the status of a finished run stays available.
pub const DEFAULT_FINISHED_TTL: Duration = Duration::from_secs(600);

struct Job {
    status: JobStatus,
    /// Present until a stream claims the upload.
    upload: Option<UploadedVideo>,
    registered: Instant,
    finished: Option<Instant>,
}

impl Job {
    fn expired(&self, now: Instant, pending_ttl: Duration, finished_ttl: Duration) -> bool {
        if self.upload.is_some() {
            return now.saturating_duration_since(self.registered) > pending_ttl;
        }
        match self.finished {
            Some(at) if self.status.state.is_finished() => {
                now.saturating_duration_since(at) > finished_ttl
            }
            _ => false,
        }
    }
}

/// Uploads waiting for their stream, and status of all runs.
///
/// Unclaimed uploads and finished runs expire. Dropping an expired upload removes its file.
pub struct JobBoard {
    counter: AtomicU64,
    jobs: Mutex<HashMap<String, Job>>,
    pending_ttl: Duration,
    finished_ttl: Duration,
}

impl Default for JobBoard {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_PENDING_TTL, DEFAULT_FINISHED_TTL)
    }
}

impl JobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(pending_ttl: Duration, finished_ttl: Duration) -> Self {
        Self {
            counter: AtomicU64::new(0),
            jobs: Mutex::new(HashMap::new()),
            pending_ttl,
            finished_ttl,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self, filename: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        format!("{:016x}", hashed(&(n, filename, nanos)))
    }

    /// Register a new upload and return its pending status.
    pub fn register(&self, upload: UploadedVideo, filename: &str) -> JobStatus {
        self.evict_expired();
        let mut jobs = self.jobs();
        let mut id = self.next_id(filename);
        while jobs.contains_key(&id) {
            id = self.next_id(filename);
        }

        let status = JobStatus::pending(id.clone());
        jobs.insert(
            id,
            Job {
                status: status.clone(),
                upload: Some(upload),
                registered: Instant::now(),
                finished: None,
            },
        );

        status
    }

    /// Take the upload of a pending job and mark the job as running.
    ///
    /// Returns `None` for unknown ids and for jobs that were already claimed.
    pub fn claim(&self, id: &str) -> Option<UploadedVideo> {
        let mut jobs = self.jobs();
        let job = jobs.get_mut(id)?;
        let upload = job.upload.take()?;
        job.status.state = JobState::Running;

        Some(upload)
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.jobs().get(id).map(|job| job.status.clone())
    }

    /// Count one more frame sent to the display.
    pub fn record_frame(&self, id: &str) {
        if let Some(job) = self.jobs().get_mut(id) {
            job.status.frames += 1;
        }
    }

    pub fn set_message(&self, id: &str, message: &str) {
        if let Some(job) = self.jobs().get_mut(id) {
            job.status.message = Some(message.to_owned());
        }
    }

    pub fn complete(&self, id: &str) {
        self.finish(id, JobState::Complete, None);
    }

    pub fn fail(&self, id: &str, reason: &str) {
        self.finish(id, JobState::Failed, Some(reason));
    }

    fn finish(&self, id: &str, state: JobState, message: Option<&str>) {
        if let Some(job) = self.jobs().get_mut(id) {
            job.status.state = state;
            job.finished = Some(Instant::now());
            if let Some(message) = message {
                job.status.message = Some(message.to_owned());
            }
        }
    }

    /// Drop unclaimed uploads and finished runs past their time to live.
    ///
    /// Returns the number of jobs removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Job> = {
            let mut jobs = self.jobs();
            let ids: Vec<String> = jobs
                .iter()
                .filter(|(_, job)| job.expired(now, self.pending_ttl, self.finished_ttl))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| jobs.remove(id)).collect()
        };

        for job in expired.iter() {
            if job.upload.is_some() {
                log::info!("Discarding upload {}, its stream never started", job.status.id);
            }
        }
        // Dropping the expired jobs removes their files, outside the lock
        expired.len()
    }

    /// Number of uploads not yet claimed by a stream.
    pub fn pending(&self) -> usize {
        self.jobs()
            .values()
            .filter(|job| job.upload.is_some())
            .count()
    }
}

/// Evict expired jobs every `period`, so idle servers release stale uploads too.
pub fn spawn_sweeper(jobs: Arc<JobBoard>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep_interval = interval(period);
        loop {
            sweep_interval.tick().await;
            let evicted = jobs.evict_expired();
            if evicted > 0 {
                log::debug!("Evicted {} expired jobs", evicted);
            }
        }
    })
}
