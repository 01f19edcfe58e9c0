//! Making sure the detector weights are present on disk.
//!
//! A missing weights file is downloaded exactly once. Concurrent cold starts are serialized by a
//! `<weights>.lock` file created with create-new semantics; the holder downloads into
//! `<weights>.part` and atomically renames it into place, everybody else waits for the file.
//! A lock whose download stopped making progress is taken over.
use std::{
    ffi::OsString,
    fs::OpenOptions,
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};

use anyhow::{bail, Context, Result};
use reqwest::Client;

use crate::utils::download_file;

/// How long to wait for another process to finish downloading.
const WAIT_TIMEOUT: Duration = Duration::from_secs(600);
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// A lock with no download progress for this long belongs to a dead process.
const STALE_LOCK_AGE: Duration = Duration::from_secs(120);

/// Where the weights came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WeightsOrigin {
    /// The file was already on disk.
    Present,
    /// This process downloaded it.
    Downloaded,
    /// Another process downloaded it while this one waited.
    DownloadedElsewhere,
}

/// Fetches a remote file.
pub trait Fetch {
    /// Download `url` into `dest`, creating or truncating it.
    fn fetch(&self, url: &str, dest: &Path) -> impl Future<Output = Result<()>> + Send;
}

/// Fetcher using HTTP(S).
#[derive(Clone, Debug, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let written = download_file(&self.client, url, dest).await?;
        log::info!("Downloaded {} bytes from {}", written, url);
        Ok(())
    }
}

/// Removes the lock file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to remove lock {}: {}", self.path.display(), err);
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Make sure the weights file at `path` exists, downloading it from `url` if absent.
pub async fn ensure_weights<F: Fetch>(
    path: &Path,
    url: Option<&str>,
    fetcher: &F,
) -> Result<WeightsOrigin> {
    if path.exists() {
        log::debug!("Weights found at {}", path.display());
        return Ok(WeightsOrigin::Present);
    }
    let Some(url) = url else {
        bail!(
            "weights file {} is missing and no download URL is configured",
            path.display()
        );
    };

    let lock_path = with_suffix(path, ".lock");
    let part_path = with_suffix(path, ".part");
    let lock = loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => {
                break LockGuard {
                    path: lock_path.clone(),
                }
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if is_stale(&lock_path, &part_path, STALE_LOCK_AGE) {
                    remove_stale_lock(&lock_path, &part_path)?;
                    continue;
                }
                log::info!(
                    "Weights download already in progress ({} exists), waiting",
                    lock_path.display()
                );
                match wait_for_download(path, &lock_path, &part_path).await? {
                    Waited::Done => return Ok(WeightsOrigin::DownloadedElsewhere),
                    Waited::Stale => {
                        remove_stale_lock(&lock_path, &part_path)?;
                        continue;
                    }
                }
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create {}", lock_path.display()))
            }
        }
    };

    // The previous holder may have finished between our check and taking the lock
    if path.exists() {
        return Ok(WeightsOrigin::DownloadedElsewhere);
    }

    log::info!("Downloading weights from {} to {}", url, path.display());
    let downloaded = match fetcher.fetch(url, &part_path).await {
        Ok(()) => std::fs::rename(&part_path, path)
            .with_context(|| format!("failed to move weights to {}", path.display())),
        Err(err) => Err(err.context(format!("failed to download weights from {}", url))),
    };
    if downloaded.is_err() {
        std::fs::remove_file(&part_path).ok();
    }
    drop(lock);

    downloaded.map(|_| WeightsOrigin::Downloaded)
}

/// Time since `path` was last modified, `None` if it does not exist.
fn modified_ago(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

/// A lock is stale when neither it nor the partial download changed for `max_age`.
///
/// A live download keeps appending to `<weights>.part`, which keeps its mtime fresh.
fn is_stale(lock_path: &Path, part_path: &Path, max_age: Duration) -> bool {
    let Some(lock_age) = modified_ago(lock_path) else {
        return false;
    };
    let part_age = modified_ago(part_path).unwrap_or(lock_age);

    lock_age.min(part_age) > max_age
}

fn remove_stale_lock(lock_path: &Path, part_path: &Path) -> Result<()> {
    log::warn!(
        "Removing stale lock {} left by an interrupted download",
        lock_path.display()
    );
    for stale in [lock_path, part_path] {
        match std::fs::remove_file(stale) {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                return Err(err).with_context(|| format!("failed to remove {}", stale.display()))
            }
            _ => {}
        }
    }

    Ok(())
}

enum Waited {
    /// The weights file appeared.
    Done,
    /// The download holding the lock stopped making progress.
    Stale,
}

async fn wait_for_download(path: &Path, lock_path: &Path, part_path: &Path) -> Result<Waited> {
    let start = Instant::now();
    loop {
        if path.exists() {
            return Ok(Waited::Done);
        }
        if !lock_path.exists() {
            bail!(
                "concurrent download of {} ended without producing the file",
                path.display()
            );
        }
        if is_stale(lock_path, part_path, STALE_LOCK_AGE) {
            return Ok(Waited::Stale);
        }
        if start.elapsed() > WAIT_TIMEOUT {
            bail!("timed out waiting for {}", path.display());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Fetch for CountingFetcher {
        async fn fetch(&self, _url: &str, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(dest, b"weights")?;
            if self.fail {
                bail!("connection reset");
            }
            Ok(())
        }
    }

    const URL: &str = "https://example.invalid/yolov5xu.onnx";

    #[tokio::test]
    async fn test_present_weights_are_not_downloaded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("yolov5xu.onnx");
        std::fs::write(&path, b"cached")?;
        let fetcher = CountingFetcher::default();

        let origin = ensure_weights(&path, Some(URL), &fetcher).await?;

        assert_eq!(origin, WeightsOrigin::Present);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&path)?, b"cached");
        Ok(())
    }

    #[tokio::test]
    async fn test_absent_weights_are_downloaded_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("yolov5xu.onnx");
        let fetcher = CountingFetcher::default();

        let origin = ensure_weights(&path, Some(URL), &fetcher).await?;
        assert_eq!(origin, WeightsOrigin::Downloaded);
        assert_eq!(std::fs::read(&path)?, b"weights");

        let origin = ensure_weights(&path, Some(URL), &fetcher).await?;
        assert_eq!(origin, WeightsOrigin::Present);

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(!with_suffix(&path, ".lock").exists());
        assert!(!with_suffix(&path, ".part").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_download_leaves_nothing_behind() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("yolov5xu.onnx");
        let fetcher = CountingFetcher {
            fail: true,
            ..Default::default()
        };

        assert!(ensure_weights(&path, Some(URL), &fetcher).await.is_err());

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
        assert!(!with_suffix(&path, ".lock").exists());
        assert!(!with_suffix(&path, ".part").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_weights_without_url_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fetcher = CountingFetcher::default();

        let result = ensure_weights(&dir.path().join("yolov5xu.onnx"), None, &fetcher).await;

        assert!(result.is_err());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_waits_for_concurrent_download() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("yolov5xu.onnx");
        let lock_path = with_suffix(&path, ".lock");
        std::fs::write(&lock_path, b"")?;
        let fetcher = CountingFetcher::default();

        let other = {
            let (path, lock_path) = (path.clone(), lock_path.clone());
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                std::fs::write(&path, b"from elsewhere")?;
                std::fs::remove_file(&lock_path)
            })
        };

        let origin = ensure_weights(&path, Some(URL), &fetcher).await?;
        other.await??;

        assert_eq!(origin, WeightsOrigin::DownloadedElsewhere);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&path)?, b"from elsewhere");
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_concurrent_download_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("yolov5xu.onnx");
        let lock_path = with_suffix(&path, ".lock");
        std::fs::write(&lock_path, b"")?;

        let remover = {
            let lock_path = lock_path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                std::fs::remove_file(&lock_path)
            })
        };

        let result = ensure_weights(&path, Some(URL), &CountingFetcher::default()).await;
        remover.await??;

        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("yolov5xu.onnx");
        let lock_path = with_suffix(&path, ".lock");
        let part_path = with_suffix(&path, ".part");
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        for leftover in [&lock_path, &part_path] {
            let file = std::fs::File::create(leftover)?;
            file.set_modified(an_hour_ago)?;
        }
        let fetcher = CountingFetcher::default();

        let origin = ensure_weights(&path, Some(URL), &fetcher).await?;

        assert_eq!(origin, WeightsOrigin::Downloaded);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&path)?, b"weights");
        assert!(!lock_path.exists());
        assert!(!part_path.exists());
        Ok(())
    }

    #[test]
    fn test_growing_partial_download_keeps_lock_alive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lock_path = dir.path().join("w.onnx.lock");
        let part_path = dir.path().join("w.onnx.part");
        std::fs::File::create(&lock_path)?
            .set_modified(SystemTime::now() - Duration::from_secs(3600))?;

        assert!(is_stale(&lock_path, &part_path, STALE_LOCK_AGE));

        std::fs::write(&part_path, b"first chunk")?;
        assert!(!is_stale(&lock_path, &part_path, STALE_LOCK_AGE));
        assert!(!is_stale(&dir.path().join("none.lock"), &part_path, STALE_LOCK_AGE));
        Ok(())
    }
}
