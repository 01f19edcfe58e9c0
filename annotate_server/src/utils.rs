//! Utility functions
//!
use std::{hash::Hash, hash::Hasher, path::Path};

use anyhow::Result;
use futures::StreamExt;
use reqwest::Client;
use tokio::{fs::File, io::AsyncWriteExt};

/// Download a file from a URL to a given filepath.
///
/// The body is streamed to disk chunk by chunk. Non-success status codes are errors.
pub async fn download_file(
    client: &Client,
    url: &str,
    filepath: impl AsRef<Path>,
) -> Result<u64> {
    let resp = client.get(url).send().await?.error_for_status()?;

    let mut file = File::create(filepath).await?;
    let mut written = 0;
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(written)
}

/// Hash any hashable value with the standard library's default hasher.
pub fn hashed<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod test {
    use super::hashed;

    #[test]
    fn test_hashed_is_deterministic() {
        assert_eq!(hashed("clip.mp4"), hashed("clip.mp4"));
        assert_ne!(hashed("clip.mp4"), hashed("clip.mov"));
    }
}
