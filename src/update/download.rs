//! Artifact download
//!
//! The body is streamed straight to disk. A SHA-256 digest is computed on
//! the way through and logged with the install; it is not checked against
//! anything.

use std::path::Path;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::UpdateError;

/// A fully written download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub size_bytes: u64,
    pub sha256: String,
}

/// Download `url` into `dest`, removing any partial file on failure
pub async fn download_to(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<Artifact, UpdateError> {
    info!(url = %url, dest = %dest.display(), "Downloading update");

    match stream_to_file(client, url, dest).await {
        Ok(artifact) => {
            info!(
                size_bytes = artifact.size_bytes,
                sha256 = %artifact.sha256,
                "Download complete"
            );
            Ok(artifact)
        }
        Err(e) => {
            if dest.exists() {
                if let Err(rm) = tokio::fs::remove_file(dest).await {
                    warn!(path = %dest.display(), error = %rm, "Failed to remove partial download");
                }
            }
            Err(e)
        }
    }
}

async fn stream_to_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<Artifact, UpdateError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| UpdateError::Network(e.to_string()))?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(UpdateError::DownloadFailed(format!(
            "HTTP {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| UpdateError::Io(format!("create {}: {}", dest.display(), e)))?;

    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| UpdateError::Network(e.to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| UpdateError::Io(e.to_string()))?;
        hasher.update(&chunk);
        size_bytes += chunk.len() as u64;
    }

    file.flush().await.map_err(|e| UpdateError::Io(e.to_string()))?;
    file.sync_all().await.map_err(|e| UpdateError::Io(e.to_string()))?;

    Ok(Artifact {
        size_bytes,
        sha256: format!("{:x}", hasher.finalize()),
    })
}
