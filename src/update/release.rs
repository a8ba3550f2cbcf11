//! Upstream release index
//!
//! Releases are published as plain binaries named per platform, e.g.
//! `telemetry-agent-linux-amd64`. The release API is only asked for the
//! latest tag; the artifact URL is built from that tag.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::download::{download_to, Artifact};
use super::UpdateError;
use crate::config::UpdateConfig;

const RELEASE_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Where update artifacts come from
#[async_trait::async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Tag of the newest published release, e.g. `v1.3.0`
    async fn latest_tag(&self) -> Result<String, UpdateError>;

    /// Download URL of `artifact` in release `tag`
    fn artifact_url(&self, tag: &str, artifact: &str) -> String;

    /// Stream `url` into `dest`. On error no partial file is left behind.
    async fn download(&self, url: &str, dest: &Path) -> Result<Artifact, UpdateError>;
}

#[derive(Debug, Deserialize)]
struct LatestRelease {
    tag_name: String,
}

/// GitHub-style release hosting
pub struct HttpReleaseSource {
    client: reqwest::Client,
    api_base: String,
    download_base: String,
    owner: String,
    repo: String,
    user_agent: String,
}

impl HttpReleaseSource {
    pub fn new(config: &UpdateConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.release_api_base.trim_end_matches('/').to_string(),
            download_base: config.release_download_base.trim_end_matches('/').to_string(),
            owner: config.release_owner.clone(),
            repo: config.release_repo.clone(),
            user_agent: config.user_agent.clone(),
        }
    }

    fn latest_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_base, self.owner, self.repo
        )
    }
}

#[async_trait::async_trait]
impl ReleaseSource for HttpReleaseSource {
    async fn latest_tag(&self) -> Result<String, UpdateError> {
        let url = self.latest_url();
        debug!(url = %url, "Querying latest release");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(RELEASE_QUERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| UpdateError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "Release query returned {}",
                response.status()
            )));
        }

        let release: LatestRelease = response
            .json()
            .await
            .map_err(|e| UpdateError::InvalidRelease(e.to_string()))?;

        Ok(release.tag_name)
    }

    fn artifact_url(&self, tag: &str, artifact: &str) -> String {
        format!(
            "{}/{}/{}/releases/download/{}/{}",
            self.download_base, self.owner, self.repo, tag, artifact
        )
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<Artifact, UpdateError> {
        download_to(&self.client, url, dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let config = UpdateConfig {
            release_api_base: "https://api.example.com/".to_string(),
            release_download_base: "https://dl.example.com".to_string(),
            release_owner: "acme".to_string(),
            release_repo: "agent".to_string(),
            ..UpdateConfig::default()
        };
        let source = HttpReleaseSource::new(&config);

        assert_eq!(
            source.latest_url(),
            "https://api.example.com/repos/acme/agent/releases/latest"
        );
        assert_eq!(
            source.artifact_url("v1.3.0", "telemetry-agent-linux-amd64"),
            "https://dl.example.com/acme/agent/releases/download/v1.3.0/telemetry-agent-linux-amd64"
        );
    }
}
