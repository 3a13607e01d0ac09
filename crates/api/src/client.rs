//! HTTP client for the release API and for jar downloads.

use std::time::Duration;

use reqwest::{Client, Response, Url, header};
use tracing::debug;

use crate::error::ProvisionError;
use crate::release::GitHubRelease;

/// Hostnames allowed to use plain HTTP.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];

const GITHUB_ACCEPT: &str = "application/vnd.github+json";

/// Thin wrapper around a configured `reqwest::Client`.
///
/// One instance is built per provisioner and reused for every metadata
/// lookup and download it performs.
#[derive(Debug, Clone)]
pub struct ReleaseClient {
    base_url: String,
    http: Client,
    metadata_timeout: Duration,
}

impl ReleaseClient {
    /// Builds a client for `base_url` with a User-Agent and timeout.
    ///
    /// `timeout` bounds connecting and every idle gap between reads; a
    /// download that keeps receiving bytes is never cut off. Metadata
    /// requests additionally get `timeout` as a total deadline.
    /// GitHub rejects requests without a User-Agent, so one is always sent.
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> Result<Self, ProvisionError> {
        validate_base_url(base_url)?;

        let http = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(ProvisionError::Client)?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            metadata_timeout: timeout,
        })
    }

    /// Fetches the latest release of `repository` (`owner/repo`).
    pub async fn latest_release(&self, repository: &str) -> Result<GitHubRelease, ProvisionError> {
        let url = format!("{}/repos/{}/releases/latest", self.base_url, repository);
        debug!(%url, "fetching release metadata");

        let response = self
            .http
            .get(&url)
            .header(header::ACCEPT, GITHUB_ACCEPT)
            .timeout(self.metadata_timeout)
            .send()
            .await
            .map_err(|source| ProvisionError::Network { url: url.clone(), source })?;
        let response = ensure_success(response, &url)?;
        response
            .json::<GitHubRelease>()
            .await
            .map_err(|source| ProvisionError::Network { url, source })
    }

    /// Starts a download and returns the response once headers are received.
    pub async fn download(&self, url: &str) -> Result<Response, ProvisionError> {
        debug!(%url, "starting download");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| ProvisionError::Network {
                url: url.to_string(),
                source,
            })?;
        ensure_success(response, url)
    }
}

fn ensure_success(response: Response, url: &str) -> Result<Response, ProvisionError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ProvisionError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Validate that a base URL is acceptable for release lookups.
///
/// Rules:
/// - `localhost` or `127.0.0.1`: any scheme is allowed
/// - otherwise: scheme must be HTTPS
fn validate_base_url(base: &str) -> Result<(), ProvisionError> {
    let invalid = |reason: String| ProvisionError::InvalidBaseUrl {
        url: base.to_string(),
        reason,
    };
    let parsed = Url::parse(base).map_err(|error| invalid(error.to_string()))?;
    let host = parsed.host_str().ok_or_else(|| invalid("missing host".to_string()))?;

    if LOCALHOST_DOMAINS.iter().any(|allowed| host.eq_ignore_ascii_case(allowed)) {
        return Ok(());
    }
    if parsed.scheme() != "https" {
        return Err(invalid(format!("must use https for non-localhost hosts; got '{}://'", parsed.scheme())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_https_and_local_http() {
        assert!(validate_base_url("https://api.github.com").is_ok());
        assert!(validate_base_url("http://127.0.0.1:8080").is_ok());
        assert!(validate_base_url("http://localhost").is_ok());
    }

    #[test]
    fn rejects_remote_http_and_garbage() {
        assert!(matches!(
            validate_base_url("http://api.github.com"),
            Err(ProvisionError::InvalidBaseUrl { .. })
        ));
        assert!(validate_base_url("not a url").is_err());
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = ReleaseClient::new("https://api.github.com/", "apkflow-test", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "https://api.github.com");
    }
}
