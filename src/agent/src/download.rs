// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The peer-to-peer file download protocol.
//!
//! Peers expose tablet snapshots over HTTP: a `GET` of
//! `/api/_tablet/_download` with a trailing slash on the `file` parameter
//! returns a newline-separated directory listing, without one it streams the
//! file. Length probes use the same URL.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use slate_agent_types::AgentError;

const HTTP_REQUEST_PREFIX: &str = "/api/_tablet/_download?";
const HTTP_REQUEST_TOKEN_PARAM: &str = "&token=";
const HTTP_REQUEST_FILE_PARAM: &str = "&file=";

/// Builds the download URL for `file` on the peer at `host:http_port`.
pub fn tablet_download_url(host: &str, http_port: u16, token: &str, file: &str) -> String {
    format!(
        "http://{host}:{http_port}{HTTP_REQUEST_PREFIX}\
         {HTTP_REQUEST_TOKEN_PARAM}{token}{HTTP_REQUEST_FILE_PARAM}{file}"
    )
}

/// Transport for the download protocol. The clone copier owns all retry and
/// verification logic; implementations perform exactly one attempt.
#[async_trait]
pub trait FileDownloader: Send + Sync {
    /// Fetches a directory listing. The returned string is newline-separated
    /// file names.
    async fn list_remote_dir(&self, url: &str, timeout: Duration) -> Result<String, AgentError>;

    /// Probes the byte length of a remote file.
    async fn get_length(&self, url: &str, timeout: Duration) -> Result<u64, AgentError>;

    /// Streams a remote file to `local_path`, truncating any existing file.
    async fn download_file(
        &self,
        url: &str,
        local_path: &Path,
        timeout: Duration,
    ) -> Result<(), AgentError>;
}

/// The production [`FileDownloader`], backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Self {
        HttpDownloader::default()
    }
}

fn transport_err(context: &str, url: &str, e: impl std::fmt::Display) -> AgentError {
    AgentError::FileDownloadFailed(format!("{context} failed for {url}: {e}"))
}

#[async_trait]
impl FileDownloader for HttpDownloader {
    async fn list_remote_dir(&self, url: &str, timeout: Duration) -> Result<String, AgentError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport_err("list", url, e))?;
        response.text().await.map_err(|e| transport_err("list", url, e))
    }

    async fn get_length(&self, url: &str, timeout: Duration) -> Result<u64, AgentError> {
        let response = self
            .client
            .head(url)
            .timeout(timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport_err("length probe", url, e))?;
        response
            .content_length()
            .ok_or_else(|| transport_err("length probe", url, "no content length"))
    }

    async fn download_file(
        &self,
        url: &str,
        local_path: &Path,
        timeout: Duration,
    ) -> Result<(), AgentError> {
        let mut response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport_err("download", url, e))?;
        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| transport_err("download", url, e))?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| transport_err("download", url, e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| transport_err("download", url, e))?;
        }
        file.flush().await.map_err(|e| transport_err("download", url, e))?;
        Ok(())
    }
}
