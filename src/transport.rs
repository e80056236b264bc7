//! Client side of the peer surface
//!
//! `PeerTransport` is the seam between the replication/reconciliation logic
//! and the network. `HttpTransport` speaks the HTTP surface served by
//! [`crate::http::HttpServer`]; tests plug in an in-process implementation.

use crate::config::Config;
use crate::error::StorageError;
use crate::record::{DayStat, FileRecord, NodeStatus};
use async_trait::async_trait;
use reqwest::{multipart, Body, Client, Response, StatusCode};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Ask `peer` for the record under `key` (content hash or path alias).
    /// None when the peer has no live record.
    async fn check_file_exist(
        &self,
        peer: &str,
        key: &str,
    ) -> Result<Option<FileRecord>, StorageError>;

    /// Send the bytes at `local` together with `record`. Returns the
    /// download URL reported by the peer.
    async fn push_file(
        &self,
        peer: &str,
        record: &FileRecord,
        local: &Path,
    ) -> Result<String, StorageError>;

    /// Send only the record; the peer pulls the bytes itself
    async fn push_reference(&self, peer: &str, record: &FileRecord)
        -> Result<String, StorageError>;

    /// Fetch the bytes of `record` from `peer` into `dest`. Returns bytes written.
    async fn download(
        &self,
        peer: &str,
        record: &FileRecord,
        dest: &Path,
    ) -> Result<u64, StorageError>;

    /// Per-day counters of `peer`
    async fn day_stats(&self, peer: &str) -> Result<Vec<DayStat>, StorageError>;

    /// Committed hashes of `peer` for `date`
    async fn hash_set(&self, peer: &str, date: &str) -> Result<HashSet<String>, StorageError>;

    /// Tell `peer` which hashes it lacks; `origin` is the node holding them
    async fn notify_missing(
        &self,
        peer: &str,
        origin: &str,
        hashes: &[String],
    ) -> Result<(), StorageError>;

    /// Health blob of `peer`
    async fn status(&self, peer: &str) -> Result<NodeStatus, StorageError>;
}

/// Reqwest implementation of [`PeerTransport`]
pub struct HttpTransport {
    client: Client,
    group: String,
    control_timeout: Duration,
    transfer_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        let client = Client::builder()
            .connect_timeout(config.control_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            group: config.group.clone(),
            control_timeout: config.control_timeout(),
            transfer_timeout: config.transfer_timeout(),
        })
    }

    fn endpoint(&self, peer: &str, path: &str) -> Result<Url, StorageError> {
        let base = Url::parse(peer).map_err(|e| StorageError::transfer(peer, e))?;
        base.join(path).map_err(|e| StorageError::transfer(peer, e))
    }

    /// Turn a non-success response into a transfer error
    async fn check(peer: &str, response: Response) -> Result<Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::transfer(peer, format!("{}: {}", status, body.trim())))
    }

    async fn post_form(
        &self,
        peer: &str,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<Response, StorageError> {
        let response = self
            .client
            .post(self.endpoint(peer, path)?)
            .timeout(self.control_timeout)
            .form(form)
            .send()
            .await
            .map_err(|e| StorageError::transfer(peer, e))?;
        Self::check(peer, response).await
    }

    async fn get(&self, peer: &str, path: &str) -> Result<Response, StorageError> {
        let response = self
            .client
            .get(self.endpoint(peer, path)?)
            .timeout(self.control_timeout)
            .send()
            .await
            .map_err(|e| StorageError::transfer(peer, e))?;
        Self::check(peer, response).await
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn check_file_exist(
        &self,
        peer: &str,
        key: &str,
    ) -> Result<Option<FileRecord>, StorageError> {
        let response = self.post_form(peer, "/check_file_exist", &[("md5", key)]).await?;
        let record: FileRecord = response
            .json()
            .await
            .map_err(|e| StorageError::transfer(peer, e))?;
        Ok((!record.is_empty()).then_some(record))
    }

    async fn push_file(
        &self,
        peer: &str,
        record: &FileRecord,
        local: &Path,
    ) -> Result<String, StorageError> {
        let file = fs::File::open(local).await?;
        let part = multipart::Part::stream_with_length(Body::from(file), record.size)
            .file_name(record.stored_name().to_string());
        let form = multipart::Form::new()
            .text("md5", record.hash.clone())
            .text("name", record.name.clone())
            .text("rename", record.rename.clone())
            .text("path", record.path.clone())
            .text("scene", record.scene.clone())
            .text("size", record.size.to_string())
            .text("timestamp", record.timestamp.to_string())
            .text("peers", record.peers.join(","))
            .part("file", part);

        let response = self
            .client
            .post(self.endpoint(peer, "/syncfile")?)
            .timeout(self.transfer_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| StorageError::transfer(peer, e))?;
        let url = Self::check(peer, response)
            .await?
            .text()
            .await
            .map_err(|e| StorageError::transfer(peer, e))?;
        debug!(peer = %peer, hash = %record.hash, "Pushed file");
        Ok(url)
    }

    async fn push_reference(
        &self,
        peer: &str,
        record: &FileRecord,
    ) -> Result<String, StorageError> {
        let info = serde_json::to_string(record)?;
        let response = self
            .post_form(peer, "/syncfile_info", &[("fileInfo", info.as_str())])
            .await?;
        response.text().await.map_err(|e| StorageError::transfer(peer, e))
    }

    async fn download(
        &self,
        peer: &str,
        record: &FileRecord,
        dest: &Path,
    ) -> Result<u64, StorageError> {
        let url = self.endpoint(peer, &record.download_path(&self.group))?;
        let response = self
            .client
            .get(url)
            .query(&[("download", "0")])
            .timeout(self.transfer_timeout)
            .send()
            .await
            .map_err(|e| StorageError::transfer(peer, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(record.full_path()));
        }
        let mut response = Self::check(peer, response).await?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| StorageError::transfer(peer, e))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn day_stats(&self, peer: &str) -> Result<Vec<DayStat>, StorageError> {
        self.get(peer, "/stat")
            .await?
            .json()
            .await
            .map_err(|e| StorageError::transfer(peer, e))
    }

    async fn hash_set(&self, peer: &str, date: &str) -> Result<HashSet<String>, StorageError> {
        let text = self
            .post_form(peer, "/get_md5s_by_date", &[("date", date)])
            .await?
            .text()
            .await
            .map_err(|e| StorageError::transfer(peer, e))?;
        Ok(parse_hash_list(&text))
    }

    async fn notify_missing(
        &self,
        peer: &str,
        origin: &str,
        hashes: &[String],
    ) -> Result<(), StorageError> {
        let joined = hashes.join(",");
        self.post_form(peer, "/receive_md5s", &[("md5s", joined.as_str()), ("peer", origin)])
            .await?;
        Ok(())
    }

    async fn status(&self, peer: &str) -> Result<NodeStatus, StorageError> {
        self.get(peer, "/status")
            .await?
            .json()
            .await
            .map_err(|e| StorageError::transfer(peer, e))
    }
}

/// Split a comma-joined hash list, ignoring blanks
pub fn parse_hash_list(text: &str) -> HashSet<String> {
    text.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hash_list() {
        let set = parse_hash_list("h1, h2,,h3\n");
        assert_eq!(set.len(), 3);
        assert!(set.contains("h2"));
        assert!(parse_hash_list("").is_empty());
    }

    #[test]
    fn test_endpoint_join() {
        let transport = HttpTransport::new(&Config::default()).unwrap();
        let url = transport.endpoint("http://10.0.0.2:8080", "/stat").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.2:8080/stat");
        assert!(transport.endpoint("not a url", "/stat").is_err());
    }
}
