//! HTTP client for one upstream Blossom server.
//!
//! Each configured peer gets one `PeerClient` wrapping the shared pooled
//! `reqwest::Client`. Requests are dialled against the peer's connect URL
//! (the `alternative_address` when configured); the official URL is used in
//! errors and logs and never the other way around. No request carries a
//! client-level timeout: the caller's deadline bounds every call. Outbound
//! compression negotiation is disabled, upstream response bodies are short
//! JSON.

use crate::error::{GatewayError, Result};
use axum::http::HeaderMap;
use axum::http::header::{ACCEPT_ENCODING, CONTENT_TYPE};
use bytes::Bytes;
use std::time::Instant as StdInstant;
use tokio::time::Instant;
use tracing::debug;

/// Statuses accepted for upload/mirror: OK, Created, Accepted (queued)
fn is_write_success(status: axum::http::StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 201 | 202)
}

pub struct PeerClient {
    http: reqwest::Client,
    /// Official URL, used in errors and log output
    url: String,
    /// URL actually dialled
    connect_url: String,
}

impl PeerClient {
    pub fn new(http: reqwest::Client, url: &str, alternative_address: Option<&str>) -> Self {
        Self {
            http,
            url: url.to_string(),
            connect_url: alternative_address.unwrap_or(url).to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn transport_error(&self, op: &str, error: &reqwest::Error) -> GatewayError {
        GatewayError::Internal(format!("{op} request to {} failed: {error}", self.url))
    }

    fn deadline_error(&self, op: &str) -> GatewayError {
        GatewayError::Internal(format!("{op} request to {} exceeded deadline", self.url))
    }

    /// PUT a blob to `<connect>/upload`. Returns the upstream response body
    /// on 200/201/202, a status-carrying error otherwise.
    pub async fn upload(
        &self,
        deadline: Instant,
        body: reqwest::Body,
        content_type: Option<&str>,
        headers: HeaderMap,
    ) -> Result<Bytes> {
        let target = format!("{}/upload", self.connect_url);
        debug!(server = %self.url, "Sending upload");

        let mut request = self
            .http
            .put(&target)
            .headers(headers)
            .header(ACCEPT_ENCODING, "identity")
            .body(body);
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }

        let started = StdInstant::now();
        let outcome = tokio::time::timeout_at(deadline, async {
            let response = request
                .send()
                .await
                .map_err(|e| self.transport_error("upload", &e))?;
            let status = response.status();
            let bytes = response.bytes().await.unwrap_or_default();
            Ok::<_, GatewayError>((status, bytes))
        })
        .await
        .map_err(|_| self.deadline_error("upload"))??;

        let (status, bytes) = outcome;
        debug!(
            server = %self.url,
            status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Upload response"
        );

        if is_write_success(status) {
            Ok(bytes)
        } else {
            Err(self.upstream_error(status, bytes))
        }
    }

    /// PUT a mirror request (small JSON referencing a remote URL) to
    /// `<connect>/mirror`. Same success classification as upload.
    pub async fn mirror(
        &self,
        deadline: Instant,
        body: Bytes,
        content_type: Option<&str>,
        headers: HeaderMap,
    ) -> Result<Bytes> {
        let target = format!("{}/mirror", self.connect_url);
        debug!(server = %self.url, "Sending mirror request");

        let mut request = self
            .http
            .put(&target)
            .headers(headers)
            .header(ACCEPT_ENCODING, "identity")
            .body(body);
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }

        let outcome = tokio::time::timeout_at(deadline, async {
            let response = request
                .send()
                .await
                .map_err(|e| self.transport_error("mirror", &e))?;
            let status = response.status();
            let bytes = response.bytes().await.unwrap_or_default();
            Ok::<_, GatewayError>((status, bytes))
        })
        .await
        .map_err(|_| self.deadline_error("mirror"))??;

        let (status, bytes) = outcome;
        if is_write_success(status) {
            Ok(bytes)
        } else {
            Err(self.upstream_error(status, bytes))
        }
    }

    /// HEAD `<connect>/upload` (BUD-06 preflight). The caller inspects the
    /// status and `X-Reason` header; any response is returned as-is.
    pub async fn head_upload(
        &self,
        deadline: Instant,
        headers: HeaderMap,
    ) -> Result<reqwest::Response> {
        let target = format!("{}/upload", self.connect_url);
        let request = self
            .http
            .head(&target)
            .headers(headers)
            .header(ACCEPT_ENCODING, "identity");

        tokio::time::timeout_at(deadline, request.send())
            .await
            .map_err(|_| self.deadline_error("preflight"))?
            .map_err(|e| self.transport_error("preflight", &e))
    }

    /// HEAD `<connect>/<path>`. 200 means the blob is present; the raw
    /// response is returned so headers can be proxied.
    pub async fn head(&self, deadline: Instant, path: &str) -> Result<reqwest::Response> {
        let target = format!("{}/{path}", self.connect_url);
        let request = self.http.head(&target).header(ACCEPT_ENCODING, "identity");

        tokio::time::timeout_at(deadline, request.send())
            .await
            .map_err(|_| self.deadline_error("head"))?
            .map_err(|e| self.transport_error("head", &e))
    }

    /// GET `<connect>/list/<pubkey>`.
    pub async fn list(&self, deadline: Instant, pubkey: &str) -> Result<Bytes> {
        let target = format!("{}/list/{pubkey}", self.connect_url);
        debug!(server = %self.url, pubkey = %pubkey, "Listing blobs");

        let outcome = tokio::time::timeout_at(deadline, async {
            let response = self
                .http
                .get(&target)
                .header(ACCEPT_ENCODING, "identity")
                .send()
                .await
                .map_err(|e| self.transport_error("list", &e))?;
            let status = response.status();
            let bytes = response.bytes().await.unwrap_or_default();
            Ok::<_, GatewayError>((status, bytes))
        })
        .await
        .map_err(|_| self.deadline_error("list"))??;

        let (status, bytes) = outcome;
        if status.as_u16() == 200 {
            Ok(bytes)
        } else {
            Err(self.upstream_error(status, bytes))
        }
    }

    /// DELETE `<connect>/<digest>`. 200 or 204 is success.
    pub async fn delete(&self, deadline: Instant, digest: &str, headers: HeaderMap) -> Result<()> {
        let target = format!("{}/{digest}", self.connect_url);
        debug!(server = %self.url, hash = %digest, "Deleting blob");

        let outcome = tokio::time::timeout_at(deadline, async {
            let response = self
                .http
                .delete(&target)
                .headers(headers)
                .header(ACCEPT_ENCODING, "identity")
                .send()
                .await
                .map_err(|e| self.transport_error("delete", &e))?;
            let status = response.status();
            let bytes = response.bytes().await.unwrap_or_default();
            Ok::<_, GatewayError>((status, bytes))
        })
        .await
        .map_err(|_| self.deadline_error("delete"))??;

        let (status, bytes) = outcome;
        if matches!(status.as_u16(), 200 | 204) {
            Ok(())
        } else {
            Err(self.upstream_error(status, bytes))
        }
    }

    fn upstream_error(&self, status: axum::http::StatusCode, body: Bytes) -> GatewayError {
        let message = if body.is_empty() {
            "(empty response body)".to_string()
        } else {
            String::from_utf8_lossy(&body).into_owned()
        };
        GatewayError::Upstream { status, message }
    }
}
