//! Upstream fan-out manager.
//!
//! Owns the peer fleet, capabilities, quorum size and selection strategies,
//! and implements every fan-out operation: buffered and streaming upload,
//! mirror, upload preflight, path presence discovery, catalog merge, and
//! delete. One task is spawned per peer per operation; results are collected
//! in completion order through an order-insensitive sink. The manager is
//! read-only after construction except for the selector's round-robin
//! counter and the active-task gauge.
//!
//! # Quorum semantics
//!
//! A fan-out write succeeds when at least `min_upload_servers` peers accept.
//! Otherwise the aggregate error carries the minimum HTTP status observed
//! across failing peers: 4xx (client fault) sorts below 5xx and is the more
//! actionable answer to surface. Transport-level failures carry no status;
//! if no peer produced one the aggregate is a plain 500.

use crate::client::PeerClient;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::select::{Selector, Strategy};
use crate::stats::Stats;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Pipe buffer depth per peer during streaming upload, in body chunks.
/// The producer runs at the pace of the slowest healthy peer once a pipe
/// this deep has filled.
const STREAM_PIPE_DEPTH: usize = 16;

/// Result of one write (upload or mirror) against one peer.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub server_url: String,
    pub success: bool,
    /// Upstream HTTP status for a failed call, 0 when the failure was
    /// transport-level (or on success)
    pub status: u16,
    /// Upstream response body on success
    pub body: Bytes,
    pub error: Option<String>,
}

impl UploadOutcome {
    fn from_result(server_url: String, result: Result<Bytes>) -> Self {
        match result {
            Ok(body) => Self {
                server_url,
                success: true,
                status: 0,
                body,
                error: None,
            },
            Err(error) => Self {
                server_url,
                success: false,
                status: error.upstream_status().map(|s| s.as_u16()).unwrap_or(0),
                body: Bytes::new(),
                error: Some(error.to_string()),
            },
        }
    }
}

/// All per-peer outcomes of one write fan-out, plus the quorum verdict.
#[derive(Debug, Clone, Default)]
pub struct Fanout {
    pub outcomes: Vec<UploadOutcome>,
}

impl Fanout {
    pub fn successes(&self) -> Vec<&UploadOutcome> {
        self.outcomes.iter().filter(|o| o.success).collect()
    }

    pub fn success_urls(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| o.server_url.clone())
            .collect()
    }

    /// Quorum verdict: Ok when at least `required` peers succeeded,
    /// otherwise a QuorumFailed carrying the minimum failing status.
    pub fn quorum(&self, required: usize) -> Result<()> {
        let succeeded = self.outcomes.iter().filter(|o| o.success).count();
        if succeeded >= required {
            return Ok(());
        }

        let min_status = self
            .outcomes
            .iter()
            .filter(|o| !o.success && o.status > 0)
            .map(|o| o.status)
            .min();

        Err(GatewayError::QuorumFailed {
            succeeded,
            required,
            status: min_status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            reason: None,
        })
    }
}

/// Result of one HEAD /upload preflight against one peer.
#[derive(Debug, Clone)]
pub struct PreflightOutcome {
    pub server_url: String,
    pub accepted: bool,
    /// 0 when the call failed at transport level
    pub status: u16,
    /// X-Reason header from a rejecting peer
    pub reason: Option<String>,
    pub error: Option<String>,
}

/// All preflight outcomes, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct Preflight {
    pub outcomes: Vec<PreflightOutcome>,
}

impl Preflight {
    pub fn accepted_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.accepted).count()
    }

    /// Quorum verdict: minimum status among rejections (400 when none
    /// produced one), reason from the first rejecting peer that sent one.
    pub fn quorum(&self, required: usize) -> Result<()> {
        let accepted = self.accepted_count();
        if accepted >= required {
            return Ok(());
        }

        let min_status = self
            .outcomes
            .iter()
            .filter(|o| !o.accepted && o.status > 0)
            .map(|o| o.status)
            .min()
            .unwrap_or(400);

        let reason = self
            .outcomes
            .iter()
            .filter(|o| !o.accepted)
            .find_map(|o| o.reason.clone());

        Err(GatewayError::QuorumFailed {
            succeeded: accepted,
            required,
            status: StatusCode::from_u16(min_status).unwrap_or(StatusCode::BAD_REQUEST),
            reason,
        })
    }
}

/// A peer that answered 200 to a presence HEAD, with its response headers
/// kept for proxying.
#[derive(Debug, Clone)]
pub struct PresenceOutcome {
    pub server_url: String,
    pub headers: HeaderMap,
}

/// Per-peer result of a list fan-out.
#[derive(Debug, Clone)]
pub struct ListOutcome {
    pub server_url: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Per-peer result of a delete fan-out.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub server_url: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Capabilities {
    supports_mirror: bool,
    supports_upload_head: bool,
}

#[derive(Debug, Clone, Copy)]
enum WriteKind {
    Upload,
    Mirror,
}

/// Decrements the active-task gauge when the task finishes, panics included.
struct TaskGuard(Arc<AtomicUsize>);

impl TaskGuard {
    fn new(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge.clone())
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One in-memory pipe feeding one peer's request body during streaming
/// upload. After its first send failure the pipe swallows subsequent writes
/// so a dead peer never stalls the producer.
struct PeerPipe {
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    failed: bool,
}

/// Copy the client body into every pipe. Pipe failures mark the pipe and
/// are otherwise ignored: the producer always drains the full body, so a
/// digest tap upstream of this call sees every byte no matter which peers
/// die mid-stream. Returns the number of bytes drained.
async fn pump_body<S>(body: S, pipes: &mut [PeerPipe]) -> u64
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    let mut body = std::pin::pin!(body);
    let mut drained: u64 = 0;

    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => {
                drained += chunk.len() as u64;
                for pipe in pipes.iter_mut().filter(|p| !p.failed) {
                    if pipe.tx.send(Ok(chunk.clone())).await.is_err() {
                        pipe.failed = true;
                    }
                }
            }
            Err(error) => {
                // Client body broke: propagate EOF-with-error to every
                // still-healthy reader and stop.
                for pipe in pipes.iter_mut().filter(|p| !p.failed) {
                    let _ = pipe
                        .tx
                        .send(Err(std::io::Error::new(error.kind(), error.to_string())))
                        .await;
                    pipe.failed = true;
                }
                break;
            }
        }
    }

    drained
}

/// Manages the upstream Blossom server fleet.
pub struct Manager {
    clients: Vec<Arc<PeerClient>>,
    server_urls: Vec<String>,
    capabilities: Vec<Capabilities>,
    min_upload_servers: usize,
    timeout: Duration,
    redirect_strategy: Strategy,
    download_strategy: Strategy,
    selector: Selector,
    active_tasks: Arc<AtomicUsize>,
}

impl Manager {
    pub fn new(config: &Config, http: reqwest::Client, stats: Option<Arc<Stats>>) -> Result<Self> {
        if config.upstream_servers.is_empty() {
            return Err(GatewayError::Internal(
                "no upstream servers configured".to_string(),
            ));
        }

        let mut clients = Vec::with_capacity(config.upstream_servers.len());
        let mut server_urls = Vec::with_capacity(config.upstream_servers.len());
        let mut capabilities = Vec::with_capacity(config.upstream_servers.len());
        let mut priorities = HashMap::new();

        for server in &config.upstream_servers {
            clients.push(Arc::new(PeerClient::new(
                http.clone(),
                &server.url,
                server.alternative_address.as_deref(),
            )));
            server_urls.push(server.url.clone());
            capabilities.push(Capabilities {
                supports_mirror: server.supports_mirror,
                supports_upload_head: server.supports_upload_head,
            });
            priorities.insert(server.url.clone(), server.priority);
        }

        let redirect_strategy = Strategy::parse(&config.server.redirect_strategy);
        let download_strategy = config
            .server
            .download_redirect_strategy
            .as_deref()
            .map(Strategy::parse)
            .unwrap_or(redirect_strategy);

        debug!(
            servers = server_urls.len(),
            min_upload_servers = config.server.min_upload_servers,
            strategy = ?redirect_strategy,
            download_strategy = ?download_strategy,
            "Upstream manager initialized"
        );

        Ok(Self {
            clients,
            server_urls,
            capabilities,
            min_upload_servers: config.server.min_upload_servers,
            timeout: Duration::from_secs(config.server.timeout_secs),
            redirect_strategy,
            download_strategy,
            selector: Selector::new(priorities, stats),
            active_tasks: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn server_urls(&self) -> &[String] {
        &self.server_urls
    }

    pub fn min_upload_servers(&self) -> usize {
        self.min_upload_servers
    }

    pub fn redirect_strategy(&self) -> Strategy {
        self.redirect_strategy
    }

    pub fn download_strategy(&self) -> Strategy {
        self.download_strategy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of fan-out tasks currently in flight, for the health verdict.
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Relaxed)
    }

    pub fn client_for(&self, server_url: &str) -> Option<Arc<PeerClient>> {
        self.server_urls
            .iter()
            .position(|url| url == server_url)
            .map(|idx| self.clients[idx].clone())
    }

    fn spawn_tracked<T>(
        &self,
        fut: impl std::future::Future<Output = T> + Send + 'static,
    ) -> tokio::task::JoinHandle<T>
    where
        T: Send + 'static,
    {
        let guard = TaskGuard::new(&self.active_tasks);
        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    /// Pick a representative among successful write outcomes.
    pub fn select_outcome<'a>(&self, successes: &[&'a UploadOutcome]) -> Option<&'a UploadOutcome> {
        let urls: Vec<&str> = successes.iter().map(|o| o.server_url.as_str()).collect();
        let index = self.selector.pick(self.redirect_strategy, &urls)?;
        Some(successes[index])
    }

    /// Pick a redirect target among servers known to hold a blob.
    pub fn select_download_url<'a>(&self, servers: &'a [String]) -> Option<&'a String> {
        let index = self.selector.pick(self.download_strategy, servers)?;
        Some(&servers[index])
    }

    /// Fan a reusable byte body out to the given peers.
    async fn write_fanout(
        &self,
        indices: Vec<usize>,
        body: Bytes,
        content_type: Option<String>,
        headers: HeaderMap,
        kind: WriteKind,
        deadline: Instant,
    ) -> Fanout {
        let mut pending = FuturesUnordered::new();
        for idx in indices {
            let client = self.clients[idx].clone();
            let body = body.clone();
            let content_type = content_type.clone();
            let headers = headers.clone();
            pending.push(self.spawn_tracked(async move {
                let result = match kind {
                    WriteKind::Upload => {
                        client
                            .upload(
                                deadline,
                                reqwest::Body::from(body),
                                content_type.as_deref(),
                                headers,
                            )
                            .await
                    }
                    WriteKind::Mirror => {
                        client
                            .mirror(deadline, body, content_type.as_deref(), headers)
                            .await
                    }
                };
                UploadOutcome::from_result(client.url().to_string(), result)
            }));
        }

        let mut fanout = Fanout::default();
        while let Some(joined) = pending.next().await {
            match joined {
                Ok(outcome) => fanout.outcomes.push(outcome),
                Err(error) => warn!(error = %error, "Fan-out task failed"),
            }
        }
        fanout
    }

    /// Buffered upload: the whole body is in memory and replayed to every
    /// peer. Used for bodies small enough that buffering is safe.
    pub async fn upload_buffered(
        &self,
        body: Bytes,
        content_type: Option<String>,
        headers: HeaderMap,
        deadline: Instant,
    ) -> Fanout {
        debug!(
            servers = self.clients.len(),
            bytes = body.len(),
            "Starting buffered upload fan-out"
        );
        let indices = (0..self.clients.len()).collect();
        self.write_fanout(indices, body, content_type, headers, WriteKind::Upload, deadline)
            .await
    }

    /// Streaming upload: the client body is teed byte-for-byte into one
    /// in-memory pipe per peer. A peer failing mid-stream never stalls the
    /// others or the producer; the body is always drained in full, so a
    /// caller-owned digest tap sees every byte.
    pub async fn upload_streaming<S>(
        &self,
        body: S,
        content_type: Option<String>,
        headers: HeaderMap,
        deadline: Instant,
    ) -> Fanout
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send,
    {
        debug!(servers = self.clients.len(), "Starting streaming upload fan-out");

        let mut pipes = Vec::with_capacity(self.clients.len());
        let mut pending = FuturesUnordered::new();

        for client in &self.clients {
            let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(STREAM_PIPE_DEPTH);
            let peer_body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
            let client = client.clone();
            let content_type = content_type.clone();
            let headers = headers.clone();
            pending.push(self.spawn_tracked(async move {
                let result = client
                    .upload(deadline, peer_body, content_type.as_deref(), headers)
                    .await;
                UploadOutcome::from_result(client.url().to_string(), result)
            }));
            pipes.push(PeerPipe { tx, failed: false });
        }

        let drained = pump_body(body, &mut pipes).await;
        // Close the healthy pipes; readers see clean EOF
        drop(pipes);
        debug!(bytes = drained, "Streaming upload body drained");

        let mut fanout = Fanout::default();
        while let Some(joined) = pending.next().await {
            match joined {
                Ok(outcome) => fanout.outcomes.push(outcome),
                Err(error) => warn!(error = %error, "Fan-out task failed"),
            }
        }
        fanout
    }

    /// Mirror fan-out (BUD-04), gated on the `supports_mirror` capability.
    pub async fn mirror(
        &self,
        body: Bytes,
        content_type: Option<String>,
        headers: HeaderMap,
    ) -> Result<Fanout> {
        let indices: Vec<usize> = (0..self.clients.len())
            .filter(|&i| self.capabilities[i].supports_mirror)
            .collect();
        if indices.is_empty() {
            return Err(GatewayError::CapabilityMissing { endpoint: "mirror" });
        }

        debug!(
            capable = indices.len(),
            total = self.clients.len(),
            "Starting mirror fan-out"
        );
        let deadline = Instant::now() + self.timeout;
        Ok(self
            .write_fanout(indices, body, content_type, headers, WriteKind::Mirror, deadline)
            .await)
    }

    /// HEAD /upload preflight fan-out (BUD-06), gated on the
    /// `supports_upload_head` capability. Outcomes arrive in completion
    /// order, which is what the first-reason rule operates on.
    pub async fn upload_preflight(&self, headers: HeaderMap) -> Result<Preflight> {
        let indices: Vec<usize> = (0..self.clients.len())
            .filter(|&i| self.capabilities[i].supports_upload_head)
            .collect();
        if indices.is_empty() {
            return Err(GatewayError::CapabilityMissing {
                endpoint: "HEAD /upload",
            });
        }

        let deadline = Instant::now() + self.timeout;
        let mut pending = FuturesUnordered::new();
        for idx in indices {
            let client = self.clients[idx].clone();
            let headers = headers.clone();
            pending.push(self.spawn_tracked(async move {
                match client.head_upload(deadline, headers).await {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        let reason = response
                            .headers()
                            .get("X-Reason")
                            .and_then(|v| v.to_str().ok())
                            .map(|v| v.to_string());
                        PreflightOutcome {
                            server_url: client.url().to_string(),
                            accepted: status == 200,
                            status,
                            reason,
                            error: None,
                        }
                    }
                    Err(error) => PreflightOutcome {
                        server_url: client.url().to_string(),
                        accepted: false,
                        status: 0,
                        reason: None,
                        error: Some(error.to_string()),
                    },
                }
            }));
        }

        let mut preflight = Preflight::default();
        while let Some(joined) = pending.next().await {
            match joined {
                Ok(outcome) => preflight.outcomes.push(outcome),
                Err(error) => warn!(error = %error, "Preflight task failed"),
            }
        }
        Ok(preflight)
    }

    /// Discover which peers hold a blob: HEAD fan-out to every peer, keeping
    /// responders and their headers for later proxying.
    pub async fn check_path(&self, path: &str) -> Vec<PresenceOutcome> {
        let deadline = Instant::now() + self.timeout;
        let mut pending = FuturesUnordered::new();
        for client in &self.clients {
            let client = client.clone();
            let path = path.to_string();
            pending.push(self.spawn_tracked(async move {
                match client.head(deadline, &path).await {
                    Ok(response) if response.status().as_u16() == 200 => Some(PresenceOutcome {
                        server_url: client.url().to_string(),
                        headers: response.headers().clone(),
                    }),
                    Ok(_) => None,
                    Err(error) => {
                        debug!(server = %client.url(), error = %error, "Presence check failed");
                        None
                    }
                }
            }));
        }

        let mut found = Vec::new();
        while let Some(joined) = pending.next().await {
            if let Ok(Some(outcome)) = joined {
                found.push(outcome);
            }
        }
        debug!(path = %path, found = found.len(), "Presence discovery complete");
        found
    }

    /// Query every peer's catalog for a pubkey and merge the results by
    /// digest. Returns the merged items plus per-peer outcomes for stats.
    pub async fn list_merged(&self, pubkey: &str) -> (Vec<Value>, Vec<ListOutcome>) {
        let deadline = Instant::now() + self.timeout;
        let mut pending = FuturesUnordered::new();
        for client in &self.clients {
            let client = client.clone();
            let pubkey = pubkey.to_string();
            pending.push(self.spawn_tracked(async move {
                let url = client.url().to_string();
                match client.list(deadline, &pubkey).await {
                    Ok(bytes) => match serde_json::from_slice::<Vec<Value>>(&bytes) {
                        Ok(items) => (url, Ok(items)),
                        Err(error) => (url, Err(format!("failed to parse list JSON: {error}"))),
                    },
                    Err(error) => (url, Err(error.to_string())),
                }
            }));
        }

        let mut per_server: Vec<(String, Vec<Value>)> = Vec::new();
        let mut outcomes = Vec::new();
        while let Some(joined) = pending.next().await {
            let Ok((url, result)) = joined else {
                continue;
            };
            match result {
                Ok(items) => {
                    outcomes.push(ListOutcome {
                        server_url: url.clone(),
                        success: true,
                        error: None,
                    });
                    per_server.push((url, items));
                }
                Err(error) => outcomes.push(ListOutcome {
                    server_url: url,
                    success: false,
                    error: Some(error),
                }),
            }
        }

        (self.merge_lists(per_server), outcomes)
    }

    /// Merge per-server catalogs: one item per digest, representative chosen
    /// by the configured strategy, augmented with `nip94` tags. Items
    /// without a valid 64-hex `sha256` field are dropped.
    pub fn merge_lists(&self, per_server: Vec<(String, Vec<Value>)>) -> Vec<Value> {
        // Group items by digest, remembering which server contributed each
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<(String, Value)>> = HashMap::new();

        for (server_url, items) in per_server {
            for item in items {
                let Some(digest) = item
                    .get("sha256")
                    .and_then(Value::as_str)
                    .filter(|s| s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()))
                    .map(|s| s.to_lowercase())
                else {
                    continue;
                };
                let group = groups.entry(digest.clone()).or_insert_with(|| {
                    order.push(digest);
                    Vec::new()
                });
                group.push((server_url.clone(), item));
            }
        }

        let mut merged = Vec::with_capacity(order.len());
        for digest in order {
            let Some(group) = groups.remove(&digest) else {
                continue;
            };

            let representative = if group.len() == 1 {
                &group[0].1
            } else {
                let urls: Vec<&str> = group.iter().map(|(url, _)| url.as_str()).collect();
                let index = self
                    .selector
                    .pick(self.redirect_strategy, &urls)
                    .unwrap_or(0);
                &group[index].1
            };

            let mut item = representative.clone();
            let Some(object) = item.as_object_mut() else {
                continue;
            };

            let mime = object
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_string);
            let urls: Vec<String> = group
                .iter()
                .filter_map(|(_, contributed)| {
                    contributed
                        .get("url")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect();
            inject_response_tags(object, Some(&digest), mime.as_deref(), &urls);

            merged.push(item);
        }

        merged
    }

    /// DELETE fan-out to the given candidate set.
    pub async fn delete_from(
        &self,
        servers: &[String],
        digest: &str,
        headers: HeaderMap,
    ) -> Vec<DeleteOutcome> {
        let deadline = Instant::now() + self.timeout;
        let mut pending = FuturesUnordered::new();
        for server_url in servers {
            let Some(client) = self.client_for(server_url) else {
                warn!(server = %server_url, "Delete target is not a configured server");
                continue;
            };
            let digest = digest.to_string();
            let headers = headers.clone();
            pending.push(self.spawn_tracked(async move {
                match client.delete(deadline, &digest, headers).await {
                    Ok(()) => DeleteOutcome {
                        server_url: client.url().to_string(),
                        success: true,
                        error: None,
                    },
                    Err(error) => DeleteOutcome {
                        server_url: client.url().to_string(),
                        success: false,
                        error: Some(error.to_string()),
                    },
                }
            }));
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = pending.next().await {
            if let Ok(outcome) = joined {
                outcomes.push(outcome);
            }
        }
        outcomes
    }
}

/// Pull valid existing `nip94` tags out of a response object.
fn existing_nip94_tags(object: &serde_json::Map<String, Value>) -> Vec<Value> {
    let Some(Value::Array(tags)) = object.get("nip94") else {
        return Vec::new();
    };
    tags.iter()
        .filter(|tag| matches!(tag, Value::Array(parts) if !parts.is_empty()))
        .cloned()
        .collect()
}

fn has_tag_type(tags: &[Value], name: &str) -> bool {
    tags.iter().any(|tag| {
        matches!(tag, Value::Array(parts)
            if parts.first().and_then(Value::as_str) == Some(name))
    })
}

fn has_tag(tags: &[Value], name: &str, value: &str) -> bool {
    tags.iter().any(|tag| {
        matches!(tag, Value::Array(parts)
            if parts.len() >= 2
                && parts[0].as_str() == Some(name)
                && parts[1].as_str() == Some(value))
    })
}

/// Inject NIP-94 / BUD-08 tags into a blob-metadata response object:
/// at most one `x` (digest) tag, at most one `m` (mime) tag, and one `url`
/// tag per distinct peer URL. Existing tags are preserved and never
/// duplicated.
pub fn inject_response_tags(
    object: &mut serde_json::Map<String, Value>,
    digest: Option<&str>,
    mime: Option<&str>,
    urls: &[String],
) {
    let mut tags = existing_nip94_tags(object);

    if let Some(digest) = digest.filter(|d| !d.is_empty()) {
        if !has_tag_type(&tags, "x") {
            tags.push(serde_json::json!(["x", digest]));
        }
    }
    if let Some(mime) = mime.filter(|m| !m.is_empty()) {
        if !has_tag_type(&tags, "m") {
            tags.push(serde_json::json!(["m", mime]));
        }
    }
    for url in urls {
        if !url.is_empty() && !has_tag(&tags, "url", url) {
            tags.push(serde_json::json!(["url", url]));
        }
    }

    object.insert("nip94".to_string(), Value::Array(tags));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, UpstreamServer};

    fn outcome(url: &str, success: bool, status: u16) -> UploadOutcome {
        UploadOutcome {
            server_url: url.to_string(),
            success,
            status,
            body: Bytes::new(),
            error: if success {
                None
            } else {
                Some("failed".to_string())
            },
        }
    }

    fn test_manager(urls: &[&str]) -> Manager {
        let config = Config {
            upstream_servers: urls
                .iter()
                .map(|url| UpstreamServer {
                    url: url.to_string(),
                    alternative_address: None,
                    priority: 0,
                    supports_mirror: false,
                    supports_upload_head: false,
                })
                .collect(),
            server: ServerConfig::default(),
        };
        Manager::new(&config, reqwest::Client::new(), None).unwrap()
    }

    #[test]
    fn test_quorum_met() {
        let fanout = Fanout {
            outcomes: vec![
                outcome("p1", true, 0),
                outcome("p2", true, 0),
                outcome("p3", false, 500),
            ],
        };
        assert!(fanout.quorum(2).is_ok());
    }

    #[test]
    fn test_quorum_unmet_uses_minimum_status() {
        // S2: P1→413, P2→502, P3→413 with N=2
        let fanout = Fanout {
            outcomes: vec![
                outcome("p1", false, 413),
                outcome("p2", false, 502),
                outcome("p3", false, 413),
            ],
        };
        match fanout.quorum(2) {
            Err(GatewayError::QuorumFailed { status, .. }) => {
                assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
            }
            other => panic!("expected QuorumFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_quorum_unmet_without_statuses_is_500() {
        let fanout = Fanout {
            outcomes: vec![outcome("p1", false, 0), outcome("p2", false, 0)],
        };
        match fanout.quorum(1) {
            Err(GatewayError::QuorumFailed { status, .. }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            }
            other => panic!("expected QuorumFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_quorum_counts_partial_successes() {
        let fanout = Fanout {
            outcomes: vec![outcome("p1", true, 0), outcome("p2", false, 403)],
        };
        match fanout.quorum(2) {
            Err(GatewayError::QuorumFailed {
                succeeded,
                required,
                status,
                ..
            }) => {
                assert_eq!(succeeded, 1);
                assert_eq!(required, 2);
                assert_eq!(status, StatusCode::FORBIDDEN);
            }
            other => panic!("expected QuorumFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_preflight_quorum_defaults_to_400_and_keeps_first_reason() {
        let preflight = Preflight {
            outcomes: vec![
                PreflightOutcome {
                    server_url: "p1".to_string(),
                    accepted: false,
                    status: 0,
                    reason: None,
                    error: Some("unreachable".to_string()),
                },
                PreflightOutcome {
                    server_url: "p2".to_string(),
                    accepted: false,
                    status: 413,
                    reason: Some("blob too large".to_string()),
                    error: None,
                },
            ],
        };
        match preflight.quorum(1) {
            Err(GatewayError::QuorumFailed { status, reason, .. }) => {
                assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
                assert_eq!(reason.as_deref(), Some("blob too large"));
            }
            other => panic!("expected QuorumFailed, got {other:?}"),
        }

        let no_status = Preflight {
            outcomes: vec![PreflightOutcome {
                server_url: "p1".to_string(),
                accepted: false,
                status: 0,
                reason: None,
                error: Some("unreachable".to_string()),
            }],
        };
        match no_status.quorum(1) {
            Err(GatewayError::QuorumFailed { status, .. }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
            }
            other => panic!("expected QuorumFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pump_body_drains_past_failed_pipes() {
        let (tx1, mut rx1) = mpsc::channel::<std::io::Result<Bytes>>(2);
        let (tx2, rx2) = mpsc::channel::<std::io::Result<Bytes>>(2);
        let mut pipes = vec![
            PeerPipe {
                tx: tx1,
                failed: false,
            },
            PeerPipe {
                tx: tx2,
                failed: false,
            },
        ];
        // Second reader dies immediately
        drop(rx2);

        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"hello, ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let body = futures::stream::iter(chunks);

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(Ok(chunk)) = rx1.recv().await {
                received.extend_from_slice(&chunk);
            }
            received
        });

        let drained = pump_body(body, &mut pipes).await;
        assert_eq!(drained, 12);
        assert!(!pipes[0].failed);
        assert!(pipes[1].failed);
        drop(pipes);

        assert_eq!(reader.await.unwrap(), b"hello, world");
    }

    #[tokio::test]
    async fn test_pump_body_drains_when_all_pipes_fail() {
        let (tx1, rx1) = mpsc::channel::<std::io::Result<Bytes>>(1);
        drop(rx1);
        let mut pipes = vec![PeerPipe {
            tx: tx1,
            failed: false,
        }];

        let chunks: Vec<std::io::Result<Bytes>> = (0..10)
            .map(|_| Ok(Bytes::from(vec![0u8; 1024])))
            .collect();
        let drained = pump_body(futures::stream::iter(chunks), &mut pipes).await;
        assert_eq!(drained, 10 * 1024);
    }

    #[test]
    fn test_merge_single_server_is_identity_plus_tags() {
        let manager = test_manager(&["https://p1.example"]);
        let digest = "a".repeat(64);
        let item = serde_json::json!({
            "sha256": digest,
            "size": 42,
            "type": "image/png",
            "url": format!("https://p1.example/{digest}"),
            "uploaded": 1700000000,
        });
        let merged = manager.merge_lists(vec![(
            "https://p1.example".to_string(),
            vec![item.clone()],
        )]);
        assert_eq!(merged.len(), 1);
        let out = &merged[0];
        assert_eq!(out["sha256"], item["sha256"]);
        assert_eq!(out["size"], item["size"]);
        assert_eq!(out["uploaded"], item["uploaded"]);
        let tags = out["nip94"].as_array().unwrap();
        assert!(tags.contains(&serde_json::json!(["x", digest])));
        assert!(tags.contains(&serde_json::json!(["m", "image/png"])));
        assert!(tags.contains(&serde_json::json!(["url", format!("https://p1.example/{digest}")])));
    }

    #[test]
    fn test_merge_collects_distinct_urls_across_servers() {
        // S5: three servers share digest D, one also has unique digest D'
        let manager = test_manager(&["p1", "p2", "p3"]);
        let d = "d".repeat(64);
        let d2 = "e".repeat(64);
        let item_for = |url: &str, digest: &str| {
            serde_json::json!({
                "sha256": digest,
                "type": "text/plain",
                "url": format!("{url}/{digest}"),
            })
        };
        let merged = manager.merge_lists(vec![
            ("p1".to_string(), vec![item_for("u1", &d)]),
            ("p2".to_string(), vec![item_for("u2", &d)]),
            ("p3".to_string(), vec![item_for("u3", &d), item_for("u3", &d2)]),
        ]);
        assert_eq!(merged.len(), 2);

        let d_item = merged
            .iter()
            .find(|i| i["sha256"].as_str() == Some(d.as_str()))
            .unwrap();
        let tags = d_item["nip94"].as_array().unwrap();
        let x_tags: Vec<_> = tags
            .iter()
            .filter(|t| t[0].as_str() == Some("x"))
            .collect();
        assert_eq!(x_tags.len(), 1);
        assert_eq!(x_tags[0][1].as_str(), Some(d.as_str()));
        let m_tags: Vec<_> = tags
            .iter()
            .filter(|t| t[0].as_str() == Some("m"))
            .collect();
        assert!(m_tags.len() <= 1);
        for url in [format!("u1/{d}"), format!("u2/{d}"), format!("u3/{d}")] {
            assert!(tags.contains(&serde_json::json!(["url", url])), "missing {url}");
        }
    }

    #[test]
    fn test_merge_drops_items_without_valid_sha256() {
        let manager = test_manager(&["p1"]);
        let merged = manager.merge_lists(vec![(
            "p1".to_string(),
            vec![
                serde_json::json!({"size": 1}),
                serde_json::json!({"sha256": "not-hex"}),
                serde_json::json!({"sha256": "ab"}),
            ],
        )]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_merge_duplicate_items_never_duplicate_url_tags() {
        let manager = test_manager(&["p1"]);
        let d = "f".repeat(64);
        let item = serde_json::json!({
            "sha256": d,
            "url": format!("https://p1/{d}"),
        });
        let merged = manager.merge_lists(vec![(
            "p1".to_string(),
            vec![item.clone(), item.clone()],
        )]);
        assert_eq!(merged.len(), 1);
        let tags = merged[0]["nip94"].as_array().unwrap();
        let url_tags: Vec<_> = tags
            .iter()
            .filter(|t| t[0].as_str() == Some("url"))
            .collect();
        assert_eq!(url_tags.len(), 1);
    }

    #[test]
    fn test_inject_preserves_existing_x_tag_and_dedupes_urls() {
        let mut value = serde_json::json!({
            "nip94": [["x", "already-there"], ["url", "https://u1"]],
        });
        let object = value.as_object_mut().unwrap();
        inject_response_tags(
            object,
            Some("new-digest"),
            Some("text/plain"),
            &["https://u1".to_string(), "https://u2".to_string()],
        );
        let tags = object["nip94"].as_array().unwrap();
        let x_tags: Vec<_> = tags
            .iter()
            .filter(|t| t[0].as_str() == Some("x"))
            .collect();
        assert_eq!(x_tags.len(), 1);
        assert_eq!(x_tags[0][1].as_str(), Some("already-there"));
        let url_tags: Vec<_> = tags
            .iter()
            .filter(|t| t[0].as_str() == Some("url"))
            .collect();
        assert_eq!(url_tags.len(), 2);
        assert!(tags.contains(&serde_json::json!(["m", "text/plain"])));
    }
}
