//! HTTP request handlers for the gateway.
//!
//! Thin adapters binding HTTP semantics to the upstream manager: path
//! parsing and validation, authentication, deadline derivation, response
//! marshalling (NIP-94/BUD-08 tag injection), and error-to-status mapping.

use crate::auth::Verb;
use crate::config::{
    BUFFERED_UPLOAD_MAX_BYTES, MIRROR_MAX_BODY_BYTES, ServerConfig, UPLOAD_DEADLINE_SLACK_SECS,
};
use crate::error::{GatewayError, Result};
use crate::now_secs;
use crate::select::Strategy;
use crate::state::AppState;
use crate::stats::Operation;
use crate::upstream::{Fanout, UploadOutcome, inject_response_tags};
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Build the gateway's HTTP router.
pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/", get(crate::homepage::home))
        .route("/health", get(health_check))
        .route("/stats", get(stats_report))
        .route("/metrics", get(metrics_export))
        .route("/upload", put(upload_blob).head(upload_preflight))
        .route("/mirror", put(mirror_blob))
        .route("/list/:pubkey", get(list_blobs))
        .route(
            "/:path",
            get(download_blob).head(head_blob).delete(delete_blob),
        )
        .with_state(state)
}

// ============================================================================
// Path and header plumbing
// ============================================================================

/// A validated blob path: 64 lowercase hex characters plus an optional
/// extension of 1-10 characters. The extension is informational and never
/// participates in addressing; the full path is preserved end-to-end for
/// redirects and HEAD proxying.
struct BlobPath {
    digest: String,
    path: String,
}

fn parse_blob_path(path: &str) -> Result<BlobPath> {
    let digest = path.get(..64).ok_or(GatewayError::NotFound)?;
    if !digest
        .chars()
        .all(|c| matches!(c, '0'..='9' | 'a'..='f'))
    {
        return Err(GatewayError::NotFound);
    }

    let rest = &path[64..];
    if !rest.is_empty() {
        let ext = rest.strip_prefix('.').ok_or(GatewayError::NotFound)?;
        if ext.is_empty() || ext.len() > 10 {
            return Err(GatewayError::NotFound);
        }
    }

    Ok(BlobPath {
        digest: digest.to_string(),
        path: path.to_string(),
    })
}

/// Copy client headers for forwarding upstream, dropping the ones the peer
/// client sets itself (content type, compression) and the ones that must
/// not be replayed (host, content length).
fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::CONTENT_TYPE
            || name == header::ACCEPT_ENCODING
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

fn authorization_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

fn content_type_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Base URL for `local` strategy responses: the configured base, or one
/// derived from the incoming request.
fn request_base_url(config: &ServerConfig, headers: &HeaderMap) -> Option<String> {
    if let Some(base) = &config.base_url {
        return Some(base.trim_end_matches('/').to_string());
    }
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    Some(format!("{proto}://{host}"))
}

/// Digest referenced by a mirror request body, when its source URL carries
/// one in the last path segment.
fn mirror_source_digest(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let url = value.get("url")?.as_str()?;
    let last = url.rsplit('/').next()?;
    let digest = last.get(..64)?;
    if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let rest = &last[64..];
    if !rest.is_empty() && !rest.starts_with('.') {
        return None;
    }
    Some(digest.to_lowercase())
}

/// Record per-peer stats for a write fan-out: every outcome feeds the
/// tracker.
fn record_fanout_stats(state: &AppState, fanout: &Fanout, op: Operation) {
    for outcome in &fanout.outcomes {
        if outcome.success {
            state.stats.record_success(&outcome.server_url, op);
        } else {
            state.stats.record_failure(&outcome.server_url, op);
        }
    }
}

/// Marshal the representative response for upload/mirror: parse its JSON,
/// rewrite the `url` for the local strategy, and inject NIP-94/BUD-08 tags.
/// Falls back to the raw upstream body when it is not a JSON object.
fn marshal_write_response(
    state: &AppState,
    headers: &HeaderMap,
    representative: &UploadOutcome,
    successes: &[&UploadOutcome],
    digest: Option<&str>,
    mime: Option<&str>,
) -> Response {
    let Ok(mut value) = serde_json::from_slice::<Value>(&representative.body) else {
        debug!(
            server = %representative.server_url,
            "Upstream response is not JSON, returning it unmodified"
        );
        return json_bytes_response(representative.body.clone());
    };
    let Some(object) = value.as_object_mut() else {
        return json_bytes_response(representative.body.clone());
    };

    if state.manager.redirect_strategy() == Strategy::Local {
        if let (Some(digest), Some(base)) = (digest, request_base_url(&state.config.server, headers))
        {
            object.insert(
                "url".to_string(),
                Value::String(format!("{base}/{digest}")),
            );
        }
    }

    let mime = mime
        .map(str::to_string)
        .or_else(|| object.get("type").and_then(Value::as_str).map(str::to_string));

    // BUD-08: one url tag per distinct URL returned by a succeeding peer
    let mut urls = Vec::with_capacity(successes.len());
    for success in successes {
        if let Ok(peer_value) = serde_json::from_slice::<Value>(&success.body) {
            if let Some(url) = peer_value.get("url").and_then(Value::as_str) {
                urls.push(url.to_string());
            }
        }
    }

    inject_response_tags(object, digest, mime.as_deref(), &urls);

    (StatusCode::OK, Json(value)).into_response()
}

fn json_bytes_response(body: Bytes) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

// ============================================================================
// Upload
// ============================================================================

/// Decrements the active-upload gauge even when the handler errors out.
struct UploadGauge(crate::metrics::Metrics);

impl Drop for UploadGauge {
    fn drop(&mut self) {
        self.0.active_uploads.dec();
    }
}

/// PUT /upload: authenticate, stream the body through a SHA-256 tap into the
/// fan-out, enforce quorum, cache the digest→peers mapping, and answer with
/// the representative's augmented response.
pub async fn upload_blob(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let started = std::time::Instant::now();
    state.metrics.record_request("upload", "started");
    state.metrics.active_uploads.inc();
    let _gauge = UploadGauge(state.metrics.clone());

    let auth_event = if state.verifier.enabled() {
        Some(
            state
                .verifier
                .verify(authorization_header(&headers), Verb::Upload)?,
        )
    } else {
        None
    };

    // Deadline: clamp(expiration - now - slack, min, max). Without a token
    // there is no expiration; the upper clamp applies.
    let server = &state.config.server;
    let deadline_secs = match auth_event.as_ref().and_then(|e| e.expiration()) {
        Some(expiration) => expiration
            .saturating_sub(now_secs())
            .saturating_sub(UPLOAD_DEADLINE_SLACK_SECS)
            .clamp(server.min_upload_timeout_secs, server.max_upload_timeout_secs),
        None => server.max_upload_timeout_secs,
    };
    let deadline = Instant::now() + Duration::from_secs(deadline_secs);

    let content_type = content_type_header(&headers);
    let forwarded = forward_headers(&headers);
    let declared_length: Option<u64> = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    // Small bodies are buffered and replayed; everything else is streamed
    // through per-peer pipes with the digest tap in front.
    let buffer = declared_length.is_some_and(|len| len <= BUFFERED_UPLOAD_MAX_BYTES);
    let (fanout, digest, body_bytes) = if buffer {
        let bytes = tokio::time::timeout_at(
            deadline,
            axum::body::to_bytes(body, BUFFERED_UPLOAD_MAX_BYTES as usize),
        )
        .await
        .map_err(|_| GatewayError::Internal("upload deadline exceeded".to_string()))?
        .map_err(|e| GatewayError::BadRequest(format!("failed to read request body: {e}")))?;

        let digest = hex::encode(Sha256::digest(&bytes));
        let size = bytes.len() as u64;
        let fanout = state
            .manager
            .upload_buffered(bytes, content_type.clone(), forwarded, deadline)
            .await;
        (fanout, digest, size)
    } else {
        let hasher = Arc::new(Mutex::new(Sha256::new()));
        let counter = Arc::new(AtomicU64::new(0));
        let tap = hasher.clone();
        let tap_counter = counter.clone();
        let stream = body.into_data_stream().map(move |chunk| match chunk {
            Ok(chunk) => {
                tap.lock().update(&chunk);
                tap_counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Ok(chunk)
            }
            Err(error) => Err(std::io::Error::other(error.to_string())),
        });

        let fanout = tokio::time::timeout_at(
            deadline,
            state
                .manager
                .upload_streaming(stream, content_type.clone(), forwarded, deadline),
        )
        .await
        .map_err(|_| GatewayError::Internal("upload deadline exceeded".to_string()))?;

        // The streaming contract guarantees the body was fully drained, so
        // the tap has seen every byte.
        let digest = hex::encode(hasher.lock().clone().finalize());
        (fanout, digest, counter.load(Ordering::Relaxed))
    };

    record_fanout_stats(&state, &fanout, Operation::Upload);

    if let Err(quorum_error) = fanout.quorum(server.min_upload_servers) {
        warn!(
            hash = %digest,
            succeeded = fanout.successes().len(),
            required = server.min_upload_servers,
            "Upload quorum not met"
        );
        return Err(quorum_error);
    }

    // The x tag must name the digest the server actually computed
    if let Some(event) = &auth_event {
        event.require_x_tag(&digest)?;
    }

    state.cache.add(&digest, fanout.success_urls());

    let successes = fanout.successes();
    let representative = state
        .manager
        .select_outcome(&successes)
        .ok_or_else(|| GatewayError::Internal("no successful server to select".to_string()))?;

    state.metrics.upload_bytes.inc_by(body_bytes);
    state.metrics.record_request("upload", "ok");
    info!(
        hash = %digest,
        size_bytes = body_bytes,
        servers = successes.len(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Upload completed"
    );

    Ok(marshal_write_response(
        &state,
        &headers,
        representative,
        &successes,
        Some(&digest),
        content_type.as_deref(),
    ))
}

/// HEAD /upload: BUD-06 preflight. Client headers are forwarded to every
/// capable peer; acceptance requires the quorum count of 200s.
pub async fn upload_preflight(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    let preflight = state
        .manager
        .upload_preflight(forward_headers(&headers))
        .await?;
    let required = state.config.server.min_upload_servers;

    if let Err(quorum_error) = preflight.quorum(required) {
        debug!(
            accepted = preflight.accepted_count(),
            required,
            "Upload preflight rejected"
        );
        return Err(quorum_error);
    }

    debug!(
        accepted = preflight.accepted_count(),
        total = preflight.outcomes.len(),
        "Upload preflight accepted"
    );
    Ok(StatusCode::OK.into_response())
}

// ============================================================================
// Mirror
// ============================================================================

/// PUT /mirror: BUD-04. The body is a small JSON document referencing a
/// remote URL; it is buffered, then fanned out to mirror-capable peers.
pub async fn mirror_blob(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    state.metrics.record_request("mirror", "started");

    let auth_event = if state.verifier.enabled() {
        Some(
            state
                .verifier
                .verify(authorization_header(&headers), Verb::Upload)?,
        )
    } else {
        None
    };

    let bytes = axum::body::to_bytes(body, MIRROR_MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("failed to read request body: {e}")))?;

    // The x tag must name the digest of the blob being mirrored; the source
    // URL carries it when the origin is itself a Blossom server.
    if let Some(event) = &auth_event {
        if let Some(source_digest) = mirror_source_digest(&bytes) {
            event.require_x_tag(&source_digest)?;
        }
    }

    let content_type = content_type_header(&headers);
    let forwarded = forward_headers(&headers);
    let fanout = state
        .manager
        .mirror(bytes, content_type.clone(), forwarded)
        .await?;

    record_fanout_stats(&state, &fanout, Operation::Mirror);

    let required = state.config.server.min_upload_servers;
    if let Err(quorum_error) = fanout.quorum(required) {
        warn!(
            succeeded = fanout.successes().len(),
            required,
            "Mirror quorum not met"
        );
        return Err(quorum_error);
    }

    let successes = fanout.successes();
    let representative = state
        .manager
        .select_outcome(&successes)
        .ok_or_else(|| GatewayError::Internal("no successful server to select".to_string()))?;

    // Digest source order: the response's `hash`, then `sha256`
    let digest = serde_json::from_slice::<Value>(&representative.body)
        .ok()
        .and_then(|value| {
            ["hash", "sha256"].iter().find_map(|field| {
                value
                    .get(field)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
        });

    state.metrics.record_request("mirror", "ok");
    info!(
        hash = %digest.as_deref().unwrap_or("unknown"),
        servers = successes.len(),
        "Mirror completed"
    );

    Ok(marshal_write_response(
        &state,
        &headers,
        representative,
        &successes,
        digest.as_deref(),
        None,
    ))
}

// ============================================================================
// List
// ============================================================================

/// GET /list/{pubkey}: fan the catalog query out to every peer and answer
/// with the merged, deduplicated array.
pub async fn list_blobs(
    State(state): State<Arc<AppState>>,
    Path(pubkey): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    state.metrics.record_request("list", "started");

    if pubkey.is_empty() {
        return Err(GatewayError::BadRequest("pubkey required".to_string()));
    }

    if state.verifier.enabled() {
        state
            .verifier
            .verify(authorization_header(&headers), Verb::List)?;
    }

    let (merged, outcomes) = state.manager.list_merged(&pubkey).await;
    for outcome in &outcomes {
        if outcome.success {
            state.stats.record_success(&outcome.server_url, Operation::List);
        } else {
            state.stats.record_failure(&outcome.server_url, Operation::List);
        }
    }

    state.metrics.record_request("list", "ok");
    debug!(pubkey = %pubkey, items = merged.len(), "List merge complete");
    Ok((StatusCode::OK, Json(merged)).into_response())
}

// ============================================================================
// Blob routes: download redirect, HEAD proxy, delete
// ============================================================================

/// Resolve the peer set for a blob path: cache hit, or HEAD discovery
/// followed by cache admission.
async fn resolve_servers(state: &AppState, blob: &BlobPath) -> Result<Vec<String>> {
    if let Some(servers) = state.cache.get(&blob.digest) {
        if !servers.is_empty() {
            state.metrics.cache_hits.inc();
            return Ok(servers);
        }
    }
    state.metrics.cache_misses.inc();

    let found = state.manager.check_path(&blob.path).await;
    if found.is_empty() {
        return Err(GatewayError::NotFound);
    }
    let servers: Vec<String> = found.into_iter().map(|o| o.server_url).collect();
    state.cache.add(&blob.digest, servers.clone());
    Ok(servers)
}

/// GET /{digest}[.ext]: resolve which peers hold the blob and answer with a
/// 307 redirect to the selected one, extension preserved.
pub async fn download_blob(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response> {
    state.metrics.record_request("download", "started");
    let blob = parse_blob_path(&path)?;

    let servers = resolve_servers(&state, &blob).await?;
    let selected = state
        .manager
        .select_download_url(&servers)
        .ok_or(GatewayError::NotFound)?
        .clone();

    // Telemetry by design: the redirect is the success signal, the gateway
    // never observes the transfer itself
    state.stats.record_success(&selected, Operation::Download);
    state.metrics.download_redirects.inc();
    state.metrics.record_request("download", "ok");

    let location = format!("{selected}/{}", blob.path);
    debug!(hash = %blob.digest, location = %location, "Redirecting download");
    Ok((
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, location)],
    )
        .into_response())
}

/// HEAD /{digest}[.ext]: same discovery as GET, but the selected peer's HEAD
/// response (status and headers) is proxied unchanged.
pub async fn head_blob(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response> {
    let blob = parse_blob_path(&path)?;

    // On a cache miss the discovery responses already carry the headers we
    // need; on a hit a fresh HEAD is issued against the selected peer.
    if let Some(servers) = state.cache.get(&blob.digest) {
        if !servers.is_empty() {
            state.metrics.cache_hits.inc();
            let selected = state
                .manager
                .select_download_url(&servers)
                .ok_or(GatewayError::NotFound)?;
            let client = state
                .manager
                .client_for(selected)
                .ok_or_else(|| GatewayError::Internal(format!("no client for {selected}")))?;
            let deadline = Instant::now() + state.manager.timeout();
            let response = client.head(deadline, &blob.path).await?;
            return Ok(proxy_head_response(
                response.status().as_u16(),
                response.headers(),
            ));
        }
    }
    state.metrics.cache_misses.inc();

    let found = state.manager.check_path(&blob.path).await;
    if found.is_empty() {
        return Err(GatewayError::NotFound);
    }
    let servers: Vec<String> = found.iter().map(|o| o.server_url.clone()).collect();
    state.cache.add(&blob.digest, servers.clone());

    let selected = state
        .manager
        .select_download_url(&servers)
        .ok_or(GatewayError::NotFound)?;
    let outcome = found
        .iter()
        .find(|o| &o.server_url == selected)
        .ok_or_else(|| GatewayError::Internal("selected server missing from discovery".to_string()))?;

    Ok(proxy_head_response(200, &outcome.headers))
}

fn proxy_head_response(status: u16, upstream_headers: &HeaderMap) -> Response {
    let mut builder = axum::http::Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in upstream_headers {
        builder = builder.header(name.clone(), value.clone());
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// DELETE /{digest}: authenticate, fan the delete out to the peers known to
/// hold the blob (all peers on a cache miss), drop the cache entry when any
/// peer succeeded.
pub async fn delete_blob(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let blob = parse_blob_path(&path)?;

    if state.verifier.enabled() {
        let event = state
            .verifier
            .verify(authorization_header(&headers), Verb::Delete)?;
        event.require_x_tag(&blob.digest)?;
    }

    let servers = match state.cache.get(&blob.digest) {
        Some(servers) if !servers.is_empty() => servers,
        _ => state.manager.server_urls().to_vec(),
    };

    let forwarded = forward_headers(&headers);
    let outcomes = state
        .manager
        .delete_from(&servers, &blob.digest, forwarded)
        .await;

    let mut deleted = 0;
    for outcome in &outcomes {
        if outcome.success {
            deleted += 1;
            state.stats.record_success(&outcome.server_url, Operation::Delete);
        } else {
            state.stats.record_failure(&outcome.server_url, Operation::Delete);
        }
    }

    if deleted > 0 {
        state.cache.remove(&blob.digest);
        info!(hash = %blob.digest, deleted, total = outcomes.len(), "Blob deleted");
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        error!(hash = %blob.digest, servers = outcomes.len(), "Delete failed on all servers");
        Err(GatewayError::Internal(
            "delete failed on all servers".to_string(),
        ))
    }
}

// ============================================================================
// Observability
// ============================================================================

/// GET /health: 200 when healthy-server, memory, and task checks all pass,
/// 503 otherwise, with the breakdown in the body.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let report = state.health.report(state.manager.active_tasks());
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// Aggregate counters across every server, for the /stats body.
#[derive(Default, serde::Serialize)]
struct StatsTotals {
    uploads_success: u64,
    uploads_failure: u64,
    downloads: u64,
    mirrors_success: u64,
    mirrors_failure: u64,
    deletes_success: u64,
    deletes_failure: u64,
    lists_success: u64,
    lists_failure: u64,
}

/// GET /stats: per-server counters, totals, and process gauges.
pub async fn stats_report(State(state): State<Arc<AppState>>) -> Response {
    let servers = state.stats.snapshot();

    let mut totals = StatsTotals::default();
    for stats in servers.values() {
        totals.uploads_success += stats.uploads_success;
        totals.uploads_failure += stats.uploads_failure;
        totals.downloads += stats.downloads;
        totals.mirrors_success += stats.mirrors_success;
        totals.mirrors_failure += stats.mirrors_failure;
        totals.deletes_success += stats.deletes_success;
        totals.deletes_failure += stats.deletes_failure;
        totals.lists_success += stats.lists_success;
        totals.lists_failure += stats.lists_failure;
    }

    let memory_bytes = memory_stats::memory_stats()
        .map(|usage| usage.physical_mem as u64)
        .unwrap_or(0);

    let response = serde_json::json!({
        "servers": servers,
        "totals": totals,
        "memory": {
            "bytes": memory_bytes,
            "max": state.config.server.max_memory_bytes,
        },
        "tasks": {
            "count": state.manager.active_tasks(),
            "max": state.config.server.max_tasks,
        },
        "healthy_count": state.stats.healthy_count(),
        "total_servers": servers.len(),
    });

    (StatusCode::OK, Json(response)).into_response()
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics_export(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
        .into_response()
}
