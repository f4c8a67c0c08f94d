//! Minimal HTML status page served at `GET /`.

use crate::state::AppState;
use axum::extract::State;
use axum::response::Html;
use std::sync::Arc;

pub async fn home(State(state): State<Arc<AppState>>) -> Html<String> {
    let snapshot = state.stats.snapshot();
    let report = state.health.report(state.manager.active_tasks());

    let mut rows = String::new();
    for url in state.manager.server_urls() {
        let (healthy, uploads, downloads) = snapshot
            .get(url)
            .map(|s| (s.is_healthy, s.uploads_success, s.downloads))
            .unwrap_or((true, 0, 0));
        let badge = if healthy { "ok" } else { "unhealthy" };
        rows.push_str(&format!(
            "<tr><td>{url}</td><td class=\"{badge}\">{badge}</td>\
             <td>{uploads}</td><td>{downloads}</td></tr>\n"
        ));
    }

    let page = format!(
        r#"<!DOCTYPE html>
<html>
<head>
<title>Blossom Gateway</title>
<style>
  body {{ font-family: sans-serif; margin: 2em; color: #222; }}
  table {{ border-collapse: collapse; }}
  td, th {{ border: 1px solid #ccc; padding: 0.4em 0.8em; text-align: left; }}
  .ok {{ color: #2a7a2a; }}
  .unhealthy {{ color: #a33; }}
</style>
</head>
<body>
<h1>Blossom Gateway</h1>
<p>Fan-out proxy over {server_count} upstream servers
({healthy_count} healthy, quorum {quorum}).</p>
<table>
<tr><th>Server</th><th>Status</th><th>Uploads</th><th>Redirects</th></tr>
{rows}
</table>
<p><a href="/health">health</a> &middot; <a href="/stats">stats</a>
&middot; <a href="/metrics">metrics</a></p>
</body>
</html>
"#,
        server_count = state.manager.server_urls().len(),
        healthy_count = report.healthy_count,
        quorum = state.manager.min_upload_servers(),
    );

    Html(page)
}
