//! Shared proptest strategies and helpers.

use blossom_gateway::config::{Config, ServerConfig, UpstreamServer};
use blossom_gateway::upstream::Manager;
use proptest::prelude::*;

/// Generate a valid 64-character lowercase hex digest.
pub fn digest_strategy() -> impl Strategy<Value = String> {
    "[a-f0-9]{64}"
}

/// Generate a blob path: a digest with an optional extension.
pub fn blob_path_strategy() -> impl Strategy<Value = String> {
    (digest_strategy(), prop::option::of("[a-z0-9]{1,10}")).prop_map(|(digest, ext)| match ext {
        Some(ext) => format!("{digest}.{ext}"),
        None => digest,
    })
}

/// Generate a server URL from a small pool so collisions are common.
pub fn server_url_strategy() -> impl Strategy<Value = String> {
    (1u8..=12).prop_map(|n| format!("https://peer{n}.example"))
}

/// Generate a set of distinct server URLs.
pub fn server_set_strategy(max: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(1u8..=12, 1..=max).prop_map(|set| {
        set.into_iter()
            .map(|n| format!("https://peer{n}.example"))
            .collect()
    })
}

/// Generate an upstream HTTP failure status.
pub fn failure_status_strategy() -> impl Strategy<Value = u16> {
    400u16..=599
}

/// Build a manager over the given server URLs with the given strategy, for
/// exercising selection and merge logic (no requests are ever sent).
pub fn manager_for(urls: &[String], strategy: &str) -> Manager {
    let config = Config {
        upstream_servers: urls
            .iter()
            .map(|url| UpstreamServer {
                url: url.clone(),
                alternative_address: None,
                priority: 0,
                supports_mirror: false,
                supports_upload_head: false,
            })
            .collect(),
        server: ServerConfig {
            redirect_strategy: strategy.to_string(),
            ..ServerConfig::default()
        },
    };
    Manager::new(&config, reqwest::Client::new(), None).expect("manager construction")
}
