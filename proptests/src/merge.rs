//! Property-based tests for the catalog merge.
//!
//! - Merging a single peer's catalog is the identity on items, modulo the
//!   addition of nip94 tags
//! - Duplicate items never produce duplicate url tags
//! - Items sharing a digest across peers collapse to one output carrying
//!   every distinct contributing URL

use crate::strategies::*;
use proptest::prelude::*;
use serde_json::{Value, json};

fn item_strategy() -> impl Strategy<Value = Value> {
    (
        digest_strategy(),
        0u64..1_000_000,
        prop::option::of("[a-z]{3,5}/[a-z]{3,5}"),
    )
        .prop_map(|(digest, size, mime)| {
            let mut item = json!({
                "sha256": digest,
                "size": size,
                "url": format!("https://origin.example/{digest}"),
            });
            if let Some(mime) = mime {
                item["type"] = json!(mime);
            }
            item
        })
}

proptest! {
    #[test]
    fn prop_single_catalog_identity(items in prop::collection::vec(item_strategy(), 0..10)) {
        let urls = vec!["https://p1.example".to_string()];
        let manager = manager_for(&urls, "round_robin");
        let merged =
            manager.merge_lists(vec![("https://p1.example".to_string(), items.clone())]);

        // One output per distinct digest
        let mut digests: Vec<&str> =
            items.iter().filter_map(|i| i["sha256"].as_str()).collect();
        digests.sort();
        digests.dedup();
        prop_assert_eq!(merged.len(), digests.len());

        for out in &merged {
            // The output is one of the input items, fields intact
            let matches = items.iter().any(|i| {
                i["sha256"] == out["sha256"]
                    && i["size"] == out["size"]
                    && i["url"] == out["url"]
            });
            prop_assert!(matches, "merged item does not match any input");

            let tags = out["nip94"].as_array().unwrap();
            let x_count = tags.iter().filter(|t| t[0].as_str() == Some("x")).count();
            prop_assert_eq!(x_count, 1);

            let m_count = tags.iter().filter(|t| t[0].as_str() == Some("m")).count();
            prop_assert!(m_count <= 1);

            let url_tags: Vec<&str> = tags
                .iter()
                .filter(|t| t[0].as_str() == Some("url"))
                .filter_map(|t| t[1].as_str())
                .collect();
            let mut deduped = url_tags.clone();
            deduped.sort();
            deduped.dedup();
            prop_assert_eq!(url_tags.len(), deduped.len(), "duplicate url tags");
        }
    }

    #[test]
    fn prop_multi_peer_grouping(digest in digest_strategy(), peer_count in 1usize..5) {
        let urls: Vec<String> =
            (0..peer_count).map(|i| format!("https://p{i}.example")).collect();
        let manager = manager_for(&urls, "round_robin");

        let per_server: Vec<(String, Vec<Value>)> = urls
            .iter()
            .map(|u| {
                (
                    u.clone(),
                    vec![json!({"sha256": digest, "url": format!("{u}/{digest}")})],
                )
            })
            .collect();

        let merged = manager.merge_lists(per_server);
        prop_assert_eq!(merged.len(), 1);

        let tags = merged[0]["nip94"].as_array().unwrap();
        let url_tags: Vec<&str> = tags
            .iter()
            .filter(|t| t[0].as_str() == Some("url"))
            .filter_map(|t| t[1].as_str())
            .collect();
        prop_assert_eq!(url_tags.len(), peer_count);
        for u in &urls {
            let expected = format!("{u}/{digest}");
            prop_assert!(url_tags.contains(&expected.as_str()));
        }
    }
}
