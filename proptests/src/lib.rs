//! Property-based tests for the Blossom gateway.
//!
//! This crate contains proptest-based property tests for the gateway's pure
//! components: the hash cache, peer stats, selection strategies, quorum
//! aggregation, and the catalog merge.
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all property tests
//! cargo test -p proptests
//!
//! # Run with more test cases (slower but more thorough)
//! PROPTEST_CASES=10000 cargo test -p proptests
//!
//! # Run a specific test module
//! cargo test -p proptests cache
//! ```
//!
//! ## Test Categories
//!
//! - **Cache tests**: digest canonicalisation, size bound, peer-list dedup
//! - **Stats tests**: counter monotonicity, consecutive-failure reset, health transitions
//! - **Selector tests**: round-robin stepping, priority minimum, health-based grouping
//! - **Quorum tests**: verdict determinism, minimum-status aggregation
//! - **Merge tests**: single-catalog identity, url-tag dedup, digest grouping

// Re-export the gateway for use in test modules
pub use blossom_gateway;

/// Shared test strategies and helpers.
pub mod strategies;

// Test modules
#[cfg(test)]
mod cache;
#[cfg(test)]
mod merge;
#[cfg(test)]
mod quorum;
#[cfg(test)]
mod select;
#[cfg(test)]
mod stats;
