//! Integration test crate for the Trellis overlay.
//!
//! This crate has no library code. It only contains integration tests that
//! run real nodes over loopback UDP across multiple workspace crates.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p trellis-integration-tests -- --ignored
//! ```
