//! Integration test entry point for ddl-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod federation;
mod oidc;
