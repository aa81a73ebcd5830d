//! Integration test entry point for pylon-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod mesh;
