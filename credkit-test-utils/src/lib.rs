//! Test utilities shared across the credkit workspace
//!
//! This crate provides common testing infrastructure including:
//! - Isolated helper environments for subprocess tests ([`HelperTestEnv`])
//! - Builders for `key=value` request text ([`wire`])
//!
//! The clippy dead_code lint is disabled for this crate because test utilities
//! may not be used by all tests, and the compiler cannot detect usage across
//! crate boundaries in development dependencies.

#![allow(dead_code)]

pub mod env;
pub mod wire;

// Re-export commonly used items
pub use env::HelperTestEnv;
pub use wire::request;
