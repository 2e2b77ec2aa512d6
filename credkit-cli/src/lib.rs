//! # credkit CLI Library
//!
//! Command surface of the `git-credential-credkit` helper: argument parsing,
//! configuration overrides and the stdin/stdout plumbing around
//! [`credkit_core::HelperService`].

pub mod cli;
pub mod consts;
