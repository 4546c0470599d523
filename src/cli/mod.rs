//! Command line interface support
//!
//! The binary in `main.rs` parses arguments; the handlers live in
//! [`commands`] so they can be exercised from tests.

pub mod commands;
pub mod error;

pub use error::CliError;
