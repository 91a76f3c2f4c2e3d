//! Configuration module
//!
//! Handles building, loading and validating server configuration.

mod server;

pub use server::*;
