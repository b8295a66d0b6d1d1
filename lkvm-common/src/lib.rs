//! # lkvm Common
//!
//! Shared utilities for the lkvm client crates.
//!
//! ## Logging
//!
//! ```rust
//! use lkvm_common::{init_logging, LogFormat};
//!
//! // Initialize with level; RUST_LOG takes precedence when set
//! let _ = init_logging("info", LogFormat::Pretty);
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_pretty, LogFormat};
