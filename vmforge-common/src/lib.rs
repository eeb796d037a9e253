//! # vmforge Common
//!
//! Shared utilities for the vmforge crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use vmforge_common::{init_logging, TimedOperation};
//!
//! init_logging("info").unwrap();
//!
//! let op = TimedOperation::start("clone", "web-01");
//! // ... provision the VM ...
//! op.finish();
//! ```

pub mod logging;

pub use logging::{
    init_logging,
    init_logging_json,
    TimedOperation,
};
