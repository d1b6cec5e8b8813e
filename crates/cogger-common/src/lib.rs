//! Cogger Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging, and checksum utilities for the cogger
//! workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the [`CoggerError`] type and [`Result`] alias shared
//!   by all workspace members
//! - **Logging**: centralized tracing setup with console/file/JSON targets
//! - **Checksums**: SHA-256 helpers for artifact integrity
//!
//! # Example
//!
//! ```no_run
//! use cogger_common::checksum::Checksum;
//! use cogger_common::Result;
//!
//! fn verify(path: &str) -> Result<()> {
//!     let checksum = Checksum::from_file(path)?;
//!     tracing::info!(%checksum, "artifact checksum");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CoggerError, Result};
