//! pagevault - archive loading and cache engine for very large image
//! archives.
//!
//! Built for the comic/manga reading case: archives past a gigabyte with
//! thousands of pages, where opening must not block on a full scan and solid
//! compression must not make page turns cost a full decompression. The engine
//! streams an index progressively, persists it keyed by archive fingerprint,
//! keeps extracted pages in a byte-budgeted pool that spills to temp files,
//! and pre-extracts solid archives in the background with a resumable
//! checkpoint.
//!
//! Entry point is [`session::Engine`].

pub mod config;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod index;
pub mod jobs;
pub mod pool;
pub mod reader;
pub mod session;

#[cfg(test)]
pub mod testutil;

pub use config::{BudgetSpec, EngineConfig};
pub use error::{EngineError, Result};
pub use session::{Engine, OpenSummary};
