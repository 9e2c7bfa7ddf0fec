//! apex-autoheal library crate
//!
//! Turns a reported Apex runtime exception into a reviewed fix: the stack trace
//! is diagnosed, a fix is negotiated with a text generator, the result is
//! committed to a fresh branch, and a pull request plus tracking ticket are
//! opened. Every run ends by recording its outcome on the originating record.

pub mod analyzer;
pub mod config;
pub mod error;
pub mod git_ops;
pub mod github;
pub mod jira;
pub mod layout;
pub mod llm;
pub mod logging;
pub mod negotiator;
pub mod pipeline;
pub mod salesforce;
pub mod server;
pub mod source;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod util;

pub use error::{RemediationError, SourceError};
pub use pipeline::{ExceptionReport, RemediationPipeline, RemediationStatus};
