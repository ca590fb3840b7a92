//! ImageIntact core: a verified multi-destination backup engine for
//! photographers' source trees.
//!
//! Replicates a source directory to one or more destination roots,
//! verifying every copied byte against a content digest, never silently
//! overwriting a diverged destination file, and publishing progress and
//! failures across all destinations in parallel.

pub mod config;
pub mod coordinator;
pub mod duplicate;
pub mod error;
pub mod eventlog;
pub mod fileops;
pub mod hash;
pub mod logging;
pub mod manifest_writer;
pub mod power;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod scanner;
pub mod shutdown;

pub use config::Config;
pub use error::CoreError;
pub type Result<T> = std::result::Result<T, CoreError>;
