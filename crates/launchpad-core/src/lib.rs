//! Shared plumbing for the launchpad deployment pipeline.
//!
//! The pipeline turns a source repository URL into a publicly reachable
//! static site in three stages:
//!
//! ```text
//! ┌──────────┐  <name>.zip   ┌──────────┐ <name>-build.zip ┌──────────┐
//! │  Ingest  │──────────────▶│  Build   │─────────────────▶│ Deliver  │──▶ public URL
//! └──────────┘               └──────────┘                  └──────────┘
//!        \_____________ artifact store (bucket) _____________/
//! ```
//!
//! Stages never pass artifacts to each other directly. Each one reconstructs
//! the object key from the repository name. This crate provides the pieces
//! they share:
//! - [`types`]: validated names, URLs and artifact keys
//! - [`error`]: the failure taxonomy
//! - [`storage`]: the artifact store
//! - [`archive`]: zip packing and safe extraction
//! - [`process`]: the injectable process runner
//! - [`scratch`]: scratch-directory ownership and path confinement
//! - [`toolchain`]: dependency install, build and output discovery

pub mod archive;
pub mod config;
pub mod error;
pub mod process;
pub mod protocol;
pub mod scratch;
pub mod serve;
pub mod storage;
pub mod toolchain;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{ErrorKind, PipelineError, PipelineResult, ToolchainStep};
pub use process::{CommandOutput, CommandSpec, ProcessHandle, ProcessRunner, TokioProcessRunner};
pub use scratch::{resolve_within, Scratch, ScopedPath};
pub use storage::{ArtifactStore, ObjectArtifactStore, StorageConfig, ZIP_CONTENT_TYPE};
pub use toolchain::{Toolchain, ToolchainConfig};
pub use types::{ArtifactKey, BuildJob, BuildOutcome, RepositoryName, SourceUrl, TemplateKind};
