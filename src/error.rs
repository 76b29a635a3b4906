//! Error taxonomy for the build pipeline.
//!
//! Every failure aborts the build step that produced it and names the
//! offending entity; there is no partial-success mode. Pipeline-level
//! callers wrap these in `anyhow` for context.

use thiserror::Error;

/// Failures surfaced by the container engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine does not know the image (candidate for a pull retry).
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The engine binary itself could not be located or started.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    /// An engine command ran and failed.
    #[error("{context}: {message}")]
    CommandFailed { context: String, message: String },

    /// An engine command exceeded its deadline and was killed.
    #[error("{context}: timed out after {seconds}s")]
    Timeout { context: String, seconds: u64 },
}

/// Failures in the config -> archive -> output pipeline.
#[derive(Error, Debug)]
pub enum BuildError {
    /// The input was not syntactically valid YAML.
    #[error("malformed configuration: {0}")]
    Parse(String),

    /// The input parsed but does not match the closed schema.
    #[error("configuration rejected: {0}")]
    Schema(String),

    /// The config label embedded in an image is present but not valid JSON.
    #[error("image {image}: embedded config label is not valid JSON: {reason}")]
    LabelDecode { image: String, reason: String },

    /// A capability string from YAML or a label is not in the known set.
    #[error("image {image}: unknown capability {capability:?}")]
    InvalidCapability { image: String, capability: String },

    /// An image could not be resolved even after a pull retry.
    #[error("could not resolve image {image}: {reason}")]
    ImageResolution { image: String, reason: String },

    /// A requested output format has no registered converter.
    #[error("unknown output format {0}")]
    UnsupportedFormat(String),

    /// Read/write failure while streaming an archive.
    #[error("archive I/O: {0}")]
    ArchiveIo(#[from] std::io::Error),

    /// Any other engine failure, passed through.
    #[error(transparent)]
    Engine(#[from] EngineError),
}
