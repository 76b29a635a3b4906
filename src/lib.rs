//! Builder for minimal immutable Linux system images.
//!
//! A single declarative YAML file names a kernel, a set of init-layer
//! images, one-shot boot containers, long-running services and extra
//! files. This crate turns that description into a composite root
//! filesystem archive and then into bootable output formats:
//!
//! - **Configuration** - Closed-schema YAML parsing with image overrides
//! - **Spec synthesis** - Per-container OCI runtime specs merged from
//!   YAML, embedded image labels and image metadata
//! - **Assembly** - Filtered container exports streamed into one tar,
//!   with onboot/service bundles laid out for boot-order execution
//! - **Outputs** - kernel+initrd splitting, ISO/cloud converters and
//!   VM-written disk images, with a content-addressed bootstrap cache
//!
//! # Architecture
//!
//! ```text
//! YAML ──> config ──> build ──┬──> tarball (per-image export + filter)
//!                             └──> oci (runtime spec per container)
//!                  composite tar
//!                       │
//!                    output ──┬──> initrd (kernel/cpio/cmdline split)
//!                             ├──> conversion containers (engine.run)
//!                             └──> VM disk writer (cache bootstrap)
//! ```
//!
//! All engine interaction goes through the [`engine::ContainerSource`]
//! trait; the tests drive the whole pipeline against an in-memory fake.

pub mod build;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod initrd;
pub mod oci;
pub mod output;
pub mod process;
pub mod tarball;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{apply_overrides, Config};
pub use engine::{ContainerSource, DockerCli};
pub use error::{BuildError, EngineError};
