//! Container filesystem provider.
//!
//! The build never runs application code; it only needs short-lived
//! filesystem-export and metadata operations from whatever engine hosts
//! the images. [`ContainerSource`] is that capability, and [`DockerCli`]
//! implements it by shelling out to the `docker` binary (located with
//! `which` before first use, every call bounded by a timeout).

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

use crate::error::EngineError;
use crate::process;

/// Image-config metadata recovered by inspection: the third precedence
/// tier for args/env/cwd, and the label map the label resolver reads.
#[derive(Debug, Clone, Default)]
pub struct ImageMetadata {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub labels: BTreeMap<String, String>,
}

/// Abstract engine capability consumed by the assembler and the output
/// converters. `Sync` so independent exports can fan out across threads.
pub trait ContainerSource: Sync {
    /// Create a (never started) container from an image, returning its id.
    fn create(&self, image: &str) -> Result<String, EngineError>;

    /// Export a container's filesystem as an uncompressed tar stream.
    fn export(&self, container: &str) -> Result<Vec<u8>, EngineError>;

    /// Remove a container created by [`ContainerSource::create`].
    fn remove(&self, container: &str) -> Result<(), EngineError>;

    /// Pull an image, optionally resolving it through content trust.
    fn pull(&self, image: &str, trusted: bool) -> Result<(), EngineError>;

    /// Inspect an image's config metadata.
    fn inspect(&self, image: &str) -> Result<ImageMetadata, EngineError>;

    /// Run a converter image with `input` on stdin, capturing stdout.
    fn run(&self, image: &str, input: &[u8], args: &[String]) -> Result<Vec<u8>, EngineError>;
}

/// `docker`-CLI-backed [`ContainerSource`].
pub struct DockerCli {
    binary: PathBuf,
    timeout: Duration,
}

/// Shape of `docker image inspect --format {{json .Config}}`.
#[derive(Debug, Default, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Entrypoint")]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd")]
    cmd: Option<Vec<String>>,
    #[serde(rename = "Env")]
    env: Option<Vec<String>>,
    #[serde(rename = "WorkingDir")]
    working_dir: Option<String>,
    #[serde(rename = "Labels")]
    labels: Option<BTreeMap<String, String>>,
}

impl DockerCli {
    /// Default bound on any single engine call. Pulls of large images
    /// dominate; everything else finishes far inside it.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    pub fn new() -> Result<Self, EngineError> {
        let binary = which::which("docker")
            .map_err(|e| EngineError::Unavailable(format!("docker not found in PATH: {e}")))?;
        Ok(Self {
            binary,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn not_found(stderr: &str) -> bool {
        stderr.contains("No such image") || stderr.contains("Unable to find image")
    }
}

impl ContainerSource for DockerCli {
    fn create(&self, image: &str) -> Result<String, EngineError> {
        debug!(image, "docker create");
        // The container is never started, so any command string will do.
        let output = process::run(
            self.command().args(["create", image, "/dev/null"]),
            None,
            self.timeout,
            &format!("docker create {image}"),
        )?;
        if !output.success {
            if Self::not_found(&output.stderr) {
                return Err(EngineError::ImageNotFound(image.to_string()));
            }
            return Err(EngineError::CommandFailed {
                context: format!("docker create {image}"),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn export(&self, container: &str) -> Result<Vec<u8>, EngineError> {
        debug!(container, "docker export");
        let output = process::run_checked(
            self.command().args(["export", container]),
            None,
            self.timeout,
            &format!("docker export {container}"),
        )?;
        Ok(output.stdout)
    }

    fn remove(&self, container: &str) -> Result<(), EngineError> {
        debug!(container, "docker rm");
        process::run_checked(
            self.command().args(["rm", container]),
            None,
            self.timeout,
            &format!("docker rm {container}"),
        )?;
        Ok(())
    }

    fn pull(&self, image: &str, trusted: bool) -> Result<(), EngineError> {
        debug!(image, trusted, "docker pull");
        let mut command = self.command();
        command.args(["pull", image]);
        // Trust resolution is the engine's business: with content trust
        // enabled the daemon resolves the reference to a signed digest.
        command.env(
            "DOCKER_CONTENT_TRUST",
            if trusted { "1" } else { "" },
        );
        process::run_checked(&mut command, None, self.timeout, &format!("docker pull {image}"))?;
        Ok(())
    }

    fn inspect(&self, image: &str) -> Result<ImageMetadata, EngineError> {
        debug!(image, "docker image inspect");
        let output = process::run(
            self.command()
                .args(["image", "inspect", "--format", "{{json .Config}}", image]),
            None,
            self.timeout,
            &format!("docker image inspect {image}"),
        )?;
        if !output.success {
            if Self::not_found(&output.stderr) || output.stderr.contains("no such image") {
                return Err(EngineError::ImageNotFound(image.to_string()));
            }
            return Err(EngineError::CommandFailed {
                context: format!("docker image inspect {image}"),
                message: output.stderr.trim().to_string(),
            });
        }
        let config: InspectConfig =
            serde_json::from_slice(&output.stdout).map_err(|e| EngineError::CommandFailed {
                context: format!("docker image inspect {image}"),
                message: format!("unparseable inspect output: {e}"),
            })?;
        Ok(ImageMetadata {
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            working_dir: config.working_dir.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
        })
    }

    fn run(&self, image: &str, input: &[u8], args: &[String]) -> Result<Vec<u8>, EngineError> {
        debug!(image, ?args, "docker run");
        let mut command = self.command();
        command.args(["run", "--rm", "-i", image]);
        command.args(args);
        let output = process::run_checked(
            &mut command,
            Some(input),
            self.timeout,
            &format!("docker run {image}"),
        )?;
        Ok(output.stdout)
    }
}
