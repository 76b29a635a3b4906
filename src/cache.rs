//! Content-addressed cache for bootstrap artifacts.
//!
//! Some output converters boot a helper VM image, which itself is built
//! from an embedded YAML specification. That build is expensive, so its
//! kernel/initramfs/cmdline triple is cached under a file-name stem
//! derived from the sha256 of the defining YAML:
//!
//! ```text
//! <root>/linuxkit/<name>-<hex>-kernel
//! <root>/linuxkit/<name>-<hex>-initrd.img
//! <root>/linuxkit/<name>-<hex>-cmdline
//! ```
//!
//! All three files existing constitutes a hit; a partial triple never
//! does. The check-then-build sequence takes a per-key advisory file
//! lock so concurrent builds of the same key serialize instead of racing
//! on file creation.

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::build;
use crate::config::{apply_overrides, Config};
use crate::engine::ContainerSource;
use crate::initrd;

/// The specification for the `mkimage` helper: a minimal system that
/// reads a tarball of kernel/initrd/cmdline from a disk and writes a
/// bootable disk image. Keyed into the cache by these exact bytes.
pub const MKIMAGE_YAML: &str = r#"
kernel:
  image: "linuxkit/kernel:4.9.x"
  cmdline: "console=ttyS0"
init:
  - linuxkit/init:14a38303ee9dcb4541c00e2b87404befc1ba2083
  - linuxkit/runc:a0f2894e50bacbd1ff82be41edff8b8e06e0b161
  - linuxkit/containerd:389e67c3c1fc009c1315f32b3e2b6659691a3ad4
onboot:
  - name: mkimage
    image: "linuxkit/mkimage:5ad60299be03008f29c5caec3c5ea4ac0387aae6"
  - name: poweroff
    image: "linuxkit/poweroff:a8f1e4ad8d459f1fdaad9e4b007512cb3b504ae8"
trust:
  org:
    - linuxkit
"#;

/// Look up the embedded definition for a named bootstrap image.
pub fn bootstrap_yaml(name: &str) -> Option<&'static str> {
    match name {
        "mkimage" => Some(MKIMAGE_YAML),
        _ => None,
    }
}

/// The three cached files for one bootstrap artifact.
#[derive(Debug, Clone)]
pub struct BootstrapArtifact {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub cmdline: PathBuf,
}

impl BootstrapArtifact {
    fn exists(&self) -> bool {
        self.kernel.exists() && self.initrd.exists() && self.cmdline.exists()
    }
}

/// Explicit cache handle rooted at a directory, passed through the
/// pipeline instead of living in ambient state.
#[derive(Debug, Clone)]
pub struct BuildCache {
    root: PathBuf,
}

impl BuildCache {
    /// Open (and create if needed) a cache rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let cache = Self {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(cache.artifact_dir())?;
        fs::create_dir_all(cache.locks_dir())?;
        fs::create_dir_all(cache.tmp_dir())?;
        Ok(cache)
    }

    fn artifact_dir(&self) -> PathBuf {
        self.root.join("linuxkit")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Scratch space for converter invocations; contents are per-call
    /// temp dirs that remove themselves.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// The file-name stem for an artifact: `<name>-<sha256 of yaml>`.
    pub fn artifact_stem(&self, name: &str, yaml: &str) -> PathBuf {
        let hash = Sha256::digest(yaml.as_bytes());
        self.artifact_dir()
            .join(format!("{}-{:x}", name, hash))
    }

    /// The triple of paths an artifact occupies (whether built or not).
    pub fn artifact_paths(&self, name: &str, yaml: &str) -> BootstrapArtifact {
        let stem = self.artifact_stem(name, yaml);
        let suffixed = |suffix: &str| {
            let mut path = stem.clone().into_os_string();
            path.push(suffix);
            PathBuf::from(path)
        };
        BootstrapArtifact {
            kernel: suffixed("-kernel"),
            initrd: suffixed("-initrd.img"),
            cmdline: suffixed("-cmdline"),
        }
    }

    /// Ensure the artifact defined by `yaml` exists, building it with
    /// the full pipeline on a miss. Identical bytes always hit the same
    /// key, so the expensive build runs at most once per definition.
    pub fn ensure_artifact(
        &self,
        name: &str,
        yaml: &str,
        engine: &dyn ContainerSource,
        pull: bool,
    ) -> Result<BootstrapArtifact> {
        let paths = self.artifact_paths(name, yaml);
        if paths.exists() {
            return Ok(paths);
        }

        let _lock = self.lock_key(name, yaml)?;
        // Another process may have built it while we waited on the lock.
        if paths.exists() {
            return Ok(paths);
        }

        info!(name, "building bootstrap image to generate output formats");
        let config: Config = Config::from_yaml(yaml.as_bytes())
            .with_context(|| format!("Failed to parse bootstrap definition {name:?}"))?;
        let config = apply_overrides(config);

        let mut image = Vec::new();
        build::build_image(&config, &mut image, engine, pull)
            .with_context(|| format!("Failed to build bootstrap image {name:?}"))?;
        let (kernel, initrd, cmdline) = initrd::split_archive(&image)
            .with_context(|| format!("Failed to convert bootstrap image {name:?} to initrd"))?;

        fs::write(&paths.kernel, &kernel)
            .with_context(|| format!("Failed to write {}", paths.kernel.display()))?;
        fs::write(&paths.initrd, &initrd)
            .with_context(|| format!("Failed to write {}", paths.initrd.display()))?;
        fs::write(&paths.cmdline, cmdline.as_bytes())
            .with_context(|| format!("Failed to write {}", paths.cmdline.display()))?;

        Ok(paths)
    }

    /// Blocking per-key lock. Waiting is deliberate: a second builder of
    /// the same key should find a hit once the first finishes, not fail.
    fn lock_key(&self, name: &str, yaml: &str) -> Result<KeyLock> {
        let hash = Sha256::digest(yaml.as_bytes());
        let lock_path = self.locks_dir().join(format!("{}-{:x}.lock", name, hash));
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file {}", lock_path.display()))?;
        lock_file
            .lock_exclusive()
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
        Ok(KeyLock { _file: lock_file })
    }
}

/// Held for the duration of a check-then-build; the advisory lock drops
/// with the file handle.
struct KeyLock {
    _file: File,
}
