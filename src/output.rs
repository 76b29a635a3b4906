//! Output dispatch: mapping logical format names to converters.
//!
//! The registry is a fixed table of tagged converter implementations.
//! The whole requested set is validated (and each format's prerequisite
//! ensured) before any converter runs, so a batch with one bad name
//! never produces partial output. The converters themselves are external
//! collaborators: either a conversion container fed the archive on stdin,
//! or a VM-based disk writer driven with the cached bootstrap artifact.

use anyhow::{bail, Context, Result};
use std::fs;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{bootstrap_yaml, BuildCache};
use crate::engine::ContainerSource;
use crate::error::BuildError;
use crate::initrd;
use crate::process;

// Conversion container images, pinned by digest.
const BIOS: &str = "linuxkit/mkimage-iso-bios:165b051322578cb0c2a4f16253b20f7d2797a502@sha256:2c06478b389e381051b5c95d51565488133fcf20f217e232c00149f3b997ac7a";
const EFI: &str = "linuxkit/mkimage-iso-efi:dc12bc6827f84334b02d1c70599acf80b840c126@sha256:2a3ae4b83ec548a98ef28f3092c55fafbad198b299491b74f068b31a0fc849f4";
const GCP: &str = "linuxkit/mkimage-gcp:d1883809d212ce048f60beb0308a4d2b14c256af@sha256:d9571a557e4b82a944f12082cd50987d3726385b5458846cbae89ea9bd694c85";
const VHD: &str = "linuxkit/mkimage-vhd:2a31f2bc91c1d247160570bd17868075e6c0009a@sha256:2035d0f486f4839848b4268b029e3a79cb353a8f745a42589923b3f923626597";
const VMDK: &str = "linuxkit/mkimage-vmdk:df02a4fabd87a82209fbbacebde58c4440d2daf0@sha256:70ac78291214f4ef1dbe229b9042d7cff4106a1f1f92249ae8101d3b53dfa9e7";
const DYNAMIC_VHD: &str = "linuxkit/mkimage-dynamic-vhd:8553167d10c3e8d8603b2566d01bdc0cf5908fa5@sha256:3f613029c461a95e850b8363a76bd31e0a86a6a4c2291c23448c68782cbb088e";

/// Name of the VM runner binary used by the disk-writing formats.
const VM_RUNNER: &str = "linuxkit";

/// Deadline for a single converter invocation.
const CONVERT_TIMEOUT: Duration = Duration::from_secs(1800);

/// What a conversion container reads on stdin.
#[derive(Debug, Clone, Copy)]
enum Input {
    /// The whole composite archive.
    FullArchive,
    /// The kernel/initrd.img/cmdline three-entry tarball.
    KernelInitrdTar,
}

/// Tagged converter implementations.
#[derive(Debug, Clone, Copy)]
enum Converter {
    /// Write the split triple as three sibling files.
    KernelInitrd,
    /// Write the split triple as a single tarball.
    TarKernelInitrd,
    /// Feed a conversion container and write its stdout.
    Container {
        image: &'static str,
        suffix: &'static str,
        input: Input,
    },
    /// Boot the bootstrap VM image to write a sized disk.
    VmDisk {
        format: &'static str,
        suffix: &'static str,
    },
}

struct Format {
    name: &'static str,
    /// Named bootstrap artifact this format needs, if any.
    prerequisite: Option<&'static str>,
    converter: Converter,
}

const FORMATS: &[Format] = &[
    Format {
        name: "kernel+initrd",
        prerequisite: None,
        converter: Converter::KernelInitrd,
    },
    Format {
        name: "tar-kernel-initrd",
        prerequisite: None,
        converter: Converter::TarKernelInitrd,
    },
    Format {
        name: "iso-bios",
        prerequisite: None,
        converter: Converter::Container {
            image: BIOS,
            suffix: ".iso",
            input: Input::FullArchive,
        },
    },
    Format {
        name: "iso-efi",
        prerequisite: None,
        converter: Converter::Container {
            image: EFI,
            suffix: "-efi.iso",
            input: Input::FullArchive,
        },
    },
    Format {
        name: "gcp",
        prerequisite: None,
        converter: Converter::Container {
            image: GCP,
            suffix: ".img.tar.gz",
            input: Input::KernelInitrdTar,
        },
    },
    Format {
        name: "vhd",
        prerequisite: None,
        converter: Converter::Container {
            image: VHD,
            suffix: ".vhd",
            input: Input::KernelInitrdTar,
        },
    },
    Format {
        name: "dynamic-vhd",
        prerequisite: None,
        converter: Converter::Container {
            image: DYNAMIC_VHD,
            suffix: ".vhd",
            input: Input::KernelInitrdTar,
        },
    },
    Format {
        name: "vmdk",
        prerequisite: None,
        converter: Converter::Container {
            image: VMDK,
            suffix: ".vmdk",
            input: Input::KernelInitrdTar,
        },
    },
    Format {
        name: "raw",
        prerequisite: Some("mkimage"),
        converter: Converter::VmDisk {
            format: "raw",
            suffix: ".raw",
        },
    },
    Format {
        name: "qcow2",
        prerequisite: Some("mkimage"),
        converter: Converter::VmDisk {
            format: "qcow2",
            suffix: ".qcow2",
        },
    },
];

fn lookup(name: &str) -> Result<&'static Format> {
    FORMATS
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| BuildError::UnsupportedFormat(name.to_string()).into())
}

/// Dispatches an assembled archive to the requested output converters.
pub struct OutputDispatcher<'a> {
    engine: &'a dyn ContainerSource,
    cache: &'a BuildCache,
    pull: bool,
}

impl<'a> OutputDispatcher<'a> {
    pub fn new(engine: &'a dyn ContainerSource, cache: &'a BuildCache, pull: bool) -> Self {
        Self {
            engine,
            cache,
            pull,
        }
    }

    /// Check every requested format and ensure its prerequisites.
    /// Called eagerly over the whole set before any converter runs.
    pub fn validate_formats(&self, formats: &[String]) -> Result<()> {
        debug!(?formats, "validating output formats");
        for name in formats {
            let format = lookup(name)?;
            if let Some(prerequisite) = format.prerequisite {
                let yaml = bootstrap_yaml(prerequisite).with_context(|| {
                    format!("Format {name} requires unknown bootstrap {prerequisite:?}")
                })?;
                self.cache
                    .ensure_artifact(prerequisite, yaml, self.engine, self.pull)
                    .with_context(|| format!("Failed to set up format type {name}"))?;
            }
        }
        Ok(())
    }

    /// Generate every requested format from the composite archive.
    /// `size_mb` bounds the disk formats; zero means the default.
    pub fn generate_outputs(
        &self,
        base: &str,
        image: &[u8],
        formats: &[String],
        size_mb: u32,
    ) -> Result<()> {
        self.validate_formats(formats)?;
        for name in formats {
            let format = lookup(name)?;
            self.generate(format, base, image, size_mb)
                .with_context(|| format!("Error writing {name} output"))?;
        }
        Ok(())
    }

    fn generate(&self, format: &Format, base: &str, image: &[u8], size_mb: u32) -> Result<()> {
        match format.converter {
            Converter::KernelInitrd => {
                let (kernel, initrd, cmdline) = initrd::split_archive(image)?;
                info!("  {base}-kernel {base}-initrd.img {base}-cmdline");
                fs::write(format!("{base}-kernel"), kernel)?;
                fs::write(format!("{base}-initrd.img"), initrd)?;
                fs::write(format!("{base}-cmdline"), cmdline.as_bytes())?;
            }
            Converter::TarKernelInitrd => {
                let (kernel, initrd, cmdline) = initrd::split_archive(image)?;
                let filename = format!("{base}-initrd.tar");
                info!("  {filename}");
                fs::write(filename, initrd::kernel_initrd_tar(&kernel, &initrd, &cmdline)?)?;
            }
            Converter::Container {
                image: converter,
                suffix,
                input,
            } => {
                let (stdin, args) = match input {
                    Input::FullArchive => (image.to_vec(), Vec::new()),
                    Input::KernelInitrdTar => {
                        let (kernel, initrd, cmdline) = initrd::split_archive(image)?;
                        let stdin = initrd::kernel_initrd_tar(&kernel, &initrd, &cmdline)?;
                        // Disk-image converters take the kernel command
                        // line as their argument.
                        (stdin, vec![cmdline])
                    }
                };
                let filename = format!("{base}{suffix}");
                info!("  {filename}");
                let produced = self.engine.run(converter, &stdin, &args)?;
                fs::write(filename, produced)?;
            }
            Converter::VmDisk {
                format: disk_format,
                suffix,
            } => {
                let prerequisite = format
                    .prerequisite
                    .context("disk format has no bootstrap image")?;
                self.vm_disk(prerequisite, disk_format, suffix, base, image, size_mb)?;
            }
        }
        Ok(())
    }

    fn vm_disk(
        &self,
        prerequisite: &str,
        disk_format: &str,
        suffix: &str,
        base: &str,
        image: &[u8],
        size_mb: u32,
    ) -> Result<()> {
        let filename = format!("{base}{suffix}");
        info!("  {filename}");

        let yaml = bootstrap_yaml(prerequisite)
            .with_context(|| format!("unknown bootstrap image {prerequisite:?}"))?;
        let bootstrap = self.cache.artifact_paths(prerequisite, yaml);
        let stem = self.cache.artifact_stem(prerequisite, yaml);
        if !bootstrap.kernel.exists() {
            bail!("Bootstrap artifact missing; validate_formats was skipped");
        }

        // Fresh scratch dir per invocation; Drop removes it on every
        // exit path, including failure.
        let scratch = tempfile::Builder::new()
            .prefix("convert-")
            .tempdir_in(self.cache.tmp_dir())
            .context("Failed to create converter scratch directory")?;

        let (kernel, initrd, cmdline) = initrd::split_archive(image)?;
        let tardisk = scratch.path().join("tardisk");
        fs::write(&tardisk, initrd::kernel_initrd_tar(&kernel, &initrd, &cmdline)?)?;

        if fs::remove_file(&filename).is_err() && std::path::Path::new(&filename).exists() {
            bail!("Cannot remove existing file {filename}");
        }

        let runner = which::which(VM_RUNNER).with_context(|| {
            format!("Cannot find {VM_RUNNER} executable, needed to build {disk_format} output")
        })?;
        let size_mb = if size_mb == 0 { 1024 } else { size_mb };
        let mut command = Command::new(runner);
        command.args([
            "-q",
            "run",
            "qemu",
            "-disk",
            &format!("{filename},size={size_mb}M,format={disk_format}"),
            "-disk",
            &format!("{},format=raw", tardisk.display()),
            "-kernel",
            &stem.display().to_string(),
        ]);
        debug!(?command, "running disk writer");
        process::run_checked(
            &mut command,
            None,
            CONVERT_TIMEOUT,
            &format!("{VM_RUNNER} run qemu"),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{tar_of, FakeSource};
    use tempfile::TempDir;

    fn composite() -> Vec<u8> {
        tar_of(&[
            ("boot/kernel", b"KERNEL"),
            ("boot/cmdline", b"console=ttyS0"),
            ("sbin/init", b"init"),
        ])
    }

    fn strings(formats: &[&str]) -> Vec<String> {
        formats.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn unknown_format_fails_before_any_converter_runs() {
        let tmp = TempDir::new().unwrap();
        let cache = BuildCache::open(&tmp.path().join("cache")).unwrap();
        let engine = FakeSource::new();
        let dispatcher = OutputDispatcher::new(&engine, &cache, false);

        let base = tmp.path().join("out").to_string_lossy().into_owned();
        let err = dispatcher
            .generate_outputs(&base, &composite(), &strings(&["kernel+initrd", "bogus"]), 0)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::UnsupportedFormat(name)) if name == "bogus"
        ));
        // Nothing was produced for the valid format either.
        assert!(!std::path::Path::new(&format!("{base}-kernel")).exists());
    }

    #[test]
    fn kernel_initrd_writes_the_triple() {
        let tmp = TempDir::new().unwrap();
        let cache = BuildCache::open(&tmp.path().join("cache")).unwrap();
        let engine = FakeSource::new();
        let dispatcher = OutputDispatcher::new(&engine, &cache, false);

        let base = tmp.path().join("test").to_string_lossy().into_owned();
        dispatcher
            .generate_outputs(&base, &composite(), &strings(&["kernel+initrd"]), 0)
            .unwrap();

        assert_eq!(fs::read(format!("{base}-kernel")).unwrap(), b"KERNEL");
        assert_eq!(
            fs::read(format!("{base}-cmdline")).unwrap(),
            b"console=ttyS0"
        );
        assert!(fs::read(format!("{base}-initrd.img"))
            .unwrap()
            .starts_with(b"070701"));
    }

    #[test]
    fn container_formats_write_converter_stdout() {
        let tmp = TempDir::new().unwrap();
        let cache = BuildCache::open(&tmp.path().join("cache")).unwrap();
        let mut engine = FakeSource::new();
        engine.run_output = b"DISKIMAGE".to_vec();
        let dispatcher = OutputDispatcher::new(&engine, &cache, false);

        let base = tmp.path().join("test").to_string_lossy().into_owned();
        dispatcher
            .generate_outputs(&base, &composite(), &strings(&["vhd", "iso-efi"]), 0)
            .unwrap();

        assert_eq!(fs::read(format!("{base}.vhd")).unwrap(), b"DISKIMAGE");
        assert_eq!(fs::read(format!("{base}-efi.iso")).unwrap(), b"DISKIMAGE");

        // Disk-image converters receive the kernel command line as
        // their argument; the iso converters take none.
        let runs = engine.runs.lock().unwrap();
        assert_eq!(runs[0].1, vec!["console=ttyS0".to_string()]);
        assert!(runs[1].1.is_empty());
    }

    #[test]
    fn disk_formats_ensure_the_bootstrap_prerequisite() {
        let tmp = TempDir::new().unwrap();
        let cache = BuildCache::open(&tmp.path().join("cache")).unwrap();
        let mut engine = FakeSource::new();
        // Serve every image the embedded mkimage definition references.
        let config = crate::config::Config::from_yaml(MKIMAGE_BYTES).unwrap();
        engine.add_image(
            &config.kernel.image,
            tar_of(&[("boot/kernel", b"BOOTK")]),
        );
        for image in &config.init {
            engine.add_image(image, tar_of(&[("sbin/init", b"i")]));
        }
        for image in &config.onboot {
            engine.add_image(&image.image, tar_of(&[("bin/app", b"a")]));
        }
        let dispatcher = OutputDispatcher::new(&engine, &cache, false);

        dispatcher.validate_formats(&strings(&["raw"])).unwrap();
        let paths = cache.artifact_paths("mkimage", bootstrap_yaml("mkimage").unwrap());
        assert!(paths.kernel.exists());
        assert_eq!(fs::read(&paths.kernel).unwrap(), b"BOOTK");
    }

    const MKIMAGE_BYTES: &[u8] = crate::cache::MKIMAGE_YAML.as_bytes();
}
