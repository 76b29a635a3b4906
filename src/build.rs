//! Pipeline driver: config -> composite archive.
//!
//! Writes, in order: the kernel image's filesystem (plus `boot/cmdline`),
//! each init image at the archive root, one bundle per onboot container
//! (numbered so boot order survives the archive), one bundle per
//! service, then the `files:` section. All entries go through a single
//! tar writer - the format is not safely writable concurrently - but
//! onboot/service exports have no data dependency on each other, so they
//! fan out across threads and only the writes are serialized.

use std::io::Write;
use std::thread;
use tar::{Builder, EntryType, Header};
use tracing::{debug, info};

use crate::config::{Config, ImageConfig};
use crate::engine::ContainerSource;
use crate::error::BuildError;
use crate::oci::{self, RuntimeSpec};
use crate::tarball;

/// An onboot/service container's collected export, ready for the
/// serialized write phase.
struct ExportedBundle {
    filesystem: Vec<u8>,
    spec: RuntimeSpec,
}

/// Build the composite archive for `config` into `out`.
pub fn build_image<W: Write>(
    config: &Config,
    out: W,
    engine: &dyn ContainerSource,
    pull: bool,
) -> Result<(), BuildError> {
    let mut tw = Builder::new(out);

    if !config.kernel.image.is_empty() {
        info!(image = %config.kernel.image, "adding kernel");
        let trust = config.trust.covers(&config.kernel.image);
        tarball::image_tar(engine, &config.kernel.image, "", &mut tw, trust, pull)?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(config.kernel.cmdline.len() as u64);
        tw.append_data(&mut header, "boot/cmdline", config.kernel.cmdline.as_bytes())?;
    }

    for image in &config.init {
        info!(%image, "adding init");
        let trust = config.trust.covers(image);
        tarball::image_tar(engine, image, "", &mut tw, trust, pull)?;
    }

    let onboot = export_bundles(&config.onboot, config, engine, pull)?;
    for (i, (image, bundle)) in config.onboot.iter().zip(onboot).enumerate() {
        let path = format!("containers/onboot/{:03}-{}", i, image.name);
        write_bundle(&path, image, bundle, &mut tw)?;
    }

    let services = export_bundles(&config.services, config, engine, pull)?;
    for (image, bundle) in config.services.iter().zip(services) {
        let path = format!("containers/services/{}", image.name);
        write_bundle(&path, image, bundle, &mut tw)?;
    }

    tarball::append_files(&config.files, &mut tw)?;
    tw.finish()?;
    Ok(())
}

/// Fan-out phase: export and synthesize every container in `images`
/// concurrently, collecting results in declaration order.
fn export_bundles(
    images: &[ImageConfig],
    config: &Config,
    engine: &dyn ContainerSource,
    pull: bool,
) -> Result<Vec<ExportedBundle>, BuildError> {
    thread::scope(|scope| {
        let handles: Vec<_> = images
            .iter()
            .map(|image| {
                scope.spawn(move || -> Result<ExportedBundle, BuildError> {
                    info!(name = %image.name, image = %image.image, "exporting container");
                    let trust = config.trust.covers(&image.image);
                    let filesystem = tarball::export_image(engine, &image.image, pull, trust)?;
                    // The image is local after the export, so inspection
                    // cannot race a missing pull.
                    let metadata = engine.inspect(&image.image)?;
                    let spec = oci::synthesize(image, &metadata)?;
                    Ok(ExportedBundle { filesystem, spec })
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("export thread panicked"))
            .collect()
    })
}

/// Fan-in phase: stream one collected bundle into the shared writer.
fn write_bundle<W: Write>(
    path: &str,
    image: &ImageConfig,
    bundle: ExportedBundle,
    tw: &mut Builder<W>,
) -> Result<(), BuildError> {
    debug!(%path, "writing bundle");
    tarball::tar_prefix(&format!("{path}/rootfs/"), tw)?;
    tarball::write_filtered(&bundle.filesystem, &format!("{path}/rootfs/"), tw)?;

    let config_json = serde_json::to_vec(&bundle.spec).map_err(|e| {
        BuildError::Schema(format!("image {:?}: unserializable spec: {e}", image.name))
    })?;
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(config_json.len() as u64);
    tw.append_data(&mut header, format!("{path}/config.json"), &config_json[..])?;
    Ok(())
}
