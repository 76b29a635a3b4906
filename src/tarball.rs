//! Filesystem assembly: streaming container filesystems into one
//! composite tar archive.
//!
//! Each container's exported filesystem is copied entry-by-entry under a
//! path prefix. Two fixed path policies apply during the copy: the
//! exclusion set (host-environment markers and pseudo-filesystem mount
//! points, read and discarded) and the replacement set (name resolution
//! files, rewritten with canonical content). Prefix directories are
//! synthesized first so the archive stays a navigable tree even though
//! entries are streamed.

use std::io::{Cursor, Write};
use tar::{Builder, EntryType, Header};
use tracing::debug;

use crate::config::FileSpec;
use crate::engine::ContainerSource;
use crate::error::{BuildError, EngineError};

/// Entries never copied into the output archive.
const EXCLUDE: &[&str] = &[
    ".dockerenv",
    "Dockerfile",
    "dev/console",
    "dev/pts",
    "dev/shm",
    "etc/hostname",
];

/// Entries rewritten wholesale with canonical content.
const REPLACE: &[(&str, &str)] = &[
    (
        "etc/hosts",
        "127.0.0.1       localhost\n\
         ::1     localhost ip6-localhost ip6-loopback\n\
         fe00::0 ip6-localnet\n\
         ff00::0 ip6-mcastprefix\n\
         ff02::1 ip6-allnodes\n\
         ff02::2 ip6-allrouters\n",
    ),
    (
        "etc/resolv.conf",
        "nameserver 8.8.8.8\n\
         nameserver 8.8.4.4\n\
         nameserver 2001:4860:4860::8888\n\
         nameserver 2001:4860:4860::8844\n",
    ),
];

fn replacement_for(name: &str) -> Option<&'static str> {
    REPLACE
        .iter()
        .find(|(path, _)| *path == name)
        .map(|(_, contents)| *contents)
}

/// Synthesize directory entries for every component of `prefix`.
pub fn tar_prefix<W: Write>(prefix: &str, out: &mut Builder<W>) -> Result<(), BuildError> {
    if prefix.is_empty() {
        return Ok(());
    }
    let Some(path) = prefix.strip_suffix('/') else {
        return Err(BuildError::Schema(format!(
            "path does not end with /: {prefix}"
        )));
    };
    if path.starts_with('/') {
        return Err(BuildError::Schema(format!(
            "path should be relative: {prefix}"
        )));
    }
    let mut mkdir = String::new();
    for component in path.split('/') {
        mkdir.push_str(component);
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        out.append_data(&mut header, &mkdir, std::io::empty())?;
        mkdir.push('/');
    }
    Ok(())
}

/// Resolve `image` to an exported filesystem tar.
///
/// If the engine does not know the image locally, it is pulled once and
/// creation retried exactly once before the error is terminal.
pub fn export_image(
    engine: &dyn ContainerSource,
    image: &str,
    pull: bool,
    trust: bool,
) -> Result<Vec<u8>, BuildError> {
    if pull || trust {
        engine.pull(image, trust)?;
    }
    let container = match engine.create(image) {
        Ok(container) => container,
        Err(EngineError::ImageNotFound(_)) => {
            engine
                .pull(image, trust)
                .map_err(|e| BuildError::ImageResolution {
                    image: image.to_string(),
                    reason: e.to_string(),
                })?;
            engine
                .create(image)
                .map_err(|e| BuildError::ImageResolution {
                    image: image.to_string(),
                    reason: e.to_string(),
                })?
        }
        Err(e) => return Err(e.into()),
    };
    let contents = engine.export(&container)?;
    engine.remove(&container)?;
    Ok(contents)
}

/// Copy an exported filesystem tar into `out` under `prefix`, applying
/// the exclusion and replacement policies.
pub fn write_filtered<W: Write>(
    contents: &[u8],
    prefix: &str,
    out: &mut Builder<W>,
) -> Result<(), BuildError> {
    let mut archive = tar::Archive::new(Cursor::new(contents));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_pax_local_extensions()
            || kind.is_pax_global_extensions()
            || kind.is_gnu_longname()
            || kind.is_gnu_longlink()
        {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut header = entry.header().clone();
        if EXCLUDE.contains(&name.as_str()) {
            debug!(%name, "filesystem tar: exclude");
        } else if let Some(replacement) = replacement_for(&name) {
            debug!(%name, "filesystem tar: replace");
            header.set_size(replacement.len() as u64);
            out.append_data(
                &mut header,
                format!("{prefix}{name}"),
                replacement.as_bytes(),
            )?;
        } else {
            out.append_data(&mut header, format!("{prefix}{name}"), &mut entry)?;
        }
    }
    Ok(())
}

/// Stream one container's filesystem into `out` under `prefix`.
pub fn image_tar<W: Write>(
    engine: &dyn ContainerSource,
    image: &str,
    prefix: &str,
    out: &mut Builder<W>,
    trust: bool,
    pull: bool,
) -> Result<(), BuildError> {
    debug!(image, prefix, "image tar");
    if !prefix.is_empty() && !prefix.ends_with('/') {
        return Err(BuildError::Schema(format!(
            "prefix does not end with /: {prefix}"
        )));
    }
    tar_prefix(prefix, out)?;
    let contents = export_image(engine, image, pull, trust)?;
    write_filtered(&contents, prefix, out)
}

/// Produce a self-contained bundle under `path`: the image's filesystem
/// at `<path>/rootfs/` followed by the marshaled runtime spec at
/// `<path>/config.json`.
pub fn image_bundle<W: Write>(
    engine: &dyn ContainerSource,
    path: &str,
    image: &str,
    config: &[u8],
    out: &mut Builder<W>,
    trust: bool,
    pull: bool,
) -> Result<(), BuildError> {
    debug!(path, image, "image bundle");
    image_tar(engine, image, &format!("{path}/rootfs/"), out, trust, pull)?;

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(config.len() as u64);
    out.append_data(&mut header, format!("{path}/config.json"), config)?;
    Ok(())
}

/// Append the `files:` section entries to the archive.
pub fn append_files<W: Write>(files: &[FileSpec], out: &mut Builder<W>) -> Result<(), BuildError> {
    for file in files {
        let path = file.path.trim_start_matches('/');
        let mode = match &file.mode {
            Some(mode) => u32::from_str_radix(mode, 8).map_err(|_| {
                BuildError::Schema(format!("file {:?}: bad mode {:?}", file.path, mode))
            })?,
            None if file.directory => 0o755,
            None => 0o644,
        };

        let mut header = Header::new_gnu();
        header.set_mode(mode);
        if file.directory {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            out.append_data(&mut header, path, std::io::empty())?;
        } else if let Some(target) = &file.symlink {
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            out.append_link(&mut header, path, target)?;
        } else if let Some(contents) = &file.contents {
            header.set_entry_type(EntryType::Regular);
            header.set_size(contents.len() as u64);
            out.append_data(&mut header, path, contents.as_bytes())?;
        } else if let Some(source) = &file.source {
            let contents = match std::fs::read(source) {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && file.optional => {
                    debug!(path = %file.path, %source, "optional file source missing, skipped");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            header.set_entry_type(EntryType::Regular);
            header.set_size(contents.len() as u64);
            out.append_data(&mut header, path, Cursor::new(contents))?;
        } else {
            return Err(BuildError::Schema(format!(
                "file {:?} has no content source",
                file.path
            )));
        }
    }
    Ok(())
}

/// Read a tar stream back into `(path, entry_type, contents)` triples.
#[cfg(test)]
pub(crate) fn read_entries(archive: &[u8]) -> Vec<(String, EntryType, Vec<u8>)> {
    use std::io::Read;

    let mut out = Vec::new();
    let mut archive = tar::Archive::new(Cursor::new(archive));
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let kind = entry.header().entry_type();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        out.push((name, kind, contents));
    }
    out
}
