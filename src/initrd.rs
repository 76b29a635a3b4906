//! Kernel / initramfs / cmdline extraction.
//!
//! The composite archive produced by the build carries the kernel at
//! `boot/kernel` and its command line at `boot/cmdline`. Converters want
//! the kernel bytes, a cpio (newc) initramfs of everything else, and the
//! cmdline string; [`split_archive`] produces that triple and
//! [`kernel_initrd_tar`] re-packs it into the three-entry tarball the
//! external image writers consume on stdin.

use std::io::{Cursor, Read, Write};
use tar::{Builder, EntryType, Header};

use crate::error::BuildError;

const KERNEL_PATH: &str = "boot/kernel";
const CMDLINE_PATH: &str = "boot/cmdline";

/// Split a composite archive into `(kernel, initramfs, cmdline)`.
///
/// Everything under `boot/` other than the kernel and cmdline is
/// dropped; all remaining entries are converted into a newc cpio
/// archive. Directories, symlinks, device nodes and FIFOs survive the
/// conversion; hardlinks are carried as zero-length regular entries.
pub fn split_archive(image: &[u8]) -> Result<(Vec<u8>, Vec<u8>, String), BuildError> {
    let mut kernel = Vec::new();
    let mut cmdline = String::new();
    let mut cpio = CpioWriter::new(Vec::new());

    let mut archive = tar::Archive::new(Cursor::new(image));
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
        let name = name.trim_end_matches('/').to_string();
        match name.as_str() {
            KERNEL_PATH => {
                entry.read_to_end(&mut kernel)?;
            }
            CMDLINE_PATH => {
                entry.read_to_string(&mut cmdline)?;
            }
            "boot" => {}
            _ if name.starts_with("boot/") => {}
            _ => cpio.append_tar_entry(&name, &mut entry)?,
        }
    }

    let initrd = cpio.finish()?;
    Ok((kernel, initrd, cmdline))
}

/// Pack a bootstrap triple into the `kernel` / `initrd.img` / `cmdline`
/// tarball shape.
pub fn kernel_initrd_tar(
    kernel: &[u8],
    initrd: &[u8],
    cmdline: &str,
) -> Result<Vec<u8>, BuildError> {
    let mut builder = Builder::new(Vec::new());
    for (name, contents) in [
        ("kernel", kernel),
        ("initrd.img", initrd),
        ("cmdline", cmdline.as_bytes()),
    ] {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o600);
        header.set_size(contents.len() as u64);
        builder.append_data(&mut header, name, contents)?;
    }
    Ok(builder.into_inner()?)
}

const NEWC_MAGIC: &str = "070701";
const TRAILER: &str = "TRAILER!!!";

/// Minimal cpio (newc) encoder, enough to express what a container
/// filesystem export contains.
struct CpioWriter<W: Write> {
    out: W,
    ino: u32,
}

impl<W: Write> CpioWriter<W> {
    fn new(out: W) -> Self {
        Self { out, ino: 0 }
    }

    fn append_tar_entry<R: Read>(
        &mut self,
        name: &str,
        entry: &mut tar::Entry<'_, R>,
    ) -> Result<(), BuildError> {
        let header = entry.header();
        // Numeric header fields may be unset (all-NUL) in minimal GNU
        // headers; treat those as zero rather than rejecting the entry.
        let perm = header.mode().unwrap_or(0) & 0o7777;
        let uid = header.uid().unwrap_or(0) as u32;
        let gid = header.gid().unwrap_or(0) as u32;
        let mtime = header.mtime().unwrap_or(0) as u32;
        let rdev_major = header.device_major().ok().flatten().unwrap_or(0);
        let rdev_minor = header.device_minor().ok().flatten().unwrap_or(0);

        let (filetype, nlink) = match header.entry_type() {
            EntryType::Directory => (0o040000, 2),
            EntryType::Symlink => (0o120000, 1),
            EntryType::Char => (0o020000, 1),
            EntryType::Block => (0o060000, 1),
            EntryType::Fifo => (0o010000, 1),
            // Hardlinks become empty regular entries; everything else is
            // a regular file.
            _ => (0o100000, 1),
        };

        let data = match header.entry_type() {
            EntryType::Symlink => header
                .link_name()?
                .map(|l| l.to_string_lossy().into_owned().into_bytes())
                .unwrap_or_default(),
            EntryType::Link | EntryType::Directory | EntryType::Char | EntryType::Block
            | EntryType::Fifo => Vec::new(),
            _ => {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                data
            }
        };

        self.write_record(
            name,
            filetype | perm,
            uid,
            gid,
            nlink,
            mtime,
            rdev_major,
            rdev_minor,
            &data,
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_record(
        &mut self,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        nlink: u32,
        mtime: u32,
        rdev_major: u32,
        rdev_minor: u32,
        data: &[u8],
    ) -> std::io::Result<()> {
        self.ino += 1;
        let namesize = name.len() as u32 + 1;
        write!(self.out, "{NEWC_MAGIC}")?;
        for field in [
            self.ino,
            mode,
            uid,
            gid,
            nlink,
            mtime,
            data.len() as u32,
            0, // devmajor
            0, // devminor
            rdev_major,
            rdev_minor,
            namesize,
            0, // check (always zero in newc)
        ] {
            write!(self.out, "{field:08X}")?;
        }
        self.out.write_all(name.as_bytes())?;
        self.out.write_all(&[0])?;
        // Header (110 bytes) plus name is padded to 4, as is the data.
        self.pad((110 + namesize) as usize)?;
        self.out.write_all(data)?;
        self.pad(data.len())?;
        Ok(())
    }

    fn pad(&mut self, written: usize) -> std::io::Result<()> {
        let zeros = [0u8; 4];
        let pad = (4 - written % 4) % 4;
        self.out.write_all(&zeros[..pad])
    }

    fn finish(mut self) -> std::io::Result<W> {
        self.ino = 0;
        self.write_record(TRAILER, 0, 0, 0, 1, 0, 0, 0, &[])?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarball::read_entries;
    use crate::test_support::tar_of;

    #[test]
    fn split_extracts_kernel_and_cmdline() {
        let image = tar_of(&[
            ("boot/kernel", b"KERNELBYTES"),
            ("boot/cmdline", b"console=ttyS0"),
            ("boot/efi-stub", b"dropped"),
            ("bin/", b""),
            ("bin/init", b"#!/bin/sh"),
        ]);

        let (kernel, initrd, cmdline) = split_archive(&image).unwrap();
        assert_eq!(kernel, b"KERNELBYTES");
        assert_eq!(cmdline, "console=ttyS0");

        let text = String::from_utf8_lossy(&initrd);
        assert!(initrd.starts_with(b"070701"));
        assert!(text.contains("bin/init"));
        assert!(text.contains("TRAILER!!!"));
        // Nothing under boot/ leaks into the initramfs.
        assert!(!text.contains("boot"));
    }

    #[test]
    fn cpio_records_are_word_aligned() {
        let image = tar_of(&[("a", b"xyz")]);
        let (_, initrd, _) = split_archive(&image).unwrap();
        assert_eq!(initrd.len() % 4, 0);
    }

    #[test]
    fn symlinks_carry_their_target_as_data() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, "bin/sh", "busybox").unwrap();
        let image = builder.into_inner().unwrap();

        let (_, initrd, _) = split_archive(&image).unwrap();
        let text = String::from_utf8_lossy(&initrd);
        assert!(text.contains("bin/sh"));
        assert!(text.contains("busybox"));
    }

    #[test]
    fn unset_numeric_header_fields_default_to_zero() {
        // Minimal GNU headers leave uid/gid/mtime as NUL bytes; the
        // conversion must not reject such entries.
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(3);
        builder.append_data(&mut header, "a", &b"xyz"[..]).unwrap();
        let image = builder.into_inner().unwrap();

        let (_, initrd, _) = split_archive(&image).unwrap();
        assert!(initrd.starts_with(b"070701"));
        // Record layout: magic(6) ino(8) mode(8) uid(8); the uid field
        // of the first record is all zeros.
        assert_eq!(&initrd[22..30], b"00000000");
        assert!(String::from_utf8_lossy(&initrd).contains("TRAILER!!!"));
    }

    #[test]
    fn kernel_initrd_tar_has_three_entries() {
        let tarball = kernel_initrd_tar(b"K", b"I", "root=/dev/sda").unwrap();
        let entries = read_entries(&tarball);
        let names: Vec<&str> = entries.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, ["kernel", "initrd.img", "cmdline"]);
        assert_eq!(entries[0].2, b"K");
        assert_eq!(entries[2].2, b"root=/dev/sda");
    }

    #[test]
    fn missing_kernel_yields_empty_pieces() {
        let image = tar_of(&[("etc/motd", b"hi")]);
        let (kernel, _, cmdline) = split_archive(&image).unwrap();
        assert!(kernel.is_empty());
        assert!(cmdline.is_empty());
    }
}
