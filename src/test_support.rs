//! In-memory engine fake shared by the module tests, so assembler and
//! pipeline behavior is testable without a container engine on the host.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tar::{Builder, EntryType, Header};

use crate::engine::{ContainerSource, ImageMetadata};
use crate::error::EngineError;

/// Build a tar stream from `(path, contents)` pairs. A path ending in
/// `/` becomes a directory entry.
pub fn tar_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for (path, contents) in entries {
        let mut header = Header::new_gnu();
        if let Some(dir) = path.strip_suffix('/') {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder
                .append_data(&mut header, dir, std::io::empty())
                .unwrap();
        } else {
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(contents.len() as u64);
            builder
                .append_data(&mut header, path, Cursor::new(contents.to_vec()))
                .unwrap();
        }
    }
    builder.into_inner().unwrap()
}

#[derive(Default)]
pub struct FakeSource {
    tars: BTreeMap<String, Vec<u8>>,
    metadata: BTreeMap<String, ImageMetadata>,
    /// Images that need a pull before create succeeds.
    remote_only: BTreeSet<String>,
    pulled: Mutex<BTreeSet<String>>,
    /// `(image, trusted)` per pull call, in order.
    pub pulls: Mutex<Vec<(String, bool)>>,
    pub creates: AtomicUsize,
    containers: Mutex<BTreeMap<String, String>>,
    next_id: AtomicUsize,
    /// What `run` returns; converters are opaque here.
    pub run_output: Vec<u8>,
    /// `(image, args)` per run call, in order.
    pub runs: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image already present on the engine.
    pub fn add_image(&mut self, image: &str, tar: Vec<u8>) {
        self.tars.insert(image.to_string(), tar);
    }

    /// Register an image that is only available after a pull.
    pub fn add_remote_image(&mut self, image: &str, tar: Vec<u8>) {
        self.tars.insert(image.to_string(), tar);
        self.remote_only.insert(image.to_string());
    }

    pub fn set_metadata(&mut self, image: &str, metadata: ImageMetadata) {
        self.metadata.insert(image.to_string(), metadata);
    }

    fn present(&self, image: &str) -> bool {
        self.tars.contains_key(image)
            && (!self.remote_only.contains(image)
                || self.pulled.lock().unwrap().contains(image))
    }
}

impl ContainerSource for FakeSource {
    fn create(&self, image: &str) -> Result<String, EngineError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if !self.present(image) {
            return Err(EngineError::ImageNotFound(image.to_string()));
        }
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), image.to_string());
        Ok(id)
    }

    fn export(&self, container: &str) -> Result<Vec<u8>, EngineError> {
        let containers = self.containers.lock().unwrap();
        let image = containers
            .get(container)
            .ok_or_else(|| EngineError::CommandFailed {
                context: format!("export {container}"),
                message: "no such container".to_string(),
            })?;
        Ok(self.tars[image].clone())
    }

    fn remove(&self, container: &str) -> Result<(), EngineError> {
        self.containers.lock().unwrap().remove(container);
        Ok(())
    }

    fn pull(&self, image: &str, trusted: bool) -> Result<(), EngineError> {
        self.pulls
            .lock()
            .unwrap()
            .push((image.to_string(), trusted));
        if !self.tars.contains_key(image) {
            return Err(EngineError::CommandFailed {
                context: format!("pull {image}"),
                message: "not in registry".to_string(),
            });
        }
        self.pulled.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    fn inspect(&self, image: &str) -> Result<ImageMetadata, EngineError> {
        if !self.present(image) {
            return Err(EngineError::ImageNotFound(image.to_string()));
        }
        Ok(self.metadata.get(image).cloned().unwrap_or_default())
    }

    fn run(&self, image: &str, _input: &[u8], args: &[String]) -> Result<Vec<u8>, EngineError> {
        self.runs
            .lock()
            .unwrap()
            .push((image.to_string(), args.to_vec()));
        Ok(self.run_output.clone())
    }
}
