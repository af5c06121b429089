//! Content-addressed artifact store backed by a single output directory.
//!
//! Every committed task leaves exactly one file, `<Prefix>_<fingerprint>.cbor`,
//! whose existence means the task is done. Files are written through
//! [`atomic_write`](crate::io::atomic_write), so a crashed or interrupted run
//! never leaves a partial artifact that a later run would mistake for a
//! finished one.

use std::collections::BTreeSet;
use std::fs;
use std::io::BufReader;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::{ARTIFACT_EXT, ArtifactId};
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: Utf8PathBuf,
}

impl ArtifactStore {
    /// Opens the store at `root`, creating the directory if needed.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(StoreError::io(&root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn path(&self, id: &ArtifactId) -> Utf8PathBuf {
        self.root.join(id.file_name())
    }

    /// Whether the artifact has been committed.
    pub fn has(&self, id: &ArtifactId) -> bool {
        self.path(id).is_file()
    }

    /// Serializes `data` and commits it under `id`, returning the file name.
    pub fn put<T: Serialize>(&self, id: &ArtifactId, data: &T) -> Result<String, StoreError> {
        let mut buffer = Vec::new();
        ciborium::into_writer(data, &mut buffer)
            .map_err(|source| StoreError::Encode { id: *id, source })?;

        let name = id.file_name();
        crate::io::atomic_write(&self.root.join(&name), &buffer)?;

        tracing::debug!("committed {} ({} bytes)", name, buffer.len());
        Ok(name)
    }

    pub fn get<T: DeserializeOwned>(&self, id: &ArtifactId) -> Result<T, StoreError> {
        let path = self.path(id);

        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(*id));
            }
            Err(e) => return Err(StoreError::io(path)(e)),
        };

        ciborium::from_reader(BufReader::new(file))
            .map_err(|source| StoreError::Decode { path, source })
    }

    /// Lists every committed artifact in the store directory.
    ///
    /// Temporary files and files that do not follow the artifact naming scheme
    /// are ignored.
    pub fn scan(&self) -> Result<BTreeSet<ArtifactId>, StoreError> {
        let pattern = format!(
            "{}/*.{}",
            glob::Pattern::escape(self.root.as_str()),
            ARTIFACT_EXT
        );

        let mut found = BTreeSet::new();

        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|e| {
                let path = Utf8PathBuf::from_path_buf(e.path().to_path_buf())
                    .unwrap_or_else(|_| self.root.clone());
                StoreError::io(path)(e.into_error())
            })?;

            let id = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse::<ArtifactId>().ok());

            if let Some(id) = id {
                found.insert(id);
            }
        }

        Ok(found)
    }
}
