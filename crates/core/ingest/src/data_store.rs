//! Segment file storage.

use std::sync::Arc;

use bytes::Bytes;
use object_store::{ObjectStore, PutPayload, local::LocalFileSystem, memory::InMemory, path::Path};

/// Data store.
///
/// A wrapper around [`ObjectStore`] holding segment files, addressed by paths relative to the
/// root of the store. Clones refer to the same store.
#[derive(Debug, Clone)]
pub struct DataStore {
    object_store: Arc<dyn ObjectStore>,
    url: Arc<str>,
}

impl DataStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, url: impl Into<Arc<str>>) -> Self {
        Self {
            object_store,
            url: url.into(),
        }
    }

    /// A store that lives as long as its last clone.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "memory://")
    }

    /// A store rooted at a local directory, which is created if missing.
    pub fn local(dir: impl AsRef<std::path::Path>) -> Result<Self, DataStoreError> {
        let dir = dir.as_ref();
        fs_err::create_dir_all(dir).map_err(DataStoreError::CreateDir)?;
        let dir = fs_err::canonicalize(dir).map_err(DataStoreError::CreateDir)?;
        let store = LocalFileSystem::new_with_prefix(&dir).map_err(DataStoreError::ObjectStore)?;

        Ok(Self::new(
            Arc::new(store),
            format!("file://{}", dir.display()),
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Writes `bytes` to `path`, replacing any previous object.
    pub async fn put(&self, path: &str, bytes: Bytes) -> Result<(), object_store::Error> {
        self.object_store
            .put(&Path::from(path), PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Bytes, object_store::Error> {
        self.object_store.get(&Path::from(path)).await?.bytes().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DataStoreError {
    #[error("failed to create data store directory")]
    CreateDir(#[source] std::io::Error),

    #[error("failed to open data store")]
    ObjectStore(#[source] object_store::Error),
}
