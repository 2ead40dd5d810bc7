// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! The artifact store: backup dumps in an S3-compatible object store.
//!
//! Keys follow the layout in [`pgvault_core::keys`]. Listing a prefix
//! returns keys sorted lexicographically, which under that layout is
//! chronological order; retention deletes from the front of that list.

use std::{fmt, path::Path, sync::Arc};

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{
    aws::AmazonS3Builder, memory::InMemory, path::Path as ObjectPath, ObjectStore,
};

use crate::config::ObjectStoreConfig;

/// Error raised by artifact-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
    /// Reading or writing the local half of an upload/download failed.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Handle to the object store holding backup artifacts.
#[derive(Clone)]
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
}

impl fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactStore").finish_non_exhaustive()
    }
}

impl ArtifactStore {
    /// Builds the S3 client from configuration.
    ///
    /// Path-style addressing is forced for compatibility with MinIO and
    /// other non-AWS S3 implementations.
    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::new()
            .with_region(&config.region)
            .with_bucket_name(&config.bucket)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key)
            .with_virtual_hosted_style_request(false)
            .with_allow_http(!config.use_ssl);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        Ok(Self {
            store: Arc::new(builder.build()?),
        })
    }

    /// An in-process store backed by memory. Used by tests.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
        }
    }

    /// Uploads a local file as a single object at `key`.
    pub async fn upload_file(&self, local: &Path, key: &str) -> Result<(), StorageError> {
        let data = tokio::fs::read(local).await?;
        self.store
            .put(&ObjectPath::from(key), Bytes::from(data).into())
            .await?;
        Ok(())
    }

    /// Downloads the object at `key` into a local file, creating or
    /// truncating it.
    pub async fn download_to_file(&self, key: &str, local: &Path) -> Result<(), StorageError> {
        let data = self.store.get(&ObjectPath::from(key)).await?.bytes().await?;
        tokio::fs::write(local, &data).await?;
        Ok(())
    }

    /// Lists all keys under `prefix`, sorted lexicographically (oldest dump
    /// first under the backup key layout).
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = ObjectPath::from(prefix);
        let mut keys: Vec<String> = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await?;
        keys.sort();
        Ok(keys)
    }

    /// Deletes the object at `key`. A missing object counts as success: the
    /// artifact is gone either way.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) => Ok(()),
            Err(error @ object_store::Error::NotFound { .. }) => {
                tracing::warn!(key, ?error, "object already absent from store");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// The size in bytes of the object at `key`.
    pub async fn head_size(&self, key: &str) -> Result<u64, StorageError> {
        let meta = self.store.head(&ObjectPath::from(key)).await?;
        Ok(meta.size as u64)
    }
}

/// The keys a retention pass must delete: everything except the `keep` most
/// recent. `keys` must be sorted ascending (oldest first).
pub fn excess_keys(keys: &[String], keep: usize) -> &[String] {
    if keys.len() <= keep {
        &[]
    } else {
        &keys[..keys.len() - keep]
    }
}

#[cfg(test)]
mod tests {
    use pgvault_test_utils::param_test;

    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    param_test! {
        excess_selection: [
            keeps_most_recent: (&["a", "b", "c", "d"], 2, &["a", "b"]),
            zero_keeps_nothing: (&["a", "b"], 0, &["a", "b"]),
            keep_equals_len: (&["a", "b"], 2, &[]),
            keep_exceeds_len: (&["a"], 5, &[]),
            empty: (&[], 3, &[]),
        ]
    }
    fn excess_selection(input: &[&str], keep: usize, expected: &[&str]) {
        let input = keys(input);
        assert_eq!(excess_keys(&input, keep), keys(expected).as_slice());
    }

    #[tokio::test]
    async fn upload_download_round_trip() -> pgvault_test_utils::Result {
        let store = ArtifactStore::in_memory();
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("dump.sql");
        tokio::fs::write(&source, b"-- dump contents\n").await?;

        store.upload_file(&source, "backups/pg1/manual/2025/07/a.sql").await?;
        assert_eq!(
            store.head_size("backups/pg1/manual/2025/07/a.sql").await?,
            17
        );

        let target = dir.path().join("restored.sql");
        store
            .download_to_file("backups/pg1/manual/2025/07/a.sql", &target)
            .await?;
        assert_eq!(tokio::fs::read(&target).await?, b"-- dump contents\n");
        Ok(())
    }

    #[tokio::test]
    async fn list_is_sorted_and_scoped_to_prefix() -> pgvault_test_utils::Result {
        let store = ArtifactStore::in_memory();
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("dump.sql");
        tokio::fs::write(&file, b"x").await?;

        for key in [
            "backups/pg1/hourly/2025/07/b.sql",
            "backups/pg1/hourly/2025/06/a.sql",
            "backups/pg1/daily/2025/07/c.sql",
            "backups/pg2/hourly/2025/07/d.sql",
        ] {
            store.upload_file(&file, key).await?;
        }

        let listed = store.list("backups/pg1/hourly/").await?;
        assert_eq!(
            listed,
            keys(&[
                "backups/pg1/hourly/2025/06/a.sql",
                "backups/pg1/hourly/2025/07/b.sql",
            ])
        );
        Ok(())
    }

    #[tokio::test]
    async fn delete_tolerates_missing_objects() -> pgvault_test_utils::Result {
        let store = ArtifactStore::in_memory();
        store.delete("backups/pg1/hourly/2025/07/gone.sql").await?;
        Ok(())
    }
}
