// Copyright (c) 2020-present, UMD Database Group.
//
// This program is free software: you can use, redistribute, and/or modify
// it under the terms of the GNU Affero General Public License, version 3
// or later ("AGPL"), as published by the Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! The BlobStore is the object-storage abstraction (C8): list objects under
//! a prefix, read/write object bytes at a key.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// List/read/write over an object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List every key under `prefix` (non-recursive filtering is the
    /// caller's job; this returns every key whose name starts with
    /// `prefix`).
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read the bytes stored at `key`. Returns `Ok(None)` if the key does
    /// not exist.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `body` to `key`, overwriting any existing object.
    async fn write(&self, key: &str, body: Vec<u8>) -> Result<()>;

    /// Delete the object at `key`, if any. Used by
    /// [`crate::dataset::Mode::Overwrite`] to clear a destination prefix
    /// before re-running a plan against it.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether an object exists at `key`. The default implementation is a
    /// `read` that discards the body; backends with a cheaper existence
    /// check (e.g. S3's `HEAD`) should override it.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read(key).await?.is_some())
    }
}

/// An in-memory BlobStore used by tests and the `--local` CLI mode.
#[derive(Default)]
pub struct LocalBlobStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl LocalBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.objects.write().await.insert(key.to_owned(), body);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

/// A BlobStore rooted at a local filesystem directory, useful for
/// demonstration runs that don't require a cloud account. Keys are
/// interpreted as relative paths under `root`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsBlobStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        out.push(key);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub mod aws {
    //! AWS S3-backed BlobStore: `put_object`/`get_object`/paginated
    //! `list_objects_v2` over a single bucket.

    use super::*;
    use crate::error::FlockError;
    use rusoto_s3::{
        DeleteObjectRequest, GetObjectRequest, ListObjectsV2Request, PutObjectRequest, S3, S3Client,
    };
    use tokio::io::AsyncReadExt;

    /// BlobStore backed by a single S3 bucket; `key`s passed to the trait
    /// methods are full object keys within that bucket (no leading slash).
    pub struct S3BlobStore {
        client: S3Client,
        bucket: String,
    }

    impl S3BlobStore {
        pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
            S3BlobStore {
                client,
                bucket: bucket.into(),
            }
        }
    }

    #[async_trait]
    impl BlobStore for S3BlobStore {
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            let mut keys = Vec::new();
            let mut continuation_token = None;
            loop {
                let resp = self
                    .client
                    .list_objects_v2(ListObjectsV2Request {
                        bucket: self.bucket.clone(),
                        prefix: Some(prefix.to_owned()),
                        continuation_token: continuation_token.clone(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| FlockError::DispatchError(e.to_string()))?;

                keys.extend(
                    resp.contents
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|o| o.key),
                );

                if resp.is_truncated == Some(true) {
                    continuation_token = resp.next_continuation_token;
                } else {
                    break;
                }
            }
            Ok(keys)
        }

        async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
            match self
                .client
                .get_object(GetObjectRequest {
                    bucket: self.bucket.clone(),
                    key: key.to_owned(),
                    ..Default::default()
                })
                .await
            {
                Ok(resp) => {
                    let mut buf = Vec::new();
                    if let Some(stream) = resp.body {
                        stream
                            .into_async_read()
                            .read_to_end(&mut buf)
                            .await
                            .map_err(FlockError::from)?;
                    }
                    Ok(Some(buf))
                }
                Err(rusoto_core::RusotoError::Service(
                    rusoto_s3::GetObjectError::NoSuchKey(_),
                )) => Ok(None),
                Err(e) => Err(FlockError::DispatchError(e.to_string())),
            }
        }

        async fn write(&self, key: &str, body: Vec<u8>) -> Result<()> {
            self.client
                .put_object(PutObjectRequest {
                    bucket: self.bucket.clone(),
                    key: key.to_owned(),
                    body: Some(body.into()),
                    ..Default::default()
                })
                .await
                .map_err(|e| FlockError::DispatchError(e.to_string()))?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.client
                .delete_object(DeleteObjectRequest {
                    bucket: self.bucket.clone(),
                    key: key.to_owned(),
                    ..Default::default()
                })
                .await
                .map_err(|e| FlockError::DispatchError(e.to_string()))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = LocalBlobStore::new();
        store.write("out/a.parquet", vec![1, 2, 3]).await.unwrap();

        assert_eq!(store.read("out/a.parquet").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.read("out/missing.parquet").await.unwrap(), None);
    }

    #[tokio::test]
    async fn exists_reflects_writes() {
        let store = LocalBlobStore::new();
        assert!(!store.exists("out/a.parquet").await.unwrap());
        store.write("out/a.parquet", vec![1]).await.unwrap();
        assert!(store.exists("out/a.parquet").await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = LocalBlobStore::new();
        store.write("out/a.parquet", vec![1]).await.unwrap();
        store.write("out/b.parquet", vec![2]).await.unwrap();
        store.write("other/c.parquet", vec![3]).await.unwrap();

        let mut keys = store.list("out/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["out/a.parquet".to_owned(), "out/b.parquet".to_owned()]);
    }

    #[tokio::test]
    async fn delete_removes_the_object() {
        let store = LocalBlobStore::new();
        store.write("out/a.parquet", vec![1]).await.unwrap();
        store.delete("out/a.parquet").await.unwrap();
        assert!(!store.exists("out/a.parquet").await.unwrap());
    }

    #[tokio::test]
    async fn fs_blobstore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store.write("prefix/a.parquet", vec![9, 9]).await.unwrap();
        assert_eq!(store.read("prefix/a.parquet").await.unwrap(), Some(vec![9, 9]));

        let keys = store.list("prefix/").await.unwrap();
        assert_eq!(keys, vec!["prefix/a.parquet".to_owned()]);
    }
}
