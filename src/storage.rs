//! File-system collaborators: a blob directory fronted by a static file
//! server, and an append-only JSON-lines item log.
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::services::{BlobStore, ItemRecord, ItemStore, NewItem};

#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    /// `public_base_url` is where `root` is served from.
    pub fn new(
        root: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
    ) -> Self {
        let public_base_url = public_base_url.into();
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_owned(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::Other(format!("refusing blob key {key:?}")));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &data).await?;

        debug!(key, bytes = data.len(), content_type, "stored blob");
        Ok(format!("{}/{key}", self.public_base_url))
    }
}

/// Appends one JSON object per persisted item.
#[derive(Debug)]
pub struct JsonlItemStore {
    path: PathBuf,
    /// Serialises appends so lines never interleave.
    write: Mutex<()>,
}

impl JsonlItemStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ItemStore for JsonlItemStore {
    async fn persist(&self, item: NewItem) -> Result<ItemRecord, StoreError> {
        let record = ItemRecord {
            id: Uuid::new_v4().to_string(),
            item,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.write.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(item_id = %record.id, "appended item record");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> NewItem {
        NewItem {
            owner_id: "user-1".into(),
            category: "Shoes".into(),
            label: "white sneakers".into(),
            description: "This is a pair of white sneakers.".into(),
            original_image: "https://cdn.test/clothing-items/a.jpg".into(),
            generated_image: "https://cdn.test/store-image-b.png".into(),
        }
    }

    #[tokio::test]
    async fn test_blob_store_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), "https://cdn.test/");

        let url = store
            .upload(
                "clothing-items/x.png",
                Bytes::from_static(b"png"),
                "image/png",
            )
            .await
            .unwrap();

        assert_eq!(url, "https://cdn.test/clothing-items/x.png");
        let written =
            std::fs::read(dir.path().join("clothing-items/x.png")).unwrap();
        assert_eq!(written, b"png");
    }

    #[tokio::test]
    async fn test_blob_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), "https://cdn.test");

        for key in ["../etc/passwd", "/abs.png", "", "./x.png", "a/../../b"] {
            assert!(
                store.upload(key, Bytes::new(), "image/png").await.is_err(),
                "{key:?} was accepted"
            );
        }
    }

    #[tokio::test]
    async fn test_item_store_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.jsonl");
        let store = JsonlItemStore::new(&path);

        let first = store.persist(item()).await.unwrap();
        let second = store.persist(item()).await.unwrap();
        assert_ne!(first.id, second.id);

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<ItemRecord> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![first, second]);
        assert_eq!(lines[0].item, item());
    }
}
