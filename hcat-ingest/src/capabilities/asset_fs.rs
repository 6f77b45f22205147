//! Filesystem asset store with SHA-256 content checksums

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use super::{AssetStore, AssetStoreError, StoredAsset};

/// Stores assets as `<root>/<uuid>-<file name>`
///
/// Returned paths are relative to `root`.
#[derive(Debug, Clone)]
pub struct FsAssetStore {
    root: PathBuf,
}

impl FsAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a store-relative path, rejecting anything escaping the root
    fn resolve(&self, path: &str) -> Result<PathBuf, AssetStoreError> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(AssetStoreError::NotFound(format!("invalid asset path: {}", path)));
        }
        Ok(self.root.join(relative))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Checksum a file without holding it in memory
pub fn file_sha256_hex(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("asset");
    base.chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

#[async_trait]
impl AssetStore for FsAssetStore {
    async fn store(&self, file_name: &str, bytes: &[u8]) -> Result<StoredAsset, AssetStoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| AssetStoreError::Unavailable(format!("{}: {}", self.root.display(), e)))?;

        let relative = format!("{}-{}", Uuid::new_v4(), sanitize_file_name(file_name));
        let target = self.root.join(&relative);

        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| AssetStoreError::Io(format!("{}: {}", target.display(), e)))?;

        Ok(StoredAsset {
            path: relative,
            checksum: sha256_hex(bytes),
            byte_size: bytes.len() as u64,
        })
    }

    async fn delete(&self, path: &str) -> Result<(), AssetStoreError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AssetStoreError::NotFound(path.to_string()))
            }
            Err(e) => Err(AssetStoreError::Io(format!("{}: {}", target.display(), e))),
        }
    }
}
