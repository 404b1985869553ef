//! Filesystem artifact transfer for `file://` URIs.
//!
//! Published artifacts land at `{root}/{run_id}/{task}/{name}` and are
//! referenced by absolute `file://` URI together with their size and a
//! `sha256:` digest. Fetching verifies the digest when the reference has one.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;
use weft_core::workflow::executor::{ArtifactError, ArtifactTransfer};
use weft_core::workflow::expression::is_name;
use weft_types::workflow::ArtifactRef;

const FILE_SCHEME: &str = "file://";
const DIGEST_PREFIX: &str = "sha256:";

/// `ArtifactTransfer` over a local directory.
pub struct FsArtifactTransfer {
    root: PathBuf,
}

impl FsArtifactTransfer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, run_id: Uuid, task: &str, name: &str) -> Result<PathBuf, ArtifactError> {
        for part in [task, name] {
            if !is_name(part) {
                return Err(ArtifactError::Io(format!("invalid artifact path component '{part}'")));
            }
        }
        Ok(self.root.join(run_id.to_string()).join(task).join(name))
    }
}

/// `sha256:`-prefixed lowercase hex digest of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{DIGEST_PREFIX}{:x}", Sha256::digest(bytes))
}

fn path_from_uri(uri: &str) -> Result<PathBuf, ArtifactError> {
    uri.strip_prefix(FILE_SCHEME)
        .filter(|p| p.starts_with('/'))
        .map(PathBuf::from)
        .ok_or_else(|| ArtifactError::UnsupportedUri(uri.to_string()))
}

impl ArtifactTransfer for FsArtifactTransfer {
    async fn fetch(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        let path = path_from_uri(&artifact.uri)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(artifact.uri.clone()));
            }
            Err(e) => return Err(ArtifactError::Io(e.to_string())),
        };

        if let Some(expected) = &artifact.digest {
            let actual = content_digest(&bytes);
            if &actual != expected {
                tracing::warn!(uri = %artifact.uri, %expected, %actual, "artifact digest mismatch");
                return Err(ArtifactError::DigestMismatch {
                    uri: artifact.uri.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    async fn publish(
        &self,
        run_id: Uuid,
        task: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, ArtifactError> {
        let path = self.artifact_path(run_id, task, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ArtifactError::Io(e.to_string()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ArtifactError::Io(e.to_string()))?;

        let absolute = std::path::absolute(&path).map_err(|e| ArtifactError::Io(e.to_string()))?;
        let mut artifact = ArtifactRef::new(format!("{FILE_SCHEME}{}", absolute.display()));
        artifact.size_bytes = Some(bytes.len() as u64);
        artifact.digest = Some(content_digest(&bytes));

        tracing::debug!(run_id = %run_id, task, name, size = bytes.len(), "published artifact");
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactTransfer::new(dir.path());
        let run_id = Uuid::now_v7();

        let artifact = store
            .publish(run_id, "build", "bundle", b"tarball".to_vec())
            .await
            .unwrap();
        assert!(artifact.uri.starts_with("file:///"));
        assert!(artifact.uri.ends_with(&format!("{run_id}/build/bundle")));
        assert_eq!(artifact.size_bytes, Some(7));
        assert_eq!(artifact.digest.as_deref(), Some(content_digest(b"tarball").as_str()));

        assert_eq!(store.fetch(&artifact).await.unwrap(), b"tarball");
    }

    #[tokio::test]
    async fn fetch_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactTransfer::new(dir.path());
        let artifact = store
            .publish(Uuid::now_v7(), "build", "report", b"ok".to_vec())
            .await
            .unwrap();

        let path = path_from_uri(&artifact.uri).unwrap();
        tokio::fs::write(&path, b"tampered").await.unwrap();

        let err = store.fetch(&artifact).await.unwrap_err();
        assert!(matches!(err, ArtifactError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn fetch_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactTransfer::new(dir.path());

        let err = store.fetch(&ArtifactRef::new("s3://bucket/key")).await.unwrap_err();
        assert!(matches!(err, ArtifactError::UnsupportedUri(_)));

        let missing = format!("file://{}/nope", dir.path().display());
        let err = store.fetch(&ArtifactRef::new(missing)).await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }

    #[tokio::test]
    async fn publish_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactTransfer::new(dir.path());
        let err = store
            .publish(Uuid::now_v7(), "build", "../escape", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Io(_)));
    }

    #[test]
    fn digest_format() {
        assert_eq!(
            content_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
