use crate::config::UploadRetention;
use std::{
    path::{Path, PathBuf},
    pin::pin,
};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncWriteExt},
};

const FALLBACK_FILENAME: &str = "upload";

#[derive(thiserror::Error, Debug)]
#[error("failed to store upload at '{}': {source}", path.display())]
pub struct UploadError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
}

/// An image reference the model can resolve on its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSource {
    /// A remote image, fetched later by the vision stage.
    Url(String),
    /// An uploaded image persisted to disk.
    Stored(PathBuf),
}

impl ImageSource {
    pub fn reference(&self) -> String {
        match self {
            ImageSource::Url(url) => url.clone(),
            ImageSource::Stored(path) => path.to_string_lossy().into_owned(),
        }
    }
}

/// Directory receiving uploaded images, one uniquely named file per upload.
pub struct UploadStore {
    dir: PathBuf,
    retention: UploadRetention,
}

impl UploadStore {
    /// Creates the upload directory if it does not exist yet.
    pub async fn prepare(dir: impl Into<PathBuf>, retention: UploadRetention) -> std::io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, retention })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns `{uuid}_{filename}` inside the upload directory.
    ///
    /// Only the last component of the client filename is kept.
    pub fn unique_path(&self, filename: Option<&str>) -> PathBuf {
        let name = filename
            .and_then(|f| Path::new(f).file_name())
            .and_then(|f| f.to_str())
            .filter(|f| !f.is_empty())
            .unwrap_or(FALLBACK_FILENAME);
        self.dir.join(format!("{}_{}", uuid::Uuid::new_v4(), name))
    }

    /// Streams `reader` verbatim into a new file and returns it once every
    /// byte is flushed to disk.
    pub async fn persist<R: AsyncRead>(
        &self,
        filename: Option<&str>,
        reader: R,
    ) -> Result<ImageSource, UploadError> {
        let path = self.unique_path(filename);
        let mut reader = pin!(reader);

        let written = async {
            let mut file = File::create(&path).await?;
            let bytes = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(bytes)
        }
        .await;

        match written {
            Ok(bytes) => {
                log::debug!("Stored {bytes} bytes at {}", path.display());
                Ok(ImageSource::Stored(path))
            }
            Err(source) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(UploadError { path, source })
            }
        }
    }

    /// Applies the retention policy to a stored upload.
    pub async fn release(&self, source: &ImageSource) {
        let ImageSource::Stored(path) = source else {
            return;
        };
        if self.retention == UploadRetention::Retain {
            return;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => log::debug!("Deleted upload {}", path.display()),
            Err(e) => log::warn!("Failed to delete upload {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(retention: UploadRetention) -> (tempfile::TempDir, UploadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::prepare(dir.path().join("uploaded-images"), retention)
            .await
            .unwrap();
        (dir, store)
    }

    fn stored_path(source: &ImageSource) -> &Path {
        match source {
            ImageSource::Stored(path) => path,
            other => panic!("expected a stored upload, got {other:?}"),
        }
    }

    #[test]
    fn url_passes_through_unchanged() {
        let url = "https://example.com/cat.jpg?size=large";
        assert_eq!(ImageSource::Url(url.to_string()).reference(), url);
    }

    #[tokio::test]
    async fn persists_bytes_verbatim_under_unique_name() {
        let (_dir, store) = store(UploadRetention::Retain).await;
        let payload = vec![7u8; 10 * 1024];

        let source = store.persist(Some("cat.jpg"), payload.as_slice()).await.unwrap();
        let path = stored_path(&source);

        assert_eq!(path.parent().unwrap(), store.dir());
        let name = path.file_name().unwrap().to_str().unwrap();
        let (id, original) = name.split_once('_').unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
        assert_eq!(original, "cat.jpg");
        assert_eq!(std::fs::read(path).unwrap(), payload);
    }

    #[tokio::test]
    async fn same_filename_never_collides() {
        let (_dir, store) = store(UploadRetention::Retain).await;
        let (a, b) = tokio::join!(
            store.persist(Some("cat.jpg"), &b"first"[..]),
            store.persist(Some("cat.jpg"), &b"second"[..]),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a, b);
        assert_eq!(std::fs::read(stored_path(&a)).unwrap(), b"first");
        assert_eq!(std::fs::read(stored_path(&b)).unwrap(), b"second");
    }

    #[tokio::test]
    async fn client_paths_are_reduced_to_file_names() {
        let (_dir, store) = store(UploadRetention::Retain).await;
        let path = store.unique_path(Some("../../etc/cat.jpg"));
        assert_eq!(path.parent().unwrap(), store.dir());
        assert!(path.to_str().unwrap().ends_with("_cat.jpg"));

        let path = store.unique_path(None);
        assert!(path.to_str().unwrap().ends_with("_upload"));
    }

    #[tokio::test]
    async fn release_honours_retention() {
        let (_dir, keep) = store(UploadRetention::Retain).await;
        let kept = keep.persist(Some("a.png"), &b"x"[..]).await.unwrap();
        keep.release(&kept).await;
        assert!(stored_path(&kept).exists());

        let (_dir2, delete) = store(UploadRetention::Delete).await;
        let deleted = delete.persist(Some("a.png"), &b"x"[..]).await.unwrap();
        delete.release(&deleted).await;
        assert!(!stored_path(&deleted).exists());
    }

    #[tokio::test]
    async fn interrupted_upload_leaves_no_partial_file() {
        let (_dir, store) = store(UploadRetention::Retain).await;
        let body = futures::stream::iter(vec![
            Ok(&b"partial"[..]),
            Err(std::io::Error::other("client went away")),
        ]);

        let err = store
            .persist(Some("cat.png"), tokio_util::io::StreamReader::new(body))
            .await
            .unwrap_err();

        assert!(err.path.starts_with(store.dir()));
        assert!(!err.path.exists());
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
    }
}
