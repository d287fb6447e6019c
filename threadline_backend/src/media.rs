use crate::config::{MediaConfig, ThreadlinePaths};
use crate::error::{ServiceError, ServiceResult};
use anyhow::Context;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    fn label(self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::File => "file",
        }
    }
}

/// An uploaded attachment written under `media/uploads/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub stored_name: String,
    pub original_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MediaDownload {
    pub absolute_path: PathBuf,
    pub mime: String,
    pub size_bytes: u64,
}

#[derive(Clone)]
pub struct MediaService {
    paths: ThreadlinePaths,
    config: MediaConfig,
}

impl MediaService {
    pub fn new(paths: ThreadlinePaths, config: MediaConfig) -> Self {
        Self { paths, config }
    }

    pub async fn save_attachment(
        &self,
        kind: AttachmentKind,
        original_name: Option<&str>,
        data: &[u8],
    ) -> ServiceResult<StoredAttachment> {
        if data.is_empty() {
            return Err(ServiceError::Validation(format!(
                "{} upload may not be empty",
                kind.label()
            )));
        }
        if data.len() > self.config.max_upload_bytes {
            return Err(ServiceError::Validation(format!(
                "{} exceeds the {} byte upload limit",
                kind.label(),
                self.config.max_upload_bytes
            )));
        }
        let sniffed = infer::get(data);
        if kind == AttachmentKind::Image && !infer::is_image(data) {
            return Err(ServiceError::Validation(
                "image upload is not a recognised image".into(),
            ));
        }

        let original_name = original_name.map(sanitize_filename);
        let extension = sniffed.as_ref().map(|t| t.extension().to_string()).or_else(|| {
            original_name.as_deref().and_then(|name| {
                Path::new(name)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .filter(|ext| !ext.is_empty())
                    .map(str::to_string)
            })
        });
        let id = Uuid::new_v4().simple().to_string();
        let stored_name = match extension {
            Some(ext) => format!("{id}.{ext}"),
            None => id,
        };

        fs::create_dir_all(&self.paths.uploads_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create upload directory {}",
                    self.paths.uploads_dir.display()
                )
            })?;
        let absolute_path = self.paths.uploads_dir.join(&stored_name);
        fs::write(&absolute_path, data).await.with_context(|| {
            format!("failed to write upload to {}", absolute_path.display())
        })?;
        tracing::debug!(%stored_name, size = data.len(), kind = kind.label(), "stored attachment");

        Ok(StoredAttachment {
            stored_name,
            original_name,
        })
    }

    /// Removes an upload that never made it into a message.
    pub async fn discard(&self, attachment: &StoredAttachment) {
        let path = self.paths.uploads_dir.join(&attachment.stored_name);
        if let Err(err) = fs::remove_file(&path).await {
            tracing::warn!(stored_name = %attachment.stored_name, error = %err, "failed to discard upload");
        }
    }

    pub async fn open(&self, stored_name: &str) -> ServiceResult<MediaDownload> {
        let not_found = || ServiceError::NotFound(format!("media {stored_name} not found"));
        if sanitize_filename(stored_name) != stored_name || stored_name.starts_with('.') {
            return Err(not_found());
        }
        let absolute_path = self.paths.uploads_dir.join(stored_name);
        let metadata = fs::metadata(&absolute_path).await.map_err(|_| not_found())?;
        if !metadata.is_file() {
            return Err(not_found());
        }
        let mime = infer::get_from_path(&absolute_path)
            .ok()
            .flatten()
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        Ok(MediaDownload {
            absolute_path,
            mime,
            size_bytes: metadata.len(),
        })
    }
}

fn sanitize_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|file| file.to_str())
        .unwrap_or("upload")
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn service(base: &Path) -> MediaService {
        let paths = ThreadlinePaths::from_base_dir(base).expect("paths");
        MediaService::new(paths, MediaConfig { max_upload_bytes: 64 })
    }

    #[tokio::test]
    async fn image_uploads_are_sniffed_and_stored() {
        let temp = tempdir().expect("tempdir");
        let media = service(temp.path());
        let stored = media
            .save_attachment(AttachmentKind::Image, Some("cat.png"), PNG_HEADER)
            .await
            .expect("stored");
        assert!(stored.stored_name.ends_with(".png"));

        let download = media.open(&stored.stored_name).await.expect("download");
        assert_eq!(download.mime, "image/png");
        assert_eq!(download.size_bytes, PNG_HEADER.len() as u64);
    }

    #[tokio::test]
    async fn non_image_bytes_rejected_as_image() {
        let temp = tempdir().expect("tempdir");
        let err = service(temp.path())
            .save_attachment(AttachmentKind::Image, Some("notes.txt"), b"plain text")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn oversized_and_empty_uploads_rejected() {
        let temp = tempdir().expect("tempdir");
        let media = service(temp.path());
        let big = vec![1u8; 65];
        assert!(matches!(
            media.save_attachment(AttachmentKind::File, None, &big).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            media.save_attachment(AttachmentKind::File, None, &[]).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn file_uploads_keep_original_extension() {
        let temp = tempdir().expect("tempdir");
        let stored = service(temp.path())
            .save_attachment(AttachmentKind::File, Some("../notes.txt"), b"hello")
            .await
            .expect("stored");
        assert!(stored.stored_name.ends_with(".txt"));
        assert_eq!(stored.original_name.as_deref(), Some("notes.txt"));
    }

    #[tokio::test]
    async fn discarded_uploads_are_removed() {
        let temp = tempdir().expect("tempdir");
        let media = service(temp.path());
        let stored = media
            .save_attachment(AttachmentKind::File, Some("draft.txt"), b"draft")
            .await
            .expect("stored");
        media.discard(&stored).await;
        assert!(matches!(
            media.open(&stored.stored_name).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn open_rejects_path_traversal() {
        let temp = tempdir().expect("tempdir");
        let err = service(temp.path()).open("../data/threadline.db").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
