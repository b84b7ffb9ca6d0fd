//! Attachment Service (spec §4.5): mediates user uploads and tool-generated
//! media — validation, blob storage, signed-URL issuance, and the row in
//! `repository`.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use repository::{Attachment, Content, ContentPart, Message, Repository};

use crate::error::{AttachmentError, Result};
use crate::sanitize::sanitize_file_name;
use crate::signer::UrlSigner;
use crate::store::BlobStore;

#[derive(Debug, Clone)]
pub struct SavedAttachment {
    pub attachment_id: String,
    pub signed_url: String,
    pub expires_at: String,
    pub mime: String,
    pub size: u64,
}

pub struct AttachmentService {
    repository: Arc<Repository>,
    store: BlobStore,
    signer: UrlSigner,
    allowed_mime_types: Vec<String>,
    max_size_bytes: u64,
    retention_days: u64,
}

impl AttachmentService {
    pub fn new(
        repository: Arc<Repository>,
        store: BlobStore,
        signer: UrlSigner,
        allowed_mime_types: Vec<String>,
        max_size_bytes: u64,
        retention_days: u64,
    ) -> Self {
        Self {
            repository,
            store,
            signer,
            allowed_mime_types,
            max_size_bytes,
            retention_days,
        }
    }

    /// Validates, stores, and records a user-supplied upload. Rejections
    /// never reach the blob store or the repository (spec §7
    /// `attachment_validation`: "no persistence").
    pub async fn save_upload(
        &self,
        session_id: &str,
        bytes: Bytes,
        declared_mime: &str,
        declared_name: &str,
    ) -> Result<SavedAttachment> {
        self.validate(declared_mime, bytes.len() as u64)?;
        let safe_name = sanitize_file_name(declared_name);
        self.store_and_record(session_id, bytes, declared_mime, Some(&safe_name)).await
    }

    /// Same as [`save_upload`](Self::save_upload) but for tool-generated
    /// media, which carries no user-supplied file name.
    pub async fn save_tool_image(
        &self,
        session_id: &str,
        bytes: Bytes,
        mime: &str,
    ) -> Result<SavedAttachment> {
        self.validate(mime, bytes.len() as u64)?;
        self.store_and_record(session_id, bytes, mime, None).await
    }

    /// Reissues the signed URL if `attachment`'s expiry is within the
    /// refresh threshold, persisting the new expiry. Returns the
    /// (possibly unchanged) attachment row.
    pub async fn refresh_if_stale(&self, attachment: Attachment) -> Result<Attachment> {
        let expires_at = attachment
            .signed_url_expires_at
            .parse::<chrono::DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now());

        let threshold = Duration::seconds(
            gateway_core::config::DEFAULT_ATTACHMENTS_REFRESH_THRESHOLD_SECS,
        );
        if expires_at - Utc::now() > threshold {
            return Ok(attachment);
        }

        let new_expires_at = Utc::now() + Duration::days(self.retention_days as i64);
        let signed_url = self.signer.sign(&attachment.blob_key, new_expires_at);

        self.repository.update_attachment_signed_url(
            &attachment.attachment_id,
            &signed_url,
            &new_expires_at.to_rfc3339(),
        )?;

        Ok(Attachment {
            signed_url,
            signed_url_expires_at: new_expires_at.to_rfc3339(),
            ..attachment
        })
    }

    /// Refreshes every near-expiry image-url content part in `message`
    /// (spec §4.1 step 2: "Refresh any attachment signed URLs whose TTL is
    /// below a threshold... updating the persisted URL and expiry in the
    /// same transaction"). Shared by the history-load path (both the
    /// `/api/chat/session/{id}/messages` endpoint and the orchestrator's own
    /// history load ahead of a provider call) so neither can feed a stale
    /// URL downstream.
    pub async fn refresh_message_urls(&self, mut message: Message) -> Message {
        let Content::Parts { parts } = &mut message.content else {
            return message;
        };
        for part in parts.iter_mut() {
            let ContentPart::ImageUrl { url, attachment_id: Some(attachment_id), .. } = part else {
                continue;
            };
            let Ok(Some(attachment)) = self.repository.get_attachment(attachment_id) else {
                continue;
            };
            if let Ok(refreshed) = self.refresh_if_stale(attachment).await {
                *url = refreshed.signed_url;
            }
        }
        message
    }

    /// Removes the row and its blob. Idempotent: deleting an already-deleted
    /// or unknown id is not an error.
    pub async fn delete(&self, attachment_id: &str) -> Result<()> {
        if let Some(attachment) = self.repository.get_attachment(attachment_id)? {
            self.store.delete(&attachment.blob_key).await?;
        }
        self.repository.delete_attachment(attachment_id)?;
        Ok(())
    }

    fn validate(&self, mime: &str, size: u64) -> Result<()> {
        if !self.allowed_mime_types.iter().any(|m| m == mime) {
            return Err(AttachmentError::UnsupportedMimeType(mime.to_string()));
        }
        if size > self.max_size_bytes {
            return Err(AttachmentError::TooLarge {
                size,
                limit: self.max_size_bytes,
            });
        }
        Ok(())
    }

    async fn store_and_record(
        &self,
        session_id: &str,
        bytes: Bytes,
        mime: &str,
        safe_name: Option<&str>,
    ) -> Result<SavedAttachment> {
        let attachment_id = gateway_core::ids::new_id();
        let size = bytes.len() as u64;

        // Blob path is derived from the stable identity (spec §4.5
        // invariant): `{session_id}/{attachment_id}[__{safe_name}]`.
        let blob_key = match safe_name {
            Some(name) => format!("{session_id}/{attachment_id}__{name}"),
            None => format!("{session_id}/{attachment_id}"),
        };

        self.store.put(&blob_key, bytes).await?;

        let expires_at = Utc::now() + Duration::days(self.retention_days as i64);
        let signed_url = self.signer.sign(&blob_key, expires_at);
        let created_at = gateway_core::time::now_rfc3339();
        let expires_at_str = expires_at.to_rfc3339();

        let attachment = Attachment {
            attachment_id: attachment_id.clone(),
            session_id: session_id.to_string(),
            blob_key,
            mime_type: mime.to_string(),
            size_bytes: size,
            signed_url: signed_url.clone(),
            signed_url_expires_at: expires_at_str.clone(),
            created_at,
        };
        self.repository.insert_attachment(&attachment)?;

        Ok(SavedAttachment {
            attachment_id,
            signed_url,
            expires_at: expires_at_str,
            mime: mime.to_string(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (AttachmentService, tempfile::TempDir) {
        let db_dir = tempfile::tempdir().unwrap();
        let blob_dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(Repository::new(db_dir.path().join("db.sqlite").to_str().unwrap()).unwrap());
        let store = BlobStore::local(blob_dir.path()).unwrap();
        let signer = UrlSigner::new("https://gw.example/api/attachments", "s3cr3t");
        let service = AttachmentService::new(
            repo,
            store,
            signer,
            vec!["image/png".to_string()],
            1024,
            7,
        );
        (service, blob_dir)
    }

    #[tokio::test]
    async fn rejects_disallowed_mime_types_without_persisting() {
        let (service, _dir) = harness();
        let err = service
            .save_upload("s1", Bytes::from_static(b"data"), "application/zip", "a.zip")
            .await
            .unwrap_err();
        assert!(matches!(err, AttachmentError::UnsupportedMimeType(_)));
    }

    #[tokio::test]
    async fn rejects_oversized_uploads() {
        let (service, _dir) = harness();
        let big = Bytes::from(vec![0u8; 2048]);
        let err = service
            .save_upload("s1", big, "image/png", "a.png")
            .await
            .unwrap_err();
        assert!(matches!(err, AttachmentError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn saves_and_deletes_an_upload() {
        let (service, _dir) = harness();
        let saved = service
            .save_upload("s1", Bytes::from_static(b"png-bytes"), "image/png", "../evil.png")
            .await
            .unwrap();
        assert!(saved.signed_url.contains("s1/"));
        assert!(!saved.signed_url.contains(".."));

        service.delete(&saved.attachment_id).await.unwrap();
        assert!(service
            .repository
            .get_attachment(&saved.attachment_id)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn refresh_if_stale_leaves_a_fresh_url_untouched() {
        let (service, _dir) = harness();
        let saved = service
            .save_upload("s1", Bytes::from_static(b"png-bytes"), "image/png", "a.png")
            .await
            .unwrap();
        let row = service
            .repository
            .get_attachment(&saved.attachment_id)
            .unwrap()
            .unwrap();

        let refreshed = service.refresh_if_stale(row.clone()).await.unwrap();
        assert_eq!(refreshed.signed_url, row.signed_url);
    }

    #[tokio::test]
    async fn refresh_if_stale_reissues_a_url_past_the_threshold() {
        let (service, _dir) = harness();
        let saved = service
            .save_upload("s1", Bytes::from_static(b"png-bytes"), "image/png", "a.png")
            .await
            .unwrap();
        let mut row = service
            .repository
            .get_attachment(&saved.attachment_id)
            .unwrap()
            .unwrap();

        // Backdate the expiry to just inside the refresh threshold, as if
        // retention were about to lapse (spec S5: 6-day-old message, 7-day
        // retention, 10% threshold).
        let near_expiry = chrono::Utc::now() + chrono::Duration::seconds(30);
        row.signed_url_expires_at = near_expiry.to_rfc3339();

        let refreshed = service.refresh_if_stale(row.clone()).await.unwrap();
        assert_ne!(refreshed.signed_url, row.signed_url);

        let new_expires_at: chrono::DateTime<Utc> =
            refreshed.signed_url_expires_at.parse().unwrap();
        assert!(new_expires_at > near_expiry + chrono::Duration::days(6));

        let persisted = service
            .repository
            .get_attachment(&saved.attachment_id)
            .unwrap()
            .unwrap();
        assert_eq!(persisted.signed_url, refreshed.signed_url);
        assert_eq!(persisted.signed_url_expires_at, refreshed.signed_url_expires_at);
    }
}
