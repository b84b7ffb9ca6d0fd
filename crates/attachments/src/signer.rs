//! Signed-URL issuance (spec §4.5 "issues a signed GET URL with TTL =
//! retention"). `object_store` has no backend-agnostic presigning API, so
//! URLs are signed here and verified by the gateway's download route rather
//! than delegated to a cloud SDK — this keeps the same code path working
//! for the local-filesystem store used in development.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

#[derive(Clone)]
pub struct UrlSigner {
    base_url: Url,
    secret: String,
}

impl UrlSigner {
    pub fn new(base_url: impl AsRef<str>, secret: impl Into<String>) -> Self {
        let mut base_url = Url::parse(base_url.as_ref()).expect("ATTACHMENTS_BASE_URL must be a valid URL");
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        Self {
            base_url,
            secret: secret.into(),
        }
    }

    /// Builds a signed GET URL for `blob_key`, valid until `expires_at`.
    pub fn sign(&self, blob_key: &str, expires_at: DateTime<Utc>) -> String {
        let expires_unix = expires_at.timestamp();
        let sig = self.digest(blob_key, expires_unix);

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .expect("base_url is not a cannot-be-a-base URL")
            .extend(blob_key.split('/'));
        url.query_pairs_mut()
            .append_pair("expires", &expires_unix.to_string())
            .append_pair("sig", &sig);
        url.to_string()
    }

    /// Verifies a `(blob_key, expires_unix, sig)` triple extracted from an
    /// incoming request against tampering and expiry.
    pub fn verify(&self, blob_key: &str, expires_unix: i64, sig: &str) -> bool {
        if Utc::now().timestamp() > expires_unix {
            return false;
        }
        self.digest(blob_key, expires_unix) == sig
    }

    fn digest(&self, blob_key: &str, expires_unix: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"|");
        hasher.update(blob_key.as_bytes());
        hasher.update(b"|");
        hasher.update(expires_unix.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn a_freshly_signed_url_verifies() {
        let signer = UrlSigner::new("https://gw.example/api/attachments", "s3cr3t");
        let expires = Utc::now() + Duration::hours(1);
        let url = signer.sign("s1/a1__photo.png", expires);

        assert!(url.starts_with("https://gw.example/api/attachments/s1/a1__photo.png?expires="));

        let sig = url.rsplit("sig=").next().unwrap();
        assert!(signer.verify("s1/a1__photo.png", expires.timestamp(), sig));
    }

    #[test]
    fn an_expired_signature_does_not_verify() {
        let signer = UrlSigner::new("https://gw.example", "s3cr3t");
        let expires = Utc::now() - Duration::hours(1);
        let sig_digest = signer.digest("key", expires.timestamp());
        assert!(!signer.verify("key", expires.timestamp(), &sig_digest));
    }

    #[test]
    fn a_tampered_key_fails_verification() {
        let signer = UrlSigner::new("https://gw.example", "s3cr3t");
        let expires = Utc::now() + Duration::hours(1);
        let url = signer.sign("s1/a1__photo.png", expires);
        let sig = url.rsplit("sig=").next().unwrap();
        assert!(!signer.verify("s1/a1__other.png", expires.timestamp(), sig));
    }
}
