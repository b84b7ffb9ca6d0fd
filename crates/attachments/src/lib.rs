pub mod error;
pub mod sanitize;
pub mod service;
pub mod signer;
pub mod store;

pub use error::AttachmentError;
pub use service::{AttachmentService, SavedAttachment};
pub use signer::UrlSigner;
pub use store::BlobStore;
