pub mod blob;
pub mod event_log;
pub mod index;

pub use blob::{open_blob_store, BlobStore, FilesystemBlobStore, ObjectStoreBlobStore};
pub use event_log::JsonlEventLog;
pub use index::RedbIndexStore;
