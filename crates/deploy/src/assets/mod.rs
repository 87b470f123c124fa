//! Build output discovery and mirror sync to object storage.

mod manifest;
mod sync;

pub use manifest::{AssetEntry, AssetManifest, FALLBACK_CONTENT_TYPE, content_type_for};
pub use sync::{AssetSyncEngine, SyncReport};
