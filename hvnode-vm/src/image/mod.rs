//! Node image catalog and local payload cache

mod archive;
mod cache;
mod fetch;
mod store;
mod types;

pub use archive::{extract_single, PayloadKind};
pub use cache::ImageCache;
pub use fetch::{HttpFetcher, ImageFetcher, Progress};
pub use store::{ImageIndexStore, JsonFileStore, MemoryStore};
pub use types::{merge_catalog, normalize_manifest, Image, ImageIndex};
