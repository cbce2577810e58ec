//! Map persistence: the versioned store, directory ownership, CSV export.

pub mod export;
pub mod format;
pub mod lock;
pub mod map_store;

pub use export::{export_csv, ExportSummary};
pub use format::{MapMetadata, MapSnapshot, RestoredMap, SessionIdentity, FORMAT_VERSION};
pub use lock::DirectoryLock;
pub use map_store::{read_snapshot, MapStore, MapStoreConfig};
