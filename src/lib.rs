//! Read-only HFS and HFS+ volume reader for loading boot files.

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod loader;

pub use config::LoaderConfig;
pub use error::{HfsError, Result};
pub use fs::{DirEntry, DirIndex, EntryKind, HfsVolume};
pub use loader::{BootLoader, DeviceId, LOAD_FAILED};
