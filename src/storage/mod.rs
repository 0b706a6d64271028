// Durable page-addressed storage.

pub mod file;

pub use file::{FileStorage, FileStorageConfig};
