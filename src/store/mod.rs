//! Player record persistence

pub mod records;

#[cfg(test)]
pub mod memory;

pub use records::{FileStore, RecordStore, StoreError};

#[cfg(test)]
pub use memory::MemoryStore;
