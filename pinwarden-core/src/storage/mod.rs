//! Content store boundary.
//!
//! The pinning engine only needs three calls from the store: read the
//! bytes behind a hash, pin it, and unpin it.

pub mod ipfs;
pub mod memory;

pub use ipfs::IpfsHttpStore;
pub use memory::MemoryContentStore;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn fetch(&self, hash: &str) -> Result<Bytes>;

    async fn pin_add(&self, hash: &str) -> Result<()>;

    /// Returns [`crate::WardenError::NotPinned`] when the store holds no pin for `hash`.
    async fn pin_remove(&self, hash: &str) -> Result<()>;
}
