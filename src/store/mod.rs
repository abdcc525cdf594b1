pub mod adapter;
pub mod blob;
pub mod collection;
pub mod file;
pub mod memory;
pub mod record;

use crate::domain::OwnerId;
use crate::error::Result;
use async_trait::async_trait;

pub use adapter::{Subscription, TaskStoreAdapter};
pub use blob::{BlobStore, LocalBlobStore};
pub use collection::DocumentFeed;
pub use file::JsonFileStore;
pub use memory::MemoryDocumentStore;
pub use record::{Document, Fields, StoreTimestamp};

/// Remote document store holding the `tasks` collection.
///
/// Reads and writes are scoped to one owner: a document owned by someone
/// else behaves as if it did not exist.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Live query for documents whose `ownerId` equals `owner`.
    ///
    /// The current result set is delivered first, then a full result set
    /// after every change. Dropping the feed detaches the query.
    async fn listen(&self, owner: &OwnerId) -> Result<DocumentFeed>;

    /// Add a document. The store stamps `createdAt` and `updatedAt` and
    /// returns the new id.
    async fn insert(&self, fields: Fields) -> Result<String>;

    /// Merge fields into a document of `owner` and refresh `updatedAt`.
    /// A `null` value clears the field.
    async fn merge(&self, owner: &OwnerId, id: &str, fields: Fields) -> Result<()>;

    /// Delete a document of `owner`
    async fn delete(&self, owner: &OwnerId, id: &str) -> Result<()>;
}
