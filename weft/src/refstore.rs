//! The seam between the host and the content-addressed blob store.

use async_trait::async_trait;
use tokio::io::AsyncRead;
use weft_base::RefId;

use crate::Result;

/// A readable blob body.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Callback fired when newly committed state references blobs the store
/// does not hold yet.
pub type RefsNeededCallback = Box<dyn Fn(Vec<RefId>) + Send + Sync>;

/// The content-addressed blob store.
#[async_trait]
pub trait RefStore: Send + Sync {
    /// Persist a blob, returning its `(sha1, sha3)` identifiers.
    async fn store_object(&self, reader: ObjectReader) -> Result<(RefId, RefId)>;

    /// Open a stored blob; returns the reader and the blob's size.
    /// [`Error::NotFound`](crate::Error::NotFound) when absent.
    async fn object(&self, ref_id: RefId) -> Result<(ObjectReader, u64)>;

    /// All refs that are referenced but not yet stored.
    async fn refs_needed(&self) -> Result<Vec<RefId>>;

    /// Register the refs-needed callback. Invoked synchronously by the
    /// store; the host must not block inside it.
    fn on_refs_needed(&self, callback: RefsNeededCallback);
}
