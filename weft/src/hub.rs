//! The seam between the host and the document state engine.

use async_trait::async_trait;
use futures::stream::BoxStream;
use weft_base::Address;

use crate::tx::{Keypath, StateNode, Tx, TxId};
use crate::Result;

/// A lazy walk over a document's tx log.
///
/// Ordering is whatever the engine's topology gives, with the guarantee
/// that parents precede children. Dropping the stream cancels the walk and
/// releases its resources.
pub type TxStream = BoxStream<'static, Result<Tx>>;

/// Callback invoked after each commit with the tx, the resulting state
/// snapshot and the new leaves.
pub type NewStateCallback = Box<dyn Fn(Tx, StateNode, Vec<TxId>) + Send + Sync>;

/// The document state engine: applies patches, materialises state, answers
/// membership queries.
///
/// Calls may block on storage; the host treats every method as a suspension
/// point.
#[async_trait]
pub trait ControllerHub: Send + Sync {
    async fn have_tx(&self, state_uri: &str, tx_id: TxId) -> Result<bool>;

    /// Commit a tx. `force` bypasses validation for locally trusted input.
    async fn add_tx(&self, tx: &Tx, force: bool) -> Result<()>;

    async fn fetch_tx(&self, state_uri: &str, tx_id: TxId) -> Result<Tx>;

    /// Walk the tx log, starting at `from_tx_id` when given.
    async fn fetch_txs(&self, state_uri: &str, from_tx_id: Option<TxId>) -> Result<TxStream>;

    /// The current tips of the document's DAG.
    async fn leaves(&self, state_uri: &str) -> Result<Vec<TxId>>;

    /// The materialised state, at `version` or at the current head.
    /// [`Error::NoController`](crate::Error::NoController) when the URI has
    /// no document yet.
    async fn state_at_version(&self, state_uri: &str, version: Option<TxId>)
        -> Result<StateNode>;

    /// Run a named index query below `keypath`.
    async fn query_index(
        &self,
        state_uri: &str,
        version: Option<TxId>,
        keypath: &Keypath,
        index_name: &str,
        query: &str,
    ) -> Result<StateNode>;

    async fn is_private(&self, state_uri: &str) -> Result<bool>;
    async fn is_member(&self, state_uri: &str, address: Address) -> Result<bool>;

    /// Register the commit callback. The engine must serialise invocations
    /// per state URI in commit order.
    fn on_new_state(&self, callback: NewStateCallback);
}
