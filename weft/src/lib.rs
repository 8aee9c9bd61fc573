//! A peer-to-peer host that replicates mutable, versioned state trees.
//!
//! Each document ("state URI") is the materialised state of a causal DAG of
//! signed transactions. Peers discover one another through pluggable
//! [`Transport`]s, exchange txs over per-URI subscriptions with per-peer
//! duplicate suppression, authenticate each other with an identity
//! challenge, and swap content-addressed blobs ("refs") referenced by the
//! documents.
//!
//! The [`Host`] is the coordinator. It owns the peer registry, the
//! subscription fan-out engine, the tx ingest/broadcast pipeline and the
//! ref fetcher. The wire transports, the document state engine
//! ([`ControllerHub`]) and the blob store ([`RefStore`]) are injected
//! collaborators: the host never touches sockets or storage itself.
//!
//! Delivery is at-least-once and duplicate-suppressed, never guaranteed:
//! fan-out failures are isolated per peer and retried on periodic ticks,
//! and the DAG tolerates branching, so there is no consensus layer.
//!
//! [`Transport`]: crate::transport::Transport

pub mod challenge;
pub mod config;
pub mod error;
mod fetch;
pub mod host;
pub mod hub;
pub mod peer_store;
pub mod refstore;
pub mod seen;
pub mod subs;
pub mod transport;
pub mod tx;
pub mod util;

pub use config::{Config, NodeConfig, SharedConfig};
pub use error::{Error, Result};
pub use host::{Host, HostBuilder, HostHandle};
pub use hub::{ControllerHub, NewStateCallback, TxStream};
pub use peer_store::{PeerDetails, PeerStore};
pub use refstore::{ObjectReader, RefStore, RefsNeededCallback};
pub use seen::SeenCache;
pub use subs::{
    InProcessSubscription, MultiReaderSubscription, Subscription, SubscriptionIdentity,
    SubscriptionRegistry, WritableSubscription,
};
pub use transport::{
    ChallengeIdentityResponse, Peer, PeerStream, ReadableSubscription, RefHeader, RefPacket,
    Transport, REF_CHUNK_SIZE,
};
pub use tx::{
    EncryptedTx, Keypath, Patch, PatchRange, StateNode, SubscriptionMsg, SubscriptionType, Tx,
    TxId, GENESIS_TX_ID,
};
