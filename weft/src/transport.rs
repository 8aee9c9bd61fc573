//! The seam between the host and its wire transports.
//!
//! A [`Transport`] owns one wire protocol and produces [`Peer`] handles; the
//! host never touches sockets itself. Transports hold a [`HostHandle`] to
//! deliver inbound traffic back into the host, which keeps ownership acyclic
//! (the handle is weak; a transport outliving its host sees no-ops).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use weft_base::{Address, ChallengeMsg, EncryptingPublicKey, PeerDialInfo, RefId, Signature, SigningPublicKey};

use crate::host::HostHandle;
use crate::tx::{StateNode, SubscriptionMsg, Tx, TxId};
use crate::Result;

/// Size of one body packet in a ref stream.
pub const REF_CHUNK_SIZE: usize = 1024;

/// A stream of peers, e.g. the providers of a state URI.
pub type PeerStream = BoxStream<'static, Arc<dyn Peer>>;

/// The response to an identity challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeIdentityResponse {
    pub sig: Signature,
    #[serde(rename = "encryptingPublicKey")]
    pub encrypting_public_key: Vec<u8>,
}

/// Header preceding a ref stream. Carries nothing yet; the frame exists so
/// the protocol can grow metadata without breaking older peers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RefHeader {}

/// One packet of a ref stream. `end` marks the terminator; its `data` is
/// empty.
#[derive(Debug, Clone, Default)]
pub struct RefPacket {
    pub data: Bytes,
    pub end: bool,
}

/// An inbound subscription to a remote peer's view of a state URI.
///
/// Reading yields frames until the remote closes or errors; `close` is
/// idempotent.
#[async_trait]
pub trait ReadableSubscription: Send {
    async fn read(&mut self) -> Result<SubscriptionMsg>;
    async fn close(&mut self) -> Result<()>;
}

/// An addressable remote node, as produced by one transport.
///
/// Handles are cheap to clone behind `Arc` and internally synchronised; the
/// host calls them from many tasks.
#[async_trait]
pub trait Peer: Send + Sync {
    /// The registry key for this peer.
    fn dial_info(&self) -> PeerDialInfo;

    /// The verified address, or [`Address::ZERO`] when unknown.
    fn address(&self) -> Address;

    /// Cached credentials, if the peer has been verified.
    fn public_keypairs(&self) -> (Option<SigningPublicKey>, Option<EncryptingPublicKey>);

    /// Record the outcome of a connection attempt.
    fn update_conn_stats(&self, success: bool);

    async fn ensure_connected(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    /// Push a tx (and optionally the resulting state) to this peer.
    async fn put(&self, tx: &Tx, state: Option<&StateNode>, leaves: &[TxId]) -> Result<()>;

    /// Tell the peer we have seen the given tx.
    async fn ack(&self, state_uri: &str, tx_id: TxId) -> Result<()>;

    async fn challenge_identity(&self, challenge: ChallengeMsg) -> Result<()>;
    async fn receive_challenge_identity_response(&self) -> Result<ChallengeIdentityResponse>;
    async fn respond_challenge_identity(&self, response: ChallengeIdentityResponse) -> Result<()>;

    async fn fetch_ref(&self, ref_id: RefId) -> Result<()>;
    async fn send_ref_header(&self) -> Result<()>;
    async fn send_ref_packet(&self, data: Bytes, end: bool) -> Result<()>;
    async fn receive_ref_header(&self) -> Result<RefHeader>;
    async fn receive_ref_packet(&self) -> Result<RefPacket>;

    /// Open an inbound subscription to this peer's copy of `state_uri`.
    async fn subscribe(&self, state_uri: &str) -> Result<Box<dyn ReadableSubscription>>;
}

/// One wire protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    /// Give the transport its way back into the host. Called once, before
    /// `start`.
    fn set_host(&self, host: HostHandle);

    /// Open a peer handle for a dial address. Dialing the local node fails
    /// with [`Error::PeerIsSelf`](crate::Error::PeerIsSelf).
    async fn new_peer_conn(&self, dial_addr: &str) -> Result<Arc<dyn Peer>>;

    /// Peers this transport believes possess `state_uri`.
    async fn providers_of_state_uri(&self, state_uri: &str) -> Result<PeerStream>;

    /// Peers this transport believes possess the ref. May be
    /// [`Error::Unimplemented`](crate::Error::Unimplemented).
    async fn providers_of_ref(&self, ref_id: RefId) -> Result<PeerStream>;

    /// Peers claiming the given address. May be
    /// [`Error::Unimplemented`](crate::Error::Unimplemented).
    async fn peers_claiming_address(&self, address: Address) -> Result<PeerStream>;

    /// Announce that we now provide the ref. May be
    /// [`Error::Unimplemented`](crate::Error::Unimplemented).
    async fn announce_ref(&self, ref_id: RefId) -> Result<()>;
}
