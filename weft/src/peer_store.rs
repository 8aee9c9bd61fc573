//! The registry of every peer this node has ever sighted.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::debug;
use weft_base::{Address, EncryptingPublicKey, PeerDialInfo, SigningPublicKey};

/// Callback fired when a dial info is sighted for the first time.
pub type NewUnverifiedPeerCallback = Box<dyn Fn(PeerDialInfo) + Send + Sync>;

/// Connection bookkeeping for one peer.
#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    pub last_contact: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub failures: u64,
}

/// Everything the node knows about one `(transport, dial address)` pair.
#[derive(Clone)]
pub struct PeerDetails {
    pub dial_info: PeerDialInfo,
    pub address: Option<Address>,
    pub sig_pubkey: Option<SigningPublicKey>,
    pub enc_pubkey: Option<EncryptingPublicKey>,
    pub verified: bool,
    pub stats: PeerStats,
}

impl PeerDetails {
    fn sighted(dial_info: PeerDialInfo) -> Self {
        Self {
            dial_info,
            address: None,
            sig_pubkey: None,
            enc_pubkey: None,
            verified: false,
            stats: PeerStats::default(),
        }
    }
}

impl std::fmt::Debug for PeerDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDetails")
            .field("dial_info", &self.dial_info)
            .field("address", &self.address)
            .field("verified", &self.verified)
            .finish_non_exhaustive()
    }
}

/// Peers keyed by dial info, with their verification state and cached
/// credentials.
///
/// Credentials are sticky: once a peer is verified, later unverified
/// sightings of the same dial info do not clear what we know.
#[derive(Default)]
pub struct PeerStore {
    peers: RwLock<HashMap<PeerDialInfo, PeerDetails>>,
    on_new_unverified: RwLock<Option<NewUnverifiedPeerCallback>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the new-unverified-peer callback. Replaces any previous one.
    pub fn on_new_unverified_peer(&self, callback: NewUnverifiedPeerCallback) {
        *self.on_new_unverified.write() = Some(callback);
    }

    /// Idempotent insert. Fires the new-unverified-peer callback once per
    /// dial info that was actually new.
    pub fn add_dial_infos(&self, dial_infos: impl IntoIterator<Item = PeerDialInfo>) {
        let mut fresh = Vec::new();
        {
            let mut peers = self.peers.write();
            for dial_info in dial_infos {
                if dial_info.dial_addr.is_empty() {
                    continue;
                }
                if !peers.contains_key(&dial_info) {
                    debug!(peer = %dial_info, "new unverified peer");
                    peers.insert(dial_info.clone(), PeerDetails::sighted(dial_info.clone()));
                    fresh.push(dial_info);
                }
            }
        }
        if fresh.is_empty() {
            return;
        }
        let callback = self.on_new_unverified.read();
        if let Some(callback) = callback.as_ref() {
            for dial_info in fresh {
                callback(dial_info);
            }
        }
    }

    /// Attach verified credentials to a dial info, inserting it if needed.
    pub fn add_verified_credentials(
        &self,
        dial_info: PeerDialInfo,
        address: Address,
        sig_pubkey: SigningPublicKey,
        enc_pubkey: Option<EncryptingPublicKey>,
    ) {
        let mut peers = self.peers.write();
        let entry = peers
            .entry(dial_info.clone())
            .or_insert_with(|| PeerDetails::sighted(dial_info));
        entry.address = Some(address);
        entry.sig_pubkey = Some(sig_pubkey);
        if enc_pubkey.is_some() {
            entry.enc_pubkey = enc_pubkey;
        }
        entry.verified = true;
    }

    pub fn peer_with_dial_info(&self, dial_info: &PeerDialInfo) -> Option<PeerDetails> {
        self.peers.read().get(dial_info).cloned()
    }

    /// All verified peers reachable over `transport` that claim `address`.
    pub fn peers_from_transport_with_address(
        &self,
        transport: &str,
        address: Address,
    ) -> Vec<PeerDetails> {
        self.peers
            .read()
            .values()
            .filter(|details| {
                details.dial_info.transport == transport && details.address == Some(address)
            })
            .cloned()
            .collect()
    }

    pub fn all_dial_infos(&self) -> Vec<PeerDialInfo> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn unverified_peers(&self) -> Vec<PeerDetails> {
        self.peers
            .read()
            .values()
            .filter(|details| !details.verified)
            .cloned()
            .collect()
    }

    /// Record the outcome of a connection attempt against the stats.
    pub fn record_conn_outcome(&self, dial_info: &PeerDialInfo, success: bool) {
        let mut peers = self.peers.write();
        if let Some(details) = peers.get_mut(dial_info) {
            if success {
                details.stats.last_contact = Some(Instant::now());
            } else {
                details.stats.last_failure = Some(Instant::now());
                details.stats.failures += 1;
            }
        }
    }
}
