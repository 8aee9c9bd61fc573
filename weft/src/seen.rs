//! Which peer has seen which tx.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use weft_base::{Address, PeerDialInfo};

use crate::tx::TxId;

/// Bound on tracked `(peer, state URI)` pairs.
const MAX_ENTRIES: usize = 4096;
/// Bound on tx ids remembered per pair.
const MAX_TXS_PER_ENTRY: usize = 2048;

/// Records `{peer → state URI → tx id}` observations so each tx is pushed
/// to any peer at most once per direction.
///
/// Both dimensions are LRU-bounded. Eviction can only produce false
/// negatives (a harmless re-send), never false positives (a dropped
/// delivery), so shedding under memory pressure is safe.
pub struct SeenCache {
    entries: Mutex<LruCache<(PeerDialInfo, String), LruCache<TxId, ()>>>,
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SeenCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_ENTRIES).expect("cap is nonzero"),
            )),
        }
    }

    /// Record that `peer` has seen `tx_id` under `state_uri`.
    pub fn mark(&self, peer: &PeerDialInfo, state_uri: &str, tx_id: TxId) {
        let mut entries = self.entries.lock();
        let entry = entries.get_or_insert_mut((peer.clone(), state_uri.to_string()), || {
            LruCache::new(NonZeroUsize::new(MAX_TXS_PER_ENTRY).expect("cap is nonzero"))
        });
        entry.put(tx_id, ());
    }

    /// Whether `peer` has seen `tx_id` under `state_uri`.
    ///
    /// A peer whose address is still unknown is treated as having seen
    /// nothing: over-sending to a stranger is safe, under-sending is not.
    pub fn seen(
        &self,
        peer: &PeerDialInfo,
        peer_address: Address,
        state_uri: &str,
        tx_id: TxId,
    ) -> bool {
        if peer_address.is_zero() {
            return false;
        }
        let mut entries = self.entries.lock();
        match entries.get_mut(&(peer.clone(), state_uri.to_string())) {
            Some(entry) => entry.get(&tx_id).is_some(),
            None => false,
        }
    }
}
