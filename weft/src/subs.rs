//! Subscription plumbing: outbound (writable) sinks, the per-URI registry,
//! and the multi-reader that aggregates inbound provider subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, Instrument};
use weft_base::{Address, PeerDialInfo};

use crate::host::HostHandle;
use crate::transport::Peer;
use crate::tx::{Keypath, StateNode, SubscriptionMsg, SubscriptionType, Tx, TxId};
use crate::{Error, Result};

/// How often the multi-reader re-polls for providers.
const PROVIDER_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// First redial delay after an inbound subscription fails.
const REDIAL_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Redial delay cap.
const REDIAL_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Buffered frames in the multi-reader merge channel.
const MERGE_CHANNEL_CAP: usize = 256;
/// Buffered frames per in-process subscription.
const IN_PROCESS_CHANNEL_CAP: usize = 64;

/// Who a writable subscription delivers to, for per-broadcast send
/// deduplication. Remote subscribers collapse onto their dial info so a
/// subscriber that also shows up as a provider gets exactly one copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionIdentity {
    Peer(PeerDialInfo),
    Local(u64),
}

/// An outbound sink for one subscriber of a state URI.
///
/// Implemented by transports for remote peers and by
/// [`InProcessSubscription`] for local consumers.
#[async_trait]
pub trait WritableSubscription: Send + Sync {
    fn state_uri(&self) -> &str;
    fn subscription_type(&self) -> SubscriptionType;
    fn keypath(&self) -> &Keypath;
    fn identity(&self) -> SubscriptionIdentity;

    /// The subscriber's verified address, for remote peers. In-process
    /// subscribers return `None` and are trusted.
    fn peer_address(&self) -> Option<Address> {
        None
    }

    /// Deliver a frame. The sink must preserve the order of calls.
    async fn write(
        &self,
        tx: Option<&Tx>,
        state: Option<&StateNode>,
        leaves: &[TxId],
    ) -> Result<()>;

    /// Deliver a private tx. Remote sinks seal the payload for the
    /// subscriber; in-process sinks deliver plaintext.
    async fn write_private(
        &self,
        tx: &Tx,
        state: Option<&StateNode>,
        leaves: &[TxId],
    ) -> Result<()>;

    /// Release transport-level resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

static NEXT_LOCAL_SUB_ID: AtomicU64 = AtomicU64::new(0);

/// The consumer half of an in-process subscription.
pub struct Subscription {
    msg_rx: mpsc::Receiver<SubscriptionMsg>,
    closed: CancellationToken,
}

impl Subscription {
    /// The next frame, or `None` once the subscription has closed.
    pub async fn next(&mut self) -> Option<SubscriptionMsg> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            msg = self.msg_rx.recv() => msg,
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// A writable subscription delivering into the local process over a
/// channel.
pub struct InProcessSubscription {
    id: u64,
    state_uri: String,
    subscription_type: SubscriptionType,
    keypath: Keypath,
    msg_tx: mpsc::Sender<SubscriptionMsg>,
    closed: CancellationToken,
}

impl InProcessSubscription {
    pub fn new(
        state_uri: impl Into<String>,
        subscription_type: SubscriptionType,
        keypath: Keypath,
    ) -> (Arc<Self>, Subscription) {
        let (msg_tx, msg_rx) = mpsc::channel(IN_PROCESS_CHANNEL_CAP);
        let closed = CancellationToken::new();
        let sub = Arc::new(Self {
            id: NEXT_LOCAL_SUB_ID.fetch_add(1, Ordering::Relaxed),
            state_uri: state_uri.into(),
            subscription_type,
            keypath,
            msg_tx,
            closed: closed.clone(),
        });
        let reader = Subscription { msg_rx, closed };
        (sub, reader)
    }

    async fn deliver(&self, msg: SubscriptionMsg) -> Result<()> {
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(Error::connection("in-process subscription closed"))
            }
            sent = self.msg_tx.send(msg) => {
                sent.map_err(|_| Error::connection("in-process subscriber went away"))
            }
        }
    }
}

#[async_trait]
impl WritableSubscription for InProcessSubscription {
    fn state_uri(&self) -> &str {
        &self.state_uri
    }

    fn subscription_type(&self) -> SubscriptionType {
        self.subscription_type
    }

    fn keypath(&self) -> &Keypath {
        &self.keypath
    }

    fn identity(&self) -> SubscriptionIdentity {
        SubscriptionIdentity::Local(self.id)
    }

    async fn write(
        &self,
        tx: Option<&Tx>,
        state: Option<&StateNode>,
        leaves: &[TxId],
    ) -> Result<()> {
        self.deliver(SubscriptionMsg {
            tx: tx.cloned(),
            state: state.cloned(),
            leaves: leaves.to_vec(),
            encrypted_tx: None,
        })
        .await
    }

    async fn write_private(
        &self,
        tx: &Tx,
        state: Option<&StateNode>,
        leaves: &[TxId],
    ) -> Result<()> {
        // Local consumers sit inside the trust boundary; no sealing.
        self.write(Some(tx), state, leaves).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// For a state URI this node replicates, keeps up to `max_peers` concurrent
/// inbound subscriptions to discovered providers and merges their frames
/// into one stream feeding the host's tx pipeline.
pub struct MultiReaderSubscription {
    state_uri: String,
    max_peers: usize,
    host: HostHandle,
    cancel: CancellationToken,
    active: Mutex<HashSet<PeerDialInfo>>,
    msg_tx: mpsc::Sender<(SubscriptionMsg, Arc<dyn Peer>)>,
}

impl MultiReaderSubscription {
    pub fn new(
        state_uri: impl Into<String>,
        max_peers: usize,
        host: HostHandle,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        let state_uri = state_uri.into();
        let cancel = parent_cancel.child_token();
        let (msg_tx, mut msg_rx) = mpsc::channel::<(SubscriptionMsg, Arc<dyn Peer>)>(
            MERGE_CHANNEL_CAP,
        );

        let sub = Arc::new(Self {
            state_uri: state_uri.clone(),
            max_peers,
            host: host.clone(),
            cancel: cancel.clone(),
            active: Mutex::new(HashSet::new()),
            msg_tx,
        });

        // Drain the merged stream into the tx pipeline.
        tokio::spawn(
            async move {
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = msg_rx.recv() => next,
                    };
                    let Some((msg, peer)) = next else { return };
                    if let Some(tx) = msg.tx {
                        host.handle_tx_received(tx, peer).await;
                    }
                }
            }
            .instrument(error_span!("sub-merge", state_uri = %state_uri)),
        );

        sub
    }

    pub fn state_uri(&self) -> &str {
        &self.state_uri
    }

    /// Spawn the provider-poll loop.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(
            async move {
                loop {
                    this.poll_providers().await;
                    tokio::select! {
                        _ = this.cancel.cancelled() => return,
                        _ = tokio::time::sleep(PROVIDER_POLL_INTERVAL) => {}
                    }
                }
            }
            .instrument(error_span!("multi-reader", state_uri = %self.state_uri)),
        );
    }

    async fn poll_providers(self: &Arc<Self>) {
        let mut providers = self.host.providers_of_state_uri(&self.state_uri).await;
        loop {
            let peer = tokio::select! {
                _ = self.cancel.cancelled() => return,
                peer = providers.next() => match peer {
                    Some(peer) => peer,
                    None => return,
                },
            };
            self.maybe_spawn_reader(peer);
        }
    }

    fn maybe_spawn_reader(self: &Arc<Self>, peer: Arc<dyn Peer>) {
        let dial_info = peer.dial_info();
        {
            let mut active = self.active.lock();
            if active.len() >= self.max_peers || active.contains(&dial_info) {
                return;
            }
            active.insert(dial_info.clone());
        }

        let this = self.clone();
        tokio::spawn(
            async move {
                this.read_from_provider(peer).await;
                this.active.lock().remove(&dial_info);
            }
            .instrument(error_span!("sub-reader", state_uri = %self.state_uri)),
        );
    }

    /// Read frames from one provider until cancelled, redialing with capped
    /// exponential back-off after failures.
    async fn read_from_provider(&self, peer: Arc<dyn Peer>) {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(REDIAL_BACKOFF_INITIAL)
            .with_max_interval(REDIAL_BACKOFF_MAX)
            .with_max_elapsed_time(None)
            .build();

        while !self.cancel.is_cancelled() {
            match peer.subscribe(&self.state_uri).await {
                Ok(mut sub) => {
                    loop {
                        let next = tokio::select! {
                            _ = self.cancel.cancelled() => {
                                let _ = sub.close().await;
                                return;
                            }
                            next = sub.read() => next,
                        };
                        match next {
                            Ok(msg) => {
                                backoff.reset();
                                if self.msg_tx.send((msg, peer.clone())).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                debug!(peer = %peer.dial_info(), %err, "subscription read failed");
                                let _ = sub.close().await;
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!(peer = %peer.dial_info(), %err, "could not subscribe to provider");
                }
            }

            let Some(delay) = backoff.next_backoff() else {
                return;
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Tear down the poll loop and every inbound subscription. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Per-URI subscription bookkeeping: at most one multi-reader per state URI
/// plus the set of open writable subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    readable: Mutex<HashMap<String, Arc<MultiReaderSubscription>>>,
    writable: Mutex<HashMap<String, Vec<Arc<dyn WritableSubscription>>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_readable(&self, state_uri: &str) -> bool {
        self.readable.lock().contains_key(state_uri)
    }

    /// Register the multi-reader for a URI. Returns `false` (dropping
    /// nothing) when one already exists.
    pub fn insert_readable(&self, sub: Arc<MultiReaderSubscription>) -> bool {
        let mut readable = self.readable.lock();
        match readable.entry(sub.state_uri().to_string()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(sub);
                true
            }
        }
    }

    pub fn remove_readable(&self, state_uri: &str) -> Option<Arc<MultiReaderSubscription>> {
        self.readable.lock().remove(state_uri)
    }

    pub fn add_writable(&self, sub: Arc<dyn WritableSubscription>) {
        let mut writable = self.writable.lock();
        writable
            .entry(sub.state_uri().to_string())
            .or_default()
            .push(sub);
    }

    /// Remove a writable subscription. Returns whether it was present, so
    /// the caller can run the close handler exactly once.
    pub fn remove_writable(&self, sub: &Arc<dyn WritableSubscription>) -> bool {
        let mut writable = self.writable.lock();
        let Some(subs) = writable.get_mut(sub.state_uri()) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|existing| !Arc::ptr_eq(existing, sub));
        let removed = subs.len() < before;
        if subs.is_empty() {
            writable.remove(sub.state_uri());
        }
        removed
    }

    pub fn writables_for(&self, state_uri: &str) -> Vec<Arc<dyn WritableSubscription>> {
        self.writable
            .lock()
            .get(state_uri)
            .cloned()
            .unwrap_or_default()
    }

    /// Close every readable subscription; used at shutdown.
    pub fn close_all_readable(&self) {
        for sub in self.readable.lock().values() {
            sub.close();
        }
    }
}
