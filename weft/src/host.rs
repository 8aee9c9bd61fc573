//! The host: the coordinator that ties peers, subscriptions, the tx
//! pipeline and the ref fetcher together.
//!
//! A [`Host`] owns the worker loops and the shared registries. Transports
//! and the controller hub talk back into it through a [`HostHandle`], a weak
//! reference exposing only the callback surface they need; a collaborator
//! outliving the host sees no-ops instead of keeping it alive.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, error_span, info, warn, Instrument};
use weft_base::{
    Address, ChallengeMsg, EncryptingKeypair, EncryptingPublicKey, PeerDialInfo, RefId,
    SigningKeypair, SigningPublicKey,
};

use crate::challenge::{self, PendingChallenges};
use crate::config::SharedConfig;
use crate::fetch;
use crate::hub::ControllerHub;
use crate::peer_store::PeerStore;
use crate::refstore::{ObjectReader, RefStore};
use crate::seen::SeenCache;
use crate::subs::{
    InProcessSubscription, MultiReaderSubscription, Subscription, SubscriptionIdentity,
    SubscriptionRegistry, WritableSubscription,
};
use crate::transport::{Peer, PeerStream, Transport};
use crate::tx::{Keypath, StateNode, SubscriptionType, Tx, TxId};
use crate::{Error, Result};

/// Deadline for verifying a single peer.
const VERIFY_PEER_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for one broadcast fan-out.
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(10);
/// Period of the verify-peers and missing-refs ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(10);
/// Bound on queued refs-needed notifications.
const REFS_NEEDED_QUEUE_CAP: usize = 100;

/// Builder for a [`Host`].
pub struct HostBuilder {
    controller_hub: Arc<dyn ControllerHub>,
    ref_store: Arc<dyn RefStore>,
    transports: Vec<Arc<dyn Transport>>,
    signing_keypair: Option<SigningKeypair>,
    encrypting_keypair: Option<EncryptingKeypair>,
    config: Option<SharedConfig>,
}

impl HostBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn signing_keypair(mut self, keypair: SigningKeypair) -> Self {
        self.signing_keypair = Some(keypair);
        self
    }

    pub fn encrypting_keypair(mut self, keypair: EncryptingKeypair) -> Self {
        self.encrypting_keypair = Some(keypair);
        self
    }

    pub fn config(mut self, config: SharedConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Arc<Host> {
        let (refs_needed_tx, refs_needed_rx) = mpsc::channel(REFS_NEEDED_QUEUE_CAP);
        let transports = self
            .transports
            .into_iter()
            .map(|transport| (transport.name().to_string(), transport))
            .collect();
        Arc::new(Host {
            signing_keypair: self.signing_keypair,
            encrypting_keypair: self
                .encrypting_keypair
                .unwrap_or_else(EncryptingKeypair::generate),
            config: self
                .config
                .unwrap_or_else(|| SharedConfig::ephemeral(Default::default())),
            transports,
            controller_hub: self.controller_hub,
            ref_store: self.ref_store,
            peer_store: Arc::new(PeerStore::new()),
            seen_cache: SeenCache::new(),
            subscriptions: SubscriptionRegistry::new(),
            pending_challenges: PendingChallenges::new(),
            verify_peers_queue: Mutex::new(None),
            refs_needed_tx,
            refs_needed_rx: Mutex::new(Some(refs_needed_rx)),
            cancel: CancellationToken::new(),
        })
    }
}

/// The central coordinator. See the crate docs for the big picture.
pub struct Host {
    signing_keypair: Option<SigningKeypair>,
    encrypting_keypair: EncryptingKeypair,
    config: SharedConfig,
    transports: HashMap<String, Arc<dyn Transport>>,
    controller_hub: Arc<dyn ControllerHub>,
    ref_store: Arc<dyn RefStore>,
    peer_store: Arc<PeerStore>,
    seen_cache: SeenCache,
    subscriptions: SubscriptionRegistry,
    pending_challenges: PendingChallenges,
    verify_peers_queue: Mutex<Option<crate::util::WorkQueue>>,
    refs_needed_tx: mpsc::Sender<Vec<RefId>>,
    refs_needed_rx: Mutex<Option<mpsc::Receiver<Vec<RefId>>>>,
    cancel: CancellationToken,
}

impl Host {
    pub fn builder(
        controller_hub: Arc<dyn ControllerHub>,
        ref_store: Arc<dyn RefStore>,
    ) -> HostBuilder {
        HostBuilder {
            controller_hub,
            ref_store,
            transports: Vec::new(),
            signing_keypair: None,
            encrypting_keypair: None,
            config: None,
        }
    }

    /// A weak handle for collaborators.
    pub fn handle(self: &Arc<Self>) -> HostHandle {
        HostHandle {
            host: Arc::downgrade(self),
        }
    }

    /// The local node address, or [`Address::ZERO`] without a signing key.
    pub fn address(&self) -> Address {
        self.signing_keypair
            .as_ref()
            .map(|keypair| keypair.address())
            .unwrap_or(Address::ZERO)
    }

    /// Our encrypting pubkey, for transports sealing private txs.
    pub fn encrypting_pubkey(&self) -> EncryptingPublicKey {
        self.encrypting_keypair.public()
    }

    pub fn controllers(&self) -> &Arc<dyn ControllerHub> {
        &self.controller_hub
    }

    pub fn transport(&self, name: &str) -> Option<&Arc<dyn Transport>> {
        self.transports.get(name)
    }

    pub fn peer_store(&self) -> &Arc<PeerStore> {
        &self.peer_store
    }

    /// Wire up collaborators and spawn the worker loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let handle = self.handle();

        // Peer verification: a coalescing queue nudged by new sightings and
        // by a periodic tick.
        let verify_handle = handle.clone();
        let queue = crate::util::WorkQueue::new(self.cancel.clone(), move || {
            let handle = verify_handle.clone();
            async move {
                if let Some(host) = handle.host.upgrade() {
                    host.verify_peers().await;
                }
            }
        });
        self.peer_store.on_new_unverified_peer({
            let queue = queue.clone();
            Box::new(move |_| queue.enqueue())
        });
        *self.verify_peers_queue.lock() = Some(queue.clone());
        tokio::spawn({
            let cancel = self.cancel.clone();
            async move {
                loop {
                    queue.enqueue();
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(TICK_INTERVAL) => {}
                    }
                }
            }
            .instrument(error_span!("verify-tick"))
        });

        // Commits flow back in here and fan out to subscribers.
        let state_handle = handle.clone();
        self.controller_hub.on_new_state(Box::new(move |tx, state, leaves| {
            let handle = state_handle.clone();
            tokio::spawn(async move {
                if let Some(host) = handle.host.upgrade() {
                    host.broadcast_new_state(tx, state, leaves).await;
                }
            });
        }));

        // Refs the store discovers it is missing.
        let refs_needed_tx = self.refs_needed_tx.clone();
        self.ref_store.on_refs_needed(Box::new(move |refs| {
            if refs_needed_tx.try_send(refs).is_err() {
                // Queue full or host gone; the periodic tick will catch up.
                debug!("dropping refs-needed notification");
            }
        }));
        self.spawn_missing_refs_loop();

        for transport in self.transports.values() {
            transport.set_host(handle.clone());
            transport.start().await?;
        }

        // Resume the URIs this node already replicates.
        for state_uri in self.config.get().node.subscribed_state_uris {
            if let Err(err) = self.subscribe_state_uri(&state_uri).await {
                warn!(%state_uri, %err, "could not resume subscription");
            }
        }

        Ok(())
    }

    /// Tear down workers, subscriptions and transports.
    pub async fn close(self: &Arc<Self>) {
        self.cancel.cancel();
        self.subscriptions.close_all_readable();
        for transport in self.transports.values() {
            if let Err(err) = transport.stop().await {
                warn!(transport = transport.name(), %err, "error stopping transport");
            }
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// All peers any transport believes provide `state_uri`.
    pub fn providers_of_state_uri(self: &Arc<Self>, state_uri: &str) -> PeerStream {
        let state_uri = state_uri.to_string();
        self.merged_peer_stream(move |transport| {
            let state_uri = state_uri.clone();
            async move { transport.providers_of_state_uri(&state_uri).await }
        })
    }

    /// All peers any transport believes provide the ref.
    pub fn providers_of_ref(self: &Arc<Self>, ref_id: RefId) -> PeerStream {
        self.merged_peer_stream(move |transport| async move {
            transport.providers_of_ref(ref_id).await
        })
    }

    /// All peers claiming `address` on any transport.
    pub fn peers_claiming_address(self: &Arc<Self>, address: Address) -> PeerStream {
        self.merged_peer_stream(move |transport| async move {
            transport.peers_claiming_address(address).await
        })
    }

    /// Fan in one per-transport stream per transport, dropping transports
    /// that error. The merged stream ends when every inner stream has ended
    /// or the host shuts down.
    fn merged_peer_stream<F, Fut>(self: &Arc<Self>, open: F) -> PeerStream
    where
        F: Fn(Arc<dyn Transport>) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = Result<PeerStream>> + Send,
    {
        let (peer_tx, peer_rx) = mpsc::channel::<Arc<dyn Peer>>(16);
        for transport in self.transports.values().cloned() {
            let open = open.clone();
            let peer_tx = peer_tx.clone();
            let cancel = self.cancel.clone();
            let name = transport.name().to_string();
            tokio::spawn(async move {
                let mut peers = match open(transport).await {
                    Ok(peers) => peers,
                    Err(err) if err.is_unimplemented() => return,
                    Err(err) => {
                        debug!(transport = %name, %err, "transport discovery failed");
                        return;
                    }
                };
                loop {
                    let peer = tokio::select! {
                        _ = cancel.cancelled() => return,
                        peer = peers.next() => match peer {
                            Some(peer) => peer,
                            None => return,
                        },
                    };
                    if peer_tx.send(peer).await.is_err() {
                        return;
                    }
                }
            });
        }
        drop(peer_tx);
        receiver_stream(peer_rx)
    }

    // ------------------------------------------------------------------
    // Peers and identity
    // ------------------------------------------------------------------

    /// Record a sighted dial info and nudge the verifier.
    pub fn add_peer(&self, dial_info: PeerDialInfo) {
        self.peer_store.add_dial_infos([dial_info]);
        if let Some(queue) = self.verify_peers_queue.lock().as_ref() {
            queue.enqueue();
        }
    }

    /// Challenge a peer and cache its recovered credentials.
    pub async fn challenge_peer_identity(
        &self,
        peer: &Arc<dyn Peer>,
    ) -> Result<(SigningPublicKey, EncryptingPublicKey)> {
        challenge::challenge_peer_identity(peer, &self.peer_store).await
    }

    /// Issue a challenge for an inbound-only peer under a session id.
    pub fn issue_session_challenge(&self, session_id: impl Into<String>) -> ChallengeMsg {
        self.pending_challenges.issue(session_id)
    }

    /// Verify the out-of-band response to a session challenge and record
    /// the recovered credentials against `dial_info`.
    pub fn verify_session_challenge(
        &self,
        session_id: &str,
        sig: &weft_base::Signature,
        enc_pubkey: Option<EncryptingPublicKey>,
        dial_info: PeerDialInfo,
    ) -> Result<SigningPublicKey> {
        let sig_pubkey = self.pending_challenges.verify_response(session_id, sig)?;
        challenge::record_session_credentials(&self.peer_store, dial_info, sig_pubkey, enc_pubkey);
        Ok(sig_pubkey)
    }

    /// One pass over the unverified peers, challenging each with its own
    /// deadline. Failures are isolated; the periodic tick retries.
    async fn verify_peers(self: &Arc<Self>) {
        let unverified = self.peer_store.unverified_peers();
        if unverified.is_empty() {
            return;
        }
        debug!(count = unverified.len(), "verifying peers");

        let mut tasks = JoinSet::new();
        for details in unverified {
            let host = self.clone();
            tasks.spawn(async move {
                let dial_info = details.dial_info;
                let Some(transport) = host.transports.get(&dial_info.transport) else {
                    return;
                };
                let attempt = tokio::time::timeout(VERIFY_PEER_TIMEOUT, async {
                    let peer = transport.new_peer_conn(&dial_info.dial_addr).await?;
                    challenge::challenge_peer_identity(&peer, &host.peer_store).await?;
                    Ok::<_, Error>(())
                })
                .await;
                match attempt {
                    Ok(Ok(())) => host.peer_store.record_conn_outcome(&dial_info, true),
                    Ok(Err(Error::PeerIsSelf)) => {}
                    Ok(Err(Error::Connection(_))) => {
                        host.peer_store.record_conn_outcome(&dial_info, false)
                    }
                    Ok(Err(err)) => warn!(peer = %dial_info, %err, "could not verify peer"),
                    Err(_) => {
                        host.peer_store.record_conn_outcome(&dial_info, false);
                        debug!(peer = %dial_info, "peer verification timed out");
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    // ------------------------------------------------------------------
    // Tx pipeline
    // ------------------------------------------------------------------

    /// Ingest a tx pushed to us by a peer.
    ///
    /// Ingress is tolerant: every failure is logged and isolated. The ack
    /// means "seen", not "committed", and is sent regardless of the commit
    /// outcome.
    pub async fn handle_tx_received(&self, tx: Tx, peer: Arc<dyn Peer>) {
        info!(tx = %tx.id, peer = %peer.dial_info(), "tx received");
        self.seen_cache
            .mark(&peer.dial_info(), &tx.state_uri, tx.id);

        match self.controller_hub.have_tx(&tx.state_uri, tx.id).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = self.controller_hub.add_tx(&tx, false).await {
                    error!(tx = %tx.id, %err, "error committing received tx");
                }
            }
            Err(err) => {
                error!(tx = %tx.id, %err, "error querying controller hub for tx");
                return;
            }
        }

        if let Err(err) = peer.ack(&tx.state_uri, tx.id).await {
            error!(peer = %peer.dial_info(), %err, "error acking peer");
        }
    }

    /// Record a peer's ack.
    pub fn handle_ack_received(&self, state_uri: &str, tx_id: TxId, peer: &Arc<dyn Peer>) {
        debug!(tx = %tx_id, peer = %peer.dial_info(), "ack received");
        self.seen_cache.mark(&peer.dial_info(), state_uri, tx_id);
    }

    /// Submit a locally authored tx.
    ///
    /// Fills in `from`, parents and the signature where the caller left
    /// them empty, commits, and auto-subscribes to the state URI.
    pub async fn send_tx(self: &Arc<Self>, mut tx: Tx) -> Result<()> {
        info!(state_uri = %tx.state_uri, tx = %tx.id, "adding tx");

        if tx.from.is_zero() {
            tx.from = self.address();
        }
        if tx.parents.is_empty() && !tx.id.is_genesis() {
            tx.parents = self.controller_hub.leaves(&tx.state_uri).await?;
        }
        if tx.sig.is_empty() {
            self.sign_tx(&mut tx)?;
        }

        self.controller_hub.add_tx(&tx, false).await?;

        if !self.config.is_subscribed_to(&tx.state_uri) {
            if let Err(err) = self.subscribe_state_uri(&tx.state_uri).await {
                error!(state_uri = %tx.state_uri, %err, "error auto-subscribing after submit");
            }
        }
        Ok(())
    }

    /// Sign a tx's canonical hash with the local signing key.
    pub fn sign_tx(&self, tx: &mut Tx) -> Result<()> {
        let keypair = self.signing_keypair.as_ref().ok_or(Error::UnsignedTx)?;
        tx.sig = keypair.sign_hash(tx.hash())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Open an in-process subscription to a state URI, subscribing the node
    /// to it if necessary.
    pub async fn subscribe(
        self: &Arc<Self>,
        state_uri: &str,
        subscription_type: SubscriptionType,
        keypath: Keypath,
    ) -> Result<Subscription> {
        self.subscribe_state_uri(state_uri).await?;
        let (sub, reader) = InProcessSubscription::new(state_uri, subscription_type, keypath);
        self.handle_writable_subscription_opened(sub).await;
        Ok(reader)
    }

    /// Stop replicating a state URI: forget it in the config and close its
    /// multi-reader.
    pub async fn unsubscribe(&self, state_uri: &str) -> Result<()> {
        self.config.update(|config| {
            config.node.subscribed_state_uris.remove(state_uri);
        })?;
        if let Some(sub) = self.subscriptions.remove_readable(state_uri) {
            sub.close();
        }
        Ok(())
    }

    /// Whether this node currently replicates `state_uri`.
    pub fn is_subscribed_to(&self, state_uri: &str) -> bool {
        self.config.is_subscribed_to(state_uri)
    }

    /// Add a URI to the replicated set and ensure its multi-reader runs.
    async fn subscribe_state_uri(self: &Arc<Self>, state_uri: &str) -> Result<()> {
        self.config.update(|config| {
            config
                .node
                .subscribed_state_uris
                .insert(state_uri.to_string());
        })?;

        if !self.subscriptions.has_readable(state_uri) {
            let max_peers = self.config.get().node.max_peers_per_subscription;
            let sub = MultiReaderSubscription::new(
                state_uri,
                max_peers,
                self.handle(),
                &self.cancel,
            );
            if self.subscriptions.insert_readable(sub.clone()) {
                sub.start();
            } else {
                // Lost the race to a concurrent subscribe.
                sub.close();
            }
        }
        Ok(())
    }

    /// Register a newly opened writable subscription, first pushing the
    /// current state snapshot to subscribers that asked for states.
    pub async fn handle_writable_subscription_opened(&self, sub: Arc<dyn WritableSubscription>) {
        if sub.subscription_type().includes(SubscriptionType::STATES) {
            match self
                .controller_hub
                .state_at_version(sub.state_uri(), None)
                .await
            {
                Ok(state) => {
                    let filtered = filtered_state(&state, sub.keypath());
                    match self.controller_hub.leaves(sub.state_uri()).await {
                        Ok(leaves) => {
                            if let Err(err) = sub.write(None, Some(&filtered), &leaves).await {
                                warn!(state_uri = %sub.state_uri(), %err, "error writing initial state");
                            }
                        }
                        Err(err) => {
                            warn!(state_uri = %sub.state_uri(), %err, "error fetching leaves for initial state");
                        }
                    }
                }
                // No document yet means nothing to deliver.
                Err(Error::NoController) => {}
                Err(err) => {
                    warn!(state_uri = %sub.state_uri(), %err, "error fetching initial state");
                }
            }
        }
        self.subscriptions.add_writable(sub);
    }

    /// Remove a writable subscription and run its close handler. The close
    /// handler runs exactly once no matter how often this is called.
    pub async fn handle_writable_subscription_closed(&self, sub: Arc<dyn WritableSubscription>) {
        if self.subscriptions.remove_writable(&sub) {
            if let Err(err) = sub.close().await {
                error!(state_uri = %sub.state_uri(), %err, "error closing writable subscription");
            }
        }
    }

    /// Replay a document's tx log into a writable subscription, honouring
    /// the private-membership rule per tx.
    pub async fn handle_fetch_history_request(
        &self,
        state_uri: &str,
        from_tx_id: Option<TxId>,
        _to_version: Option<TxId>,
        sub: Arc<dyn WritableSubscription>,
    ) -> Result<()> {
        let mut txs = self.controller_hub.fetch_txs(state_uri, from_tx_id).await?;
        let is_private = self.controller_hub.is_private(state_uri).await?;

        while let Some(tx) = txs.next().await {
            let tx = tx?;
            let leaves = self.controller_hub.leaves(state_uri).await?;

            let write_result = if is_private {
                let allowed = match sub.peer_address() {
                    Some(address) => self.controller_hub.is_member(state_uri, address).await?,
                    // In-process subscriptions are trusted.
                    None => true,
                };
                if !allowed {
                    continue;
                }
                sub.write_private(&tx, None, &leaves).await
            } else {
                sub.write(Some(&tx), None, &leaves).await
            };

            if let Err(err) = write_result {
                error!(state_uri = %state_uri, %err, "error writing history to subscriber");
                self.handle_writable_subscription_closed(sub).await;
                return Err(err);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    /// Fan a committed tx out to subscribers and providers.
    async fn broadcast_new_state(self: &Arc<Self>, tx: Tx, state: StateNode, leaves: Vec<TxId>) {
        // Possession of a private genesis tx implies membership; make sure
        // we replicate the document before telling anyone about it.
        if tx.private && tx.id.is_genesis() && !self.config.is_subscribed_to(&tx.state_uri) {
            if let Err(err) = self.subscribe_state_uri(&tx.state_uri).await {
                error!(state_uri = %tx.state_uri, %err, "error subscribing to private state URI");
            }
        }

        let already_sent = Arc::new(Mutex::new(HashSet::new()));
        let fanout = async {
            tokio::join!(
                self.broadcast_to_writable_subscribers(&tx, &state, &leaves, &already_sent),
                self.broadcast_to_state_uri_providers(&tx, &leaves, &already_sent),
            );
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::timeout(BROADCAST_TIMEOUT, fanout) => {}
        }
    }

    async fn broadcast_to_writable_subscribers(
        self: &Arc<Self>,
        tx: &Tx,
        state: &StateNode,
        leaves: &[TxId],
        already_sent: &Arc<Mutex<HashSet<SubscriptionIdentity>>>,
    ) {
        let is_private = match self.controller_hub.is_private(&tx.state_uri).await {
            Ok(is_private) => is_private,
            Err(err) => {
                error!(state_uri = %tx.state_uri, %err, "error determining privacy of state URI");
                return;
            }
        };

        let mut tasks = JoinSet::new();
        for sub in self.subscriptions.writables_for(&tx.state_uri) {
            // A peer that has already seen this tx only hears about it
            // again if it subscribed to states: its interest is the
            // resulting snapshot, not the tx.
            if let SubscriptionIdentity::Peer(dial_info) = sub.identity() {
                let address = sub.peer_address().unwrap_or(Address::ZERO);
                if self.seen_cache.seen(&dial_info, address, &tx.state_uri, tx.id)
                    && !sub.subscription_type().includes(SubscriptionType::STATES)
                {
                    continue;
                }
            }
            if !already_sent.lock().insert(sub.identity()) {
                continue;
            }

            let host = self.clone();
            let tx = tx.clone();
            let state = state.clone();
            let leaves = leaves.to_vec();
            tasks.spawn(async move {
                let filtered = filtered_state(&state, sub.keypath());

                let write_result = if is_private {
                    let allowed = match sub.peer_address() {
                        Some(address) => {
                            match host.controller_hub.is_member(&tx.state_uri, address).await {
                                Ok(allowed) => allowed,
                                Err(err) => {
                                    error!(%address, %err, "error checking membership");
                                    return;
                                }
                            }
                        }
                        // In-process subscriptions are trusted.
                        None => true,
                    };
                    if !allowed {
                        return;
                    }
                    sub.write_private(&tx, Some(&filtered), &leaves).await
                } else {
                    sub.write(Some(&tx), Some(&filtered), &leaves).await
                };

                match write_result {
                    Ok(()) => {
                        if let SubscriptionIdentity::Peer(dial_info) = sub.identity() {
                            host.seen_cache.mark(&dial_info, &tx.state_uri, tx.id);
                        }
                    }
                    Err(err) => {
                        warn!(state_uri = %tx.state_uri, %err, "error writing to subscriber; closing");
                        host.handle_writable_subscription_closed(sub).await;
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn broadcast_to_state_uri_providers(
        self: &Arc<Self>,
        tx: &Tx,
        leaves: &[TxId],
        already_sent: &Arc<Mutex<HashSet<SubscriptionIdentity>>>,
    ) {
        let mut providers = self.providers_of_state_uri(&tx.state_uri);
        let mut tasks = JoinSet::new();

        while let Some(peer) = providers.next().await {
            let dial_info = peer.dial_info();
            let seen = self
                .seen_cache
                .seen(&dial_info, peer.address(), &tx.state_uri, tx.id);
            let is_author = !peer.address().is_zero() && tx.from == peer.address();
            if seen || is_author {
                continue;
            }
            if !already_sent
                .lock()
                .insert(SubscriptionIdentity::Peer(dial_info.clone()))
            {
                continue;
            }

            let host = self.clone();
            let tx = tx.clone();
            let leaves = leaves.to_vec();
            tasks.spawn(async move {
                if let Err(err) = peer.ensure_connected().await {
                    peer.update_conn_stats(false);
                    debug!(peer = %dial_info, %err, "error connecting to provider");
                    return;
                }
                peer.update_conn_stats(true);
                match peer.put(&tx, None, &leaves).await {
                    Ok(()) => host.seen_cache.mark(&dial_info, &tx.state_uri, tx.id),
                    Err(err) => warn!(peer = %dial_info, %err, "error pushing tx to provider"),
                }
                let _ = peer.close().await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    // ------------------------------------------------------------------
    // Refs
    // ------------------------------------------------------------------

    /// Store a blob and return its `(sha1, sha3)` identifiers.
    pub async fn add_ref(&self, reader: ObjectReader) -> Result<(RefId, RefId)> {
        self.ref_store.store_object(reader).await
    }

    /// Fetch one missing ref from whoever provides it.
    pub async fn fetch_ref(self: &Arc<Self>, ref_id: RefId) {
        let providers = self.providers_of_ref(ref_id);
        let transports: Vec<_> = self.transports.values().cloned().collect();
        fetch::fetch_ref(providers, &self.ref_store, &transports, ref_id, &self.cancel).await;
    }

    /// Stream a stored ref to a requesting peer.
    pub async fn handle_fetch_ref_received(&self, ref_id: RefId, peer: Arc<dyn Peer>) {
        fetch::serve_ref(&self.ref_store, ref_id, peer).await;
    }

    fn spawn_missing_refs_loop(self: &Arc<Self>) {
        let Some(mut refs_needed_rx) = self.refs_needed_rx.lock().take() else {
            return;
        };
        let host = self.clone();
        tokio::spawn(
            async move {
                let mut tick = tokio::time::interval(TICK_INTERVAL);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = host.cancel.cancelled() => return,
                        refs = refs_needed_rx.recv() => {
                            let Some(refs) = refs else { return };
                            host.fetch_missing_refs(refs).await;
                        }
                        _ = tick.tick() => {
                            match host.ref_store.refs_needed().await {
                                Ok(refs) if !refs.is_empty() => host.fetch_missing_refs(refs).await,
                                Ok(_) => {}
                                Err(err) => error!(%err, "error listing needed refs"),
                            }
                        }
                    }
                }
            }
            .instrument(error_span!("missing-refs")),
        );
    }

    async fn fetch_missing_refs(self: &Arc<Self>, refs: Vec<RefId>) {
        let mut tasks = JoinSet::new();
        for ref_id in refs {
            let host = self.clone();
            tasks.spawn(async move { host.fetch_ref(ref_id).await });
        }
        while tasks.join_next().await.is_some() {}
    }

    // ------------------------------------------------------------------
    // State queries
    // ------------------------------------------------------------------

    /// The materialised state of a document, at a version or the head.
    pub async fn state_at_version(
        &self,
        state_uri: &str,
        version: Option<TxId>,
    ) -> Result<StateNode> {
        self.controller_hub.state_at_version(state_uri, version).await
    }

    /// Respond to an inbound identity challenge.
    pub async fn handle_challenge_identity(
        &self,
        challenge: ChallengeMsg,
        peer: &Arc<dyn Peer>,
    ) -> Result<()> {
        let keypair = self.signing_keypair.as_ref().ok_or(Error::UnsignedTx)?;
        challenge::respond_challenge_identity(peer, challenge, keypair, &self.encrypting_keypair)
            .await
    }
}

/// Drill a snapshot down to a subscription's keypath. Root-equivalent
/// keypaths pass the whole snapshot through; a missing path yields an
/// empty node.
fn filtered_state(state: &StateNode, keypath: &Keypath) -> StateNode {
    match keypath.normalized() {
        None => state.clone(),
        Some(keypath) => state.node_at(keypath).unwrap_or_else(StateNode::empty),
    }
}

/// The weak reference collaborators hold on the host.
///
/// Every method is a no-op (or an error, where there is a result to give)
/// once the host has been dropped.
#[derive(Clone)]
pub struct HostHandle {
    host: Weak<Host>,
}

impl HostHandle {
    fn upgrade(&self) -> Result<Arc<Host>> {
        self.host
            .upgrade()
            .ok_or_else(|| Error::connection("host has shut down"))
    }

    pub async fn handle_tx_received(&self, tx: Tx, peer: Arc<dyn Peer>) {
        if let Ok(host) = self.upgrade() {
            host.handle_tx_received(tx, peer).await;
        }
    }

    pub fn handle_ack_received(&self, state_uri: &str, tx_id: TxId, peer: &Arc<dyn Peer>) {
        if let Ok(host) = self.upgrade() {
            host.handle_ack_received(state_uri, tx_id, peer);
        }
    }

    pub async fn handle_challenge_identity(
        &self,
        challenge: ChallengeMsg,
        peer: &Arc<dyn Peer>,
    ) -> Result<()> {
        self.upgrade()?.handle_challenge_identity(challenge, peer).await
    }

    pub async fn handle_writable_subscription_opened(&self, sub: Arc<dyn WritableSubscription>) {
        if let Ok(host) = self.upgrade() {
            host.handle_writable_subscription_opened(sub).await;
        }
    }

    pub async fn handle_writable_subscription_closed(&self, sub: Arc<dyn WritableSubscription>) {
        if let Ok(host) = self.upgrade() {
            host.handle_writable_subscription_closed(sub).await;
        }
    }

    pub async fn handle_fetch_history_request(
        &self,
        state_uri: &str,
        from_tx_id: Option<TxId>,
        to_version: Option<TxId>,
        sub: Arc<dyn WritableSubscription>,
    ) -> Result<()> {
        self.upgrade()?
            .handle_fetch_history_request(state_uri, from_tx_id, to_version, sub)
            .await
    }

    pub async fn handle_fetch_ref_received(&self, ref_id: RefId, peer: Arc<dyn Peer>) {
        if let Ok(host) = self.upgrade() {
            host.handle_fetch_ref_received(ref_id, peer).await;
        }
    }

    /// Providers of a state URI, merged across transports. Empty once the
    /// host has shut down.
    pub async fn providers_of_state_uri(&self, state_uri: &str) -> PeerStream {
        match self.upgrade() {
            Ok(host) => host.providers_of_state_uri(state_uri),
            Err(_) => futures::stream::empty().boxed(),
        }
    }

    /// Record a sighted peer.
    pub fn add_peer(&self, dial_info: PeerDialInfo) {
        if let Ok(host) = self.upgrade() {
            host.add_peer(dial_info);
        }
    }

    /// Issue a challenge for an inbound-only peer.
    pub fn issue_session_challenge(&self, session_id: impl Into<String>) -> Result<ChallengeMsg> {
        Ok(self.upgrade()?.issue_session_challenge(session_id))
    }

    /// Verify a session challenge response.
    pub fn verify_session_challenge(
        &self,
        session_id: &str,
        sig: &weft_base::Signature,
        enc_pubkey: Option<EncryptingPublicKey>,
        dial_info: PeerDialInfo,
    ) -> Result<SigningPublicKey> {
        self.upgrade()?
            .verify_session_challenge(session_id, sig, enc_pubkey, dial_info)
    }

    /// Our encrypting pubkey, for sealing private txs on the wire.
    pub fn encrypting_pubkey(&self) -> Result<EncryptingPublicKey> {
        Ok(self.upgrade()?.encrypting_pubkey())
    }
}

/// Adapt an mpsc receiver into a stream without pulling in another crate.
fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}
