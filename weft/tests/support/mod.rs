//! In-memory collaborator fakes for driving the host without IO.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use sha1::Digest as _;
use weft::host::HostHandle;
use weft::{
    ChallengeIdentityResponse, ControllerHub, Error, NewStateCallback, ObjectReader, Peer,
    PeerStream, ReadableSubscription, RefHeader, RefPacket, RefStore, RefsNeededCallback, Result,
    StateNode, SubscriptionMsg, Transport, Tx, TxId, TxStream,
};
use weft_base::{
    Address, ChallengeMsg, EncryptingKeypair, EncryptingPublicKey, PeerDialInfo, RefId,
    SigningKeypair, SigningPublicKey,
};

pub fn mem_dial(addr: &str) -> PeerDialInfo {
    PeerDialInfo::new("mem", addr)
}

/// Poll until `cond` holds, failing the test after two seconds.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ----------------------------------------------------------------------
// Controller hub
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct MemControllerHub {
    log: Mutex<HashMap<String, Vec<Tx>>>,
    leaves: Mutex<HashMap<String, Vec<TxId>>>,
    states: Mutex<HashMap<String, StateNode>>,
    private: Mutex<HashSet<String>>,
    members: Mutex<HashMap<String, HashSet<Address>>>,
    callback: Mutex<Option<NewStateCallback>>,
    /// When set, `leaves` fails; used to prove a path never asks for them.
    pub fail_leaves: Mutex<bool>,
}

impl MemControllerHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_private(&self, state_uri: &str, members: impl IntoIterator<Item = Address>) {
        self.private.lock().insert(state_uri.to_string());
        self.members
            .lock()
            .entry(state_uri.to_string())
            .or_default()
            .extend(members);
    }

    pub fn set_state(&self, state_uri: &str, state: StateNode) {
        self.states.lock().insert(state_uri.to_string(), state);
    }

    pub fn txs_for(&self, state_uri: &str) -> Vec<Tx> {
        self.log.lock().get(state_uri).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ControllerHub for MemControllerHub {
    async fn have_tx(&self, state_uri: &str, tx_id: TxId) -> Result<bool> {
        Ok(self
            .log
            .lock()
            .get(state_uri)
            .is_some_and(|txs| txs.iter().any(|tx| tx.id == tx_id)))
    }

    async fn add_tx(&self, tx: &Tx, _force: bool) -> Result<()> {
        self.log
            .lock()
            .entry(tx.state_uri.clone())
            .or_default()
            .push(tx.clone());
        self.leaves
            .lock()
            .insert(tx.state_uri.clone(), vec![tx.id]);

        let state = self
            .states
            .lock()
            .get(&tx.state_uri)
            .cloned()
            .unwrap_or_else(StateNode::empty);
        if let Some(callback) = self.callback.lock().as_ref() {
            callback(tx.clone(), state, vec![tx.id]);
        }
        Ok(())
    }

    async fn fetch_tx(&self, state_uri: &str, tx_id: TxId) -> Result<Tx> {
        self.log
            .lock()
            .get(state_uri)
            .and_then(|txs| txs.iter().find(|tx| tx.id == tx_id).cloned())
            .ok_or(Error::NotFound)
    }

    async fn fetch_txs(&self, state_uri: &str, from_tx_id: Option<TxId>) -> Result<TxStream> {
        let txs = self.txs_for(state_uri);
        let txs = match from_tx_id {
            Some(from) => txs
                .into_iter()
                .skip_while(|tx| tx.id != from)
                .collect::<Vec<_>>(),
            None => txs,
        };
        Ok(futures::stream::iter(txs.into_iter().map(Ok)).boxed())
    }

    async fn leaves(&self, state_uri: &str) -> Result<Vec<TxId>> {
        if *self.fail_leaves.lock() {
            return Err(Error::Other(anyhow::anyhow!(
                "leaves must not be fetched here"
            )));
        }
        Ok(self
            .leaves
            .lock()
            .get(state_uri)
            .cloned()
            .unwrap_or_default())
    }

    async fn state_at_version(
        &self,
        state_uri: &str,
        _version: Option<TxId>,
    ) -> Result<StateNode> {
        self.states
            .lock()
            .get(state_uri)
            .cloned()
            .ok_or(Error::NoController)
    }

    async fn query_index(
        &self,
        _state_uri: &str,
        _version: Option<TxId>,
        _keypath: &weft::Keypath,
        _index_name: &str,
        _query: &str,
    ) -> Result<StateNode> {
        Err(Error::NotFound)
    }

    async fn is_private(&self, state_uri: &str) -> Result<bool> {
        Ok(self.private.lock().contains(state_uri))
    }

    async fn is_member(&self, state_uri: &str, address: Address) -> Result<bool> {
        Ok(self
            .members
            .lock()
            .get(state_uri)
            .is_some_and(|members| members.contains(&address)))
    }

    fn on_new_state(&self, callback: NewStateCallback) {
        *self.callback.lock() = Some(callback);
    }
}

// ----------------------------------------------------------------------
// Ref store
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct MemRefStore {
    objects: Mutex<HashMap<RefId, Vec<u8>>>,
    needed: Mutex<Vec<RefId>>,
    callback: Mutex<Option<RefsNeededCallback>>,
}

impl MemRefStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hashes_of(data: &[u8]) -> (RefId, RefId) {
        let sha1: [u8; 20] = sha1::Sha1::digest(data).into();
        let sha3: [u8; 32] = sha3::Sha3_256::digest(data).into();
        (RefId::sha1(sha1), RefId::sha3(sha3))
    }

    /// Insert a blob directly, returning its ids.
    pub fn insert(&self, data: Vec<u8>) -> (RefId, RefId) {
        let (sha1, sha3) = Self::hashes_of(&data);
        let mut objects = self.objects.lock();
        objects.insert(sha1, data.clone());
        objects.insert(sha3, data);
        (sha1, sha3)
    }

    pub fn contains(&self, ref_id: RefId) -> bool {
        self.objects.lock().contains_key(&ref_id)
    }

    pub fn object_len(&self, ref_id: RefId) -> Option<usize> {
        self.objects.lock().get(&ref_id).map(Vec::len)
    }

    pub fn set_needed(&self, refs: Vec<RefId>) {
        *self.needed.lock() = refs;
    }

    pub fn refs_needed_list(&self) -> Vec<RefId> {
        self.needed.lock().clone()
    }

    /// Fire the refs-needed callback the way the real store would on a
    /// commit that references missing blobs.
    pub fn notify_needed(&self, refs: Vec<RefId>) {
        if let Some(callback) = self.callback.lock().as_ref() {
            callback(refs);
        }
    }
}

#[async_trait]
impl RefStore for MemRefStore {
    async fn store_object(&self, mut reader: ObjectReader) -> Result<(RefId, RefId)> {
        use tokio::io::AsyncReadExt;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|err| Error::connection(err.to_string()))?;
        Ok(self.insert(data))
    }

    async fn object(&self, ref_id: RefId) -> Result<(ObjectReader, u64)> {
        let data = self
            .objects
            .lock()
            .get(&ref_id)
            .cloned()
            .ok_or(Error::NotFound)?;
        let len = data.len() as u64;
        Ok((Box::new(std::io::Cursor::new(data)), len))
    }

    async fn refs_needed(&self) -> Result<Vec<RefId>> {
        Ok(self.needed.lock().clone())
    }

    fn on_refs_needed(&self, callback: RefsNeededCallback) {
        *self.callback.lock() = Some(callback);
    }
}

// ----------------------------------------------------------------------
// Peers
// ----------------------------------------------------------------------

/// A scripted peer. Everything it is told is recorded; everything it says
/// is queued up front.
#[derive(Default)]
pub struct MemPeer {
    pub dial: PeerDialInfo,
    pub address: Mutex<Address>,
    /// When set, challenge responses are signed with this identity.
    pub remote_identity: Option<(SigningKeypair, EncryptingKeypair)>,
    /// When set, challenge responses carry a zero-length signature.
    pub empty_challenge_sig: bool,

    pub pending_challenge: Mutex<Option<ChallengeMsg>>,
    pub acks: Mutex<Vec<(String, TxId)>>,
    pub puts: Mutex<Vec<Tx>>,
    pub sent_packets: Mutex<Vec<RefPacket>>,
    pub challenge_responses: Mutex<Vec<ChallengeIdentityResponse>>,
    pub fetch_requests: Mutex<Vec<RefId>>,
    pub incoming_packets: Mutex<VecDeque<RefPacket>>,
    pub sub_msgs: Mutex<Option<VecDeque<SubscriptionMsg>>>,
    pub closed: Mutex<bool>,
}

impl MemPeer {
    pub fn new(addr: &str) -> Arc<Self> {
        Arc::new(Self {
            dial: mem_dial(addr),
            ..Default::default()
        })
    }

    pub fn with_address(addr: &str, address: Address) -> Arc<Self> {
        let peer = Self::new(addr);
        *peer.address.lock() = address;
        peer
    }

    pub fn with_identity(
        addr: &str,
        signing: SigningKeypair,
        encrypting: EncryptingKeypair,
    ) -> Arc<Self> {
        Arc::new(Self {
            dial: mem_dial(addr),
            remote_identity: Some((signing, encrypting)),
            ..Default::default()
        })
    }

    /// Queue the chunked wire form of `data` for the fetch side to read.
    pub fn queue_ref_stream(&self, data: &[u8]) {
        let mut packets = self.incoming_packets.lock();
        for chunk in data.chunks(weft::REF_CHUNK_SIZE) {
            packets.push_back(RefPacket {
                data: Bytes::copy_from_slice(chunk),
                end: false,
            });
        }
        packets.push_back(RefPacket {
            data: Bytes::new(),
            end: true,
        });
    }

    pub fn queue_subscription_msgs(&self, msgs: impl IntoIterator<Item = SubscriptionMsg>) {
        *self.sub_msgs.lock() = Some(msgs.into_iter().collect());
    }
}

#[async_trait]
impl Peer for MemPeer {
    fn dial_info(&self) -> PeerDialInfo {
        self.dial.clone()
    }

    fn address(&self) -> Address {
        *self.address.lock()
    }

    fn public_keypairs(&self) -> (Option<SigningPublicKey>, Option<EncryptingPublicKey>) {
        let identity = self.remote_identity.as_ref();
        (
            identity.map(|(signing, _)| signing.public()),
            identity.map(|(_, encrypting)| encrypting.public()),
        )
    }

    fn update_conn_stats(&self, _success: bool) {}

    async fn ensure_connected(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }

    async fn put(&self, tx: &Tx, _state: Option<&StateNode>, _leaves: &[TxId]) -> Result<()> {
        self.puts.lock().push(tx.clone());
        Ok(())
    }

    async fn ack(&self, state_uri: &str, tx_id: TxId) -> Result<()> {
        self.acks.lock().push((state_uri.to_string(), tx_id));
        Ok(())
    }

    async fn challenge_identity(&self, challenge: ChallengeMsg) -> Result<()> {
        *self.pending_challenge.lock() = Some(challenge);
        Ok(())
    }

    async fn receive_challenge_identity_response(&self) -> Result<ChallengeIdentityResponse> {
        let challenge = self
            .pending_challenge
            .lock()
            .take()
            .ok_or_else(|| Error::protocol("no challenge sent"))?;
        let Some((signing, encrypting)) = self.remote_identity.as_ref() else {
            return Err(Error::Unimplemented);
        };
        let sig = if self.empty_challenge_sig {
            weft_base::Signature::default()
        } else {
            signing.sign_hash(challenge.digest())?
        };
        Ok(ChallengeIdentityResponse {
            sig,
            encrypting_public_key: encrypting.public().as_bytes().to_vec(),
        })
    }

    async fn respond_challenge_identity(&self, response: ChallengeIdentityResponse) -> Result<()> {
        self.challenge_responses.lock().push(response);
        Ok(())
    }

    async fn fetch_ref(&self, ref_id: RefId) -> Result<()> {
        self.fetch_requests.lock().push(ref_id);
        Ok(())
    }

    async fn send_ref_header(&self) -> Result<()> {
        Ok(())
    }

    async fn send_ref_packet(&self, data: Bytes, end: bool) -> Result<()> {
        self.sent_packets.lock().push(RefPacket { data, end });
        Ok(())
    }

    async fn receive_ref_header(&self) -> Result<RefHeader> {
        Ok(RefHeader {})
    }

    async fn receive_ref_packet(&self) -> Result<RefPacket> {
        self.incoming_packets
            .lock()
            .pop_front()
            .ok_or_else(|| Error::connection("ref stream exhausted"))
    }

    async fn subscribe(&self, _state_uri: &str) -> Result<Box<dyn ReadableSubscription>> {
        let msgs = self
            .sub_msgs
            .lock()
            .take()
            .ok_or(Error::Unimplemented)?;
        Ok(Box::new(MemReadableSubscription { msgs }))
    }
}

pub struct MemReadableSubscription {
    msgs: VecDeque<SubscriptionMsg>,
}

#[async_trait]
impl ReadableSubscription for MemReadableSubscription {
    async fn read(&mut self) -> Result<SubscriptionMsg> {
        match self.msgs.pop_front() {
            Some(msg) => Ok(msg),
            // Stay open, like a live wire with nothing to say.
            None => futures::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Writable subscriptions
// ----------------------------------------------------------------------

static NEXT_RECORDING_SUB_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub tx: Option<Tx>,
    pub state: Option<StateNode>,
    pub leaves: Vec<TxId>,
    pub private: bool,
}

/// A writable subscription that records everything written to it. With a
/// dial info it impersonates a remote peer subscriber; without one it acts
/// as an in-process consumer.
pub struct RecordingSub {
    id: u64,
    state_uri: String,
    subscription_type: weft::SubscriptionType,
    keypath: weft::Keypath,
    remote: Option<(PeerDialInfo, Address)>,
    pub fail_writes: bool,
    pub writes: Mutex<Vec<RecordedWrite>>,
    pub write_attempts: std::sync::atomic::AtomicUsize,
    pub close_count: std::sync::atomic::AtomicUsize,
}

impl RecordingSub {
    pub fn remote(
        state_uri: &str,
        subscription_type: weft::SubscriptionType,
        dial: PeerDialInfo,
        address: Address,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_RECORDING_SUB_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            state_uri: state_uri.to_string(),
            subscription_type,
            keypath: weft::Keypath::default(),
            remote: Some((dial, address)),
            fail_writes: false,
            writes: Mutex::new(Vec::new()),
            write_attempts: std::sync::atomic::AtomicUsize::new(0),
            close_count: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn failing(
        state_uri: &str,
        subscription_type: weft::SubscriptionType,
        dial: PeerDialInfo,
        address: Address,
    ) -> Arc<Self> {
        let mut sub = Self::remote(state_uri, subscription_type, dial, address);
        Arc::get_mut(&mut sub).expect("fresh arc").fail_writes = true;
        sub
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn closes(&self) -> usize {
        self.close_count.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.write_attempts.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn record(
        &self,
        tx: Option<&Tx>,
        state: Option<&StateNode>,
        leaves: &[TxId],
        private: bool,
    ) -> Result<()> {
        self.write_attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_writes {
            return Err(Error::connection("subscriber hung up"));
        }
        self.writes.lock().push(RecordedWrite {
            tx: tx.cloned(),
            state: state.cloned(),
            leaves: leaves.to_vec(),
            private,
        });
        Ok(())
    }
}

#[async_trait]
impl weft::WritableSubscription for RecordingSub {
    fn state_uri(&self) -> &str {
        &self.state_uri
    }

    fn subscription_type(&self) -> weft::SubscriptionType {
        self.subscription_type
    }

    fn keypath(&self) -> &weft::Keypath {
        &self.keypath
    }

    fn identity(&self) -> weft::SubscriptionIdentity {
        match &self.remote {
            Some((dial, _)) => weft::SubscriptionIdentity::Peer(dial.clone()),
            None => weft::SubscriptionIdentity::Local(self.id),
        }
    }

    fn peer_address(&self) -> Option<Address> {
        self.remote.as_ref().map(|(_, address)| *address)
    }

    async fn write(
        &self,
        tx: Option<&Tx>,
        state: Option<&StateNode>,
        leaves: &[TxId],
    ) -> Result<()> {
        self.record(tx, state, leaves, false)
    }

    async fn write_private(
        &self,
        tx: &Tx,
        state: Option<&StateNode>,
        leaves: &[TxId],
    ) -> Result<()> {
        self.record(Some(tx), state, leaves, true)
    }

    async fn close(&self) -> Result<()> {
        self.close_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct MemTransport {
    host: Mutex<Option<HostHandle>>,
    pub conns: Mutex<HashMap<String, Arc<dyn Peer>>>,
    pub state_uri_providers: Mutex<Vec<Arc<dyn Peer>>>,
    pub ref_providers: Mutex<Vec<Arc<dyn Peer>>>,
    pub announced: Mutex<Vec<RefId>>,
}

impl MemTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_conn(&self, addr: &str, peer: Arc<dyn Peer>) {
        self.conns.lock().insert(addr.to_string(), peer);
    }

    pub fn add_state_uri_provider(&self, peer: Arc<dyn Peer>) {
        self.state_uri_providers.lock().push(peer);
    }

    pub fn add_ref_provider(&self, peer: Arc<dyn Peer>) {
        self.ref_providers.lock().push(peer);
    }
}

#[async_trait]
impl Transport for MemTransport {
    fn name(&self) -> &str {
        "mem"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn set_host(&self, host: HostHandle) {
        *self.host.lock() = Some(host);
    }

    async fn new_peer_conn(&self, dial_addr: &str) -> Result<Arc<dyn Peer>> {
        self.conns
            .lock()
            .get(dial_addr)
            .cloned()
            .ok_or_else(|| Error::connection(format!("no route to {dial_addr}")))
    }

    async fn providers_of_state_uri(&self, _state_uri: &str) -> Result<PeerStream> {
        let providers = self.state_uri_providers.lock().clone();
        Ok(futures::stream::iter(providers).boxed())
    }

    async fn providers_of_ref(&self, _ref_id: RefId) -> Result<PeerStream> {
        let providers = self.ref_providers.lock().clone();
        Ok(futures::stream::iter(providers).boxed())
    }

    async fn peers_claiming_address(&self, _address: Address) -> Result<PeerStream> {
        Err(Error::Unimplemented)
    }

    async fn announce_ref(&self, ref_id: RefId) -> Result<()> {
        self.announced.lock().push(ref_id);
        Ok(())
    }
}
