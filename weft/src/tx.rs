//! Transactions, state nodes and the subscription wire envelopes.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use weft_base::{Address, Hash, Signature};

/// A 32-byte transaction identifier.
///
/// Ids are independent of the signature: random unless the caller chooses
/// one. [`GENESIS_TX_ID`] is reserved for the root tx of a document.
#[derive(PartialEq, Eq, Copy, Clone, Hash, PartialOrd, Ord, Default)]
pub struct TxId([u8; 32]);

/// The reserved id of the root tx of every document.
pub const GENESIS_TX_ID: TxId = TxId(*b"genesis\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0");

impl TxId {
    /// A fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        TxId(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        TxId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether this is the reserved genesis id.
    pub fn is_genesis(&self) -> bool {
        *self == GENESIS_TX_ID
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self.to_hex())
    }
}

impl FromStr for TxId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(TxId(bytes))
    }
}

impl Serialize for TxId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for TxId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(de::Error::custom)
        } else {
            let data: [u8; 32] = Deserialize::deserialize(deserializer)?;
            Ok(TxId(data))
        }
    }
}

/// A path into a state tree, `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Keypath(String);

impl Keypath {
    pub fn new(path: impl Into<String>) -> Self {
        Keypath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments, with empty segments dropped.
    pub fn parts(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|part| !part.is_empty())
    }

    /// Empty and bare-separator keypaths address the root.
    pub fn is_root(&self) -> bool {
        self.parts().next().is_none()
    }

    /// Root-equivalent keypaths normalise to `None`.
    pub fn normalized(&self) -> Option<&Keypath> {
        if self.is_root() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Display for Keypath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Keypath {
    fn from(s: &str) -> Self {
        Keypath(s.to_string())
    }
}

/// An immutable snapshot of (part of) a document's state.
///
/// The tree is shared, not copied: broadcast hands the same snapshot to
/// every subscriber, and [`node_at`](Self::node_at) only clones the subtree
/// a filtered subscriber asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct StateNode(Arc<serde_json::Value>);

impl StateNode {
    pub fn new(value: serde_json::Value) -> Self {
        StateNode(Arc::new(value))
    }

    /// An empty (null) state.
    pub fn empty() -> Self {
        StateNode(Arc::new(serde_json::Value::Null))
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Drill down to the node at `keypath`.
    ///
    /// Object segments index by key; array segments index by decimal
    /// position. A missing segment yields `None`.
    pub fn node_at(&self, keypath: &Keypath) -> Option<StateNode> {
        let mut current: &serde_json::Value = &self.0;
        for part in keypath.parts() {
            match current {
                serde_json::Value::Object(map) => {
                    current = map.get(part)?;
                }
                serde_json::Value::Array(items) => {
                    let idx: usize = part.parse().ok()?;
                    current = items.get(idx)?;
                }
                _ => return None,
            }
        }
        Some(StateNode(Arc::new(current.clone())))
    }
}

impl Serialize for StateNode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StateNode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(StateNode(Arc::new(serde_json::Value::deserialize(
            deserializer,
        )?)))
    }
}

/// A contiguous range a patch applies to, for array edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRange {
    pub start: i64,
    pub end: i64,
}

/// One edit inside a tx: a keypath, an optional range, and the new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub keypath: Keypath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<PatchRange>,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// A signed, parented patch-set commit against one state URI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tx {
    pub id: TxId,
    pub parents: Vec<TxId>,
    #[serde(rename = "stateURI")]
    pub state_uri: String,
    pub from: Address,
    pub sig: Signature,
    #[serde(default)]
    pub patches: Vec<Patch>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_base64_bytes"
    )]
    pub attachment: Option<Bytes>,
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default)]
    pub private: bool,
}

impl Tx {
    /// The canonical hash the signature covers.
    ///
    /// The signature itself is excluded, so `from` can be recovered from
    /// `(hash, sig)`.
    pub fn hash(&self) -> Hash {
        let mut unsigned = self.clone();
        unsigned.sig = Signature::default();
        let bytes =
            serde_json::to_vec(&unsigned).expect("tx serializes to json unconditionally");
        Hash::of(bytes)
    }

    /// Whether this is the root tx of its document.
    pub fn is_genesis(&self) -> bool {
        self.id.is_genesis()
    }
}

/// What a subscriber wants delivered: raw txs, resulting states, or both.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionType(u8);

impl SubscriptionType {
    pub const TXS: SubscriptionType = SubscriptionType(1);
    pub const STATES: SubscriptionType = SubscriptionType(2);

    pub fn includes(self, other: SubscriptionType) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SubscriptionType {
    type Output = SubscriptionType;

    fn bitor(self, rhs: Self) -> Self {
        SubscriptionType(self.0 | rhs.0)
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.includes(SubscriptionType::TXS) {
            parts.push("transactions");
        }
        if self.includes(SubscriptionType::STATES) {
            parts.push("states");
        }
        f.write_str(&parts.join(","))
    }
}

impl fmt::Debug for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionType({self})")
    }
}

impl FromStr for SubscriptionType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ty = SubscriptionType::default();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part {
                "transactions" => ty = ty | SubscriptionType::TXS,
                "states" => ty = ty | SubscriptionType::STATES,
                other => {
                    return Err(crate::Error::protocol(format!(
                        "unknown subscription type {other:?}"
                    )))
                }
            }
        }
        Ok(ty)
    }
}

/// The wire envelope of a private tx: the payload is a sealed box from the
/// sender's encrypting keypair to the recipient's encrypting pubkey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedTx {
    #[serde(rename = "txID")]
    pub tx_id: TxId,
    #[serde(rename = "encryptedPayload", with = "base64_bytes")]
    pub encrypted_payload: Vec<u8>,
    #[serde(rename = "senderPublicKey", with = "base64_bytes")]
    pub sender_public_key: Vec<u8>,
}

/// One frame of a subscription stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx: Option<Tx>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leaves: Vec<TxId>,
    #[serde(
        rename = "encryptedTx",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub encrypted_tx: Option<EncryptedTx>,
}

mod base64_bytes {
    use data_encoding::BASE64;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s.as_bytes()).map_err(de::Error::custom)
    }
}

mod opt_base64_bytes {
    use bytes::Bytes;
    use data_encoding::BASE64;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => Ok(Some(Bytes::from(
                BASE64.decode(s.as_bytes()).map_err(de::Error::custom)?,
            ))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_base::SigningKeypair;

    #[test]
    fn test_genesis_id_is_reserved() {
        assert!(GENESIS_TX_ID.is_genesis());
        assert!(!TxId::random().is_genesis());
        assert_eq!(&GENESIS_TX_ID.as_bytes()[..7], b"genesis".as_slice());
    }

    #[test]
    fn test_tx_hash_excludes_signature() {
        let keypair = SigningKeypair::generate();
        let mut tx = Tx {
            id: TxId::random(),
            state_uri: "example.com/doc".into(),
            from: keypair.address(),
            ..Default::default()
        };
        let before = tx.hash();
        tx.sig = keypair.sign_hash(before).unwrap();
        assert_eq!(tx.hash(), before);
    }

    #[test]
    fn test_signed_tx_recovers_sender() {
        let keypair = SigningKeypair::generate();
        let mut tx = Tx {
            id: TxId::random(),
            state_uri: "example.com/doc".into(),
            from: keypair.address(),
            ..Default::default()
        };
        tx.sig = keypair.sign_hash(tx.hash()).unwrap();
        let recovered = weft_base::recover_signing_pubkey(tx.hash(), &tx.sig).unwrap();
        assert_eq!(recovered.address(), tx.from);
    }

    #[test]
    fn test_keypath_normalisation() {
        assert!(Keypath::new("").is_root());
        assert!(Keypath::new("/").is_root());
        assert!(Keypath::new("").normalized().is_none());
        let kp = Keypath::new("/messages/0");
        assert_eq!(kp.normalized(), Some(&kp));
        assert_eq!(kp.parts().collect::<Vec<_>>(), vec!["messages", "0"]);
    }

    #[test]
    fn test_state_node_drilling() {
        let state = StateNode::new(serde_json::json!({
            "messages": [{"text": "hi"}, {"text": "there"}],
        }));
        let node = state.node_at(&Keypath::new("messages/1/text")).unwrap();
        assert_eq!(node.value(), &serde_json::json!("there"));
        assert!(state.node_at(&Keypath::new("missing")).is_none());
        assert!(state.node_at(&Keypath::new("messages/2")).is_none());
        assert!(state.node_at(&Keypath::new("messages/x")).is_none());
    }

    #[test]
    fn test_subscription_type_parsing() {
        let ty: SubscriptionType = "transactions,states".parse().unwrap();
        assert!(ty.includes(SubscriptionType::TXS));
        assert!(ty.includes(SubscriptionType::STATES));

        let ty: SubscriptionType = "states".parse().unwrap();
        assert!(!ty.includes(SubscriptionType::TXS));
        assert_eq!(ty.to_string(), "states");

        assert!("telepathy".parse::<SubscriptionType>().is_err());
    }

    #[test]
    fn test_encrypted_tx_wire_field_names() {
        let etx = EncryptedTx {
            tx_id: GENESIS_TX_ID,
            encrypted_payload: vec![1, 2, 3],
            sender_public_key: vec![4, 5, 6],
        };
        let json: serde_json::Value = serde_json::to_value(&etx).unwrap();
        assert!(json.get("txID").is_some());
        assert!(json.get("encryptedPayload").is_some());
        assert!(json.get("senderPublicKey").is_some());
        let back: EncryptedTx = serde_json::from_value(json).unwrap();
        assert_eq!(back, etx);
    }

    #[test]
    fn test_subscription_msg_wire_field_names() {
        let msg = SubscriptionMsg {
            tx: Some(Tx::default()),
            state: None,
            leaves: vec![GENESIS_TX_ID],
            encrypted_tx: None,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert!(json.get("tx").is_some());
        assert!(json.get("leaves").is_some());
        assert!(json.get("state").is_none());
        assert_eq!(json.get("tx").unwrap().get("stateURI").unwrap(), "");
    }
}
