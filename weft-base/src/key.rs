//! Cryptographic key handling for weft.
//!
//! Nodes carry two keypairs. The *signing* keypair (secp256k1) authenticates
//! transactions and identity challenges: signatures are recoverable, so the
//! signer's public key and address come out of `(digest, signature)` with no
//! side channel. The *encrypting* keypair (X25519) seals private-tx payloads
//! between peers.

use std::fmt;
use std::str::FromStr;

use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::SalsaBox;
use k256::ecdsa::{RecoveryId, SigningKey, VerifyingKey};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

use crate::{Address, Hash};

/// The derivation path used when a signing key is built from a mnemonic.
pub const DEFAULT_HD_DERIVATION_PATH: &str = "m/44'/60'/0'/0/0";

/// Length of a recoverable signature: `r || s || v`.
const SIGNATURE_LENGTH: usize = 65;

/// Nonce length prepended to sealed-box ciphertexts.
const NONCE_LENGTH: usize = 24;

/// Errors arising from key handling and signature recovery.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key material")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("signature recovery failed")]
    Recovery,
    #[error("invalid mnemonic: {0}")]
    Mnemonic(String),
    #[error("invalid derivation path")]
    DerivationPath,
    #[error("sealed box could not be opened")]
    SealedBox,
}

/// A recoverable secp256k1 signature, `r || s || v` (65 bytes).
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Signature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(de::Error::custom)?;
        Ok(Signature(bytes))
    }
}

/// A secp256k1 public key, from which a node [`Address`] is derived.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SigningPublicKey(VerifyingKey);

impl SigningPublicKey {
    /// Parse a key from SEC1 bytes (compressed or uncompressed).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let key = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| KeyError::InvalidKey)?;
        Ok(SigningPublicKey(key))
    }

    /// The key in SEC1 compressed form (33 bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }

    /// Derive the node address: the trailing 20 bytes of the Keccak-256 of
    /// the uncompressed curve point (without the SEC1 prefix byte).
    pub fn address(&self) -> Address {
        let point = self.0.to_encoded_point(false);
        let digest = Keccak256::digest(&point.as_bytes()[1..]);
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&digest[12..]);
        Address::from_bytes(addr)
    }
}

impl fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningPublicKey({})", self.address())
    }
}

/// Recover the signing public key that produced `sig` over `hash`.
///
/// The recovery byte accepts both the raw `{0,1}` form and the legacy
/// `{27,28}` offset form.
pub fn recover_signing_pubkey(hash: Hash, sig: &Signature) -> Result<SigningPublicKey, KeyError> {
    let bytes = sig.as_bytes();
    if bytes.len() != SIGNATURE_LENGTH {
        return Err(KeyError::InvalidSignature);
    }
    let v = match bytes[64] {
        v @ 0..=3 => v,
        v @ 27..=30 => v - 27,
        _ => return Err(KeyError::InvalidSignature),
    };
    let recovery_id = RecoveryId::from_byte(v).ok_or(KeyError::InvalidSignature)?;
    let signature =
        k256::ecdsa::Signature::from_slice(&bytes[..64]).map_err(|_| KeyError::InvalidSignature)?;
    let key = VerifyingKey::recover_from_prehash(hash.as_bytes(), &signature, recovery_id)
        .map_err(|_| KeyError::Recovery)?;
    Ok(SigningPublicKey(key))
}

/// A secp256k1 keypair producing recoverable signatures.
#[derive(Clone)]
pub struct SigningKeypair {
    private: SigningKey,
}

impl SigningKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        SigningKeypair {
            private: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Load a keypair from a 32-byte private scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let private = SigningKey::from_slice(bytes).map_err(|_| KeyError::InvalidKey)?;
        Ok(SigningKeypair { private })
    }

    /// Load a keypair from a hex-encoded private scalar.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidKey)?;
        Self::from_bytes(&bytes)
    }

    /// Derive a keypair from a BIP-39 mnemonic at the given BIP-32 path.
    ///
    /// Use [`DEFAULT_HD_DERIVATION_PATH`] unless a deployment pins another
    /// path. The seed is built with an empty passphrase.
    pub fn from_mnemonic(mnemonic: &str, derivation_path: &str) -> Result<Self, KeyError> {
        let mnemonic = bip39::Mnemonic::parse_normalized(mnemonic)
            .map_err(|err| KeyError::Mnemonic(err.to_string()))?;
        let seed = mnemonic.to_seed_normalized("");
        let path: bip32::DerivationPath = derivation_path
            .parse()
            .map_err(|_| KeyError::DerivationPath)?;
        let xprv = bip32::XPrv::derive_from_path(seed, &path).map_err(|_| KeyError::InvalidKey)?;
        Ok(SigningKeypair {
            private: xprv.private_key().clone(),
        })
    }

    /// The public half.
    pub fn public(&self) -> SigningPublicKey {
        SigningPublicKey(*self.private.verifying_key())
    }

    /// The node address of the public half.
    pub fn address(&self) -> Address {
        self.public().address()
    }

    /// The private scalar as lowercase hex.
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.private.to_bytes())
    }

    /// Sign a 32-byte digest, producing a recoverable signature.
    pub fn sign_hash(&self, hash: Hash) -> Result<Signature, KeyError> {
        let (signature, recovery_id) = self
            .private
            .sign_prehash_recoverable(hash.as_bytes())
            .map_err(|_| KeyError::InvalidSignature)?;
        let mut bytes = signature.to_vec();
        bytes.push(recovery_id.to_byte());
        Ok(Signature(bytes))
    }
}

impl fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the private scalar.
        write!(f, "SigningKeypair({})", self.address())
    }
}

/// An X25519 public key used to seal messages to its owner.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncryptingPublicKey([u8; 32]);

impl EncryptingPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        EncryptingPublicKey(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidKey)?;
        Ok(EncryptingPublicKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for EncryptingPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptingPublicKey({})", self.to_hex())
    }
}

impl Serialize for EncryptingPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EncryptingPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(de::Error::custom)?;
        Self::from_slice(&bytes).map_err(de::Error::custom)
    }
}

/// An X25519 keypair for sealing and opening private payloads.
#[derive(Clone)]
pub struct EncryptingKeypair {
    secret: crypto_box::SecretKey,
}

impl EncryptingKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        EncryptingKeypair {
            secret: crypto_box::SecretKey::generate(&mut OsRng),
        }
    }

    /// Load a keypair from a 32-byte secret.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        EncryptingKeypair {
            secret: crypto_box::SecretKey::from(bytes),
        }
    }

    /// The public half.
    pub fn public(&self) -> EncryptingPublicKey {
        EncryptingPublicKey(*self.secret.public_key().as_bytes())
    }

    /// Seal `msg` so only the holder of `recipient`'s secret can open it.
    /// The 24-byte nonce is prepended to the ciphertext.
    pub fn seal_message_for(
        &self,
        recipient: &EncryptingPublicKey,
        msg: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        let recipient = crypto_box::PublicKey::from(*recipient.as_bytes());
        let sbox = SalsaBox::new(&recipient, &self.secret);
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let ciphertext = sbox.encrypt(&nonce, msg).map_err(|_| KeyError::SealedBox)?;
        let mut sealed = nonce.to_vec();
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    /// Open a message sealed by `sender` for us with [`seal_message_for`].
    ///
    /// [`seal_message_for`]: Self::seal_message_for
    pub fn open_message_from(
        &self,
        sender: &EncryptingPublicKey,
        sealed: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        if sealed.len() <= NONCE_LENGTH {
            return Err(KeyError::SealedBox);
        }
        let sender = crypto_box::PublicKey::from(*sender.as_bytes());
        let sbox = SalsaBox::new(&sender, &self.secret);
        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
        let nonce: [u8; NONCE_LENGTH] = nonce.try_into().map_err(|_| KeyError::SealedBox)?;
        sbox.decrypt(&nonce.into(), ciphertext)
            .map_err(|_| KeyError::SealedBox)
    }
}

impl fmt::Debug for EncryptingKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptingKeypair({})", self.public().to_hex())
    }
}

/// A random nonce a peer must sign to prove control of its signing key.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ChallengeMsg(Vec<u8>);

impl ChallengeMsg {
    /// Generate a fresh 32-byte challenge.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        ChallengeMsg(bytes.to_vec())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ChallengeMsg(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The digest a responder signs.
    pub fn digest(&self) -> Hash {
        Hash::of(&self.0)
    }
}

impl fmt::Debug for ChallengeMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChallengeMsg({})", hex::encode(&self.0))
    }
}

impl FromStr for ChallengeMsg {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ChallengeMsg(hex::decode(s)?))
    }
}

impl Serialize for ChallengeMsg {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for ChallengeMsg {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_from_hd_mnemonic() {
        let mnemonic = "joke basic have athlete nurse tank snow uniform busy rural depend recall dinosaur glory elegant";
        let keypair = SigningKeypair::from_mnemonic(mnemonic, DEFAULT_HD_DERIVATION_PATH).unwrap();
        assert_eq!(
            keypair.private_key_hex(),
            "1c6e8d3d4e32f3c8e0bf1295a397ed5cda700888f8d289d602b15fdfd05a3f82"
        );
    }

    #[test]
    fn test_sign_and_recover_address() {
        let keypair = SigningKeypair::generate();
        let hash = Hash::of(b"some signed payload");
        let sig = keypair.sign_hash(hash).unwrap();
        assert_eq!(sig.as_bytes().len(), 65);

        let recovered = recover_signing_pubkey(hash, &sig).unwrap();
        assert_eq!(recovered.address(), keypair.address());
    }

    #[test]
    fn test_recover_rejects_bad_signatures() {
        let hash = Hash::of(b"payload");
        assert!(matches!(
            recover_signing_pubkey(hash, &Signature::default()),
            Err(KeyError::InvalidSignature)
        ));
        assert!(matches!(
            recover_signing_pubkey(hash, &Signature::from_bytes(vec![0u8; 64])),
            Err(KeyError::InvalidSignature)
        ));
    }

    #[test]
    fn test_recover_accepts_legacy_offset_recovery_byte() {
        let keypair = SigningKeypair::generate();
        let hash = Hash::of(b"legacy");
        let sig = keypair.sign_hash(hash).unwrap();
        let mut bytes = sig.as_bytes().to_vec();
        bytes[64] += 27;
        let recovered = recover_signing_pubkey(hash, &Signature::from_bytes(bytes)).unwrap();
        assert_eq!(recovered.address(), keypair.address());
    }

    #[test]
    fn test_sealed_box_roundtrip() {
        let alice = EncryptingKeypair::generate();
        let bob = EncryptingKeypair::generate();

        let sealed = alice
            .seal_message_for(&bob.public(), b"between us")
            .unwrap();
        let opened = bob.open_message_from(&alice.public(), &sealed).unwrap();
        assert_eq!(opened, b"between us");

        // A third party cannot open it.
        let eve = EncryptingKeypair::generate();
        assert!(eve.open_message_from(&alice.public(), &sealed).is_err());
    }

    #[test]
    fn test_sealed_box_rejects_truncated_input() {
        let alice = EncryptingKeypair::generate();
        let bob = EncryptingKeypair::generate();
        assert!(bob
            .open_message_from(&alice.public(), &[0u8; 10])
            .is_err());
    }

    #[test]
    fn test_challenge_digest_is_stable() {
        let challenge = ChallengeMsg::generate();
        assert_eq!(challenge.as_bytes().len(), 32);
        assert_eq!(challenge.digest(), Hash::of(challenge.as_bytes()));
    }
}
