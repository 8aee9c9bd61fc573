//! Base types for weft.
//!
//! This crate carries the small, widely shared vocabulary of the weft
//! protocol: content hashes, node addresses, signing and encrypting keys,
//! content-addressed ref identifiers and peer dial info. It deliberately has
//! no networking or storage dependencies so that transports, state engines
//! and stores can all depend on it without dragging the host along.

pub mod address;
pub mod dial_info;
pub mod hash;
pub mod key;
pub mod ref_id;

pub use address::Address;
pub use dial_info::PeerDialInfo;
pub use hash::Hash;
pub use key::{
    recover_signing_pubkey, ChallengeMsg, EncryptingKeypair, EncryptingPublicKey, KeyError,
    Signature, SigningKeypair, SigningPublicKey, DEFAULT_HD_DERIVATION_PATH,
};
pub use ref_id::{RefHashAlg, RefId};
