//! The identity challenge protocol.
//!
//! Verification is symmetric in structure: one side generates a random
//! nonce, the other signs the nonce's digest, and the challenger recovers
//! the signing pubkey (and thus the address) from the signature. Peers
//! without an inbound dial address (browsers) instead *request* a challenge
//! under a session id and deliver the signed response out of band.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use weft_base::{
    recover_signing_pubkey, ChallengeMsg, EncryptingKeypair, EncryptingPublicKey, PeerDialInfo,
    SigningKeypair, SigningPublicKey,
};

use crate::peer_store::PeerStore;
use crate::transport::Peer;
use crate::{Error, Result};

/// How long a requested challenge stays answerable.
const PENDING_CHALLENGE_TTL: Duration = Duration::from_secs(600);

/// Run the challenger side against a connected peer and record the
/// recovered credentials in the peer store.
pub async fn challenge_peer_identity(
    peer: &Arc<dyn Peer>,
    peer_store: &PeerStore,
) -> Result<(SigningPublicKey, EncryptingPublicKey)> {
    peer.ensure_connected().await?;

    let challenge = ChallengeMsg::generate();
    peer.challenge_identity(challenge.clone()).await?;
    let response = peer.receive_challenge_identity_response().await?;

    if response.sig.is_empty() {
        return Err(Error::protocol("empty challenge signature"));
    }
    let sig_pubkey = recover_signing_pubkey(challenge.digest(), &response.sig)
        .map_err(|err| Error::protocol(format!("challenge signature: {err}")))?;
    let enc_pubkey = EncryptingPublicKey::from_slice(&response.encrypting_public_key)
        .map_err(|err| Error::protocol(format!("challenge encrypting key: {err}")))?;

    peer_store.add_verified_credentials(
        peer.dial_info(),
        sig_pubkey.address(),
        sig_pubkey,
        Some(enc_pubkey),
    );

    Ok((sig_pubkey, enc_pubkey))
}

/// Run the responder side: sign the challenge digest and reply with our
/// encrypting pubkey. The peer handle is closed afterwards either way.
pub async fn respond_challenge_identity(
    peer: &Arc<dyn Peer>,
    challenge: ChallengeMsg,
    signing_keypair: &SigningKeypair,
    encrypting_keypair: &EncryptingKeypair,
) -> Result<()> {
    let result = async {
        let sig = signing_keypair.sign_hash(challenge.digest())?;
        peer.respond_challenge_identity(crate::transport::ChallengeIdentityResponse {
            sig,
            encrypting_public_key: encrypting_keypair.public().as_bytes().to_vec(),
        })
        .await
    }
    .await;
    let _ = peer.close().await;
    result
}

struct PendingChallenge {
    challenge: ChallengeMsg,
    issued_at: Instant,
}

/// Challenges issued to inbound-only peers, keyed by session id.
///
/// Entries expire after [`PENDING_CHALLENGE_TTL`]; expired entries are swept
/// opportunistically on insert and lookup, so the map stays bounded without
/// a background task.
#[derive(Default)]
pub struct PendingChallenges {
    pending: Mutex<HashMap<String, PendingChallenge>>,
}

impl PendingChallenges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh challenge under `session_id`, replacing any previous
    /// one for the same session.
    pub fn issue(&self, session_id: impl Into<String>) -> ChallengeMsg {
        let challenge = ChallengeMsg::generate();
        let mut pending = self.pending.lock();
        Self::sweep(&mut pending);
        pending.insert(
            session_id.into(),
            PendingChallenge {
                challenge: challenge.clone(),
                issued_at: Instant::now(),
            },
        );
        challenge
    }

    /// Verify the signed response for a session, consuming the pending
    /// entry. On success the recovered pubkey (and so the session's
    /// address) is returned; recording credentials is up to the caller,
    /// which knows the session's dial semantics.
    pub fn verify_response(
        &self,
        session_id: &str,
        sig: &weft_base::Signature,
    ) -> Result<SigningPublicKey> {
        let entry = {
            let mut pending = self.pending.lock();
            Self::sweep(&mut pending);
            pending.remove(session_id)
        };
        let Some(entry) = entry else {
            return Err(Error::protocol("no pending challenge for session"));
        };
        if sig.is_empty() {
            return Err(Error::protocol("empty challenge signature"));
        }
        recover_signing_pubkey(entry.challenge.digest(), sig)
            .map_err(|err| Error::protocol(format!("challenge signature: {err}")))
    }

    fn sweep(pending: &mut HashMap<String, PendingChallenge>) {
        pending.retain(|_, entry| entry.issued_at.elapsed() < PENDING_CHALLENGE_TTL);
    }

    #[cfg(test)]
    fn expire(&self, session_id: &str) {
        if let Some(entry) = self.pending.lock().get_mut(session_id) {
            entry.issued_at = Instant::now() - PENDING_CHALLENGE_TTL;
        }
    }
}

/// Record credentials recovered from a session-based challenge against a
/// dial info (e.g. the HTTP session of a browser peer).
pub fn record_session_credentials(
    peer_store: &PeerStore,
    dial_info: PeerDialInfo,
    sig_pubkey: SigningPublicKey,
    enc_pubkey: Option<EncryptingPublicKey>,
) {
    peer_store.add_verified_credentials(dial_info, sig_pubkey.address(), sig_pubkey, enc_pubkey);
}
