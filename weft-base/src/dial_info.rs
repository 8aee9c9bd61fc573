//! Peer dial info.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The addressable handle of a peer: which transport can reach it, and at
/// which transport-specific address.
///
/// This pair is the registry key for peers. The same node reachable over
/// two transports is two separate entries until verification ties both to
/// one address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerDialInfo {
    pub transport: String,
    pub dial_addr: String,
}

impl PeerDialInfo {
    pub fn new(transport: impl Into<String>, dial_addr: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            dial_addr: dial_addr.into(),
        }
    }
}

impl fmt::Display for PeerDialInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.transport, self.dial_addr)
    }
}
