use sha2::{Digest, Sha256};

use kaba_types::PeerId;

/// Derive the avatar color for a peer: `#rrggbb` from the first three bytes of
/// SHA-256 over the decimal id. Stable across restarts and machines.
pub fn color_for_peer(peer_id: PeerId) -> String {
    let digest = Sha256::digest(peer_id.to_string().as_bytes());
    format!("#{}", hex::encode(&digest[..3]))
}
