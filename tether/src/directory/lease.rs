use serde::{Deserialize, Serialize};

use crate::addressable::AddressableReference;
use crate::cluster::NodeId;
use crate::time::Timestamp;

/// Exclusive right of one node to host one addressable until `expires_at`.
///
/// The directory holds at most one unexpired lease per reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableLease {
    pub reference: AddressableReference,
    pub node_id: NodeId,
    pub expires_at: Timestamp,
    pub renew_at: Timestamp,
}

impl AddressableLease {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }

    pub fn needs_renewal(&self, now: Timestamp) -> bool {
        self.renew_at <= now
    }
}
