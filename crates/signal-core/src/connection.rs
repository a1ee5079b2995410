use std::time::Instant;

use crate::address::Address;
use crate::engine::DataChannel;

/// The result of a completed establishment. Owned by whichever component
/// (dial or listen engine) finished the handshake; on the listen side it is
/// surrendered to the inbound upgrader (an external collaborator, not
/// implemented in this workspace).
pub struct Connection {
    pub application_dc: DataChannel,
    pub remote_address: Address,
    pub opened_at: Instant,
}
