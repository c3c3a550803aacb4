//! Cached status of one peer instance.

use std::time::Instant;

/// What the last heartbeat said about a peer.
///
/// The id and cluster are fixed for the lifetime of the record; only
/// the slot count and timestamp are updated as heartbeats arrive. The
/// local instance never appears in its own table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub cluster_id: String,
    pub ip: String,
    pub port: u16,
    pub open_slots: u32,
    /// When the last heartbeat for this peer was *written*. Reads never
    /// touch this.
    pub last_heartbeat_at: Instant,
}

impl InstanceStatus {
    /// Whether this record has gone longer than `timeout` without a
    /// heartbeat, judged at `now`.
    pub fn is_expired(&self, now: Instant, timeout: std::time::Duration) -> bool {
        now.duration_since(self.last_heartbeat_at) > timeout
    }
}
