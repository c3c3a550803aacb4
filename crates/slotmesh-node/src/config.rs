//! Node configuration.
//!
//! Two layers with different owners. [`NodeConfig`] is local: read from
//! a TOML file next to the process, it says who this instance is and
//! how many slots it offers. [`SharedConfig`] is network-wide: every
//! timing parameter that peers must agree on (or their capacity math
//! and expiry judgments drift apart), fetched from the coordinator at
//! startup as a JSON snapshot.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use slotmesh_admission::AdmissionPolicy;

use crate::error::{NodeError, NodeResult};

/// Local, per-process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub cluster_id: String,
    /// Fixed instance id. When absent the node asks the id allocator
    /// for one at startup.
    pub instance_id: Option<String>,
    pub ip: String,
    pub port: u16,
    pub total_slots: u32,
    /// Reject unreserved logins even when slots are open.
    #[serde(default)]
    pub strict_admission: bool,
    /// Periodically try to drain this instance's users onto a fuller
    /// instance of the same cluster.
    #[serde(default)]
    pub consolidate: bool,
    #[serde(default)]
    pub channels: ChannelNames,
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> NodeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| NodeError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: NodeConfig =
            toml::from_str(&content).map_err(|source| NodeError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.channels.ensure_distinct()?;
        Ok(config)
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        if self.strict_admission {
            AdmissionPolicy::Strict
        } else {
            AdmissionPolicy::Standard
        }
    }
}

/// Timing parameters every instance on the mesh must share.
///
/// Stored in milliseconds on the wire; use the accessors in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConfig {
    /// No heartbeat for longer than this and a peer is presumed dead.
    pub server_timeout_ms: u64,
    /// How often the emitter checks the open-slot count for changes.
    pub slot_poll_interval_ms: u64,
    /// Longest allowed quiet gap between heartbeats.
    pub heartbeat_ceiling_ms: u64,
    /// How long a granted reservation counts against capacity before
    /// it is presumed abandoned.
    pub reservation_timeout_ms: u64,
    /// How long a relocation attempt waits on one candidate's answer.
    pub response_timeout_ms: u64,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            server_timeout_ms: 10_000,
            slot_poll_interval_ms: 250,
            heartbeat_ceiling_ms: 3_000,
            reservation_timeout_ms: 15_000,
            response_timeout_ms: 2_000,
        }
    }
}

impl SharedConfig {
    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    pub fn slot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.slot_poll_interval_ms)
    }

    pub fn heartbeat_ceiling(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ceiling_ms)
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Names of the pub/sub channels the mesh runs on.
///
/// All eight must be distinct; two message kinds sharing a channel
/// would decode each other's bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelNames {
    pub heartbeat: String,
    pub shutdown: String,
    pub reservation_request: String,
    pub reservation_response: String,
    pub config_request: String,
    pub config_response: String,
    pub id_request: String,
    pub id_response: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            heartbeat: "slotmesh.heartbeat".to_string(),
            shutdown: "slotmesh.shutdown".to_string(),
            reservation_request: "slotmesh.reservation.request".to_string(),
            reservation_response: "slotmesh.reservation.response".to_string(),
            config_request: "slotmesh.config.request".to_string(),
            config_response: "slotmesh.config.response".to_string(),
            id_request: "slotmesh.id.request".to_string(),
            id_response: "slotmesh.id.response".to_string(),
        }
    }
}

impl ChannelNames {
    pub fn ensure_distinct(&self) -> NodeResult<()> {
        let all = [
            &self.heartbeat,
            &self.shutdown,
            &self.reservation_request,
            &self.reservation_response,
            &self.config_request,
            &self.config_response,
            &self.id_request,
            &self.id_response,
        ];
        let mut seen = HashSet::new();
        for name in all {
            if !seen.insert(name.as_str()) {
                return Err(NodeError::DuplicateChannel(name.clone()));
            }
        }
        Ok(())
    }
}
