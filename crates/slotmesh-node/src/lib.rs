//! slotmesh-node — assembling one instance's participation in the mesh.
//!
//! ```text
//!            ┌────────────────────────── Node ──────────────────────────┐
//!            │                                                          │
//!  config ──▶│ NodeConfig + SharedConfig (bootstrapped)                 │
//!            │                                                          │
//!            │  heartbeat ingest ──▶ MembershipCache ◀── shutdown ingest│
//!            │  HeartbeatEmitter ──▶ bus                                │
//!            │  RelocationClient ◀─▶ bus ◀─▶ RelocationServer           │
//!            │          │                           │                   │
//!            │     UserSender                 SlotManager ◀─ UserDirectory
//!            │                                                          │
//!            │  maintenance tick: SlotManager::tick + membership sweep  │
//!            │  consolidator (optional): drain users to a fuller peer   │
//!            └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All wiring is explicit; a process can run any number of nodes, each
//! with its own [`Node`] handle.

pub mod bootstrap;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod heartbeat;
pub mod node;

pub use bootstrap::{AlertSink, Bootstrap, LogAlertSink};
pub use config::{ChannelNames, NodeConfig, SharedConfig};
pub use consolidate::Consolidator;
pub use error::{NodeError, NodeResult};
pub use heartbeat::HeartbeatEmitter;
pub use node::Node;
