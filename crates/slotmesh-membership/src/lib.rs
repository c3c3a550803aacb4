//! slotmesh-membership — who is on the mesh, and who is worth asking.
//!
//! Consumes peer heartbeats and shutdown notices to keep a TTL-bounded
//! table of instance status per cluster, and answers the one question
//! the relocation client cares about: "which instances of cluster C
//! look able to hold K more users, best first?"
//!
//! # Architecture
//!
//! ```text
//! MembershipCache
//!   ├── instances: id → InstanceStatus        (primary)
//!   ├── clusters:  cluster → {instance ids}   (secondary index)
//!   ├── candidates_for(cluster, mode, min)    (lazy TTL filtering)
//!   ├── sweep_expired()                       (periodic, fires events)
//!   └── broadcast MembershipEvent             (joined / leaving / unresponsive)
//! ```
//!
//! The view is eventually consistent by construction: it trails peers
//! by up to one heartbeat interval and holds dead peers for up to one
//! timeout. The reservation handshake, not this cache, is what actually
//! guarantees capacity.
//!
//! Expiry is driven strictly by time since the last heartbeat *write*;
//! reading a record never extends its life.

pub mod cache;
pub mod selection;
pub mod status;

pub use cache::{MembershipCache, MembershipEvent};
pub use selection::SelectionMode;
pub use status::InstanceStatus;
