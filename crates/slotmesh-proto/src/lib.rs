//! slotmesh-proto — wire protocol for the slotmesh coordination mesh.
//!
//! Four message types travel between instances, each on its own pub/sub
//! channel:
//!
//! ```text
//! Heartbeat            cluster id, instance id, ip:port, open slots
//! ShutdownNotification instance id only (raw bytes, no framing)
//! ReservationRequest   target + requester + request id + user set
//! ReservationResponse  requester + responder + request id + approved
//! ```
//!
//! Encodings are hand-rolled: fixed-width big-endian integers and
//! length-prefixed UTF-8 strings. No schema library — the heartbeat
//! message is designed so the open-slots field can be rewritten into an
//! already-encoded buffer without reallocating (see
//! [`Heartbeat::rewrite_open_slots`]).
//!
//! Decoders never panic on garbage input; every malformed message comes
//! back as a [`ProtoError`] that the receiving side logs and drops.

pub mod error;
pub mod heartbeat;
pub mod reservation;
pub mod shutdown;

mod wire;

pub use error::{ProtoError, ProtoResult};
pub use heartbeat::Heartbeat;
pub use reservation::{RelocationTarget, ReservationRequest, ReservationResponse};
pub use shutdown::ShutdownNotification;
