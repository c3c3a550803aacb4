//! slotmesh-admission — the only component that can say "yes, come here."
//!
//! Each instance runs one [`SlotManager`] with sole authority over its
//! own capacity. Peers never reason about aggregate capacity; the
//! no-overbooking guarantee is purely local: a group reservation is one
//! atomic check-and-commit against this instance's slots, and it either
//! holds a slot for every user in the group or holds nothing.
//!
//! Reservations are short-lived. A user who never shows up within the
//! fulfillment timeout silently returns their slot to the pool.

pub mod slots;

pub use slots::{AdmissionOutcome, AdmissionPolicy, SlotManager};
