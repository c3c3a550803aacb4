//! slotmesh-relocate — turning "who looks available" into "who said yes."
//!
//! The client side runs relocation attempts: pick a candidate from the
//! membership cache (or an explicit ordered list), publish a
//! reservation request, wait out the response window, and either hand
//! the users to the [`UserSender`] or move on to the next candidate.
//! The server side answers requests aimed at the local instance by
//! asking its own admission controller, and says nothing at all about
//! requests aimed elsewhere.
//!
//! ```text
//! client                                server (every peer)
//!   candidates_for(cluster, mode, k)
//!   publish ReservationRequest ───────▶ targeted here?
//!                                         no  → silence
//!                                         yes → SlotManager::reserve
//!   ReservationResponse ◀───────────── publish (approved or not)
//!   approved → UserSender::send_user
//!   denied   → next candidate, same request id
//!   timeout  → next candidate
//! ```
//!
//! An attempt cannot be cancelled once its request is published; it
//! runs to a definitive answer or its retry budget. Overlapping
//! attempts for the same user are refused up front instead of being
//! allowed to race.

pub mod client;
pub mod host;
pub mod server;

pub use client::{RelocationClient, RelocationTicket};
pub use host::{UserDirectory, UserSender};
pub use server::RelocationServer;
