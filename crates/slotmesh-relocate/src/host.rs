//! Seams to the host process that actually owns the users.
//!
//! The coordination layer never touches connections itself. It asks the
//! host two things: "is this user here right now?" (to decide whether a
//! user-targeted reservation request is aimed at this instance) and
//! "send this user over there" (after a handshake succeeds).

use std::collections::HashSet;

use uuid::Uuid;

/// Transfers a user to another instance, best effort.
///
/// A user who disconnected between the handshake and the transfer is
/// simply not sent; the reservation on the far side expires on its own.
pub trait UserSender: Send + Sync + 'static {
    fn send_user(&self, user: Uuid, destination_instance: &str);
}

/// Authoritative presence queries against the host's live-user list.
///
/// Implementations may need to hop into the host's own execution
/// context; that is their concern, the protocol only needs the answer.
pub trait UserDirectory: Send + Sync + 'static {
    fn is_user_present(&self, user: &Uuid) -> bool;
    fn is_name_present(&self, name: &str) -> bool;
    fn present_users(&self) -> HashSet<Uuid>;
}
