//! slotmesh-transport — the messaging seam.
//!
//! The coordination protocol only ever asks its transport for two
//! things: publish bytes on a named channel, and subscribe to a named
//! channel. Delivery is at-least-once with no ordering guarantee across
//! channels; the protocol layers above are built to tolerate duplicates
//! and loss (a dropped heartbeat is the next heartbeat's problem, a
//! dropped reservation response is a timeout).
//!
//! Production deployments plug in a real broker behind [`Messenger`].
//! [`LocalBus`] is the in-process implementation used by tests and the
//! `slotmeshd simulate` command.

pub mod bus;
pub mod error;

pub use bus::LocalBus;
pub use error::{TransportError, TransportResult};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Publish/subscribe byte messaging on named channels.
///
/// Implementations must not let a slow subscriber block `publish`;
/// the bundled [`LocalBus`] uses unbounded per-subscriber queues, and a
/// broker-backed implementation inherits the broker's semantics.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    /// Publish a payload to every current subscriber of `channel`.
    ///
    /// A publish failure is not fatal to the protocol; callers log it
    /// and treat the message as lost.
    async fn publish(&self, channel: &str, payload: Bytes) -> TransportResult<()>;

    /// Subscribe to `channel`. Messages published after this call are
    /// delivered to the returned receiver until it is dropped.
    async fn subscribe(&self, channel: &str) -> TransportResult<mpsc::UnboundedReceiver<Bytes>>;
}
