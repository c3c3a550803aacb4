//! In-process pub/sub bus.
//!
//! Fans every published payload out to all live subscribers of the
//! channel. Subscribers that have gone away (receiver dropped) are
//! pruned on the next publish to their channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{TransportError, TransportResult};
use crate::Messenger;

/// In-process [`Messenger`] used by tests and the simulator.
///
/// Cheap to clone; all clones share the same channel table.
#[derive(Clone, Default)]
pub struct LocalBus {
    channels: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a channel, for tests.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|table| {
                table
                    .get(channel)
                    .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl Messenger for LocalBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> TransportResult<()> {
        if channel.is_empty() {
            return Err(TransportError::EmptyChannel);
        }
        let mut table = self
            .channels
            .lock()
            .map_err(|_| TransportError::Publish("bus lock poisoned".to_string()))?;
        if let Some(subs) = table.get_mut(channel) {
            subs.retain(|tx| tx.send(payload.clone()).is_ok());
            trace!(channel, subscribers = subs.len(), "published");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> TransportResult<mpsc::UnboundedReceiver<Bytes>> {
        if channel.is_empty() {
            return Err(TransportError::EmptyChannel);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.channels.lock().map_err(|_| TransportError::Closed)?;
        table.entry(channel.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
