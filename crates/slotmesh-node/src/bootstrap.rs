//! Startup handshakes with the coordinator.
//!
//! A node cannot do anything sensible before it has the network-wide
//! [`SharedConfig`] and, unless configured with a fixed one, an
//! instance id. Both come from a coordinator over the bus. The loops
//! here block their caller indefinitely: a node that cannot reach the
//! coordinator is not allowed to guess timings or pick its own id, so
//! it keeps asking, logs its impatience, and raises the [`AlertSink`]
//! once the silence gets suspicious.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use slotmesh_transport::Messenger;

use crate::config::{ChannelNames, SharedConfig};
use crate::error::{NodeError, NodeResult};

const RESEND_INTERVAL: Duration = Duration::from_secs(10);
const LOG_INTERVAL: Duration = Duration::from_secs(15);
const ALERT_AFTER_TRIES: u32 = 10;

/// Gets told when bootstrap has gone unanswered long enough that a
/// human should hear about it. Notified at most once per handshake.
pub trait AlertSink: Send + Sync + 'static {
    fn notify(&self, message: &str);
}

/// An [`AlertSink`] that only logs. The default for processes with no
/// paging hookup.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, message: &str) {
        warn!(message, "bootstrap alert");
    }
}

/// Asks the coordinator for the shared config snapshot.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigRequest {
    pub requester: Uuid,
}

/// Asks the allocator for a fresh instance id within a cluster.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdRequest {
    pub cluster_id: String,
    pub nonce: Uuid,
}

/// The allocator's answer, echoing the request nonce.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdResponse {
    pub nonce: Uuid,
    pub instance_id: String,
}

/// Runs the two startup handshakes.
pub struct Bootstrap {
    messenger: Arc<dyn Messenger>,
    channels: ChannelNames,
    alert: Arc<dyn AlertSink>,
    resend_interval: Duration,
    log_interval: Duration,
    alert_after_tries: u32,
}

impl Bootstrap {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        channels: ChannelNames,
        alert: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            messenger,
            channels,
            alert,
            resend_interval: RESEND_INTERVAL,
            log_interval: LOG_INTERVAL,
            alert_after_tries: ALERT_AFTER_TRIES,
        }
    }

    /// Shorten the retry cadence. Meant for tests and simulations.
    pub fn with_intervals(mut self, resend: Duration, log: Duration) -> Self {
        self.resend_interval = resend;
        self.log_interval = log;
        self
    }

    /// Fetch the shared config. Blocks until an answer arrives.
    pub async fn load_shared_config(&self) -> NodeResult<SharedConfig> {
        let request = serde_json::to_vec(&ConfigRequest {
            requester: Uuid::new_v4(),
        })
        .map_err(|source| NodeError::Encode {
            what: "config request",
            source,
        })?;

        self.ask(
            "shared config",
            &self.channels.config_request,
            &self.channels.config_response,
            Bytes::from(request),
            |payload| serde_json::from_slice::<SharedConfig>(payload).ok(),
        )
        .await
    }

    /// Obtain a fresh instance id for `cluster_id`. Blocks until the
    /// allocator answers the request nonce.
    pub async fn request_instance_id(&self, cluster_id: &str) -> NodeResult<String> {
        let nonce = Uuid::new_v4();
        let request = serde_json::to_vec(&IdRequest {
            cluster_id: cluster_id.to_string(),
            nonce,
        })
        .map_err(|source| NodeError::Encode {
            what: "id request",
            source,
        })?;

        self.ask(
            "instance id",
            &self.channels.id_request,
            &self.channels.id_response,
            Bytes::from(request),
            move |payload| {
                serde_json::from_slice::<IdResponse>(payload)
                    .ok()
                    .filter(|r| r.nonce == nonce)
                    .map(|r| r.instance_id)
            },
        )
        .await
    }

    /// The shared ask-until-answered loop.
    ///
    /// Subscribes before the first publish so an instant answer cannot
    /// slip past. `accept` filters the response channel; anything it
    /// rejects is someone else's answer (or garbage) and is dropped.
    async fn ask<T>(
        &self,
        what: &str,
        request_channel: &str,
        response_channel: &str,
        request: Bytes,
        accept: impl Fn(&[u8]) -> Option<T>,
    ) -> NodeResult<T> {
        let mut rx = self.messenger.subscribe(response_channel).await?;

        let started = Instant::now();
        let mut last_log = Instant::now();
        let mut tries: u32 = 0;
        let mut alerted = false;

        loop {
            tries += 1;
            if let Err(err) = self
                .messenger
                .publish(request_channel, request.clone())
                .await
            {
                warn!(%err, what, "failed to publish bootstrap request");
            }

            let deadline = tokio::time::sleep(self.resend_interval);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    payload = rx.recv() => {
                        let Some(payload) = payload else { break };
                        if let Some(answer) = accept(&payload) {
                            info!(what, tries, "bootstrap handshake answered");
                            return Ok(answer);
                        }
                        debug!(what, "ignoring unrelated bootstrap response");
                    }
                }
            }

            if last_log.elapsed() >= self.log_interval {
                warn!(
                    what,
                    tries,
                    waited_secs = started.elapsed().as_secs(),
                    "still waiting for bootstrap answer"
                );
                last_log = Instant::now();
            }
            if !alerted && tries >= self.alert_after_tries {
                self.alert
                    .notify(&format!("no answer for {what} after {tries} requests"));
                alerted = true;
            }
        }
    }
}
