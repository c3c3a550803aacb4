//! Relocation protocol, answering side.
//!
//! Every instance sees every reservation request. The server decides
//! whether a request is aimed at this instance — directly by id, or
//! indirectly because the named user is currently here — and if so
//! consults the local admission controller and always publishes the
//! outcome. Requests aimed elsewhere get silence, not errors.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use slotmesh_admission::SlotManager;
use slotmesh_proto::{RelocationTarget, ReservationRequest, ReservationResponse};
use slotmesh_transport::{Messenger, TransportResult};

use crate::host::UserDirectory;

/// Answers incoming reservation requests for one instance.
pub struct RelocationServer {
    instance_id: String,
    slots: Arc<SlotManager>,
    directory: Arc<dyn UserDirectory>,
    messenger: Arc<dyn Messenger>,
    request_channel: String,
    response_channel: String,
}

impl RelocationServer {
    pub fn new(
        instance_id: &str,
        slots: Arc<SlotManager>,
        directory: Arc<dyn UserDirectory>,
        messenger: Arc<dyn Messenger>,
        request_channel: &str,
        response_channel: &str,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            slots,
            directory,
            messenger,
            request_channel: request_channel.to_string(),
            response_channel: response_channel.to_string(),
        }
    }

    /// Subscribe to the request channel and answer until the transport
    /// closes it.
    pub async fn spawn(self: Arc<Self>) -> TransportResult<JoinHandle<()>> {
        let mut rx = self.messenger.subscribe(&self.request_channel).await?;
        Ok(tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                self.on_request_bytes(&payload).await;
            }
        }))
    }

    async fn on_request_bytes(&self, payload: &[u8]) {
        let request = match ReservationRequest::decode(payload) {
            Ok(r) => r,
            Err(err) => {
                warn!(%err, "unparseable message on the reservation-request channel");
                return;
            }
        };

        if !self.is_targeted(&request.target) {
            // Most requests on the channel are for other instances.
            return;
        }

        let approved = self.slots.reserve(&request.users);
        debug!(
            request_id = request.request_id,
            requester = %request.requester,
            users = request.users.len(),
            approved,
            "answered reservation request"
        );

        let response = ReservationResponse {
            target: request.requester,
            responder: self.instance_id.clone(),
            request_id: request.request_id,
            approved,
        };
        if let Err(err) = self
            .messenger
            .publish(&self.response_channel, Bytes::from(response.encode()))
            .await
        {
            warn!(%err, request_id = response.request_id, "failed to publish reservation response");
        }
    }

    fn is_targeted(&self, target: &RelocationTarget) -> bool {
        match target {
            RelocationTarget::Instance(id) => *id == self.instance_id,
            RelocationTarget::UserId(user) => self.directory.is_user_present(user),
            RelocationTarget::UserName(name) => self.directory.is_name_present(name),
        }
    }
}
