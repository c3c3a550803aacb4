//! Relocation protocol, asking side.
//!
//! Each public call starts an independent attempt on its own task and
//! hands back a [`RelocationTicket`] that resolves when the attempt
//! reaches success, definitive failure, or the end of its retry budget.
//! Responses come back on a shared channel; a pump task routes them to
//! the attempt that issued the matching request id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use slotmesh_membership::{MembershipCache, SelectionMode};
use slotmesh_proto::{RelocationTarget, ReservationRequest, ReservationResponse};
use slotmesh_transport::{Messenger, TransportResult};

use crate::host::UserSender;

/// Upper bound on candidates tried per attempt, so a flapping cluster
/// cannot hold an attempt open forever.
const MAX_TRIES: u32 = 20;

/// The future outcome of a relocation attempt.
///
/// `true` means an instance accepted the reservation and the users
/// were handed to the sender — not that they all arrived; the transfer
/// itself is best effort.
pub struct RelocationTicket {
    rx: oneshot::Receiver<bool>,
}

impl RelocationTicket {
    pub async fn outcome(self) -> bool {
        self.rx.await.unwrap_or(false)
    }

    fn settled(result: bool) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

/// Where a group attempt draws its candidates from.
enum GroupTarget {
    /// Re-query the membership cache every iteration, so a better
    /// late-arriving instance can still be tried.
    Cluster {
        cluster_id: String,
        mode: SelectionMode,
    },
    /// Fixed, already-ordered list of instance ids.
    List(Vec<String>),
}

/// Issues relocation attempts for one instance.
pub struct RelocationClient {
    instance_id: String,
    response_timeout: Duration,
    max_tries: u32,
    membership: Arc<MembershipCache>,
    sender: Arc<dyn UserSender>,
    messenger: Arc<dyn Messenger>,
    request_channel: String,
    response_channel: String,
    /// Request ids are client-local; the wire pairs them with the
    /// issuing instance id. Starts at the bottom of the range and
    /// wraps, like any counter with a bounded lifetime of outstanding
    /// requests.
    next_request_id: AtomicI32,
    /// request id → channel into the waiting attempt.
    pending: Mutex<HashMap<i32, mpsc::UnboundedSender<ReservationResponse>>>,
    /// Users with an attempt currently in flight. New attempts that
    /// overlap are refused instead of being allowed to race.
    in_flight: Mutex<HashSet<Uuid>>,
}

impl RelocationClient {
    pub fn new(
        instance_id: &str,
        membership: Arc<MembershipCache>,
        sender: Arc<dyn UserSender>,
        messenger: Arc<dyn Messenger>,
        request_channel: &str,
        response_channel: &str,
        response_timeout: Duration,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            response_timeout,
            max_tries: MAX_TRIES,
            membership,
            sender,
            messenger,
            request_channel: request_channel.to_string(),
            response_channel: response_channel.to_string(),
            next_request_id: AtomicI32::new(i32::MIN),
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Cap the candidates tried per group attempt.
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Start the response pump. Must be running before any attempt is
    /// issued; without it every attempt times out.
    pub async fn spawn(self: &Arc<Self>) -> TransportResult<JoinHandle<()>> {
        let mut rx = self.messenger.subscribe(&self.response_channel).await?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                this.on_response_bytes(&payload);
            }
        }))
    }

    /// Relocate `users` onto the best instance of a cluster.
    pub fn send_to_cluster(
        self: &Arc<Self>,
        cluster_id: &str,
        mode: SelectionMode,
        users: HashSet<Uuid>,
    ) -> RelocationTicket {
        self.start_group(
            GroupTarget::Cluster {
                cluster_id: cluster_id.to_string(),
                mode,
            },
            users,
        )
    }

    /// Relocate `users` trying a specific list of instances in order.
    pub fn send_to_instances(self: &Arc<Self>, ordered: Vec<String>, users: HashSet<Uuid>) -> RelocationTicket {
        if ordered.is_empty() {
            warn!("relocation attempt with an empty instance list");
            return RelocationTicket::settled(false);
        }
        self.start_group(GroupTarget::List(ordered), users)
    }

    /// Relocate `users` onto one specific instance. No fallback.
    pub fn send_to_instance(self: &Arc<Self>, instance_id: &str, users: HashSet<Uuid>) -> RelocationTicket {
        self.start_targeted(RelocationTarget::Instance(instance_id.to_string()), users)
    }

    /// Relocate `users` onto whichever instance hosts `target_user`.
    pub fn send_to_user(self: &Arc<Self>, target_user: Uuid, users: HashSet<Uuid>) -> RelocationTicket {
        self.start_targeted(RelocationTarget::UserId(target_user), users)
    }

    /// Relocate `users` onto whichever instance hosts the user named
    /// `target_name`.
    pub fn send_to_user_name(self: &Arc<Self>, target_name: &str, users: HashSet<Uuid>) -> RelocationTicket {
        if target_name.is_empty() {
            warn!("relocation attempt with an empty target name");
            return RelocationTicket::settled(false);
        }
        self.start_targeted(RelocationTarget::UserName(target_name.to_string()), users)
    }

    fn start_group(self: &Arc<Self>, target: GroupTarget, users: HashSet<Uuid>) -> RelocationTicket {
        let Some((request_id, rx, ticket_tx, ticket)) = self.open_attempt(&users) else {
            return RelocationTicket::settled(false);
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.run_group(request_id, &target, &users, rx).await;
            this.close_attempt(request_id, &users);
            let _ = ticket_tx.send(result);
        });
        ticket
    }

    fn start_targeted(self: &Arc<Self>, target: RelocationTarget, users: HashSet<Uuid>) -> RelocationTicket {
        let Some((request_id, rx, ticket_tx, ticket)) = self.open_attempt(&users) else {
            return RelocationTicket::settled(false);
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.run_targeted(request_id, target, &users, rx).await;
            this.close_attempt(request_id, &users);
            let _ = ticket_tx.send(result);
        });
        ticket
    }

    /// Validate the user set, claim the in-flight guard, allocate a
    /// request id, and register the response route.
    #[allow(clippy::type_complexity)]
    fn open_attempt(
        &self,
        users: &HashSet<Uuid>,
    ) -> Option<(
        i32,
        mpsc::UnboundedReceiver<ReservationResponse>,
        oneshot::Sender<bool>,
        RelocationTicket,
    )> {
        if users.is_empty() {
            warn!("relocation attempt with no users");
            return None;
        }
        {
            let Ok(mut in_flight) = self.in_flight.lock() else {
                return None;
            };
            if users.iter().any(|u| in_flight.contains(u)) {
                warn!(users = users.len(), "refusing relocation attempt that overlaps one in flight");
                return None;
            }
            in_flight.extend(users.iter().copied());
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (route_tx, route_rx) = mpsc::unbounded_channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request_id, route_tx);
        }
        let (ticket_tx, ticket_rx) = oneshot::channel();
        Some((request_id, route_rx, ticket_tx, RelocationTicket { rx: ticket_rx }))
    }

    fn close_attempt(&self, request_id: i32, users: &HashSet<Uuid>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&request_id);
        }
        if let Ok(mut in_flight) = self.in_flight.lock() {
            for user in users {
                in_flight.remove(user);
            }
        }
    }

    async fn run_group(
        &self,
        request_id: i32,
        target: &GroupTarget,
        users: &HashSet<Uuid>,
        mut responses: mpsc::UnboundedReceiver<ReservationResponse>,
    ) -> bool {
        let mut tried: HashSet<String> = HashSet::new();

        for _ in 0..self.max_tries {
            let candidates: Vec<String> = match target {
                GroupTarget::Cluster { cluster_id, mode } => self
                    .membership
                    .candidates_for(cluster_id, *mode, users.len() as u32)
                    .into_iter()
                    .map(|s| s.instance_id)
                    .collect(),
                GroupTarget::List(list) => list.clone(),
            };

            let Some(candidate) = candidates.into_iter().find(|id| !tried.contains(id)) else {
                debug!(request_id, "no untried candidates left");
                return false;
            };
            tried.insert(candidate.clone());

            if !self
                .publish_request(RelocationTarget::Instance(candidate.clone()), request_id, users)
                .await
            {
                // A lost request looks exactly like a lost response:
                // this candidate's window just times out.
            }

            match self.wait_for_answer(&mut responses, Some(&candidate)).await {
                Some(resp) if resp.approved => {
                    self.dispatch(users, &resp.responder);
                    return true;
                }
                Some(_) => {
                    debug!(request_id, %candidate, "reservation denied, trying next candidate");
                }
                None => {
                    debug!(request_id, %candidate, "reservation response timed out");
                }
            }
        }
        false
    }

    async fn run_targeted(
        &self,
        request_id: i32,
        target: RelocationTarget,
        users: &HashSet<Uuid>,
        mut responses: mpsc::UnboundedReceiver<ReservationResponse>,
    ) -> bool {
        if !self.publish_request(target, request_id, users).await {
            return false;
        }
        match self.wait_for_answer(&mut responses, None).await {
            Some(resp) if resp.approved => {
                self.dispatch(users, &resp.responder);
                true
            }
            Some(_) => false,
            None => {
                debug!(request_id, "targeted reservation timed out");
                false
            }
        }
    }

    async fn publish_request(
        &self,
        target: RelocationTarget,
        request_id: i32,
        users: &HashSet<Uuid>,
    ) -> bool {
        let request = ReservationRequest {
            target,
            requester: self.instance_id.clone(),
            request_id,
            users: users.clone(),
        };
        debug!(request_id, users = users.len(), "publishing reservation request");
        match self
            .messenger
            .publish(&self.request_channel, Bytes::from(request.encode()))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, request_id, "failed to publish reservation request");
                false
            }
        }
    }

    /// Wait out one response window.
    ///
    /// An approval from any responder settles the attempt — the slot is
    /// held there, so it is used even if it arrives late from an
    /// earlier candidate. A denial only counts against the candidate
    /// currently being waited on; stale denials are dropped.
    async fn wait_for_answer(
        &self,
        responses: &mut mpsc::UnboundedReceiver<ReservationResponse>,
        current: Option<&str>,
    ) -> Option<ReservationResponse> {
        let deadline = tokio::time::sleep(self.response_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return None,
                resp = responses.recv() => {
                    match resp {
                        None => return None,
                        Some(r) if r.approved => return Some(r),
                        Some(r) if current.is_none_or(|c| r.responder == c) => return Some(r),
                        Some(r) => {
                            debug!(request_id = r.request_id, responder = %r.responder, "stale denial dropped");
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, users: &HashSet<Uuid>, destination: &str) {
        info!(destination, users = users.len(), "reservation approved, sending users");
        for user in users {
            self.sender.send_user(*user, destination);
        }
    }

    fn on_response_bytes(&self, payload: &[u8]) {
        let response = match ReservationResponse::decode(payload) {
            Ok(r) => r,
            Err(err) => {
                warn!(%err, "unparseable message on the reservation-response channel");
                return;
            }
        };
        if response.target != self.instance_id {
            return;
        }
        let Ok(pending) = self.pending.lock() else {
            return;
        };
        if let Some(route) = pending.get(&response.request_id) {
            let _ = route.send(response);
        }
        // A response for an unknown request id is a late answer to an
        // attempt that already finished; nothing to do.
    }
}
