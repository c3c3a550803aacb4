//! The node handle.
//!
//! One `Node` owns every moving part of an instance's participation in
//! the mesh: the membership cache and its ingest loops, the local slot
//! manager, both halves of the relocation protocol, the heartbeat
//! emitter, and the periodic maintenance tick. Everything is wired
//! explicitly at [`Node::start`]; there is no process-global state, so
//! tests and the simulator run as many nodes in one process as they
//! like.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use slotmesh_admission::{AdmissionOutcome, SlotManager};
use slotmesh_membership::{MembershipCache, MembershipEvent, SelectionMode};
use slotmesh_proto::{Heartbeat, ShutdownNotification};
use slotmesh_relocate::{
    RelocationClient, RelocationServer, RelocationTicket, UserDirectory, UserSender,
};
use slotmesh_transport::Messenger;

use crate::config::{NodeConfig, SharedConfig};
use crate::consolidate::Consolidator;
use crate::error::NodeResult;
use crate::heartbeat::HeartbeatEmitter;

/// A running slotmesh instance.
pub struct Node {
    instance_id: String,
    cluster_id: String,
    membership: Arc<MembershipCache>,
    slots: Arc<SlotManager>,
    client: Arc<RelocationClient>,
    emitter: Arc<HeartbeatEmitter>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Wire up and start every subsystem.
    ///
    /// `config.instance_id` must be resolved by this point; callers
    /// that need an allocated id run the bootstrap handshake first and
    /// fill it in.
    pub async fn start(
        config: &NodeConfig,
        shared: &SharedConfig,
        messenger: Arc<dyn Messenger>,
        directory: Arc<dyn UserDirectory>,
        sender: Arc<dyn UserSender>,
    ) -> NodeResult<Self> {
        config.channels.ensure_distinct()?;
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.cluster_id, Uuid::new_v4()));

        let membership = Arc::new(MembershipCache::new(
            &instance_id,
            &config.cluster_id,
            shared.server_timeout(),
        ));
        let slots = Arc::new(
            SlotManager::new(config.total_slots, shared.reservation_timeout())
                .with_policy(config.admission_policy()),
        );

        let server = Arc::new(RelocationServer::new(
            &instance_id,
            Arc::clone(&slots),
            Arc::clone(&directory),
            Arc::clone(&messenger),
            &config.channels.reservation_request,
            &config.channels.reservation_response,
        ));
        let client = Arc::new(RelocationClient::new(
            &instance_id,
            Arc::clone(&membership),
            sender,
            Arc::clone(&messenger),
            &config.channels.reservation_request,
            &config.channels.reservation_response,
            shared.response_timeout(),
        ));

        let emitter = Arc::new(HeartbeatEmitter::new(
            &config.cluster_id,
            &instance_id,
            &config.ip,
            config.port,
            Arc::clone(&slots),
            Arc::clone(&messenger),
            &config.channels.heartbeat,
            &config.channels.shutdown,
            shared.slot_poll_interval(),
            shared.heartbeat_ceiling(),
        ));

        let mut tasks = Vec::new();
        tasks.push(
            Self::spawn_heartbeat_ingest(
                &messenger,
                &config.channels.heartbeat,
                Arc::clone(&membership),
            )
            .await?,
        );
        tasks.push(
            Self::spawn_shutdown_ingest(
                &messenger,
                &config.channels.shutdown,
                Arc::clone(&membership),
            )
            .await?,
        );
        tasks.push(server.spawn().await?);
        tasks.push(client.spawn().await?);
        tasks.push(emitter.spawn());
        if config.consolidate {
            let consolidator = Arc::new(Consolidator::new(
                &config.cluster_id,
                Arc::clone(&membership),
                Arc::clone(&slots),
                Arc::clone(&client),
                directory,
            ));
            tasks.push(consolidator.spawn());
        }
        tasks.push(Self::spawn_maintenance(
            Arc::clone(&slots),
            Arc::clone(&membership),
            shared.slot_poll_interval(),
        ));

        info!(
            instance_id = %instance_id,
            cluster_id = %config.cluster_id,
            total_slots = config.total_slots,
            "node started"
        );

        Ok(Self {
            instance_id,
            cluster_id: config.cluster_id.clone(),
            membership,
            slots,
            client,
            emitter,
            tasks,
        })
    }

    async fn spawn_heartbeat_ingest(
        messenger: &Arc<dyn Messenger>,
        channel: &str,
        membership: Arc<MembershipCache>,
    ) -> NodeResult<JoinHandle<()>> {
        let mut rx = messenger.subscribe(channel).await?;
        Ok(tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                match Heartbeat::decode(&payload) {
                    Ok(hb) => membership.on_heartbeat(&hb),
                    Err(err) => warn!(%err, "unparseable heartbeat dropped"),
                }
            }
        }))
    }

    async fn spawn_shutdown_ingest(
        messenger: &Arc<dyn Messenger>,
        channel: &str,
        membership: Arc<MembershipCache>,
    ) -> NodeResult<JoinHandle<()>> {
        let mut rx = messenger.subscribe(channel).await?;
        Ok(tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                match ShutdownNotification::decode(&payload) {
                    Ok(note) => membership.on_shutdown(&note),
                    Err(err) => warn!(%err, "unparseable shutdown notice dropped"),
                }
            }
        }))
    }

    /// Periodic housekeeping: expire stale reservations (which may
    /// resolve a pending shrink) and sweep expired peers so listeners
    /// hear about unresponsive instances without waiting for a read.
    fn spawn_maintenance(
        slots: Arc<SlotManager>,
        membership: Arc<MembershipCache>,
        period: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                slots.tick();
                membership.sweep_expired();
            }
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    // ── Relocation ────────────────────────────────────────────

    /// Move `users` to the best instance of `cluster_id` per `mode`.
    pub fn send_users_to_cluster(
        &self,
        cluster_id: &str,
        mode: SelectionMode,
        users: HashSet<Uuid>,
    ) -> RelocationTicket {
        self.client.send_to_cluster(cluster_id, mode, users)
    }

    /// Move `users` trying `instances` in the given order.
    pub fn send_users_to_instances(
        &self,
        instances: Vec<String>,
        users: HashSet<Uuid>,
    ) -> RelocationTicket {
        self.client.send_to_instances(instances, users)
    }

    /// Move `users` to one specific instance, no fallback.
    pub fn send_users_to_instance(
        &self,
        instance_id: &str,
        users: HashSet<Uuid>,
    ) -> RelocationTicket {
        self.client.send_to_instance(instance_id, users)
    }

    /// Move `users` to wherever `target_user` currently is.
    pub fn send_users_to_user(&self, target_user: Uuid, users: HashSet<Uuid>) -> RelocationTicket {
        self.client.send_to_user(target_user, users)
    }

    /// Move `users` to wherever the user named `target_name` is.
    pub fn send_users_to_user_name(
        &self,
        target_name: &str,
        users: HashSet<Uuid>,
    ) -> RelocationTicket {
        self.client.send_to_user_name(target_name, users)
    }

    // ── Capacity ──────────────────────────────────────────────

    /// Change the slot total. The returned promise resolves `true`
    /// once the new total is enforceable, `false` if another resize
    /// supersedes this one first.
    pub fn set_total_slots(&self, new_total: u32) -> oneshot::Receiver<bool> {
        self.slots.resize(new_total)
    }

    pub fn open_slots(&self) -> u32 {
        self.slots.open_slots()
    }

    pub fn total_slots(&self) -> u32 {
        self.slots.total_slots()
    }

    /// Admission check for a user attempting to log in.
    pub fn admit(&self, user: &Uuid) -> AdmissionOutcome {
        self.slots.admit(user)
    }

    /// A user finished logging in.
    pub fn user_joined(&self) {
        self.slots.user_joined();
    }

    /// A user disconnected.
    pub fn user_left(&self) {
        self.slots.user_left();
    }

    // ── Membership ────────────────────────────────────────────

    pub fn cluster_size(&self, cluster_id: &str) -> usize {
        self.membership.cluster_size(cluster_id)
    }

    pub fn status_report(&self) -> Vec<String> {
        self.membership.status_report()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership.subscribe_events()
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Announce shutdown and stop the heartbeat. Ingest loops and the
    /// relocation server keep running so in-flight handshakes finish;
    /// drop the node to tear those down.
    pub async fn shutdown(&self) -> NodeResult<()> {
        self.emitter.send_shutdown().await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
