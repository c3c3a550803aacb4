//! Instance consolidation.
//!
//! Optional background behavior for clusters that want stragglers
//! drained: a partially filled instance periodically looks for a
//! fuller instance of its own cluster that can still take everyone
//! currently here, and relocates its users there. Emptied instances
//! can then be reclaimed instead of idling half-full forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use slotmesh_admission::SlotManager;
use slotmesh_membership::{MembershipCache, SelectionMode};
use slotmesh_relocate::{RelocationClient, UserDirectory};

/// How often a consolidation is attempted.
const CONSOLIDATION_PERIOD: Duration = Duration::from_secs(20);

/// Periodically tries to move this instance's users onto a fuller
/// peer of the same cluster.
pub struct Consolidator {
    cluster_id: String,
    membership: Arc<MembershipCache>,
    slots: Arc<SlotManager>,
    client: Arc<RelocationClient>,
    directory: Arc<dyn UserDirectory>,
    period: Duration,
}

impl Consolidator {
    pub fn new(
        cluster_id: &str,
        membership: Arc<MembershipCache>,
        slots: Arc<SlotManager>,
        client: Arc<RelocationClient>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            membership,
            slots,
            client,
            directory,
            period: CONSOLIDATION_PERIOD,
        }
    }

    /// Shorten the attempt cadence. Meant for tests.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick fires at once; a freshly started
            // instance gets a full period to settle before it tries to
            // empty itself.
            tick.tick().await;
            loop {
                tick.tick().await;
                this.try_consolidate();
            }
        })
    }

    /// One consolidation attempt, if the numbers call for one.
    ///
    /// Only an instance that is neither full nor empty has anything to
    /// gain. A peer is worth moving to when it is fuller than this
    /// instance (fewer open slots) yet still fits everyone here.
    fn try_consolidate(&self) {
        let open = self.slots.open_slots();
        let occupants = self.slots.online_count();
        if occupants == 0 || open == 0 {
            return;
        }

        let fuller: Vec<String> = self
            .membership
            .candidates_for(&self.cluster_id, SelectionMode::Matchmaking, occupants)
            .into_iter()
            .filter(|s| s.open_slots < open)
            .map(|s| s.instance_id)
            .collect();
        if fuller.is_empty() {
            debug!(cluster_id = %self.cluster_id, "no fuller instance fits everyone");
            return;
        }

        let users = self.directory.present_users();
        if users.is_empty() {
            return;
        }
        info!(
            cluster_id = %self.cluster_id,
            users = users.len(),
            candidates = fuller.len(),
            "consolidating users onto a fuller instance"
        );
        // Denial or timeout just means another try next period.
        let _ = self.client.send_to_instances(fuller, users);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use uuid::Uuid;

    use slotmesh_relocate::{RelocationServer, UserSender};
    use slotmesh_transport::LocalBus;

    use super::*;

    const REQ: &str = "test.reservation.request";
    const RESP: &str = "test.reservation.response";

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(Uuid, String)>>,
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<(Uuid, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl UserSender for RecordingSender {
        fn send_user(&self, user: Uuid, destination_instance: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((user, destination_instance.to_string()));
        }
    }

    struct StaticDirectory {
        users: HashSet<Uuid>,
    }

    impl UserDirectory for StaticDirectory {
        fn is_user_present(&self, user: &Uuid) -> bool {
            self.users.contains(user)
        }
        fn is_name_present(&self, _name: &str) -> bool {
            false
        }
        fn present_users(&self) -> HashSet<Uuid> {
            self.users.clone()
        }
    }

    struct Fixture {
        sender: Arc<RecordingSender>,
        peer_slots: Arc<SlotManager>,
        consolidator: Arc<Consolidator>,
    }

    /// Local instance "pool-1" with `local_online` of 10 slots used;
    /// peer "pool-2" answering on the bus with `peer_open` slots open.
    async fn fixture(local_online: u32, peer_open: u32, users: HashSet<Uuid>) -> Fixture {
        let bus = LocalBus::new();
        let timeout = Duration::from_secs(30);

        let peer_slots = Arc::new(SlotManager::new(peer_open, timeout));
        let peer = Arc::new(RelocationServer::new(
            "pool-2",
            Arc::clone(&peer_slots),
            Arc::new(StaticDirectory {
                users: HashSet::new(),
            }),
            Arc::new(bus.clone()),
            REQ,
            RESP,
        ));
        peer.spawn().await.unwrap();

        let membership = Arc::new(MembershipCache::new("pool-1", "pool", Duration::from_secs(10)));
        membership.on_heartbeat(&slotmesh_proto::Heartbeat {
            cluster_id: "pool".to_string(),
            instance_id: "pool-2".to_string(),
            ip: "10.0.0.2".to_string(),
            port: 25_565,
            open_slots: peer_open,
        });

        let slots = Arc::new(SlotManager::new(10, timeout));
        for _ in 0..local_online {
            slots.user_joined();
        }

        let sender = Arc::new(RecordingSender::default());
        let client = Arc::new(RelocationClient::new(
            "pool-1",
            Arc::clone(&membership),
            Arc::clone(&sender) as Arc<dyn UserSender>,
            Arc::new(bus.clone()),
            REQ,
            RESP,
            Duration::from_millis(200),
        ));
        client.spawn().await.unwrap();

        let consolidator = Arc::new(
            Consolidator::new(
                "pool",
                membership,
                slots,
                client,
                Arc::new(StaticDirectory { users }),
            )
            .with_period(Duration::from_millis(20)),
        );
        Fixture {
            sender,
            peer_slots,
            consolidator,
        }
    }

    #[tokio::test]
    async fn moves_users_onto_a_fuller_peer() {
        let users = HashSet::from([Uuid::new_v4(), Uuid::new_v4()]);
        // Local: 2 of 10 used, 8 open. Peer: 4 open, fuller, fits both.
        let fixture = fixture(2, 4, users.clone()).await;
        fixture.consolidator.spawn();

        let sent = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let sent = fixture.sender.sent();
                if sent.len() >= 2 {
                    return sent;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("consolidation should fire within a couple of periods");

        for (user, destination) in &sent {
            assert!(users.contains(user));
            assert_eq!(destination, "pool-2");
        }
        assert!(fixture.peer_slots.reservation_count() >= 2);
    }

    #[tokio::test]
    async fn empty_instance_stays_put() {
        let fixture = fixture(0, 4, HashSet::from([Uuid::new_v4()])).await;
        fixture.consolidator.spawn();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fixture.sender.sent().is_empty());
        assert_eq!(fixture.peer_slots.reservation_count(), 0);
    }

    #[tokio::test]
    async fn emptier_peer_is_not_a_destination() {
        let users = HashSet::from([Uuid::new_v4(), Uuid::new_v4()]);
        // Peer has 9 open, more than our 8; moving there would spread
        // users out instead of packing them.
        let fixture = fixture(2, 9, users).await;
        fixture.consolidator.spawn();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fixture.sender.sent().is_empty());
        assert_eq!(fixture.peer_slots.reservation_count(), 0);
    }
}
