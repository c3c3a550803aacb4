//! The membership cache.
//!
//! Fed by the node's heartbeat/shutdown ingest loops; read by the
//! relocation client and the status report. The primary table and its
//! cluster index are updated inside one critical section so the index
//! never names a record that is gone.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use slotmesh_proto::{Heartbeat, ShutdownNotification};

use crate::selection::SelectionMode;
use crate::status::InstanceStatus;

/// Capacity of the event fan-out; a listener that lags this far behind
/// misses events rather than blocking the cache.
const EVENT_CAPACITY: usize = 64;

/// A change in a peer's availability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// First heartbeat from an unseen peer, or from a peer that had
    /// been given up on.
    Joined {
        instance_id: String,
        cluster_id: String,
        ip: String,
        port: u16,
    },
    /// The peer announced a planned shutdown.
    Leaving {
        instance_id: String,
        cluster_id: String,
    },
    /// The peer stopped heartbeating and timed out, with no shutdown
    /// notice. Fired once per transition, by the sweep.
    Unresponsive {
        instance_id: String,
        cluster_id: String,
    },
}

struct Tables {
    /// Primary: instance id → status.
    instances: HashMap<String, InstanceStatus>,
    /// Secondary: cluster id → instance ids. Maintained in the same
    /// critical sections as the primary.
    clusters: HashMap<String, HashSet<String>>,
}

impl Tables {
    fn remove(&mut self, instance_id: &str) -> Option<InstanceStatus> {
        let status = self.instances.remove(instance_id)?;
        if let Some(members) = self.clusters.get_mut(&status.cluster_id) {
            members.remove(instance_id);
            if members.is_empty() {
                self.clusters.remove(&status.cluster_id);
            }
        }
        Some(status)
    }
}

/// TTL-bounded view of every other instance on the mesh.
///
/// The local instance never records itself; its own heartbeats are
/// ignored on ingest and [`cluster_size`](Self::cluster_size) adds it
/// back when counting its own cluster.
pub struct MembershipCache {
    local_instance_id: String,
    local_cluster_id: String,
    /// No heartbeat for longer than this and a peer is dead.
    server_timeout: Duration,
    inner: Mutex<Tables>,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipCache {
    /// Create a cache for the instance identified by
    /// `local_instance_id`, a member of `local_cluster_id`.
    pub fn new(local_instance_id: &str, local_cluster_id: &str, server_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local_instance_id: local_instance_id.to_string(),
            local_cluster_id: local_cluster_id.to_string(),
            server_timeout,
            inner: Mutex::new(Tables {
                instances: HashMap::new(),
                clusters: HashMap::new(),
            }),
            events,
        }
    }

    /// Subscribe to peer join/leave/unresponsive events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Ingest one peer heartbeat.
    ///
    /// Upserts the peer's record; only the slot count and timestamp
    /// change on a live record. A heartbeat from a peer that had
    /// already exceeded the timeout counts as a rejoin and replaces the
    /// record wholesale, new cluster and address included.
    pub fn on_heartbeat(&self, hb: &Heartbeat) {
        if hb.instance_id == self.local_instance_id {
            return;
        }

        let now = Instant::now();
        let mut joined = false;

        {
            let Ok(mut tables) = self.inner.lock() else {
                return;
            };
            let rejoining = tables
                .instances
                .get(&hb.instance_id)
                .is_some_and(|s| s.is_expired(now, self.server_timeout));
            if rejoining {
                // The old record's lifetime ended at expiry; the rejoin
                // starts a fresh record so the cluster index follows
                // whatever the new heartbeat claims.
                tables.remove(&hb.instance_id);
            }
            match tables.instances.get_mut(&hb.instance_id) {
                Some(status) => {
                    if status.cluster_id != hb.cluster_id {
                        // A peer cannot move clusters within one record's
                        // lifetime; keep the original until it expires.
                        warn!(
                            instance_id = %hb.instance_id,
                            known = %status.cluster_id,
                            claimed = %hb.cluster_id,
                            "heartbeat claims a different cluster, ignoring the change"
                        );
                    }
                    status.open_slots = hb.open_slots;
                    status.last_heartbeat_at = now;
                }
                None => {
                    let status = InstanceStatus {
                        instance_id: hb.instance_id.clone(),
                        cluster_id: hb.cluster_id.clone(),
                        ip: hb.ip.clone(),
                        port: hb.port,
                        open_slots: hb.open_slots,
                        last_heartbeat_at: now,
                    };
                    tables
                        .clusters
                        .entry(hb.cluster_id.clone())
                        .or_default()
                        .insert(hb.instance_id.clone());
                    tables.instances.insert(hb.instance_id.clone(), status);
                    joined = true;
                }
            }
        }

        if joined {
            debug!(instance_id = %hb.instance_id, cluster_id = %hb.cluster_id, "peer joined");
            let _ = self.events.send(MembershipEvent::Joined {
                instance_id: hb.instance_id.clone(),
                cluster_id: hb.cluster_id.clone(),
                ip: hb.ip.clone(),
                port: hb.port,
            });
        }
    }

    /// Ingest a planned-shutdown notice: the peer is removed at once,
    /// with no grace period.
    pub fn on_shutdown(&self, note: &ShutdownNotification) {
        if note.instance_id == self.local_instance_id {
            return;
        }

        let removed = {
            let Ok(mut tables) = self.inner.lock() else {
                return;
            };
            tables.remove(&note.instance_id)
        };

        if let Some(status) = removed {
            info!(instance_id = %note.instance_id, cluster_id = %status.cluster_id, "peer leaving by plan");
            let _ = self.events.send(MembershipEvent::Leaving {
                instance_id: status.instance_id,
                cluster_id: status.cluster_id,
            });
        }
    }

    /// The best candidates in `cluster_id` with at least `min_slots`
    /// open, ordered by `mode`. Empty when nothing qualifies — that is
    /// an answer, not an error.
    pub fn candidates_for(
        &self,
        cluster_id: &str,
        mode: SelectionMode,
        min_slots: u32,
    ) -> Vec<InstanceStatus> {
        let now = Instant::now();
        let mut candidates: Vec<InstanceStatus> = {
            let Ok(tables) = self.inner.lock() else {
                return Vec::new();
            };
            let Some(members) = tables.clusters.get(cluster_id) else {
                return Vec::new();
            };
            members
                .iter()
                .filter_map(|id| tables.instances.get(id))
                .filter(|s| !s.is_expired(now, self.server_timeout) && s.open_slots >= min_slots)
                .cloned()
                .collect()
        };
        mode.order(&mut candidates);
        candidates
    }

    /// Live instance count of a cluster, counting the local instance
    /// when the cluster is its own.
    pub fn cluster_size(&self, cluster_id: &str) -> usize {
        let now = Instant::now();
        let mut count = usize::from(cluster_id == self.local_cluster_id);

        if let Ok(tables) = self.inner.lock() {
            if let Some(members) = tables.clusters.get(cluster_id) {
                count += members
                    .iter()
                    .filter_map(|id| tables.instances.get(id))
                    .filter(|s| !s.is_expired(now, self.server_timeout))
                    .count();
            }
        }
        count
    }

    /// Human-readable dump of the cache: one header, then each cluster
    /// that has at least one responsive instance, one line per
    /// instance. Backs the read-only network-status admin command.
    pub fn status_report(&self) -> Vec<String> {
        let now = Instant::now();
        let mut lines = vec!["clusters:".to_string()];

        let Ok(tables) = self.inner.lock() else {
            return lines;
        };
        let mut cluster_ids: Vec<&String> = tables.clusters.keys().collect();
        cluster_ids.sort();

        for cluster_id in cluster_ids {
            let mut live: Vec<&InstanceStatus> = tables.clusters[cluster_id]
                .iter()
                .filter_map(|id| tables.instances.get(id))
                .filter(|s| !s.is_expired(now, self.server_timeout))
                .collect();
            if live.is_empty() {
                continue;
            }
            live.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

            lines.push(format!("  {cluster_id}:"));
            for status in live {
                lines.push(format!(
                    "    - {} ({}:{}, {} open slots)",
                    status.instance_id, status.ip, status.port, status.open_slots
                ));
            }
        }

        if lines.len() == 1 {
            lines.push("  no responsive clusters".to_string());
        }
        lines
    }

    /// Remove every record past the heartbeat timeout, firing
    /// `Unresponsive` once per removed peer. Run periodically.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let dead: Vec<InstanceStatus> = {
            let Ok(mut tables) = self.inner.lock() else {
                return Vec::new();
            };
            let ids: Vec<String> = tables
                .instances
                .values()
                .filter(|s| s.is_expired(now, self.server_timeout))
                .map(|s| s.instance_id.clone())
                .collect();
            ids.iter().filter_map(|id| tables.remove(id)).collect()
        };

        let mut removed = Vec::with_capacity(dead.len());
        for status in dead {
            warn!(instance_id = %status.instance_id, cluster_id = %status.cluster_id, "peer unresponsive");
            let _ = self.events.send(MembershipEvent::Unresponsive {
                instance_id: status.instance_id.clone(),
                cluster_id: status.cluster_id,
            });
            removed.push(status.instance_id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(40);

    fn cache() -> MembershipCache {
        MembershipCache::new("local-1", "lobby", TIMEOUT)
    }

    fn beat(id: &str, cluster: &str, open_slots: u32) -> Heartbeat {
        Heartbeat {
            cluster_id: cluster.to_string(),
            instance_id: id.to_string(),
            ip: "10.0.0.1".to_string(),
            port: 25565,
            open_slots,
        }
    }

    #[test]
    fn first_heartbeat_creates_record_and_fires_joined() {
        let cache = cache();
        let mut events = cache.subscribe_events();

        cache.on_heartbeat(&beat("game-1", "games", 4));

        assert_eq!(cache.cluster_size("games"), 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            MembershipEvent::Joined { instance_id, .. } if instance_id == "game-1"
        ));
    }

    #[test]
    fn own_heartbeat_ignored() {
        let cache = cache();
        cache.on_heartbeat(&beat("local-1", "lobby", 4));
        // Only the implicit local membership counts.
        assert_eq!(cache.cluster_size("lobby"), 1);
        assert!(cache.candidates_for("lobby", SelectionMode::Matchmaking, 0).is_empty());
    }

    #[test]
    fn repeat_heartbeat_updates_slots_without_new_event() {
        let cache = cache();
        let mut events = cache.subscribe_events();

        cache.on_heartbeat(&beat("game-1", "games", 4));
        cache.on_heartbeat(&beat("game-1", "games", 9));

        let found = cache.candidates_for("games", SelectionMode::Matchmaking, 0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].open_slots, 9);

        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err(), "second heartbeat must not re-announce");
    }

    #[test]
    fn shutdown_removes_immediately_and_fires_leaving() {
        let cache = cache();
        cache.on_heartbeat(&beat("game-1", "games", 4));
        let mut events = cache.subscribe_events();

        cache.on_shutdown(&ShutdownNotification {
            instance_id: "game-1".to_string(),
        });

        assert_eq!(cache.cluster_size("games"), 0);
        assert!(cache.candidates_for("games", SelectionMode::Random, 0).is_empty());
        assert!(matches!(
            events.try_recv().unwrap(),
            MembershipEvent::Leaving { instance_id, .. } if instance_id == "game-1"
        ));
    }

    #[test]
    fn shutdown_for_unknown_peer_is_silent() {
        let cache = cache();
        let mut events = cache.subscribe_events();
        cache.on_shutdown(&ShutdownNotification {
            instance_id: "never-seen".to_string(),
        });
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn queries_do_not_extend_ttl() {
        let cache = cache();
        cache.on_heartbeat(&beat("game-1", "games", 4));

        // Query repeatedly while the timeout runs out; reads must not
        // keep the record alive.
        for _ in 0..5 {
            let _ = cache.candidates_for("games", SelectionMode::Matchmaking, 1);
            let _ = cache.cluster_size("games");
            std::thread::sleep(TIMEOUT / 4);
        }
        std::thread::sleep(TIMEOUT / 2);

        assert!(cache.candidates_for("games", SelectionMode::Matchmaking, 1).is_empty());
        assert_eq!(cache.cluster_size("games"), 0);
    }

    #[test]
    fn sweep_fires_unresponsive_once() {
        let cache = cache();
        cache.on_heartbeat(&beat("game-1", "games", 4));
        let mut events = cache.subscribe_events();

        std::thread::sleep(TIMEOUT + Duration::from_millis(10));

        assert_eq!(cache.sweep_expired(), vec!["game-1".to_string()]);
        assert!(matches!(
            events.try_recv().unwrap(),
            MembershipEvent::Unresponsive { instance_id, .. } if instance_id == "game-1"
        ));

        // Second sweep finds nothing; no duplicate event.
        assert!(cache.sweep_expired().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn heartbeat_after_expiry_is_a_rejoin() {
        let cache = cache();
        cache.on_heartbeat(&beat("game-1", "games", 4));
        std::thread::sleep(TIMEOUT + Duration::from_millis(10));

        let mut events = cache.subscribe_events();
        cache.on_heartbeat(&beat("game-1", "games", 2));

        assert!(matches!(
            events.try_recv().unwrap(),
            MembershipEvent::Joined { instance_id, .. } if instance_id == "game-1"
        ));
        assert_eq!(cache.cluster_size("games"), 1);
    }

    #[test]
    fn rejoin_into_a_new_cluster_moves_the_record() {
        let cache = cache();
        cache.on_heartbeat(&beat("game-1", "games", 4));
        std::thread::sleep(TIMEOUT + Duration::from_millis(10));

        // The peer restarted as a member of a different cluster.
        let mut events = cache.subscribe_events();
        cache.on_heartbeat(&beat("game-1", "lobby2", 6));

        assert!(cache.candidates_for("games", SelectionMode::Matchmaking, 0).is_empty());
        let found = cache.candidates_for("lobby2", SelectionMode::Matchmaking, 0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].cluster_id, "lobby2");
        assert_eq!(cache.cluster_size("games"), 0);
        assert_eq!(cache.cluster_size("lobby2"), 1);

        assert!(matches!(
            events.try_recv().unwrap(),
            MembershipEvent::Joined { cluster_id, .. } if cluster_id == "lobby2"
        ));
        // The abandoned record is gone; a later sweep has nothing to do.
        assert!(cache.sweep_expired().is_empty());
    }

    #[test]
    fn candidates_filter_and_order() {
        let cache = cache();
        cache.on_heartbeat(&beat("a", "games", 5));
        cache.on_heartbeat(&beat("b", "games", 1));
        cache.on_heartbeat(&beat("c", "games", 8));
        cache.on_heartbeat(&beat("other", "lobby", 9));

        let mm = cache.candidates_for("games", SelectionMode::Matchmaking, 1);
        let ids: Vec<&str> = mm.iter().map(|s| s.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        let lb = cache.candidates_for("games", SelectionMode::LoadBalancing, 1);
        let ids: Vec<&str> = lb.iter().map(|s| s.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        // min-slot filter drops too-small instances entirely.
        let big = cache.candidates_for("games", SelectionMode::Matchmaking, 6);
        let ids: Vec<&str> = big.iter().map(|s| s.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn status_report_lists_live_clusters_only() {
        let cache = cache();
        cache.on_heartbeat(&beat("game-2", "games", 3));
        cache.on_heartbeat(&beat("game-1", "games", 7));

        let report = cache.status_report();
        assert_eq!(report[0], "clusters:");
        assert_eq!(report[1], "  games:");
        assert!(report[2].contains("game-1") && report[2].contains("7 open slots"));
        assert!(report[3].contains("game-2") && report[3].contains("3 open slots"));

        std::thread::sleep(TIMEOUT + Duration::from_millis(10));
        let report = cache.status_report();
        assert_eq!(report, vec!["clusters:", "  no responsive clusters"]);
    }

    #[test]
    fn unknown_cluster_yields_empty_not_error() {
        let cache = cache();
        assert!(cache.candidates_for("nope", SelectionMode::Random, 0).is_empty());
        assert_eq!(cache.cluster_size("nope"), 0);
    }
}
