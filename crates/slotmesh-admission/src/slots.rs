//! Slot accounting, reservations, and resize.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What to do with a user who shows up without a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Admit them anyway if a slot happens to be open.
    #[default]
    Standard,
    /// Reject them regardless of open slots; only reserved users enter.
    Strict,
}

/// Result of an admission check at login time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// The user may enter. Any reservation they held was consumed.
    Admitted,
    /// Strict policy and no reservation.
    RejectedUnreserved,
    /// No reservation and no open slot at this instant.
    RejectedFull,
}

impl AdmissionOutcome {
    pub fn is_admitted(self) -> bool {
        matches!(self, AdmissionOutcome::Admitted)
    }
}

struct Capacity {
    total_slots: u32,
    /// Mirrors the host's live user count, via `user_joined`/`user_left`.
    online: u32,
    /// user id → when the reservation was granted.
    reservations: HashMap<Uuid, Instant>,
    /// At most one caller may be waiting for a shrink to become
    /// enforceable; a newer resize resolves the older promise false.
    pending_resize: Option<oneshot::Sender<bool>>,
}

impl Capacity {
    fn open_slots(&self) -> u32 {
        self.total_slots
            .saturating_sub(self.online)
            .saturating_sub(self.reservations.len() as u32)
    }

    /// Drop reservations older than `timeout`. Returns how many went.
    fn prune_expired(&mut self, timeout: Duration, now: Instant) -> usize {
        let before = self.reservations.len();
        self.reservations
            .retain(|_, created| now.duration_since(*created) <= timeout);
        before - self.reservations.len()
    }

    /// Resolve the pending resize promise if the numbers now fit.
    fn check_resize(&mut self) {
        let fits = self.total_slots >= self.online + self.reservations.len() as u32;
        if fits {
            if let Some(tx) = self.pending_resize.take() {
                let _ = tx.send(true);
            }
        }
    }
}

/// Local admission controller for one instance.
///
/// All mutation happens under one lock with short critical sections;
/// the atomicity of [`reserve`](Self::reserve) is exactly that lock.
///
/// The host drives the user-lifecycle edges: call
/// [`admit`](Self::admit) when a user attempts to log in, then
/// [`user_joined`](Self::user_joined) once they are actually in, and
/// [`user_left`](Self::user_left) when they disconnect.
pub struct SlotManager {
    policy: AdmissionPolicy,
    reservation_timeout: Duration,
    inner: Mutex<Capacity>,
}

impl SlotManager {
    pub fn new(total_slots: u32, reservation_timeout: Duration) -> Self {
        Self {
            policy: AdmissionPolicy::default(),
            reservation_timeout,
            inner: Mutex::new(Capacity {
                total_slots,
                online: 0,
                reservations: HashMap::new(),
                pending_resize: None,
            }),
        }
    }

    pub fn with_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Atomically reserve one slot per user, or nothing at all.
    ///
    /// Re-reserving a user who already holds a reservation refreshes
    /// their timestamp rather than consuming a second slot.
    pub fn reserve(&self, users: &HashSet<Uuid>) -> bool {
        if users.is_empty() {
            return false;
        }
        let now = Instant::now();
        let Ok(mut cap) = self.inner.lock() else {
            return false;
        };
        if cap.prune_expired(self.reservation_timeout, now) > 0 {
            cap.check_resize();
        }

        let fresh = users
            .iter()
            .filter(|u| !cap.reservations.contains_key(u))
            .count() as u32;
        if cap.open_slots() < fresh {
            debug!(
                requested = users.len(),
                open = cap.open_slots(),
                "reservation denied, not enough open slots"
            );
            return false;
        }
        for user in users {
            cap.reservations.insert(*user, now);
        }
        true
    }

    /// Consume `user`'s reservation. Returns whether one existed.
    pub fn consume(&self, user: &Uuid) -> bool {
        let now = Instant::now();
        let Ok(mut cap) = self.inner.lock() else {
            return false;
        };
        cap.prune_expired(self.reservation_timeout, now);
        let existed = cap.reservations.remove(user).is_some();
        if existed {
            cap.check_resize();
        }
        existed
    }

    /// Admission check for a login attempt.
    ///
    /// A held reservation always admits (and is consumed). Without one,
    /// the standard policy admits when a slot is open right now and the
    /// strict policy never does.
    pub fn admit(&self, user: &Uuid) -> AdmissionOutcome {
        let now = Instant::now();
        let Ok(mut cap) = self.inner.lock() else {
            return AdmissionOutcome::RejectedFull;
        };
        if cap.prune_expired(self.reservation_timeout, now) > 0 {
            cap.check_resize();
        }

        if cap.reservations.remove(user).is_some() {
            cap.check_resize();
            return AdmissionOutcome::Admitted;
        }
        match self.policy {
            AdmissionPolicy::Strict => {
                warn!(%user, "rejected login without reservation (strict)");
                AdmissionOutcome::RejectedUnreserved
            }
            AdmissionPolicy::Standard => {
                if cap.open_slots() >= 1 {
                    AdmissionOutcome::Admitted
                } else {
                    AdmissionOutcome::RejectedFull
                }
            }
        }
    }

    /// The host reports a user finished connecting.
    pub fn user_joined(&self) {
        if let Ok(mut cap) = self.inner.lock() {
            cap.online += 1;
            cap.check_resize();
        }
    }

    /// The host reports a user disconnected.
    pub fn user_left(&self) {
        if let Ok(mut cap) = self.inner.lock() {
            cap.online = cap.online.saturating_sub(1);
            cap.check_resize();
        }
    }

    /// Change the total slot count.
    ///
    /// The number takes effect immediately; the returned promise
    /// resolves `true` once the new total actually covers the current
    /// online users and reservations (at once, if it already does), or
    /// `false` if another resize supersedes this one first. Shrinking
    /// never evicts anyone; it only blocks new admissions until the
    /// numbers reconcile.
    pub fn resize(&self, new_total: u32) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let Ok(mut cap) = self.inner.lock() else {
            return rx;
        };

        if let Some(prev) = cap.pending_resize.take() {
            let _ = prev.send(false);
        }

        cap.total_slots = new_total;
        info!(total_slots = new_total, "total slots changed");

        cap.prune_expired(self.reservation_timeout, now);
        if cap.total_slots >= cap.online + cap.reservations.len() as u32 {
            let _ = tx.send(true);
        } else {
            cap.pending_resize = Some(tx);
        }
        rx
    }

    /// Expire stale reservations and re-check the resize promise.
    /// Driven by the node's periodic tick so expiry does not wait for
    /// the next reserve/admit call.
    pub fn tick(&self) {
        let now = Instant::now();
        if let Ok(mut cap) = self.inner.lock() {
            let expired = cap.prune_expired(self.reservation_timeout, now);
            if expired > 0 {
                debug!(expired, "reservations expired unfulfilled");
                cap.check_resize();
            }
        }
    }

    pub fn open_slots(&self) -> u32 {
        let now = Instant::now();
        match self.inner.lock() {
            Ok(mut cap) => {
                if cap.prune_expired(self.reservation_timeout, now) > 0 {
                    cap.check_resize();
                }
                cap.open_slots()
            }
            Err(_) => 0,
        }
    }

    pub fn total_slots(&self) -> u32 {
        self.inner.lock().map(|cap| cap.total_slots).unwrap_or(0)
    }

    pub fn online_count(&self) -> u32 {
        self.inner.lock().map(|cap| cap.online).unwrap_or(0)
    }

    pub fn reservation_count(&self) -> usize {
        let now = Instant::now();
        match self.inner.lock() {
            Ok(mut cap) => {
                cap.prune_expired(self.reservation_timeout, now);
                cap.reservations.len()
            }
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const LONG: Duration = Duration::from_secs(60);

    fn users(n: usize) -> HashSet<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn reserve_is_all_or_nothing() {
        let mgr = SlotManager::new(3, LONG);
        assert!(!mgr.reserve(&users(4)));
        assert_eq!(mgr.open_slots(), 3, "failed reservation must not hold slots");
        assert!(mgr.reserve(&users(3)));
        assert_eq!(mgr.open_slots(), 0);
    }

    #[test]
    fn consume_returns_slot_ownership_to_user() {
        let mgr = SlotManager::new(2, LONG);
        let group = users(1);
        let user = *group.iter().next().unwrap();

        assert!(mgr.reserve(&group));
        assert_eq!(mgr.open_slots(), 1);
        assert!(mgr.consume(&user));
        assert!(!mgr.consume(&user), "a reservation is consumed at most once");
        assert_eq!(mgr.open_slots(), 2);
    }

    #[test]
    fn reservation_expires_unfulfilled() {
        let timeout = Duration::from_millis(30);
        let mgr = SlotManager::new(2, timeout);
        assert!(mgr.reserve(&users(2)));
        assert_eq!(mgr.open_slots(), 0);

        std::thread::sleep(timeout + Duration::from_millis(10));
        assert_eq!(mgr.open_slots(), 2, "expired reservations return silently");
    }

    #[test]
    fn admit_with_reservation_always_enters() {
        let mgr = SlotManager::new(1, LONG).with_policy(AdmissionPolicy::Strict);
        let group = users(1);
        let user = *group.iter().next().unwrap();
        assert!(mgr.reserve(&group));

        assert_eq!(mgr.admit(&user), AdmissionOutcome::Admitted);
        mgr.user_joined();
        assert_eq!(mgr.online_count(), 1);
    }

    #[test]
    fn strict_policy_rejects_unreserved() {
        let mgr = SlotManager::new(10, LONG).with_policy(AdmissionPolicy::Strict);
        assert_eq!(
            mgr.admit(&Uuid::new_v4()),
            AdmissionOutcome::RejectedUnreserved
        );
    }

    #[test]
    fn standard_policy_admits_walkins_while_open() {
        let mgr = SlotManager::new(1, LONG);
        assert_eq!(mgr.admit(&Uuid::new_v4()), AdmissionOutcome::Admitted);
        mgr.user_joined();
        assert_eq!(mgr.admit(&Uuid::new_v4()), AdmissionOutcome::RejectedFull);
    }

    #[test]
    fn grow_resolves_immediately() {
        let mgr = SlotManager::new(1, LONG);
        let mut rx = mgr.resize(5);
        assert_eq!(rx.try_recv(), Ok(true));
        assert_eq!(mgr.total_slots(), 5);
    }

    #[test]
    fn shrink_waits_for_reconciliation() {
        let mgr = SlotManager::new(4, LONG);
        let group = users(3);
        assert!(mgr.reserve(&group));

        let mut rx = mgr.resize(2);
        assert!(rx.try_recv().is_err(), "3 reservations > 2 slots, must wait");
        // The raw number still changed immediately.
        assert_eq!(mgr.total_slots(), 2);
        assert_eq!(mgr.open_slots(), 0);

        let mut it = group.iter();
        assert!(mgr.consume(it.next().unwrap()));
        // 2 reservations now fit in 2 slots.
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn consuming_a_reservation_reevaluates_shrink() {
        let mgr = SlotManager::new(4, LONG);
        let group = users(4);
        assert!(mgr.reserve(&group));

        let mut rx = mgr.resize(3);
        assert!(rx.try_recv().is_err());

        // Consuming a reservation is a reconciliation point: 3 held
        // reservations and 0 online now fit in 3 slots.
        let user = *group.iter().next().unwrap();
        assert_eq!(mgr.admit(&user), AdmissionOutcome::Admitted);
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn newer_resize_supersedes_pending() {
        let mgr = SlotManager::new(4, LONG);
        assert!(mgr.reserve(&users(4)));

        let mut first = mgr.resize(1);
        let mut second = mgr.resize(10);

        assert_eq!(first.try_recv(), Ok(false), "superseded promise resolves false");
        assert_eq!(second.try_recv(), Ok(true));
        assert_eq!(mgr.total_slots(), 10);
    }

    #[test]
    fn expiry_resolves_pending_resize() {
        let timeout = Duration::from_millis(30);
        let mgr = SlotManager::new(2, timeout);
        assert!(mgr.reserve(&users(2)));

        let mut rx = mgr.resize(1);
        assert!(rx.try_recv().is_err());

        std::thread::sleep(timeout + Duration::from_millis(10));
        mgr.tick();
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn user_departure_resolves_pending_resize() {
        let mgr = SlotManager::new(3, LONG);
        mgr.user_joined();
        mgr.user_joined();
        mgr.user_joined();

        let mut rx = mgr.resize(2);
        assert!(rx.try_recv().is_err());
        assert_eq!(mgr.online_count(), 3, "shrink never evicts");

        mgr.user_left();
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn concurrent_reservations_never_overbook() {
        use rand::Rng;

        let total = 64u32;
        let mgr = Arc::new(SlotManager::new(total, LONG));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let mgr = Arc::clone(&mgr);
            handles.push(std::thread::spawn(move || {
                let mut granted = 0u32;
                let mut rng = rand::thread_rng();
                for _ in 0..50 {
                    let size = rng.gen_range(1..=5);
                    if mgr.reserve(&users(size)) {
                        granted += size as u32;
                    }
                }
                granted
            }));
        }

        let granted: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(
            granted <= total,
            "granted {granted} slots with only {total} available"
        );
        assert_eq!(mgr.open_slots(), total - granted);
    }
}
