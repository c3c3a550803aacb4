//! Variable-rate heartbeat emitter.
//!
//! Peers only need a fresh heartbeat when something changed, but they
//! also need proof of life before the membership TTL gives up on us.
//! So the emitter polls the open-slot count on a short interval and
//! beats immediately on a change, and otherwise lets the wire stay
//! quiet up to `heartbeat_ceiling` before forcing a beat.
//!
//! The encoded message never changes except its trailing slot field,
//! which is rewritten in place under the same lock that serializes
//! sends.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use slotmesh_admission::SlotManager;
use slotmesh_proto::{Heartbeat, ShutdownNotification};
use slotmesh_transport::Messenger;

use crate::error::NodeResult;

pub struct HeartbeatEmitter {
    instance_id: String,
    slots: Arc<SlotManager>,
    messenger: Arc<dyn Messenger>,
    heartbeat_channel: String,
    shutdown_channel: String,
    slot_poll_interval: Duration,
    heartbeat_ceiling: Duration,
    /// Encoded heartbeat; only the trailing slot field is ever touched,
    /// and only while this lock is held for a send.
    base: tokio::sync::Mutex<Vec<u8>>,
    stop_tx: watch::Sender<bool>,
}

impl HeartbeatEmitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster_id: &str,
        instance_id: &str,
        ip: &str,
        port: u16,
        slots: Arc<SlotManager>,
        messenger: Arc<dyn Messenger>,
        heartbeat_channel: &str,
        shutdown_channel: &str,
        slot_poll_interval: Duration,
        heartbeat_ceiling: Duration,
    ) -> Self {
        let base = Heartbeat {
            cluster_id: cluster_id.to_string(),
            instance_id: instance_id.to_string(),
            ip: ip.to_string(),
            port,
            open_slots: slots.open_slots(),
        }
        .encode();
        let (stop_tx, _) = watch::channel(false);
        Self {
            instance_id: instance_id.to_string(),
            slots,
            messenger,
            heartbeat_channel: heartbeat_channel.to_string(),
            shutdown_channel: shutdown_channel.to_string(),
            slot_poll_interval,
            heartbeat_ceiling,
            base: tokio::sync::Mutex::new(base),
            stop_tx,
        }
    }

    /// Start beating. The first beat goes out immediately so peers
    /// learn about this instance without waiting out the ceiling.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut last_sent = this.slots.open_slots();
            this.beat(last_sent).await;
            let mut last_beat = Instant::now();

            let mut poll = tokio::time::interval(this.slot_poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = poll.tick() => {}
                    _ = stop_rx.changed() => {
                        debug!(instance_id = %this.instance_id, "heartbeat emitter stopped");
                        return;
                    }
                }
                let open = this.slots.open_slots();
                if open != last_sent || last_beat.elapsed() >= this.heartbeat_ceiling {
                    this.beat(open).await;
                    last_sent = open;
                    last_beat = Instant::now();
                }
            }
        })
    }

    async fn beat(&self, open_slots: u32) {
        let mut base = self.base.lock().await;
        if let Err(err) = Heartbeat::rewrite_open_slots(&mut base, open_slots) {
            warn!(%err, "heartbeat buffer corrupt, skipping beat");
            return;
        }
        let payload = Bytes::copy_from_slice(&base);
        if let Err(err) = self.messenger.publish(&self.heartbeat_channel, payload).await {
            warn!(%err, "failed to publish heartbeat");
        }
    }

    /// Announce a planned shutdown and stop the beat.
    ///
    /// The receive side of the node stays up; peers just stop hearing
    /// from this instance and remove it immediately on the notice.
    pub async fn send_shutdown(&self) -> NodeResult<()> {
        let _ = self.stop_tx.send(true);
        let notice = ShutdownNotification {
            instance_id: self.instance_id.clone(),
        };
        self.messenger
            .publish(&self.shutdown_channel, Bytes::from(notice.encode()))
            .await?;
        info!(instance_id = %self.instance_id, "shutdown notice published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use slotmesh_transport::LocalBus;

    use super::*;

    const POLL: Duration = Duration::from_millis(10);
    const CEILING: Duration = Duration::from_millis(80);

    fn emitter(bus: &LocalBus, slots: Arc<SlotManager>) -> Arc<HeartbeatEmitter> {
        Arc::new(HeartbeatEmitter::new(
            "pool",
            "pool-1",
            "10.0.0.1",
            25_565,
            slots,
            Arc::new(bus.clone()),
            "hb",
            "down",
            POLL,
            CEILING,
        ))
    }

    #[tokio::test]
    async fn beats_immediately_and_on_slot_change() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("hb").await.unwrap();
        let slots = Arc::new(SlotManager::new(8, Duration::from_secs(30)));
        let emitter = emitter(&bus, Arc::clone(&slots));
        emitter.spawn();

        let first = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Heartbeat::decode(&first).unwrap().open_slots, 8);

        slots.user_joined();
        let changed = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Heartbeat::decode(&changed).unwrap().open_slots, 7);
    }

    #[tokio::test]
    async fn quiet_gap_never_exceeds_the_ceiling() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("hb").await.unwrap();
        let slots = Arc::new(SlotManager::new(8, Duration::from_secs(30)));
        let emitter = emitter(&bus, slots);
        emitter.spawn();

        // Slots never change; beats must still arrive on the ceiling.
        for _ in 0..3 {
            let beat = tokio::time::timeout(CEILING + Duration::from_millis(60), rx.recv())
                .await
                .expect("beat within the ceiling")
                .unwrap();
            assert_eq!(Heartbeat::decode(&beat).unwrap().open_slots, 8);
        }
    }

    #[tokio::test]
    async fn shutdown_stops_the_beat_and_notifies() {
        let bus = LocalBus::new();
        let mut hb_rx = bus.subscribe("hb").await.unwrap();
        let mut down_rx = bus.subscribe("down").await.unwrap();
        let slots = Arc::new(SlotManager::new(8, Duration::from_secs(30)));
        let emitter = emitter(&bus, slots);
        emitter.spawn();

        // Swallow the initial beat, then shut down.
        hb_rx.recv().await.unwrap();
        emitter.send_shutdown().await.unwrap();

        let notice = down_rx.recv().await.unwrap();
        let decoded = ShutdownNotification::decode(&notice).unwrap();
        assert_eq!(decoded.instance_id, "pool-1");

        // Drain anything already in flight, then expect silence.
        tokio::time::sleep(CEILING + Duration::from_millis(40)).await;
        while hb_rx.try_recv().is_ok() {}
        tokio::time::sleep(CEILING + Duration::from_millis(40)).await;
        assert!(hb_rx.try_recv().is_err());
    }
}
