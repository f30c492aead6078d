//! Periodic room-state fan-out.
//!
//! A single timer ticks at the fastest configured period; each room decides
//! under its own lock whether its adaptive period has elapsed and what to
//! emit. Publishing happens after the room lock is dropped, since the
//! publish socket only enqueues.
//!
//! Pose fan-out splices each client's cached raw body into the outgoing
//! payload. Nothing is re-encoded per tick per client; that is the relay's
//! main performance lever.

use std::{sync::Arc, time::Duration};

use roomcast_core::{RelayCounters, TickPlan};
use roomcast_proto::{Message, encode_room_pose_raw};
use tokio::{
    sync::watch,
    time::{Instant as TokioInstant, MissedTickBehavior},
};

use crate::{state::RoomDirectory, transport::PubSocket};

/// How often the counters are logged while traffic flows.
const COUNTER_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Drives the broadcast timer across all rooms.
pub struct Broadcaster {
    rooms: Arc<RoomDirectory>,
    publisher: PubSocket,
    counters: Arc<RelayCounters>,
    inactivity_timeout: Duration,
    tick_period: Duration,
}

impl Broadcaster {
    /// Create a broadcaster ticking at `tick_period` (the pacing floor).
    pub fn new(
        rooms: Arc<RoomDirectory>,
        publisher: PubSocket,
        counters: Arc<RelayCounters>,
        inactivity_timeout: Duration,
        tick_period: Duration,
    ) -> Self {
        Self { rooms, publisher, counters, inactivity_timeout, tick_period }
    }

    /// Tick until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_log = TokioInstant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {},
            }
            self.tick().await;

            if last_log.elapsed() >= COUNTER_LOG_INTERVAL {
                last_log = TokioInstant::now();
                let snapshot = self.counters.snapshot();
                let room_count = self.rooms.len().await;
                tracing::info!(
                    rooms = room_count,
                    relayed_poses = snapshot.relayed_poses,
                    relayed_rpcs = snapshot.relayed_rpcs,
                    malformed = snapshot.malformed_frames,
                    dropped_publishes = snapshot.dropped_publishes,
                    "relay counters"
                );
            }
        }
        tracing::debug!("broadcaster stopped");
    }

    /// Run one pass over every room.
    pub async fn tick(&self) {
        let now = std::time::Instant::now();
        for (room_id, slot) in self.rooms.all().await {
            let plan = {
                let mut room = slot.write().await;
                room.tick(now, self.inactivity_timeout)
            };
            self.execute(&room_id, plan).await;
        }
    }

    async fn execute(&self, room_id: &str, plan: TickPlan) {
        for reaped in &plan.reaped {
            RelayCounters::bump(&self.counters.reaped_clients);
            tracing::info!(
                room = %room_id,
                client = reaped.client_no,
                device = %reaped.device_id,
                "reaped inactive client"
            );
        }

        let topic = room_id.as_bytes();

        if let Some(clients) = &plan.pose {
            match encode_room_pose_raw(room_id, clients) {
                Ok(payload) => self.publisher.publish(topic, &payload),
                Err(e) => tracing::warn!(room = %room_id, "pose fan-out skipped: {e}"),
            }
        }

        if let Some(entries) = plan.mapping {
            match Message::DeviceIdMapping(entries).to_bytes() {
                Ok(payload) => self.publisher.publish(topic, &payload),
                Err(e) => tracing::warn!(room = %room_id, "mapping fan-out skipped: {e}"),
            }
        }

        if !plan.global_sync.is_empty() {
            match Message::GlobalVarSync(plan.global_sync).to_bytes() {
                Ok(payload) => self.publisher.publish(topic, &payload),
                Err(e) => tracing::warn!(room = %room_id, "global var sync skipped: {e}"),
            }
        }

        if !plan.client_sync.is_empty() {
            match Message::ClientVarSync(plan.client_sync).to_bytes() {
                Ok(payload) => self.publisher.publish(topic, &payload),
                Err(e) => tracing::warn!(room = %room_id, "client var sync skipped: {e}"),
            }
        }

        if plan.destroy_room && self.rooms.remove_if_empty(room_id).await {
            RelayCounters::bump(&self.counters.destroyed_rooms);
            tracing::info!(room = %room_id, "destroyed empty room");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Instant};

    use bytes::Bytes;

    use super::*;
    use crate::transport::PubListener;

    async fn broadcaster() -> (Broadcaster, Arc<RoomDirectory>, Arc<RelayCounters>) {
        let counters = Arc::new(RelayCounters::new());
        let rooms = Arc::new(RoomDirectory::new(
            Duration::from_millis(50),
            Duration::from_millis(500),
        ));
        let publisher = PubListener::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Arc::clone(&counters),
        )
        .await
        .unwrap()
        .socket();
        let broadcaster = Broadcaster::new(
            Arc::clone(&rooms),
            publisher,
            Arc::clone(&counters),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        (broadcaster, rooms, counters)
    }

    #[tokio::test]
    async fn ticks_reap_and_eventually_destroy_rooms() {
        let (broadcaster, rooms, counters) = broadcaster().await;

        {
            let slot = rooms.get_or_create("stage").await;
            let mut room = slot.write().await;
            let (n, _) = room.upsert_client("dev-a", Instant::now()).unwrap();
            room.cache_pose_body(n, Bytes::from_static(&[0, 1, 2, 3]), false, 1);
        }

        // First pass broadcasts; the client is fresh.
        broadcaster.tick().await;
        assert_eq!(counters.snapshot().reaped_clients, 0);

        // Let the client go stale, then reap it.
        tokio::time::sleep(Duration::from_millis(150)).await;
        broadcaster.tick().await;
        assert_eq!(counters.snapshot().reaped_clients, 1);
        assert_eq!(rooms.len().await, 1);

        // The empty room survives one further pass, then dies.
        tokio::time::sleep(Duration::from_millis(60)).await;
        broadcaster.tick().await;
        assert_eq!(rooms.len().await, 0);
        assert_eq!(counters.snapshot().destroyed_rooms, 1);
    }
}
