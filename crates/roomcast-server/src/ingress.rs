//! Ingress dispatcher.
//!
//! One consumer drains the queue fed by the connection readers, so units
//! from a single connection are processed in arrival order. Each unit is
//! validated and routed; a malformed unit is counted and dropped without
//! disturbing the loop, and nothing is ever reported back to the sender.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use roomcast_core::{RelayCounters, RelayError, WriteOutcome};
use roomcast_proto::{ClientPose, Message, ProtocolError, message::MAX_ROOM_ID_LEN};
use tokio::sync::{mpsc, watch};

use crate::{rpc::RpcRouter, state::RoomDirectory, transport::IngressUnit};

/// How often a full room may log its allocation failure.
const ROOM_FULL_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Routes validated ingress units into room state, the variable store, and
/// the RPC router.
pub struct Dispatcher {
    rooms: Arc<RoomDirectory>,
    counters: Arc<RelayCounters>,
    rpc: RpcRouter,
    room_full_logged: Mutex<HashMap<String, Instant>>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(rooms: Arc<RoomDirectory>, counters: Arc<RelayCounters>, rpc: RpcRouter) -> Self {
        Self { rooms, counters, rpc, room_full_logged: Mutex::new(HashMap::new()) }
    }

    /// Consume units until shutdown or the queue closes.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<IngressUnit>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                unit = rx.recv() => match unit {
                    Some(unit) => {
                        if let Err(e) = self.dispatch(unit).await {
                            RelayCounters::bump(&self.counters.malformed_frames);
                            tracing::debug!("dropped malformed unit: {e}");
                        }
                    },
                    None => break,
                },
            }
        }
        tracing::debug!("ingress dispatcher stopped");
    }

    async fn dispatch(&self, unit: IngressUnit) -> Result<(), ProtocolError> {
        if unit.room.is_empty() || unit.room.len() > MAX_ROOM_ID_LEN {
            return Err(ProtocolError::InvalidRoomId(unit.room.len()));
        }
        let room_id = std::str::from_utf8(&unit.room)
            .map_err(|_| ProtocolError::InvalidUtf8 { field: "room id" })?
            .to_owned();

        match Message::decode(unit.payload.clone())? {
            Message::ClientPose(upload) => self.handle_pose(&room_id, upload).await,
            Message::RpcBroadcast(rpc) => {
                self.touch_sender(&room_id, rpc.sender).await;
                self.rpc.relay(&unit.room, &unit.payload);
            },
            Message::RpcClient(rpc) => {
                self.touch_sender(&room_id, rpc.sender).await;
                self.rpc.relay(&unit.room, &unit.payload);
            },
            Message::RpcServer(rpc) => {
                self.touch_sender(&room_id, rpc.sender).await;
                self.rpc.deliver_server(&room_id, &rpc);
            },
            Message::GlobalVarSet(set) => {
                let slot = self.rooms.get_or_create(&room_id).await;
                let mut room = slot.write().await;
                room.touch(set.sender, Instant::now());
                let outcome = room.set_global(&set.name, &set.value, set.timestamp, set.sender);
                drop(room);
                self.count_var_outcome(outcome);
            },
            Message::ClientVarSet(set) => {
                if set.target == 0 {
                    // 0 is the reserved server number; nothing to write to.
                    RelayCounters::bump(&self.counters.unroutable_messages);
                    return Ok(());
                }
                let slot = self.rooms.get_or_create(&room_id).await;
                let mut room = slot.write().await;
                room.touch(set.sender, Instant::now());
                let outcome =
                    room.set_client_var(set.target, &set.name, &set.value, set.timestamp, set.sender);
                drop(room);
                self.count_var_outcome(outcome);
            },
            Message::RoomPose { .. }
            | Message::DeviceIdMapping(_)
            | Message::GlobalVarSync(_)
            | Message::ClientVarSync(_) => {
                // Server-to-client traffic arriving at ingress.
                RelayCounters::bump(&self.counters.unroutable_messages);
                tracing::debug!(room = %room_id, "dropped server-bound unit from a client");
            },
        }
        Ok(())
    }

    async fn handle_pose(&self, room_id: &str, upload: ClientPose) {
        let now = Instant::now();
        let slot = self.rooms.get_or_create(room_id).await;
        let mut room = slot.write().await;

        match room.upsert_client(&upload.device_id, now) {
            Ok((client_no, is_new)) => {
                if is_new {
                    tracing::info!(
                        room = %room_id,
                        client = client_no,
                        device = %upload.device_id,
                        "client joined"
                    );
                }
                if room.cache_pose_body(client_no, upload.body, upload.stealth, upload.sequence) {
                    RelayCounters::bump(&self.counters.relayed_poses);
                } else {
                    RelayCounters::bump(&self.counters.stale_poses);
                }
            },
            Err(RelayError::RoomFull) => {
                drop(room);
                self.log_room_full(room_id, now);
            },
            Err(e) => {
                tracing::warn!(room = %room_id, "pose upsert failed: {e}");
            },
        }
    }

    /// Any frame from a bound client counts as liveness, not just poses.
    async fn touch_sender(&self, room_id: &str, sender: u16) {
        if sender == 0 {
            return;
        }
        let slot = self.rooms.get_or_create(room_id).await;
        slot.write().await.touch(sender, Instant::now());
    }

    fn count_var_outcome(&self, outcome: Result<WriteOutcome, RelayError>) {
        match outcome {
            Ok(WriteOutcome::Stored) => {},
            Ok(WriteOutcome::Stale) => RelayCounters::bump(&self.counters.stale_var_writes),
            Ok(WriteOutcome::CapacityExceeded) => {
                RelayCounters::bump(&self.counters.capacity_rejects);
            },
            Err(e) => {
                // Decode already enforced the length caps, so this is a
                // defect worth surfacing rather than a client problem.
                tracing::warn!("variable write rejected post-decode: {e}");
                RelayCounters::bump(&self.counters.malformed_frames);
            },
        }
    }

    fn log_room_full(&self, room_id: &str, now: Instant) {
        let mut logged = match self.room_full_logged.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let due = logged
            .get(room_id)
            .is_none_or(|last| now.duration_since(*last) >= ROOM_FULL_LOG_INTERVAL);
        if due {
            logged.insert(room_id.to_owned(), now);
            tracing::warn!(room = %room_id, "client-number pool exhausted; pose dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use bytes::Bytes;
    use roomcast_proto::{GlobalVarSet, PoseBody};

    use super::*;
    use crate::transport::PubListener;

    async fn dispatcher() -> (Dispatcher, Arc<RoomDirectory>, Arc<RelayCounters>) {
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
        let rpc = RpcRouter::new(publisher, Arc::clone(&counters));
        let dispatcher = Dispatcher::new(Arc::clone(&rooms), Arc::clone(&counters), rpc);
        (dispatcher, rooms, counters)
    }

    fn pose_unit(room: &str, device: &str, sequence: u32) -> IngressUnit {
        let upload = ClientPose::new(device, sequence, &PoseBody::identity()).unwrap();
        IngressUnit {
            room: Bytes::copy_from_slice(room.as_bytes()),
            payload: Message::ClientPose(upload).to_bytes().unwrap(),
        }
    }

    #[tokio::test]
    async fn poses_create_rooms_and_bind_clients() {
        let (dispatcher, rooms, counters) = dispatcher().await;

        dispatcher.dispatch(pose_unit("stage", "dev-a", 1)).await.unwrap();
        dispatcher.dispatch(pose_unit("stage", "dev-b", 1)).await.unwrap();

        let slot = rooms.get("stage").await.unwrap();
        let room = slot.read().await;
        assert_eq!(room.client_count(), 2);
        assert_eq!(room.client_no_for_device("dev-a"), Some(1));
        assert_eq!(room.client_no_for_device("dev-b"), Some(2));
        assert_eq!(counters.snapshot().relayed_poses, 2);
    }

    #[tokio::test]
    async fn stale_sequences_are_counted_not_cached() {
        let (dispatcher, rooms, counters) = dispatcher().await;

        dispatcher.dispatch(pose_unit("stage", "dev-a", 5)).await.unwrap();
        dispatcher.dispatch(pose_unit("stage", "dev-a", 5)).await.unwrap();
        dispatcher.dispatch(pose_unit("stage", "dev-a", 4)).await.unwrap();

        assert_eq!(counters.snapshot().relayed_poses, 1);
        assert_eq!(counters.snapshot().stale_poses, 2);

        let slot = rooms.get("stage").await.unwrap();
        assert_eq!(slot.read().await.client_count(), 1);
    }

    #[tokio::test]
    async fn malformed_room_ids_are_rejected() {
        let (dispatcher, rooms, _counters) = dispatcher().await;

        let unit = IngressUnit {
            room: Bytes::new(),
            payload: pose_unit("x", "dev", 1).payload,
        };
        assert!(matches!(
            dispatcher.dispatch(unit).await,
            Err(ProtocolError::InvalidRoomId(0))
        ));

        let unit = IngressUnit {
            room: Bytes::from(vec![b'r'; MAX_ROOM_ID_LEN + 1]),
            payload: pose_unit("x", "dev", 1).payload,
        };
        assert!(dispatcher.dispatch(unit).await.is_err());
        assert!(rooms.is_empty().await);
    }

    #[tokio::test]
    async fn var_sets_store_and_count_outcomes() {
        let (dispatcher, rooms, counters) = dispatcher().await;
        dispatcher.dispatch(pose_unit("stage", "dev-a", 1)).await.unwrap();

        let set = Message::GlobalVarSet(GlobalVarSet {
            sender: 1,
            name: "scene".into(),
            value: "lobby".into(),
            timestamp: 100.0,
        });
        let unit = IngressUnit {
            room: Bytes::from_static(b"stage"),
            payload: set.to_bytes().unwrap(),
        };
        dispatcher.dispatch(unit).await.unwrap();

        // The identical write again is stale.
        let set = Message::GlobalVarSet(GlobalVarSet {
            sender: 1,
            name: "scene".into(),
            value: "lobby".into(),
            timestamp: 100.0,
        });
        let unit = IngressUnit {
            room: Bytes::from_static(b"stage"),
            payload: set.to_bytes().unwrap(),
        };
        dispatcher.dispatch(unit).await.unwrap();

        let slot = rooms.get("stage").await.unwrap();
        let room = slot.read().await;
        assert_eq!(room.globals().get("scene").unwrap().value, "lobby");
        assert_eq!(counters.snapshot().stale_var_writes, 1);
    }

    #[tokio::test]
    async fn server_bound_sync_messages_are_unroutable() {
        let (dispatcher, _rooms, counters) = dispatcher().await;

        let unit = IngressUnit {
            room: Bytes::from_static(b"stage"),
            payload: Message::GlobalVarSync(Vec::new()).to_bytes().unwrap(),
        };
        dispatcher.dispatch(unit).await.unwrap();
        assert_eq!(counters.snapshot().unroutable_messages, 1);
    }
}
