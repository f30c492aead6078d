//! RPC routing.
//!
//! Broadcast and targeted RPCs are re-published verbatim under the sender's
//! room topic; the payload bytes that arrived are the payload bytes that
//! leave, so routing costs no re-serialization. Targeted RPCs reach every
//! subscriber and the target filters by its own client-number, trading
//! amplification for the absence of per-client channels.
//!
//! Server-bound RPCs go to an in-process sink. Running without a sink is
//! normal; those RPCs are silently dropped.

use std::sync::Arc;

use roomcast_core::RelayCounters;
use roomcast_proto::Rpc;

use crate::transport::PubSocket;

/// In-process consumer for server-bound RPCs.
pub trait ServerRpcSink: Send + Sync {
    /// Handle one RPC addressed to the server.
    fn handle(&self, room_id: &str, rpc: &Rpc);
}

/// Routes the three RPC shapes.
pub struct RpcRouter {
    publisher: PubSocket,
    counters: Arc<RelayCounters>,
    sink: Option<Arc<dyn ServerRpcSink>>,
}

impl RpcRouter {
    /// Create a router without a server sink.
    pub fn new(publisher: PubSocket, counters: Arc<RelayCounters>) -> Self {
        Self { publisher, counters, sink: None }
    }

    /// Attach the server-bound RPC sink.
    pub fn with_sink(mut self, sink: Arc<dyn ServerRpcSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Re-publish a broadcast or targeted RPC under its room topic.
    pub fn relay(&self, topic: &[u8], payload: &[u8]) {
        self.publisher.publish(topic, payload);
        RelayCounters::bump(&self.counters.relayed_rpcs);
    }

    /// Deliver a server-bound RPC to the sink, if one is registered.
    pub fn deliver_server(&self, room_id: &str, rpc: &Rpc) {
        match &self.sink {
            Some(sink) => {
                sink.handle(room_id, rpc);
                RelayCounters::bump(&self.counters.relayed_rpcs);
            },
            None => {
                tracing::debug!(
                    room = %room_id,
                    function = %rpc.function,
                    "dropped server RPC: no sink registered"
                );
            },
        }
    }
}
