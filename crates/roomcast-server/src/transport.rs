//! TCP transports for the ingress and publish endpoints.
//!
//! Both endpoints speak the multipart unit framing from `roomcast_proto`:
//! a `u8` frame count, then a `u32` little-endian length plus bytes per
//! frame. Relay units carry exactly two frames (room id, payload).
//!
//! The ingress endpoint is a request-style socket the relay only reads:
//! every connection gets a reader task that forwards decoded units into one
//! bounded queue, so the dispatcher consumes all connections in arrival
//! order per connection.
//!
//! The publish endpoint is a fan-out socket. Subscribers send one-frame
//! control units in ZeroMQ's subscription format (`0x01` + topic prefix to
//! subscribe, `0x00` + topic prefix to unsubscribe) and receive every
//! published unit whose topic matches one of their prefixes. Each
//! subscriber has a bounded queue; a full queue drops the unit, which is
//! acceptable because pose broadcasts are superseded by the next tick and
//! mapping/sync messages are re-sent periodically.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use roomcast_core::RelayCounters;
use roomcast_proto::wire;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};

use crate::error::ServerError;

/// Outbound messages queued per subscriber before drops begin.
pub const PUBLISH_HIGH_WATER_MARK: usize = 1000;

/// Units queued between connection readers and the dispatcher.
pub const INGRESS_QUEUE_DEPTH: usize = 1024;

const SUBSCRIBE: u8 = 0x01;
const UNSUBSCRIBE: u8 = 0x00;

/// One decoded two-frame unit from a client.
#[derive(Debug)]
pub struct IngressUnit {
    /// Frame 0: raw room identifier bytes.
    pub room: Bytes,
    /// Frame 1: message payload.
    pub payload: Bytes,
}

/// Read one multipart unit. `Ok(None)` is a clean end of stream.
pub(crate) async fn read_unit<R>(reader: &mut R) -> Result<Option<Vec<Bytes>>, ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut count = [0u8; 1];
    match reader.read_exact(&mut count).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ServerError::Transport(e.to_string())),
    }
    let count = count[0] as usize;
    if count > wire::MAX_FRAMES_PER_UNIT {
        return Err(ServerError::Transport(format!("unit declared {count} frames")));
    }

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len).await?;
        let len = u32::from_le_bytes(len) as usize;
        if len > wire::MAX_FRAME_LEN {
            return Err(ServerError::Transport(format!("frame declared {len} bytes")));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        frames.push(Bytes::from(frame));
    }
    Ok(Some(frames))
}

/// Encode and write one multipart unit.
pub(crate) async fn write_unit<W>(writer: &mut W, frames: &[&[u8]]) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    wire::encode_unit(frames, &mut buf)?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// The request-style ingress endpoint.
pub struct IngressListener {
    listener: TcpListener,
    counters: Arc<RelayCounters>,
}

impl IngressListener {
    /// Bind to `addr`.
    pub async fn bind(addr: SocketAddr, counters: Arc<RelayCounters>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("ingress bind {addr}: {e}")))?;
        tracing::info!("ingress endpoint bound to {}", listener.local_addr()?);
        Ok(Self { listener, counters })
    }

    /// Local address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown, feeding units into `tx`.
    pub async fn run(self, tx: mpsc::Sender<IngressUnit>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let tx = tx.clone();
                        let counters = Arc::clone(&self.counters);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            ingress_connection(stream, peer, tx, counters, shutdown).await;
                        });
                    },
                    Err(e) => tracing::warn!("ingress accept error: {e}"),
                },
            }
        }
    }
}

async fn ingress_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<IngressUnit>,
    counters: Arc<RelayCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(%peer, "ingress connection opened");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            unit = read_unit(&mut stream) => match unit {
                Ok(None) => break,
                Ok(Some(frames)) => {
                    if frames.len() != wire::UNIT_FRAMES {
                        RelayCounters::bump(&counters.malformed_frames);
                        tracing::debug!(%peer, frames = frames.len(), "dropped unit with wrong frame count");
                        continue;
                    }
                    let mut frames = frames.into_iter();
                    let (Some(room), Some(payload)) = (frames.next(), frames.next()) else {
                        continue;
                    };
                    if tx.send(IngressUnit { room, payload }).await.is_err() {
                        break;
                    }
                },
                Err(e) => {
                    // Length-prefix violations may leave the stream midway
                    // through a unit, so the connection is not recoverable.
                    RelayCounters::bump(&counters.malformed_frames);
                    tracing::debug!(%peer, "closing ingress connection: {e}");
                    break;
                },
            },
        }
    }
    tracing::debug!(%peer, "ingress connection closed");
}

struct Subscriber {
    topics: HashSet<Bytes>,
    tx: mpsc::Sender<Bytes>,
}

struct PubShared {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    counters: Arc<RelayCounters>,
}

impl PubShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Subscriber>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Cloneable handle that enqueues units for matching subscribers.
#[derive(Clone)]
pub struct PubSocket {
    shared: Arc<PubShared>,
}

impl PubSocket {
    /// Publish one unit under `topic`. Never blocks; full subscriber queues
    /// drop the unit and count it.
    pub fn publish(&self, topic: &[u8], payload: &[u8]) {
        let mut buf = BytesMut::with_capacity(topic.len() + payload.len() + 16);
        if let Err(e) = wire::encode_unit(&[topic, payload], &mut buf) {
            tracing::warn!("publish dropped unencodable unit: {e}");
            RelayCounters::bump(&self.shared.counters.dropped_publishes);
            return;
        }
        let unit = buf.freeze();

        let subscribers = self.shared.lock();
        for subscriber in subscribers.values() {
            if !subscriber.topics.iter().any(|prefix| topic.starts_with(prefix)) {
                continue;
            }
            if subscriber.tx.try_send(unit.clone()).is_err() {
                RelayCounters::bump(&self.shared.counters.dropped_publishes);
            }
        }
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().len()
    }
}

/// The fan-out publish endpoint.
pub struct PubListener {
    listener: TcpListener,
    socket: PubSocket,
}

impl PubListener {
    /// Bind to `addr`.
    pub async fn bind(addr: SocketAddr, counters: Arc<RelayCounters>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("publish bind {addr}: {e}")))?;
        tracing::info!("publish endpoint bound to {}", listener.local_addr()?);
        let socket = PubSocket {
            shared: Arc::new(PubShared {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                counters,
            }),
        };
        Ok(Self { listener, socket })
    }

    /// Local address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// A publish handle usable from any thread.
    pub fn socket(&self) -> PubSocket {
        self.socket.clone()
    }

    /// Accept subscribers until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&self.socket.shared);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            subscriber_connection(stream, peer, shared, shutdown).await;
                        });
                    },
                    Err(e) => tracing::warn!("publish accept error: {e}"),
                },
            }
        }
    }
}

async fn subscriber_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<PubShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::channel::<Bytes>(PUBLISH_HIGH_WATER_MARK);
    shared.lock().insert(id, Subscriber { topics: HashSet::new(), tx });
    tracing::debug!(%peer, id, "subscriber connected");

    // Control units are read on their own task so a partially read unit is
    // never cancelled by outbound traffic. When the peer hangs up, the
    // reader drops the subscriber entry, which drops the queue sender and
    // ends the write loop below.
    let (reader, mut writer) = stream.into_split();
    let control = tokio::spawn(subscription_reader(reader, id, Arc::clone(&shared)));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            queued = rx.recv() => match queued {
                Some(unit) => {
                    if writer.write_all(&unit).await.is_err() {
                        break;
                    }
                },
                None => break,
            },
        }
    }

    shared.lock().remove(&id);
    control.abort();
    tracing::debug!(%peer, id, "subscriber disconnected");
}

async fn subscription_reader(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    id: u64,
    shared: Arc<PubShared>,
) {
    loop {
        match read_unit(&mut reader).await {
            Ok(Some(frames)) if frames.len() == 1 && !frames[0].is_empty() => {
                let action = frames[0][0];
                let topic = frames[0].slice(1..);
                let mut subscribers = shared.lock();
                if let Some(subscriber) = subscribers.get_mut(&id) {
                    match action {
                        SUBSCRIBE => {
                            subscriber.topics.insert(topic);
                        },
                        UNSUBSCRIBE => {
                            subscriber.topics.remove(&topic);
                        },
                        other => {
                            tracing::debug!(id, action = other, "ignored control unit");
                        },
                    }
                }
            },
            Ok(Some(_)) => {},
            Ok(None) | Err(_) => break,
        }
    }
    shared.lock().remove(&id);
}
