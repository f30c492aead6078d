//! Relay message types and their payload codecs.
//!
//! The payload of every two-frame unit starts with a one-byte message type.
//! Client-bound state fan-out (`RoomPose`, `DeviceIdMapping`, the var syncs)
//! and client-sent traffic (`ClientPose`, the RPCs, the var sets) share one
//! enum so tests and simulators can speak both directions.
//!
//! Pose traffic carries a protocol-version byte; the pre-v3 transform IDs
//! (1 and 2) are rejected as unknown.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    PROTOCOL_VERSION,
    error::{ProtocolError, Result},
    pose::PoseBody,
    wire,
};

/// Cap on room identifiers, in UTF-8 bytes.
pub const MAX_ROOM_ID_LEN: usize = 255;
/// Cap on device identifiers, in UTF-8 bytes.
pub const MAX_DEVICE_ID_LEN: usize = 255;
/// Cap on RPC function names, in UTF-8 bytes.
pub const MAX_FUNCTION_LEN: usize = 255;
/// Cap on RPC argument blobs, in UTF-8 bytes.
pub const MAX_ARGS_LEN: usize = u16::MAX as usize;
/// Cap on variable names, in UTF-8 bytes.
pub const MAX_VAR_NAME_LEN: usize = 64;
/// Cap on variable values, in UTF-8 bytes.
pub const MAX_VAR_VALUE_LEN: usize = 1024;

/// Wire identifiers for every message the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client-to-room RPC, relayed to every subscriber.
    RpcBroadcast = 3,
    /// Client-to-server RPC, consumed in-process.
    RpcServer = 4,
    /// Client-to-client RPC, relayed under the room topic.
    RpcClient = 5,
    /// Client-number to device-id mapping fan-out.
    DeviceIdMapping = 6,
    /// Room-scoped variable write.
    GlobalVarSet = 7,
    /// Room-scoped variable fan-out.
    GlobalVarSync = 8,
    /// Client-scoped variable write.
    ClientVarSet = 9,
    /// Client-scoped variable fan-out.
    ClientVarSync = 10,
    /// One client's pose, client to server.
    ClientPose = 11,
    /// Whole-room pose fan-out, server to clients.
    RoomPose = 12,
}

impl MessageType {
    /// Map a wire byte to a message type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            3 => Some(Self::RpcBroadcast),
            4 => Some(Self::RpcServer),
            5 => Some(Self::RpcClient),
            6 => Some(Self::DeviceIdMapping),
            7 => Some(Self::GlobalVarSet),
            8 => Some(Self::GlobalVarSync),
            9 => Some(Self::ClientVarSet),
            10 => Some(Self::ClientVarSync),
            11 => Some(Self::ClientPose),
            12 => Some(Self::RoomPose),
            _ => None,
        }
    }

    /// The wire byte for this type.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Read the message type from a payload without consuming it.
pub fn peek_type(payload: &[u8]) -> Result<MessageType> {
    let first = *payload.first().ok_or(ProtocolError::Truncated { field: "message type" })?;
    MessageType::from_u8(first).ok_or(ProtocolError::UnknownMessageType(first))
}

/// One client's pose upload.
///
/// The body is kept as the raw encoded bytes so the relay can cache and
/// re-emit it without re-encoding. [`ClientPose::pose`] parses on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientPose {
    /// Stable client-chosen identity, typically a GUID.
    pub device_id: String,
    /// Client-side frame counter, used to drop reordered uploads.
    pub sequence: u32,
    /// Mirror of the body's stealth flag bit.
    pub stealth: bool,
    /// Raw pose body bytes, exactly as received.
    pub body: Bytes,
}

impl ClientPose {
    /// Build an upload from a logical pose.
    pub fn new(device_id: impl Into<String>, sequence: u32, pose: &PoseBody) -> Result<Self> {
        let device_id = device_id.into();
        check_device_id(&device_id)?;
        let body = pose.to_bytes()?;
        Ok(Self { device_id, sequence, stealth: pose.stealth, body })
    }

    /// Parse the raw body into a logical pose.
    pub fn pose(&self) -> Result<PoseBody> {
        let mut rd = self.body.clone();
        let pose = PoseBody::decode(&mut rd)?;
        if rd.has_remaining() {
            return Err(ProtocolError::TrailingBytes(rd.remaining()));
        }
        Ok(pose)
    }
}

/// One entry of a [`Message::DeviceIdMapping`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// Client-number inside the room.
    pub client_no: u16,
    /// Whether the client is currently invisible.
    pub stealth: bool,
    /// The client's device identity.
    pub device_id: String,
}

/// Sender plus call data shared by broadcast and server RPCs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    /// Sender client-number.
    pub sender: u16,
    /// Function name.
    pub function: String,
    /// Opaque UTF-8 JSON argument blob; the relay never parses it.
    pub args: String,
}

/// A targeted client-to-client RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcTarget {
    /// Sender client-number.
    pub sender: u16,
    /// Target client-number; targets filter on receipt.
    pub target: u16,
    /// Function name.
    pub function: String,
    /// Opaque UTF-8 JSON argument blob.
    pub args: String,
}

/// A room-scoped variable write.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVarSet {
    /// Writer client-number.
    pub sender: u16,
    /// Variable name, 1..=64 bytes.
    pub name: String,
    /// Variable value, up to 1024 bytes.
    pub value: String,
    /// Writer's wall clock, seconds since the Unix epoch.
    pub timestamp: f64,
}

/// A client-scoped variable write.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientVarSet {
    /// Writer client-number.
    pub sender: u16,
    /// Client-number the variable belongs to.
    pub target: u16,
    /// Variable name, 1..=64 bytes.
    pub name: String,
    /// Variable value, up to 1024 bytes.
    pub value: String,
    /// Writer's wall clock, seconds since the Unix epoch.
    pub timestamp: f64,
}

/// One synchronized variable entry.
#[derive(Debug, Clone, PartialEq)]
pub struct VarSyncEntry {
    /// Variable name.
    pub name: String,
    /// Stored value.
    pub value: String,
    /// Timestamp of the accepted write.
    pub timestamp: f64,
    /// Client-number of the accepted writer (0 is the server).
    pub writer: u16,
}

/// Variables of one client inside a [`Message::ClientVarSync`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientVarBlock {
    /// Client-number the entries belong to.
    pub client_no: u16,
    /// The entries.
    pub entries: Vec<VarSyncEntry>,
}

/// Every message the relay can decode or encode.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client-to-room RPC.
    RpcBroadcast(Rpc),
    /// Client-to-server RPC.
    RpcServer(Rpc),
    /// Client-to-client RPC.
    RpcClient(RpcTarget),
    /// Client-number to device-id mapping fan-out.
    DeviceIdMapping(Vec<MappingEntry>),
    /// Room-scoped variable write.
    GlobalVarSet(GlobalVarSet),
    /// Room-scoped variable fan-out.
    GlobalVarSync(Vec<VarSyncEntry>),
    /// Client-scoped variable write.
    ClientVarSet(ClientVarSet),
    /// Client-scoped variable fan-out.
    ClientVarSync(Vec<ClientVarBlock>),
    /// One client's pose upload.
    ClientPose(ClientPose),
    /// Whole-room pose fan-out.
    RoomPose {
        /// Room the snapshot belongs to.
        room_id: String,
        /// Per-client poses in ascending client-number order.
        clients: Vec<(u16, PoseBody)>,
    },
}

impl Message {
    /// The wire type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::RpcBroadcast(_) => MessageType::RpcBroadcast,
            Self::RpcServer(_) => MessageType::RpcServer,
            Self::RpcClient(_) => MessageType::RpcClient,
            Self::DeviceIdMapping(_) => MessageType::DeviceIdMapping,
            Self::GlobalVarSet(_) => MessageType::GlobalVarSet,
            Self::GlobalVarSync(_) => MessageType::GlobalVarSync,
            Self::ClientVarSet(_) => MessageType::ClientVarSet,
            Self::ClientVarSync(_) => MessageType::ClientVarSync,
            Self::ClientPose(_) => MessageType::ClientPose,
            Self::RoomPose { .. } => MessageType::RoomPose,
        }
    }

    /// Decode a full payload, rejecting trailing bytes.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let ty = peek_type(&payload)?;
        payload.advance(1);
        let buf = &mut payload;

        let message = match ty {
            MessageType::RpcBroadcast => Self::RpcBroadcast(decode_rpc(buf)?),
            MessageType::RpcServer => Self::RpcServer(decode_rpc(buf)?),
            MessageType::RpcClient => {
                let sender = wire::get_u16(buf, "rpc sender")?;
                let target = wire::get_u16(buf, "rpc target")?;
                let function = wire::get_str_u8(buf, "rpc function", 1, MAX_FUNCTION_LEN)?;
                let args = wire::get_str_u16(buf, "rpc args", 0, MAX_ARGS_LEN)?;
                Self::RpcClient(RpcTarget { sender, target, function, args })
            },
            MessageType::DeviceIdMapping => {
                let count = wire::get_u16(buf, "mapping count")?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let client_no = wire::get_u16(buf, "mapping client")?;
                    let stealth = wire::get_u8(buf, "mapping stealth")? != 0;
                    let device_id =
                        wire::get_str_u8(buf, "device id", 1, MAX_DEVICE_ID_LEN)?;
                    entries.push(MappingEntry { client_no, stealth, device_id });
                }
                Self::DeviceIdMapping(entries)
            },
            MessageType::GlobalVarSet => {
                let sender = wire::get_u16(buf, "var sender")?;
                let (name, value) = decode_var_pair(buf)?;
                let timestamp = wire::get_f64(buf, "var timestamp")?;
                Self::GlobalVarSet(GlobalVarSet { sender, name, value, timestamp })
            },
            MessageType::GlobalVarSync => Self::GlobalVarSync(decode_sync_entries(buf)?),
            MessageType::ClientVarSet => {
                let sender = wire::get_u16(buf, "var sender")?;
                let target = wire::get_u16(buf, "var target")?;
                let (name, value) = decode_var_pair(buf)?;
                let timestamp = wire::get_f64(buf, "var timestamp")?;
                Self::ClientVarSet(ClientVarSet { sender, target, name, value, timestamp })
            },
            MessageType::ClientVarSync => {
                let count = wire::get_u16(buf, "client count")?;
                let mut clients = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let client_no = wire::get_u16(buf, "client number")?;
                    let entries = decode_sync_entries(buf)?;
                    clients.push(ClientVarBlock { client_no, entries });
                }
                Self::ClientVarSync(clients)
            },
            MessageType::ClientPose => {
                check_version(buf)?;
                let device_id = wire::get_str_u8(buf, "device id", 1, MAX_DEVICE_ID_LEN)?;
                let sequence = wire::get_u32(buf, "pose sequence")?;
                let body = buf.copy_to_bytes(buf.remaining());
                let mut probe = body.clone();
                let pose = PoseBody::decode(&mut probe)?;
                if probe.has_remaining() {
                    return Err(ProtocolError::TrailingBytes(probe.remaining()));
                }
                return Ok(Self::ClientPose(ClientPose {
                    device_id,
                    sequence,
                    stealth: pose.stealth,
                    body,
                }));
            },
            MessageType::RoomPose => {
                check_version(buf)?;
                let room_id = wire::get_str_u8(buf, "room id", 1, MAX_ROOM_ID_LEN)?;
                let count = wire::get_u16(buf, "client count")?;
                let mut clients = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let client_no = wire::get_u16(buf, "client number")?;
                    clients.push((client_no, PoseBody::decode(buf)?));
                }
                Self::RoomPose { room_id, clients }
            },
        };

        if buf.has_remaining() {
            return Err(ProtocolError::TrailingBytes(buf.remaining()));
        }
        Ok(message)
    }

    /// Encode into `dst`, starting with the message-type byte.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.message_type().to_u8());
        match self {
            Self::RpcBroadcast(rpc) | Self::RpcServer(rpc) => encode_rpc(dst, rpc)?,
            Self::RpcClient(rpc) => {
                dst.put_u16_le(rpc.sender);
                dst.put_u16_le(rpc.target);
                wire::put_str_u8(dst, &rpc.function, "rpc function", MAX_FUNCTION_LEN)?;
                wire::put_str_u16(dst, &rpc.args, "rpc args", MAX_ARGS_LEN)?;
            },
            Self::DeviceIdMapping(entries) => {
                dst.put_u16_le(entries.len() as u16);
                for entry in entries {
                    dst.put_u16_le(entry.client_no);
                    dst.put_u8(u8::from(entry.stealth));
                    wire::put_str_u8(dst, &entry.device_id, "device id", MAX_DEVICE_ID_LEN)?;
                }
            },
            Self::GlobalVarSet(set) => {
                dst.put_u16_le(set.sender);
                encode_var_pair(dst, &set.name, &set.value)?;
                dst.put_f64_le(set.timestamp);
            },
            Self::GlobalVarSync(entries) => encode_sync_entries(dst, entries)?,
            Self::ClientVarSet(set) => {
                dst.put_u16_le(set.sender);
                dst.put_u16_le(set.target);
                encode_var_pair(dst, &set.name, &set.value)?;
                dst.put_f64_le(set.timestamp);
            },
            Self::ClientVarSync(clients) => {
                dst.put_u16_le(clients.len() as u16);
                for block in clients {
                    dst.put_u16_le(block.client_no);
                    encode_sync_entries(dst, &block.entries)?;
                }
            },
            Self::ClientPose(pose) => {
                dst.put_u8(PROTOCOL_VERSION);
                check_device_id(&pose.device_id)?;
                wire::put_str_u8(dst, &pose.device_id, "device id", MAX_DEVICE_ID_LEN)?;
                dst.put_u32_le(pose.sequence);
                dst.put_slice(&pose.body);
            },
            Self::RoomPose { room_id, clients } => {
                dst.put_u8(PROTOCOL_VERSION);
                wire::put_str_u8(dst, room_id, "room id", MAX_ROOM_ID_LEN)?;
                dst.put_u16_le(clients.len() as u16);
                for (client_no, body) in clients {
                    dst.put_u16_le(*client_no);
                    body.encode(dst)?;
                }
            },
        }
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Assemble a `RoomPose` payload from cached raw bodies.
///
/// This is the broadcast hot path: each client's body is spliced in verbatim,
/// never re-encoded. Callers supply clients in ascending client-number order.
pub fn encode_room_pose_raw(room_id: &str, clients: &[(u16, Bytes)]) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(
        4 + room_id.len() + clients.iter().map(|(_, b)| b.len() + 2).sum::<usize>(),
    );
    dst.put_u8(MessageType::RoomPose.to_u8());
    dst.put_u8(PROTOCOL_VERSION);
    wire::put_str_u8(&mut dst, room_id, "room id", MAX_ROOM_ID_LEN)?;
    dst.put_u16_le(clients.len() as u16);
    for (client_no, body) in clients {
        dst.put_u16_le(*client_no);
        dst.put_slice(body);
    }
    Ok(dst.freeze())
}

fn check_version(buf: &mut impl Buf) -> Result<()> {
    let version = wire::get_u8(buf, "protocol version")?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(())
}

fn check_device_id(device_id: &str) -> Result<()> {
    if device_id.is_empty() {
        return Err(ProtocolError::EmptyString { field: "device id" });
    }
    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(ProtocolError::StringTooLong {
            field: "device id",
            len: device_id.len(),
            max: MAX_DEVICE_ID_LEN,
        });
    }
    Ok(())
}

fn decode_rpc(buf: &mut impl Buf) -> Result<Rpc> {
    let sender = wire::get_u16(buf, "rpc sender")?;
    let function = wire::get_str_u8(buf, "rpc function", 1, MAX_FUNCTION_LEN)?;
    let args = wire::get_str_u16(buf, "rpc args", 0, MAX_ARGS_LEN)?;
    Ok(Rpc { sender, function, args })
}

fn encode_rpc(dst: &mut BytesMut, rpc: &Rpc) -> Result<()> {
    dst.put_u16_le(rpc.sender);
    wire::put_str_u8(dst, &rpc.function, "rpc function", MAX_FUNCTION_LEN)?;
    wire::put_str_u16(dst, &rpc.args, "rpc args", MAX_ARGS_LEN)?;
    Ok(())
}

fn decode_var_pair(buf: &mut impl Buf) -> Result<(String, String)> {
    let name = wire::get_str_u8(buf, "var name", 1, MAX_VAR_NAME_LEN)?;
    let value = wire::get_str_u16(buf, "var value", 0, MAX_VAR_VALUE_LEN)?;
    Ok((name, value))
}

fn encode_var_pair(dst: &mut BytesMut, name: &str, value: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProtocolError::EmptyString { field: "var name" });
    }
    wire::put_str_u8(dst, name, "var name", MAX_VAR_NAME_LEN)?;
    wire::put_str_u16(dst, value, "var value", MAX_VAR_VALUE_LEN)?;
    Ok(())
}

fn decode_sync_entries(buf: &mut impl Buf) -> Result<Vec<VarSyncEntry>> {
    let count = wire::get_u16(buf, "var count")?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (name, value) = decode_var_pair(buf)?;
        let timestamp = wire::get_f64(buf, "var timestamp")?;
        let writer = wire::get_u16(buf, "var writer")?;
        entries.push(VarSyncEntry { name, value, timestamp, writer });
    }
    Ok(entries)
}

fn encode_sync_entries(dst: &mut BytesMut, entries: &[VarSyncEntry]) -> Result<()> {
    dst.put_u16_le(entries.len() as u16);
    for entry in entries {
        encode_var_pair(dst, &entry.name, &entry.value)?;
        dst.put_f64_le(entry.timestamp);
        dst.put_u16_le(entry.writer);
    }
    Ok(())
}
