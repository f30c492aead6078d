//! Wire codec for the roomcast relay protocol.
//!
//! Every unit on the wire is a two-frame pair: frame 0 is the raw UTF-8 room
//! identifier (also the publish topic), frame 1 is a payload whose first byte
//! selects the message type. Pose traffic additionally carries a protocol
//! version byte, currently version 3.
//!
//! The crate is transport-agnostic: [`wire`] provides the multipart framing
//! used over TCP, [`message`] the payload codecs, [`pose`] the quantized pose
//! body, and [`quat`] the smallest-three rotation compression. Decoding never
//! panics on hostile input; every failure is a typed [`ProtocolError`].

mod error;
pub mod message;
pub mod pose;
pub mod quat;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use message::{
    ClientPose, ClientVarBlock, ClientVarSet, GlobalVarSet, MappingEntry, Message, MessageType,
    Rpc, RpcTarget, VarSyncEntry, encode_room_pose_raw, peek_type,
};
pub use pose::{PoseBody, Transform, Vec3};
pub use quat::Quaternion;

/// Protocol version carried by pose traffic.
pub const PROTOCOL_VERSION: u8 = 3;
