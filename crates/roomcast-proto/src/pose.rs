//! Pose body codec with fixed-point quantization.
//!
//! A pose body is the per-client unit spliced into room broadcasts:
//!
//! ```text
//! flags: u8          bit 0 right hand, bit 1 left hand, bit 2 virtuals,
//!                    bit 3 stealth, bit 4 physical yaw; rest reserved
//! head position      3 x i24 LE, 0.01 m per unit (absolute)
//! head rotation      u32 LE smallest-three
//! physical yaw       i16 LE, 0.1 deg per unit        (flag bit 4)
//! right hand         3 x i16 LE head-relative 0.005 m + u32 (flag bit 0)
//! left hand          same layout                      (flag bit 1)
//! virtuals           u8 count (max 50), then per item (flag bit 2)
//!                    3 x i16 head-relative + u32
//! ```
//!
//! Out-of-range positions clamp to the representable range. A stealth body
//! (flag bit 3) carries zeroed coordinates on the wire and decodes to NaN
//! sentinels; the client stays present but invisible.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    error::{ProtocolError, Result},
    quat::{self, Quaternion},
    wire,
};

/// Maximum virtual transforms per pose.
pub const MAX_VIRTUALS: usize = 50;

const FLAG_RIGHT_HAND: u8 = 1 << 0;
const FLAG_LEFT_HAND: u8 = 1 << 1;
const FLAG_VIRTUALS: u8 = 1 << 2;
const FLAG_STEALTH: u8 = 1 << 3;
const FLAG_PHYSICAL_YAW: u8 = 1 << 4;

/// Largest absolute-position raw value (i24, 0.01 m per unit).
const ABS_RAW_MAX: f64 = 8_388_607.0;
/// Largest head-relative raw value (i16, 0.005 m per unit).
const REL_RAW_MAX: f64 = 32_767.0;
/// Largest yaw raw value (i16, 0.1 deg per unit).
const YAW_RAW_MAX: f64 = 32_767.0;

/// A position in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3 {
    /// X in meters.
    pub x: f32,
    /// Y in meters.
    pub y: f32,
    /// Z in meters.
    pub z: f32,
}

impl Vec3 {
    /// Zero vector.
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    /// Construct from components.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    fn nan() -> Self {
        Self { x: f32::NAN, y: f32::NAN, z: f32::NAN }
    }
}

/// A position plus rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Position in meters. Absolute for the head, head-relative otherwise.
    pub position: Vec3,
    /// Rotation as a unit quaternion (x, y, z, w).
    pub rotation: Quaternion,
}

impl Transform {
    /// Identity transform at the origin.
    pub const IDENTITY: Self =
        Self { position: Vec3::ZERO, rotation: [0.0, 0.0, 0.0, 1.0] };

    fn nan() -> Self {
        Self { position: Vec3::nan(), rotation: [f32::NAN; 4] }
    }
}

/// Logical contents of one client's pose.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseBody {
    /// Present-but-invisible marker. Stealth bodies carry NaN sentinels.
    pub stealth: bool,
    /// Head pose in room space.
    pub head: Transform,
    /// Yaw-only ground reference in degrees, if tracked.
    pub physical_yaw: Option<f32>,
    /// Right hand, head-relative, if tracked.
    pub right_hand: Option<Transform>,
    /// Left hand, head-relative, if tracked.
    pub left_hand: Option<Transform>,
    /// Extra tracked objects, head-relative. At most [`MAX_VIRTUALS`].
    pub virtuals: Vec<Transform>,
}

impl PoseBody {
    /// A minimal visible pose at the origin.
    pub fn identity() -> Self {
        Self {
            stealth: false,
            head: Transform::IDENTITY,
            physical_yaw: None,
            right_hand: None,
            left_hand: None,
            virtuals: Vec::new(),
        }
    }

    /// The invisible sentinel pose: present, but carrying no coordinates.
    pub fn invisible() -> Self {
        Self {
            stealth: true,
            head: Transform::nan(),
            physical_yaw: None,
            right_hand: None,
            left_hand: None,
            virtuals: Vec::new(),
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.right_hand.is_some() {
            flags |= FLAG_RIGHT_HAND;
        }
        if self.left_hand.is_some() {
            flags |= FLAG_LEFT_HAND;
        }
        if !self.virtuals.is_empty() {
            flags |= FLAG_VIRTUALS;
        }
        if self.stealth {
            flags |= FLAG_STEALTH;
        }
        if self.physical_yaw.is_some() {
            flags |= FLAG_PHYSICAL_YAW;
        }
        flags
    }

    /// Encode into `dst`.
    ///
    /// # Errors
    ///
    /// `TooManyVirtuals` if more than [`MAX_VIRTUALS`] virtual transforms
    /// are attached.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if self.virtuals.len() > MAX_VIRTUALS {
            return Err(ProtocolError::TooManyVirtuals(self.virtuals.len().min(255) as u8));
        }

        dst.put_u8(self.flags());
        put_abs_position(dst, self.head.position);
        dst.put_u32_le(quat::compress(self.head.rotation));

        if let Some(yaw) = self.physical_yaw {
            dst.put_i16_le(quant_yaw(yaw));
        }
        if let Some(hand) = self.right_hand {
            put_rel_transform(dst, hand);
        }
        if let Some(hand) = self.left_hand {
            put_rel_transform(dst, hand);
        }
        if !self.virtuals.is_empty() {
            dst.put_u8(self.virtuals.len() as u8);
            for v in &self.virtuals {
                put_rel_transform(dst, *v);
            }
        }
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one pose body, advancing `buf` past it.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let flags = wire::get_u8(buf, "pose flags")?;
        let stealth = flags & FLAG_STEALTH != 0;

        let head = Transform {
            position: get_abs_position(buf)?,
            rotation: quat::decompress(wire::get_u32(buf, "head rotation")?),
        };

        let physical_yaw = if flags & FLAG_PHYSICAL_YAW != 0 {
            Some(dequant_yaw(wire::get_i16(buf, "physical yaw")?))
        } else {
            None
        };

        let right_hand = if flags & FLAG_RIGHT_HAND != 0 {
            Some(get_rel_transform(buf, "right hand")?)
        } else {
            None
        };
        let left_hand = if flags & FLAG_LEFT_HAND != 0 {
            Some(get_rel_transform(buf, "left hand")?)
        } else {
            None
        };

        let virtuals = if flags & FLAG_VIRTUALS != 0 {
            let count = wire::get_u8(buf, "virtual count")?;
            if count as usize > MAX_VIRTUALS {
                return Err(ProtocolError::TooManyVirtuals(count));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(get_rel_transform(buf, "virtual transform")?);
            }
            items
        } else {
            Vec::new()
        };

        let mut body =
            Self { stealth, head, physical_yaw, right_hand, left_hand, virtuals };
        if stealth {
            body.blank_to_sentinels();
        }
        Ok(body)
    }

    /// Replace every coordinate with the NaN sentinel, keeping structure.
    fn blank_to_sentinels(&mut self) {
        self.head = Transform::nan();
        if self.physical_yaw.is_some() {
            self.physical_yaw = Some(f32::NAN);
        }
        if self.right_hand.is_some() {
            self.right_hand = Some(Transform::nan());
        }
        if self.left_hand.is_some() {
            self.left_hand = Some(Transform::nan());
        }
        for v in &mut self.virtuals {
            *v = Transform::nan();
        }
    }
}

fn quant_abs(m: f32) -> i32 {
    let raw = (f64::from(m) * 100.0).round();
    if raw.is_nan() { 0 } else { raw.clamp(-ABS_RAW_MAX, ABS_RAW_MAX) as i32 }
}

fn dequant_abs(raw: i32) -> f32 {
    (f64::from(raw) / 100.0) as f32
}

fn quant_rel(m: f32) -> i16 {
    let raw = (f64::from(m) * 200.0).round();
    if raw.is_nan() { 0 } else { raw.clamp(-REL_RAW_MAX, REL_RAW_MAX) as i16 }
}

fn dequant_rel(raw: i16) -> f32 {
    (f64::from(raw) / 200.0) as f32
}

fn quant_yaw(deg: f32) -> i16 {
    let raw = (f64::from(deg) * 10.0).round();
    if raw.is_nan() { 0 } else { raw.clamp(-YAW_RAW_MAX, YAW_RAW_MAX) as i16 }
}

fn dequant_yaw(raw: i16) -> f32 {
    (f64::from(raw) / 10.0) as f32
}

fn put_abs_position(dst: &mut BytesMut, p: Vec3) {
    wire::put_i24(dst, quant_abs(p.x));
    wire::put_i24(dst, quant_abs(p.y));
    wire::put_i24(dst, quant_abs(p.z));
}

fn get_abs_position(buf: &mut impl Buf) -> Result<Vec3> {
    Ok(Vec3 {
        x: dequant_abs(wire::get_i24(buf, "head position")?),
        y: dequant_abs(wire::get_i24(buf, "head position")?),
        z: dequant_abs(wire::get_i24(buf, "head position")?),
    })
}

fn put_rel_transform(dst: &mut BytesMut, t: Transform) {
    dst.put_i16_le(quant_rel(t.position.x));
    dst.put_i16_le(quant_rel(t.position.y));
    dst.put_i16_le(quant_rel(t.position.z));
    dst.put_u32_le(quat::compress(t.rotation));
}

fn get_rel_transform(buf: &mut impl Buf, field: &'static str) -> Result<Transform> {
    Ok(Transform {
        position: Vec3 {
            x: dequant_rel(wire::get_i16(buf, field)?),
            y: dequant_rel(wire::get_i16(buf, field)?),
            z: dequant_rel(wire::get_i16(buf, field)?),
        },
        rotation: quat::decompress(wire::get_u32(buf, field)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(body: &PoseBody) -> PoseBody {
        let bytes = body.to_bytes().unwrap();
        let mut rd = bytes.clone();
        let decoded = PoseBody::decode(&mut rd).unwrap();
        assert!(!rd.has_remaining(), "decode must consume the whole body");
        decoded
    }

    #[test]
    fn full_pose_survives_quantization() {
        let body = PoseBody {
            stealth: false,
            head: Transform {
                position: Vec3::new(1.23, 4.56, -7.89),
                rotation: [0.0, 0.0, 0.0, 1.0],
            },
            physical_yaw: Some(137.4),
            right_hand: Some(Transform {
                position: Vec3::new(0.25, -0.1, 0.4),
                rotation: [0.0, 0.0, 0.0, 1.0],
            }),
            left_hand: None,
            virtuals: vec![Transform {
                position: Vec3::new(0.1, 0.2, 0.3),
                rotation: [0.0, 0.0, 0.0, 1.0],
            }],
        };

        let decoded = round_trip(&body);
        assert!(!decoded.stealth);
        assert!((decoded.head.position.x - 1.23).abs() < 0.005);
        assert!((decoded.head.position.y - 4.56).abs() < 0.005);
        assert!((decoded.head.position.z + 7.89).abs() < 0.005);
        assert!((decoded.physical_yaw.unwrap() - 137.4).abs() < 0.05);
        let rh = decoded.right_hand.unwrap();
        assert!((rh.position.x - 0.25).abs() < 0.0025);
        assert_eq!(decoded.virtuals.len(), 1);
        assert!((decoded.virtuals[0].position.z - 0.3).abs() < 0.0025);
    }

    #[test]
    fn encoded_bytes_are_stable_across_reencoding() {
        let body = PoseBody {
            stealth: false,
            head: Transform {
                position: Vec3::new(-12.0, 1.7, 300.25),
                rotation: [0.0, 0.0, 0.0, 1.0],
            },
            physical_yaw: Some(-90.0),
            right_hand: None,
            left_hand: Some(Transform::IDENTITY),
            virtuals: Vec::new(),
        };

        let first = body.to_bytes().unwrap();
        let reencoded = round_trip(&body).to_bytes().unwrap();
        assert_eq!(first, reencoded);
    }

    #[test]
    fn out_of_range_positions_clamp() {
        let body = PoseBody {
            head: Transform {
                position: Vec3::new(1.0e9, -1.0e9, 0.0),
                rotation: [0.0, 0.0, 0.0, 1.0],
            },
            ..PoseBody::identity()
        };
        let decoded = round_trip(&body);
        assert!((decoded.head.position.x - 83_886.07).abs() < 0.01);
        assert!((decoded.head.position.y + 83_886.07).abs() < 0.01);
    }

    #[test]
    fn stealth_body_is_zeroed_on_wire_and_nan_in_memory() {
        let bytes = PoseBody::invisible().to_bytes().unwrap();
        // flags byte with only the stealth bit, then zeroed head fields.
        assert_eq!(bytes[0], 0b0000_1000);
        assert!(bytes[1..].iter().all(|b| *b == 0));

        let mut rd = bytes.clone();
        let decoded = PoseBody::decode(&mut rd).unwrap();
        assert!(decoded.stealth);
        assert!(decoded.head.position.x.is_nan());
        assert!(decoded.head.rotation[0].is_nan());

        // Re-encoding the sentinel reproduces the original bytes.
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn virtual_count_cap_is_enforced() {
        let body = PoseBody {
            virtuals: vec![Transform::IDENTITY; MAX_VIRTUALS + 1],
            ..PoseBody::identity()
        };
        assert!(matches!(
            body.to_bytes(),
            Err(ProtocolError::TooManyVirtuals(_))
        ));

        // Fifty exactly is fine.
        let body = PoseBody {
            virtuals: vec![Transform::IDENTITY; MAX_VIRTUALS],
            ..PoseBody::identity()
        };
        let decoded = round_trip(&body);
        assert_eq!(decoded.virtuals.len(), MAX_VIRTUALS);
    }

    #[test]
    fn truncated_body_is_rejected() {
        let bytes = PoseBody::identity().to_bytes().unwrap();
        let mut rd = bytes.slice(..bytes.len() - 2);
        assert!(matches!(
            PoseBody::decode(&mut rd),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
