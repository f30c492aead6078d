//! Little-endian cursor helpers and the multipart transport unit.
//!
//! Every relay message travels as a two-frame unit: frame 0 is the raw UTF-8
//! room identifier (doubling as the publish topic), frame 1 is the payload.
//! On TCP the unit is encoded as a `u8` frame count followed by, per frame,
//! a `u32` little-endian length and the frame bytes.
//!
//! All reads are bounds-checked before touching the buffer. Length-prefixed
//! strings are validated for UTF-8 and their caps at the read site so callers
//! never see over-cap data.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Hard cap on a single frame's length.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Hard cap on frames per multipart unit.
pub const MAX_FRAMES_PER_UNIT: usize = 8;

/// Frames in an ingress or publish unit: room id + payload.
pub const UNIT_FRAMES: usize = 2;

fn need(buf: &impl Buf, n: usize, field: &'static str) -> Result<()> {
    if buf.remaining() < n {
        return Err(ProtocolError::Truncated { field });
    }
    Ok(())
}

/// Read a `u8`.
pub fn get_u8(buf: &mut impl Buf, field: &'static str) -> Result<u8> {
    need(buf, 1, field)?;
    Ok(buf.get_u8())
}

/// Read a little-endian `u16`.
pub fn get_u16(buf: &mut impl Buf, field: &'static str) -> Result<u16> {
    need(buf, 2, field)?;
    Ok(buf.get_u16_le())
}

/// Read a little-endian `i16`.
pub fn get_i16(buf: &mut impl Buf, field: &'static str) -> Result<i16> {
    need(buf, 2, field)?;
    Ok(buf.get_i16_le())
}

/// Read a little-endian `u32`.
pub fn get_u32(buf: &mut impl Buf, field: &'static str) -> Result<u32> {
    need(buf, 4, field)?;
    Ok(buf.get_u32_le())
}

/// Read a little-endian IEEE-754 `f64`.
pub fn get_f64(buf: &mut impl Buf, field: &'static str) -> Result<f64> {
    need(buf, 8, field)?;
    Ok(buf.get_f64_le())
}

/// Read a little-endian signed 24-bit integer, sign-extended to `i32`.
pub fn get_i24(buf: &mut impl Buf, field: &'static str) -> Result<i32> {
    need(buf, 3, field)?;
    let b0 = buf.get_u8();
    let b1 = buf.get_u8();
    let b2 = buf.get_u8();
    let ext = if b2 & 0x80 != 0 { 0xFF } else { 0x00 };
    Ok(i32::from_le_bytes([b0, b1, b2, ext]))
}

/// Write the low 24 bits of `v` as a little-endian signed 24-bit integer.
///
/// `v` must already be clamped into the i24 range; the top byte is dropped.
pub fn put_i24(dst: &mut impl BufMut, v: i32) {
    let bytes = v.to_le_bytes();
    dst.put_slice(&bytes[..3]);
}

fn get_string(
    buf: &mut impl Buf,
    len: usize,
    field: &'static str,
    min: usize,
    max: usize,
) -> Result<String> {
    if len > max {
        return Err(ProtocolError::StringTooLong { field, len, max });
    }
    if len < min {
        return Err(ProtocolError::EmptyString { field });
    }
    need(buf, len, field)?;
    let raw = buf.copy_to_bytes(len);
    let s = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8 { field })?;
    Ok(s.to_owned())
}

/// Read a `u8`-length-prefixed UTF-8 string with a length cap.
pub fn get_str_u8(
    buf: &mut impl Buf,
    field: &'static str,
    min: usize,
    max: usize,
) -> Result<String> {
    let len = get_u8(buf, field)? as usize;
    get_string(buf, len, field, min, max)
}

/// Read a `u16`-length-prefixed UTF-8 string with a length cap.
pub fn get_str_u16(
    buf: &mut impl Buf,
    field: &'static str,
    min: usize,
    max: usize,
) -> Result<String> {
    let len = get_u16(buf, field)? as usize;
    get_string(buf, len, field, min, max)
}

/// Write a `u8`-length-prefixed string, enforcing the cap.
pub fn put_str_u8(dst: &mut impl BufMut, s: &str, field: &'static str, max: usize) -> Result<()> {
    let len = s.len();
    if len > max {
        return Err(ProtocolError::StringTooLong { field, len, max });
    }
    dst.put_u8(len as u8);
    dst.put_slice(s.as_bytes());
    Ok(())
}

/// Write a `u16`-length-prefixed string, enforcing the cap.
pub fn put_str_u16(dst: &mut impl BufMut, s: &str, field: &'static str, max: usize) -> Result<()> {
    let len = s.len();
    if len > max {
        return Err(ProtocolError::StringTooLong { field, len, max });
    }
    dst.put_u16_le(len as u16);
    dst.put_slice(s.as_bytes());
    Ok(())
}

/// Encode a multipart unit: `u8` frame count, then per frame a `u32`
/// little-endian length and the frame bytes.
///
/// # Errors
///
/// `FrameCount` if more than [`MAX_FRAMES_PER_UNIT`] frames are given,
/// `FrameTooLarge` if any frame exceeds [`MAX_FRAME_LEN`].
pub fn encode_unit(frames: &[&[u8]], dst: &mut BytesMut) -> Result<()> {
    if frames.len() > MAX_FRAMES_PER_UNIT {
        return Err(ProtocolError::FrameCount { expected: MAX_FRAMES_PER_UNIT, got: frames.len() });
    }
    dst.put_u8(frames.len() as u8);
    for frame in frames {
        if frame.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { size: frame.len(), max: MAX_FRAME_LEN });
        }
        dst.put_u32_le(frame.len() as u32);
        dst.put_slice(frame);
    }
    Ok(())
}

/// Decode one multipart unit from a contiguous buffer.
///
/// Frames are zero-copy slices of the input where the underlying buffer
/// allows it.
pub fn decode_unit(buf: &mut Bytes) -> Result<Vec<Bytes>> {
    let count = get_u8(buf, "frame count")? as usize;
    if count > MAX_FRAMES_PER_UNIT {
        return Err(ProtocolError::FrameCount { expected: MAX_FRAMES_PER_UNIT, got: count });
    }
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = get_u32(buf, "frame length")? as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { size: len, max: MAX_FRAME_LEN });
        }
        need(buf, len, "frame body")?;
        frames.push(buf.copy_to_bytes(len));
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i24_round_trips_across_range() {
        let mut buf = BytesMut::new();
        for v in [0, 1, -1, 8_388_607, -8_388_608, 42_000, -42_000] {
            buf.clear();
            put_i24(&mut buf, v);
            let mut rd = buf.clone().freeze();
            assert_eq!(get_i24(&mut rd, "test").unwrap(), v);
        }
    }

    #[test]
    fn string_caps_are_enforced() {
        let mut buf = BytesMut::new();
        assert!(put_str_u8(&mut buf, &"x".repeat(300), "name", 255).is_err());

        let mut wire = BytesMut::new();
        put_str_u8(&mut wire, "abc", "name", 255).unwrap();
        let mut rd = wire.freeze();
        let err = get_str_u8(&mut rd, "name", 1, 2).unwrap_err();
        assert!(matches!(err, ProtocolError::StringTooLong { len: 3, max: 2, .. }));
    }

    #[test]
    fn truncated_reads_fail_cleanly() {
        let mut rd = Bytes::from_static(&[5, b'a', b'b']);
        let err = get_str_u8(&mut rd, "name", 1, 255).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn unit_round_trip() {
        let mut wire = BytesMut::new();
        encode_unit(&[b"room-1", b"\x0bpayload"], &mut wire).unwrap();
        let mut rd = wire.freeze();
        let frames = decode_unit(&mut rd).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"room-1");
        assert_eq!(&frames[1][..], b"\x0bpayload");
        assert!(rd.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut rd = {
            let mut wire = BytesMut::new();
            wire.put_u8(1);
            wire.put_u32_le(u32::MAX);
            wire.freeze()
        };
        assert!(matches!(decode_unit(&mut rd), Err(ProtocolError::FrameTooLarge { .. })));
    }
}
