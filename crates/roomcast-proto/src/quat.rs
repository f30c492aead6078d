//! Smallest-three quaternion compression.
//!
//! A unit quaternion's largest-magnitude component is always at least 0.5,
//! and `q` and `-q` describe the same rotation. The encoder negates the
//! quaternion so the largest component is non-negative, then stores only the
//! other three. Layout of the resulting `u32`:
//!
//! ```text
//! bits 30..32   index of the omitted (largest) component
//! bits 20..30   first remaining component, signed 10-bit
//! bits 10..20   second remaining component, signed 10-bit
//! bits  0..10   third remaining component, signed 10-bit
//! ```
//!
//! Each stored component lies in `[-1/sqrt(2), 1/sqrt(2)]` and is scaled by
//! `sqrt(2) * 511` before rounding, giving a worst-case error under 7e-4 per
//! stored component. The omitted component is reconstructed from the
//! unit-length constraint as the non-negative root, which compounds the
//! three stored errors: its error is bounded by the ratio of the stored
//! components' magnitude sum to the omitted magnitude, peaking near 2.1e-3
//! when all four components sit at 0.5. Rotations whose largest component
//! is clearly dominant (at least 0.8 in magnitude) stay within 1e-3 on
//! every component; nothing tighter fits in 32 bits with this layout.
//!
//! Components within one quantization step of each other may re-encode under
//! a different largest index; both encodings decode to the same rotation.

/// Quaternion component order is x, y, z, w.
pub type Quaternion = [f32; 4];

const COMPONENT_BITS: u32 = 10;
const COMPONENT_MASK: u32 = (1 << COMPONENT_BITS) - 1;
const COMPONENT_RANGE: f64 = 511.0;
const SQRT_2: f64 = std::f64::consts::SQRT_2;

fn quantize(v: f32) -> u32 {
    let scaled = (f64::from(v) * SQRT_2 * COMPONENT_RANGE).round();
    let clamped = if scaled.is_nan() { 0.0 } else { scaled.clamp(-512.0, 511.0) };
    (clamped as i32 as u32) & COMPONENT_MASK
}

fn dequantize(bits: u32) -> f32 {
    let raw = (bits & COMPONENT_MASK) as i32;
    let signed = if raw >= 512 { raw - 1024 } else { raw };
    ((f64::from(signed) / COMPONENT_RANGE) / SQRT_2) as f32
}

/// Compress a unit quaternion into 32 bits.
///
/// Non-finite inputs (the stealth sentinel) quantize to zero components,
/// which keeps the encoding deterministic for any input.
pub fn compress(q: Quaternion) -> u32 {
    let mut largest = 0;
    for i in 1..4 {
        if q[i].abs() > q[largest].abs() {
            largest = i;
        }
    }

    let flip = q[largest] < 0.0;
    let mut out = (largest as u32) << 30;
    let mut shift = 20;
    for (i, &c) in q.iter().enumerate() {
        if i == largest {
            continue;
        }
        let v = if flip { -c } else { c };
        out |= quantize(v) << shift;
        shift -= 10;
    }
    out
}

/// Decompress a 32-bit smallest-three encoding into a unit quaternion.
pub fn decompress(packed: u32) -> Quaternion {
    let largest = (packed >> 30) as usize;
    let mut q = [0.0f32; 4];

    let mut shift = 20;
    let mut sum_sq = 0.0f64;
    for (i, slot) in q.iter_mut().enumerate() {
        if i == largest {
            continue;
        }
        let c = dequantize(packed >> shift);
        *slot = c;
        sum_sq += f64::from(c) * f64::from(c);
        shift -= 10;
    }

    q[largest] = (1.0 - sum_sq).max(0.0).sqrt() as f32;
    q
}
