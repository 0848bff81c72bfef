//! Fixed-point signal processing kernels.
//!
//! The engine stores raw sensor data as 16-bit (`q15`) or 32-bit (`q31`) fixed
//! point, matching what the acquisition front-ends deliver. The kernels in this
//! module operate on those representations directly and only widen to `f32`
//! where a result is inherently fractional (RMS values, dB levels,
//! frequencies). Physical-unit scaling (the feature's `resolution`) is applied
//! by the consumer, not here.

pub mod rms;
pub mod sound;
pub mod spectral;

/// One LSB of a q15 value is `1 / 32768`.
pub const Q15_ONE: f32 = 32768.0;

/// Convert a q15 fixed-point value to `f32`.
#[inline]
pub fn q15_to_f32(value: i16) -> f32 {
    f32::from(value) / Q15_ONE
}

/// Convert an `f32` in `[-1, 1)` to q15, saturating out-of-range input.
#[inline]
pub fn f32_to_q15(value: f32) -> i16 {
    (value * Q15_ONE).round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Largest absolute sample value in a q15 slice, and its index.
///
/// Returns `(0, 0)` for an empty slice.
pub fn max_abs_q15(values: &[i16]) -> (u16, usize) {
    let mut max = 0u16;
    let mut idx = 0usize;
    for (i, &v) in values.iter().enumerate() {
        let a = v.unsigned_abs();
        if a > max {
            max = a;
            idx = i;
        }
    }
    (max, idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q15_round_trip_of_half() {
        let q = f32_to_q15(0.5);
        assert_eq!(q, 16384);
        assert!((q15_to_f32(q) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn f32_to_q15_saturates() {
        assert_eq!(f32_to_q15(2.0), i16::MAX);
        assert_eq!(f32_to_q15(-2.0), i16::MIN);
    }

    #[test]
    fn max_abs_finds_negative_peak() {
        assert_eq!(max_abs_q15(&[3, -7, 5]), (7, 1));
        assert_eq!(max_abs_q15(&[]), (0, 0));
    }
}
