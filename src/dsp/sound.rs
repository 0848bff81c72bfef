//! Sound pressure level estimation from q15 audio windows.

use crate::dsp::max_abs_q15;

/// Average decibel level of a window, as `20 * mean(log10(|x|))`.
///
/// Taking a logarithm per sample is far too slow on the windows the audio
/// front-end produces, so samples are multiplied together in a `u64`
/// accumulator and the logarithm is taken once per batch. The accumulator is
/// flushed as soon as it crosses a limit chosen from the largest sample in the
/// window, so the next multiplication cannot overflow. Zero samples contribute
/// nothing to the product but still count toward the window length, matching
/// the per-sample formula in the limit.
///
/// The caller applies any microphone-specific scaling and dB offset.
pub fn average_db(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let (max_val, _) = max_abs_q15(samples);
    if max_val == 0 {
        return 0.0;
    }
    let max_bits = f64::from(max_val).log2().round() as u32;
    let limit: u64 = 1u64 << (63 - max_bits.min(62));

    let mut log_sum = 0.0f64;
    let mut product: u64 = 1;
    for &s in samples {
        let a = u64::from(s.unsigned_abs());
        if a == 0 {
            continue;
        }
        product *= a;
        if product >= limit {
            log_sum += (product as f64).log10();
            product = 1;
        }
    }
    if product > 1 {
        log_sum += (product as f64).log10();
    }
    (20.0 * log_sum / samples.len() as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_sample_db(samples: &[i16]) -> f64 {
        let sum: f64 = samples
            .iter()
            .filter(|&&s| s != 0)
            .map(|&s| f64::from(s.unsigned_abs()).log10())
            .sum();
        20.0 * sum / samples.len() as f64
    }

    #[test]
    fn constant_window_matches_closed_form() {
        let samples = [100i16; 512];
        // 20 * log10(100) = 40 dB
        assert!((average_db(&samples) - 40.0).abs() < 1e-3);
    }

    #[test]
    fn batched_log_matches_per_sample_log() {
        // Deterministic pseudo-random q15 window.
        let mut state = 0x2545_f491u32;
        let samples: Vec<i16> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 17) as i16
            })
            .collect();
        let batched = f64::from(average_db(&samples));
        let exact = per_sample_db(&samples);
        assert!((batched - exact).abs() < 1e-3, "{batched} vs {exact}");
    }

    #[test]
    fn zero_samples_dilute_the_average() {
        let samples = [0i16, 0, 100];
        let expected = 20.0 * 100f32.log10() / 3.0;
        assert!((average_db(&samples) - expected).abs() < 1e-3);
    }

    #[test]
    fn silent_window_is_zero() {
        assert_eq!(average_db(&[0; 64]), 0.0);
        assert_eq!(average_db(&[]), 0.0);
    }

    #[test]
    fn full_scale_window_does_not_overflow() {
        let samples = [i16::MIN; 4096];
        // |i16::MIN| = 32768, 20 * log10(32768) ~= 90.309
        let expected = 20.0 * 32768.0f32.log10();
        assert!((average_db(&samples) - expected).abs() < 1e-3);
    }
}
