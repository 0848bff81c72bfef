//! Time-domain energy kernels: signal RMS and section sums.

/// Root of the (optionally mean-removed, optionally normalized) squared sum of
/// a q15 window.
///
/// With `normalize` unset this is the square root of the signal energy, so a
/// two-sample window `[3, 4]` yields `5.0`. Mean removal subtracts the integer
/// mean of the window before squaring, which drives a constant window to `0.0`.
pub fn signal_rms(values: &[i16], remove_mean: bool, normalize: bool) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mean: i32 = if remove_mean {
        let sum: i64 = values.iter().map(|&v| i64::from(v)).sum();
        (sum / values.len() as i64) as i32
    } else {
        0
    };
    let mut total = 0.0f32;
    for &v in values {
        let centered = (i32::from(v) - mean) as f32;
        total += centered * centered;
    }
    if normalize {
        total /= values.len() as f32;
    }
    total.sqrt()
}

/// Sum of an `f32` window, with optional averaging or RMS-style aggregation.
///
/// `rms_input` treats the window values as RMS contributions: it returns
/// `sqrt(mean(v^2))`, which is how per-block RMS values combine into a
/// longer-window RMS. `normalize` alone returns the plain average.
pub fn section_sum(values: &[f32], normalize: bool, rms_input: bool) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut total = 0.0f32;
    if rms_input {
        for &v in values {
            total += v * v;
        }
    } else {
        for &v in values {
            total += v;
        }
    }
    if normalize || rms_input {
        total /= values.len() as f32;
    }
    if rms_input {
        total = total.sqrt();
    }
    total
}

/// Element-wise combination across parallel, same-shaped sources.
///
/// `columns` holds one slice per source; all must share the length of `out`.
/// For each element index the source values are summed (or squared and
/// averaged, per the flags) into `out`, e.g. combining per-axis RMS into a
/// total-magnitude signal.
pub fn multi_source_sum(columns: &[&[f32]], normalize: bool, rms_input: bool, out: &mut [f32]) {
    let count = columns.len() as f32;
    for (k, slot) in out.iter_mut().enumerate() {
        let mut total = 0.0f32;
        if rms_input {
            for column in columns {
                total += column[k] * column[k];
            }
        } else {
            for column in columns {
                total += column[k];
            }
        }
        if normalize || rms_input {
            total /= count;
        }
        if rms_input {
            total = total.sqrt();
        }
        *slot = total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_three_four_is_five() {
        assert!((signal_rms(&[3, 4], false, false) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn rms_with_mean_removal_of_constant_window_is_zero() {
        assert_eq!(signal_rms(&[0, 0, 0, 0], true, false), 0.0);
        assert_eq!(signal_rms(&[100, 100, 100, 100], true, false), 0.0);
    }

    #[test]
    fn rms_normalized() {
        // energy 25 over 2 samples -> sqrt(12.5)
        let v = signal_rms(&[3, 4], false, true);
        assert!((v - 12.5f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn rms_of_empty_window_is_zero() {
        assert_eq!(signal_rms(&[], true, true), 0.0);
    }

    #[test]
    fn section_sum_plain_and_averaged() {
        assert!((section_sum(&[1.0, 2.0], false, false) - 3.0).abs() < 1e-6);
        assert!((section_sum(&[1.0, 2.0], true, false) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn section_sum_rms_combination() {
        // Two equal RMS blocks combine to the same RMS.
        let v = section_sum(&[2.0, 2.0], false, true);
        assert!((v - 2.0).abs() < 1e-6);
    }

    #[test]
    fn multi_source_sum_elementwise() {
        let a = [1.0f32, 2.0];
        let b = [3.0f32, 4.0];
        let mut out = [0.0f32; 2];
        multi_source_sum(&[&a, &b], false, false, &mut out);
        assert_eq!(out, [4.0, 6.0]);
    }

    #[test]
    fn multi_source_sum_rms_of_axes() {
        // 3-4-0 triangle across three axes, per element.
        let x = [3.0f32];
        let y = [4.0f32];
        let z = [0.0f32];
        let mut out = [0.0f32; 1];
        multi_source_sum(&[&x, &y, &z], false, true, &mut out);
        // sqrt((9 + 16 + 0) / 3)
        assert!((out[0] - (25.0f32 / 3.0).sqrt()).abs() < 1e-5);
    }
}
