//! Real-valued spectral transform and frequency-domain integration.
//!
//! The forward transform is computed with `rustfft` in `f32` and immediately
//! quantized back to the q15 coefficient domain (scaled down by the window
//! length, the way fixed-point RFFT routines on the target hardware behave).
//! All downstream spectrum manipulation (amplitudes, band-pass filtering,
//! integration by `1/(j*omega*k)`) stays in q15, which is why every
//! integration pass is preceded by a dynamic-range rescaling factor: dividing
//! 16-bit coefficients by the frequency would otherwise flush most bins to
//! zero.

use log::warn;
use num_complex::Complex;
use rustfft::Fft;

use std::f32::consts::PI;

/// Forward real FFT of a q15 window into interleaved q15 coefficients.
///
/// `coeffs` receives `(re, im)` pairs for bins `0..=n/2`, each scaled down by
/// the window length `n`. `work` is scratch reused across calls; neither output
/// vector reallocates once warmed up to the window size.
pub fn forward_coefficients(
    samples: &[i16],
    fft: &dyn Fft<f32>,
    work: &mut Vec<Complex<f32>>,
    coeffs: &mut Vec<i16>,
) {
    let n = samples.len();
    work.clear();
    work.extend(samples.iter().map(|&s| Complex::new(f32::from(s), 0.0)));
    fft.process(work);
    let scale = n as f32;
    coeffs.clear();
    for bin in work.iter().take(n / 2 + 1) {
        coeffs.push(quantize(bin.re / scale));
        coeffs.push(quantize(bin.im / scale));
    }
}

/// Amplitude (modulus) of each coefficient pair, as q15.
pub fn amplitudes(coeffs: &[i16], out: &mut Vec<i16>) {
    out.clear();
    for pair in coeffs.chunks_exact(2) {
        let re = f32::from(pair[0]);
        let im = f32::from(pair[1]);
        out.push(quantize((re * re + im * im).sqrt()));
    }
}

/// RMS of the signal reconstructed from its amplitude spectrum.
///
/// Positive and negative frequencies are conjugate for a real signal, so every
/// bin above DC counts twice. `remove_dc` drops the 0 Hz component, which is
/// the right thing when judging agitation of a mean-free signal.
pub fn spectrum_rms(amps: &[i16], remove_dc: bool) -> f32 {
    let mut acc: u64 = 0;
    if let Some((&dc, rest)) = amps.split_first() {
        if !remove_dc {
            let dc = i64::from(dc).unsigned_abs();
            acc += dc * dc;
        }
        for &a in rest {
            let a = i64::from(a).unsigned_abs();
            acc += 2 * a * a;
        }
    }
    (acc as f32).sqrt()
}

/// Largest power-of-two factor that keeps the integrated spectrum inside q15.
///
/// Integration divides bin `i` by `i * omega`; the factor is chosen so the largest
/// resulting magnitude lands just under 2^13, preserving headroom without
/// flushing small bins. The DC bin is ignored (integration assumes it is 0).
pub fn rescaling_factor(amps: &[i16], sample_count: usize, sampling_rate: u32) -> u16 {
    let df = sampling_rate as f32 / sample_count as f32;
    let omega = 2.0 * PI * df;
    let mut max_val = 2.0f32;
    for (i, &a) in amps.iter().enumerate().skip(1) {
        let val = f32::from(a) / (i as f32 * omega);
        if val > max_val {
            max_val = val;
        }
    }
    let rescale_bits = (13 - max_val.log2().ceil() as i32).clamp(0, 15);
    1u16 << rescale_bits
}

/// Band-pass filter and integrate an amplitude spectrum in place.
///
/// Bins below `low_cut_hz` (always including DC) and above `high_cut_hz` are
/// zeroed; surviving bins are divided by `i * omega / scaling`, or by its
/// square when `twice` is set, which integrates the underlying signal once or
/// twice in the frequency domain. `scaling` must come from
/// [`rescaling_factor`] and
/// is the caller's responsibility to divide back out of any derived RMS.
pub fn filter_and_integrate(
    amps: &mut [i16],
    sample_count: usize,
    sampling_rate: u32,
    low_cut_hz: u16,
    high_cut_hz: u16,
    scaling: u16,
    twice: bool,
) {
    if sample_count == 0 || sampling_rate == 0 {
        warn!("spectral integration skipped: empty window or zero sampling rate");
        return;
    }
    let df = sampling_rate as f32 / sample_count as f32;
    let nyquist_idx = sample_count / 2;
    // low index clamps to >= 1 so the 1/i integration can never divide by zero
    let low_idx = ((f32::from(low_cut_hz) / df).max(1.0)) as usize;
    let high_idx = ((f32::from(high_cut_hz) / df).min((nyquist_idx + 1) as f32)) as usize;
    let omega = 2.0 * PI * df / f32::from(scaling);

    let len = amps.len();
    for a in amps.iter_mut().take(low_idx.min(len)) {
        *a = 0;
    }
    for a in amps.iter_mut().skip(high_idx) {
        *a = 0;
    }
    if twice {
        let factor = 1.0 / (omega * omega);
        for i in low_idx..high_idx.min(amps.len()) {
            amps[i] = quantize(f32::from(amps[i]) * factor / (i * i) as f32);
        }
    } else {
        for i in low_idx..high_idx.min(amps.len()) {
            amps[i] = quantize(f32::from(amps[i]) / (i as f32 * omega));
        }
    }
}

#[inline]
fn quantize(value: f32) -> i16 {
    value.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustfft::FftPlanner;
    use std::sync::Arc;

    fn sine_window(n: usize, cycles: usize, amplitude: f32) -> Vec<i16> {
        (0..n)
            .map(|i| {
                let phase = 2.0 * PI * cycles as f32 * i as f32 / n as f32;
                (amplitude * phase.sin()).round() as i16
            })
            .collect()
    }

    fn fft(n: usize) -> Arc<dyn Fft<f32>> {
        FftPlanner::new().plan_fft_forward(n)
    }

    #[test]
    fn sine_concentrates_in_one_bin() {
        let n = 64;
        let samples = sine_window(n, 5, 1000.0);
        let mut work = Vec::new();
        let mut coeffs = Vec::new();
        forward_coefficients(&samples, fft(n).as_ref(), &mut work, &mut coeffs);
        let mut amps = Vec::new();
        amplitudes(&coeffs, &mut amps);

        let (peak_idx, &peak) = amps
            .iter()
            .enumerate()
            .max_by_key(|(_, &a)| a)
            .unwrap();
        assert_eq!(peak_idx, 5);
        // amplitude A maps to A/2 in each of the two conjugate bins
        assert!((f32::from(peak) - 500.0).abs() < 5.0);
    }

    #[test]
    fn spectrum_rms_matches_time_domain() {
        let n = 64;
        let samples = sine_window(n, 5, 1000.0);
        let mut work = Vec::new();
        let mut coeffs = Vec::new();
        forward_coefficients(&samples, fft(n).as_ref(), &mut work, &mut coeffs);
        let mut amps = Vec::new();
        amplitudes(&coeffs, &mut amps);

        // Parseval: RMS of a sine of amplitude A is A / sqrt(2)
        let rms = spectrum_rms(&amps, true);
        assert!((rms - 1000.0 / 2.0f32.sqrt()).abs() < 10.0);
    }

    #[test]
    fn integration_divides_peak_by_its_angular_frequency() {
        let n = 64;
        let rate = 640; // df = 10 Hz
        let samples = sine_window(n, 5, 20_000.0);
        let mut work = Vec::new();
        let mut coeffs = Vec::new();
        forward_coefficients(&samples, fft(n).as_ref(), &mut work, &mut coeffs);
        let mut amps = Vec::new();
        amplitudes(&coeffs, &mut amps);
        let before = f32::from(amps[5]);

        let scaling = rescaling_factor(&amps, n, rate);
        filter_and_integrate(&mut amps, n, rate, 10, 200, scaling, false);
        let omega = 2.0 * PI * 10.0; // df = 10 Hz
        let expected = before / (5.0 * omega) * f32::from(scaling);
        assert!((f32::from(amps[5]) - expected).abs() <= 1.0);
    }

    #[test]
    fn band_edges_are_zeroed() {
        let n = 64;
        let rate = 640;
        let mut amps = vec![100i16; n / 2 + 1];
        // low cut 30 Hz (idx 3), high cut 100 Hz (idx 10)
        filter_and_integrate(&mut amps, n, rate, 30, 100, 1, false);
        assert_eq!(amps[0], 0);
        assert_eq!(amps[2], 0);
        assert_ne!(amps[3], 0);
        assert_eq!(amps[10], 0);
        assert_eq!(amps[n / 2], 0);
    }

    #[test]
    fn rescaling_factor_never_zero() {
        let amps = vec![i16::MAX; 33];
        let factor = rescaling_factor(&amps, 64, 64_000);
        assert!(factor >= 1);
        let silent = vec![0i16; 33];
        let factor = rescaling_factor(&silent, 64, 64_000);
        assert!(factor >= 1);
    }
}
