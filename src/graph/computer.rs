//! Stateless transform nodes connecting feature buffers.
//!
//! A [`Computer`] consumes whole sections from its sources and records derived
//! values into its destinations. It keeps no state across runs; the scratch
//! buffers below exist only to avoid reallocating working memory every tick
//! and never carry values from one run into the next.

use log::warn;
use num_complex::Complex;
use rustfft::Fft;
use serde::Deserialize;
use std::sync::Arc;

use crate::dsp::{rms, sound, spectral};
use crate::graph::feature::Feature;
use crate::graph::FeatureId;

fn default_scaling() -> f32 {
    1.0
}

/// Declarative description of a transform, as it appears in configuration.
///
/// The builder turns this into the runtime [`Transform`], planning FFTs and
/// binding buffer indices in the process.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransformKind {
    /// RMS or energy of a q15 window.
    SignalRms {
        /// Subtract the window mean before squaring.
        #[serde(default)]
        remove_mean: bool,
        /// Divide the squared sum by the sample count.
        #[serde(default)]
        normalize: bool,
        /// Multiplier applied to the result.
        #[serde(default = "default_scaling")]
        scaling: f32,
    },
    /// Per-source scalar aggregate, fanned out 1:1 to destinations.
    SectionSum {
        /// Average instead of sum.
        #[serde(default)]
        normalize: bool,
        /// Combine inputs as RMS contributions.
        #[serde(default)]
        rms_input: bool,
    },
    /// Element-wise combination of parallel sources.
    MultiSourceSum {
        /// Average instead of sum.
        #[serde(default)]
        normalize: bool,
        /// Combine inputs as RMS contributions.
        #[serde(default)]
        rms_input: bool,
    },
    /// FFT with reduced bins, main frequency, velocity and displacement RMS.
    Spectral {
        /// High-pass cutoff for integration, in Hz.
        low_cut_hz: u16,
        /// Low-pass cutoff for integration, in Hz.
        high_cut_hz: u16,
        /// Spectrum RMS below which all outputs are zeroed.
        #[serde(default)]
        min_agitation: f32,
    },
    /// Batched-log average dB level.
    SoundLevel {
        /// Multiplier applied to the raw dB value.
        #[serde(default = "default_scaling")]
        scaling: f32,
        /// Additive calibration offset, in dB.
        #[serde(default)]
        offset: f32,
    },
}

/// One consumed input: a feature, the receiver slot this computer holds on
/// it, and how many sections each run consumes.
#[derive(Clone, Copy, Debug)]
pub struct SourceSlot {
    pub(crate) feature: FeatureId,
    pub(crate) slot: usize,
    pub(crate) sections: usize,
}

/// Parameters of the spectral transform.
pub(crate) struct SpectralTransform {
    /// High-pass cutoff for integration, in Hz.
    pub low_cut_hz: u16,
    /// Low-pass cutoff for integration, in Hz.
    pub high_cut_hz: u16,
    /// Spectrum RMS (in physical units) below which the device is considered
    /// still and all outputs are forced to zero.
    pub min_agitation: f32,
    pub fft: Arc<dyn Fft<f32>>,
}

/// The closed set of numeric transforms a computer can run.
pub(crate) enum Transform {
    /// Root of the (optionally mean-removed, normalized) squared sum of a q15
    /// window, times `scaling`.
    SignalRms {
        remove_mean: bool,
        normalize: bool,
        scaling: f32,
    },
    /// Per-source window aggregate; source `i` feeds destination `i`.
    SectionSum { normalize: bool, rms_input: bool },
    /// Element-wise combination of same-shaped sources into one destination.
    MultiSourceSum { normalize: bool, rms_input: bool },
    /// Forward FFT with reduced-bin output, main frequency, and single and
    /// double frequency-domain integration.
    Spectral(SpectralTransform),
    /// Batched-log average dB level of an audio window.
    SoundLevel { scaling: f32, offset: f32 },
}

#[derive(Default)]
struct Scratch {
    q15: Vec<i16>,
    floats: Vec<f32>,
    columns: Vec<f32>,
    work: Vec<Complex<f32>>,
    coeffs: Vec<i16>,
    amps: Vec<i16>,
    peaks: Vec<usize>,
}

/// A transform node wired between feature buffers.
pub struct Computer {
    name: String,
    active: bool,
    sources: Vec<SourceSlot>,
    destinations: Vec<FeatureId>,
    transform: Transform,
    scratch: Scratch,
}

impl Computer {
    pub(crate) fn new(
        name: String,
        sources: Vec<SourceSlot>,
        destinations: Vec<FeatureId>,
        transform: Transform,
    ) -> Self {
        Computer {
            name,
            active: false,
            sources,
            destinations,
            transform,
            scratch: Scratch::default(),
        }
    }

    /// Computer name, unique within a graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the transform runs; inactive computers still drain inputs.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub(crate) fn sources(&self) -> &[SourceSlot] {
        &self.sources
    }

    pub(crate) fn destinations(&self) -> &[FeatureId] {
        &self.destinations
    }

    /// Attempts one run. Returns `false` when inputs or outputs are not
    /// ready, which is ordinary backpressure and resolved on a later tick.
    ///
    /// An inactive computer skips the transform but still acknowledges its
    /// sources, so a disabled branch cannot wedge a buffer that other
    /// consumers depend on.
    pub(crate) fn try_run(&mut self, features: &mut [Feature]) -> bool {
        for s in &self.sources {
            if !features[s.feature.0].is_ready_to_compute(s.slot, s.sections) {
                return false;
            }
        }
        if self.active {
            if !self.destinations_ready(features) {
                return false;
            }
            self.execute(features);
        }
        for s in &self.sources {
            features[s.feature.0].acknowledge(s.slot, s.sections);
        }
        true
    }

    fn window_len(&self, features: &[Feature]) -> usize {
        let s = self.sources[0];
        s.sections * features[s.feature.0].section_size()
    }

    fn destinations_ready(&self, features: &[Feature]) -> bool {
        let per_dest: usize = match self.transform {
            Transform::MultiSourceSum { .. } => self.window_len(features),
            _ => 1,
        };
        for (i, &d) in self.destinations.iter().enumerate() {
            let dest = &features[d.0];
            // the reduced-bin spectral destination takes one full section
            let count = match self.transform {
                Transform::Spectral(_) if i == 0 => dest.section_size(),
                _ => per_dest,
            };
            let sections = count.div_ceil(dest.section_size()).max(1);
            if !dest.is_ready_to_record(sections) {
                return false;
            }
        }
        true
    }

    fn execute(&mut self, features: &mut [Feature]) {
        match &self.transform {
            Transform::SignalRms {
                remove_mean,
                normalize,
                scaling,
            } => {
                let (remove_mean, normalize, scaling) = (*remove_mean, *normalize, *scaling);
                let s = self.sources[0];
                let Some(window) = features[s.feature.0].q15_view(s.slot, s.sections) else {
                    warn!("Computer '{}' expected a q15 source", self.name);
                    return;
                };
                self.scratch.q15.clear();
                self.scratch.q15.extend_from_slice(window);
                let value = rms::signal_rms(&self.scratch.q15, remove_mean, normalize) * scaling;
                features[self.destinations[0].0].add_float(value);
            }
            Transform::SectionSum { normalize, rms_input } => {
                let (normalize, rms_input) = (*normalize, *rms_input);
                for (i, s) in self.sources.iter().enumerate() {
                    let Some(window) = features[s.feature.0].float_view(s.slot, s.sections) else {
                        warn!("Computer '{}' expected a float source", self.name);
                        continue;
                    };
                    self.scratch.floats.clear();
                    self.scratch.floats.extend_from_slice(window);
                    let value = rms::section_sum(&self.scratch.floats, normalize, rms_input);
                    features[self.destinations[i].0].add_float(value);
                }
            }
            Transform::MultiSourceSum { normalize, rms_input } => {
                let (normalize, rms_input) = (*normalize, *rms_input);
                let len = self.window_len(features);
                self.scratch.columns.clear();
                for s in &self.sources {
                    let Some(window) = features[s.feature.0].float_view(s.slot, s.sections) else {
                        warn!("Computer '{}' expected a float source", self.name);
                        return;
                    };
                    self.scratch.columns.extend_from_slice(window);
                }
                let Scratch { columns, floats, .. } = &mut self.scratch;
                let cols: Vec<&[f32]> = columns.chunks_exact(len).collect();
                floats.resize(len, 0.0);
                rms::multi_source_sum(&cols, normalize, rms_input, floats);
                let dest = &mut features[self.destinations[0].0];
                for &v in floats.iter() {
                    dest.add_float(v);
                }
            }
            Transform::SoundLevel { scaling, offset } => {
                let (scaling, offset) = (*scaling, *offset);
                let s = self.sources[0];
                let Some(window) = features[s.feature.0].q15_view(s.slot, s.sections) else {
                    warn!("Computer '{}' expected a q15 source", self.name);
                    return;
                };
                self.scratch.q15.clear();
                self.scratch.q15.extend_from_slice(window);
                let value = sound::average_db(&self.scratch.q15) * scaling + offset;
                features[self.destinations[0].0].add_float(value);
            }
            Transform::Spectral(_) => self.execute_spectral(features),
        }
    }

    /// Spectral destinations, in wiring order: reduced coefficient triples
    /// (q15), main frequency (Hz), single-integration RMS, double-integration
    /// RMS.
    fn execute_spectral(&mut self, features: &mut [Feature]) {
        let s = self.sources[0];
        let source = &features[s.feature.0];
        let rate = source.sampling_rate();
        let resolution = source.resolution();
        let Some(window) = source.q15_view(s.slot, s.sections) else {
            warn!("Computer '{}' expected a q15 source", self.name);
            return;
        };
        self.scratch.q15.clear();
        self.scratch.q15.extend_from_slice(window);
        let n = self.scratch.q15.len();

        let Transform::Spectral(params) = &self.transform else {
            return;
        };
        let Scratch {
            q15,
            work,
            coeffs,
            amps,
            peaks,
            ..
        } = &mut self.scratch;
        spectral::forward_coefficients(q15, params.fft.as_ref(), work, coeffs);
        spectral::amplitudes(coeffs, amps);

        let reduced = self.destinations[0];
        let peak_count = features[reduced.0].section_size() / 3;
        let agitation = spectral::spectrum_rms(amps, true) * resolution;
        if agitation < params.min_agitation {
            // still device: publish zeros so downstream consumers keep moving
            let dest = &mut features[reduced.0];
            for _ in 0..dest.section_size() {
                dest.add_q15(0);
            }
            for &d in &self.destinations[1..] {
                features[d.0].add_float(0.0);
            }
            return;
        }

        // K highest-amplitude bins, as (index, re, im) q15 triples
        peaks.clear();
        for _ in 0..peak_count {
            let mut best: Option<(usize, i16)> = None;
            for (i, &a) in amps.iter().enumerate() {
                if peaks.contains(&i) {
                    continue;
                }
                if best.map_or(true, |(_, b)| a > b) {
                    best = Some((i, a));
                }
            }
            match best {
                Some((i, _)) => peaks.push(i),
                None => break,
            }
        }
        let df = rate as f32 / n as f32;
        let low_idx = ((f32::from(params.low_cut_hz) / df).max(1.0)) as usize;
        let high_idx = ((f32::from(params.high_cut_hz) / df).min((n / 2 + 1) as f32)) as usize;
        let main_freq = amps
            .iter()
            .enumerate()
            .take(high_idx)
            .skip(low_idx)
            .max_by_key(|(_, &a)| a)
            .filter(|(_, &a)| a > 0)
            .map_or(0.0, |(i, _)| i as f32 * df);

        let scaling_1 = spectral::rescaling_factor(amps, n, rate);
        spectral::filter_and_integrate(
            amps,
            n,
            rate,
            params.low_cut_hz,
            params.high_cut_hz,
            scaling_1,
            false,
        );
        let velocity =
            spectral::spectrum_rms(amps, true) * resolution * 1000.0 / f32::from(scaling_1);

        let scaling_2 = spectral::rescaling_factor(amps, n, rate);
        spectral::filter_and_integrate(
            amps,
            n,
            rate,
            params.low_cut_hz,
            params.high_cut_hz,
            scaling_2,
            false,
        );
        let displacement = spectral::spectrum_rms(amps, true) * resolution * 1_000_000.0
            / (f32::from(scaling_1) * f32::from(scaling_2));

        let dest = &mut features[reduced.0];
        for &i in peaks.iter() {
            dest.add_q15(i as i16);
            dest.add_q15(coeffs[2 * i]);
            dest.add_q15(coeffs[2 * i + 1]);
        }
        // pad the section when fewer peaks than slots exist
        for _ in peaks.len() * 3..dest.section_size() {
            dest.add_q15(0);
        }
        features[self.destinations[1].0].add_float(main_freq);
        features[self.destinations[2].0].add_float(velocity);
        features[self.destinations[3].0].add_float(displacement);
    }
}
