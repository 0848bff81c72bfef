//! Ring-buffered feature values and the section publication protocol.
//!
//! A [`Feature`] owns a fixed backing array split into equal sections. The
//! recording side fills the current section one value at a time; closing a
//! section publishes it to every registered receiver at once. Each receiver
//! reads through its own cursor and acknowledges independently, and a section
//! becomes writable again only when every receiver has acknowledged it. The
//! `locked` flag overlays this cycle to guard streaming snapshots: a locked
//! section can be neither recorded into nor unpublished.
//!
//! All of this is plain state manipulation. Nothing here blocks, allocates
//! after construction, or returns runtime errors; misconfiguration is caught
//! when the graph is built.

use log::{debug, warn};
use serde::Deserialize;

use crate::graph::ComputerId;

/// Upper bound on sections per feature buffer.
pub const MAX_SECTION_COUNT: usize = 8;

/// Upper bound on registered receivers (consuming computers) per feature.
pub const MAX_RECEIVER_COUNT: usize = 5;

/// Value representation of a feature buffer, fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueKind {
    /// 16-bit fixed point, as delivered by accelerometer and audio front-ends.
    Q15,
    /// 32-bit fixed point.
    Q31,
    /// IEEE single precision, used for derived scalar metrics.
    Float,
}

/// One raw value entering a feature buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sample {
    /// 16-bit fixed point sample.
    Q15(i16),
    /// 32-bit fixed point sample.
    Q31(i32),
    /// Floating point sample.
    Float(f32),
}

/// Discrete severity classification derived from a feature's thresholds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationState {
    /// Below the normal threshold, or classification disabled.
    #[default]
    Idle,
    /// Above the normal threshold.
    Normal,
    /// Above the warning threshold.
    Warning,
    /// Above the danger threshold.
    Danger,
}

enum SampleStore {
    Q15(Vec<i16>),
    Q31(Vec<i32>),
    Float(Vec<f32>),
}

impl SampleStore {
    fn new(kind: ValueKind, capacity: usize) -> Self {
        match kind {
            ValueKind::Q15 => SampleStore::Q15(vec![0; capacity]),
            ValueKind::Q31 => SampleStore::Q31(vec![0; capacity]),
            ValueKind::Float => SampleStore::Float(vec![0.0; capacity]),
        }
    }

    fn kind(&self) -> ValueKind {
        match self {
            SampleStore::Q15(_) => ValueKind::Q15,
            SampleStore::Q31(_) => ValueKind::Q31,
            SampleStore::Float(_) => ValueKind::Float,
        }
    }

    fn zero(&mut self) {
        match self {
            SampleStore::Q15(buf) => buf.fill(0),
            SampleStore::Q31(buf) => buf.fill(0),
            SampleStore::Float(buf) => buf.fill(0.0),
        }
    }

    fn value_as_f32(&self, index: usize) -> f32 {
        match self {
            SampleStore::Q15(buf) => f32::from(buf[index]),
            SampleStore::Q31(buf) => buf[index] as f32,
            SampleStore::Float(buf) => buf[index],
        }
    }
}

/// A fixed-capacity, section-published ring buffer of sensor or derived
/// values.
pub struct Feature {
    name: String,
    section_count: usize,
    section_size: usize,
    store: SampleStore,
    fill_index: usize,
    record_section: usize,
    published: [bool; MAX_SECTION_COUNT],
    locked: [bool; MAX_SECTION_COUNT],
    acknowledged: [[bool; MAX_RECEIVER_COUNT]; MAX_SECTION_COUNT],
    compute_cursor: [usize; MAX_RECEIVER_COUNT],
    receivers: Vec<ComputerId>,
    producer: Option<ComputerId>,
    sampling_rate: u32,
    resolution: f32,
    active: bool,
    streaming_enabled: bool,
    filled_once: bool,
    thresholds: Option<[f32; 3]>,
    operation_state: OperationState,
}

impl Feature {
    pub(crate) fn new(
        name: String,
        kind: ValueKind,
        section_count: usize,
        section_size: usize,
        sampling_rate: u32,
        resolution: f32,
    ) -> Self {
        Feature {
            name,
            section_count,
            section_size,
            store: SampleStore::new(kind, section_count * section_size),
            fill_index: 0,
            record_section: 0,
            published: [false; MAX_SECTION_COUNT],
            locked: [false; MAX_SECTION_COUNT],
            acknowledged: [[false; MAX_RECEIVER_COUNT]; MAX_SECTION_COUNT],
            compute_cursor: [0; MAX_RECEIVER_COUNT],
            receivers: Vec::new(),
            producer: None,
            sampling_rate,
            resolution,
            active: false,
            streaming_enabled: false,
            filled_once: false,
            thresholds: None,
            operation_state: OperationState::Idle,
        }
    }

    /// Feature name, unique within a graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value representation of the backing store.
    pub fn kind(&self) -> ValueKind {
        self.store.kind()
    }

    /// Number of sections in the ring.
    pub fn section_count(&self) -> usize {
        self.section_count
    }

    /// Samples per section.
    pub fn section_size(&self) -> usize {
        self.section_size
    }

    /// Sampling rate of the recorded values, in Hz.
    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    /// Physical-unit scaling factor applied when values leave the engine.
    pub fn resolution(&self) -> f32 {
        self.resolution
    }

    pub(crate) fn set_metadata(&mut self, sampling_rate: u32, resolution: f32) {
        self.sampling_rate = sampling_rate;
        self.resolution = resolution;
    }

    /// Whether the feature currently participates in the graph.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Whether a streaming group currently requires this feature.
    pub fn is_streaming(&self) -> bool {
        self.streaming_enabled
    }

    pub(crate) fn set_streaming(&mut self, streaming: bool) {
        self.streaming_enabled = streaming;
    }

    /// True once every section has been published at least once.
    pub fn filled_once(&self) -> bool {
        self.filled_once
    }

    /// Latest classification, `Idle` when thresholds are unset.
    pub fn operation_state(&self) -> OperationState {
        self.operation_state
    }

    /// Whether threshold classification runs on publish.
    pub fn classifies(&self) -> bool {
        self.thresholds.is_some()
    }

    pub(crate) fn set_thresholds(&mut self, normal: f32, warning: f32, danger: f32) {
        self.thresholds = Some([normal, warning, danger]);
    }

    pub(crate) fn producer(&self) -> Option<ComputerId> {
        self.producer
    }

    pub(crate) fn set_producer(&mut self, computer: ComputerId) -> bool {
        if self.producer.is_some() {
            return false;
        }
        self.producer = Some(computer);
        true
    }

    pub(crate) fn receivers(&self) -> &[ComputerId] {
        &self.receivers
    }

    /// Registers a consuming computer and returns its receiver slot, or
    /// `None` when all slots are taken.
    pub(crate) fn add_receiver(&mut self, computer: ComputerId) -> Option<usize> {
        if self.receivers.len() >= MAX_RECEIVER_COUNT {
            return None;
        }
        self.receivers.push(computer);
        Some(self.receivers.len() - 1)
    }

    /// Writes one value at the fill index and advances it; closing out the
    /// current section publishes it.
    ///
    /// Recording never fails. Callers that must not overwrite unconsumed data
    /// gate on [`Feature::is_ready_to_record`] first; a kind mismatch is a
    /// wiring defect that the builder rejects, so here it is only logged.
    pub fn add_value(&mut self, sample: Sample) {
        match (&mut self.store, sample) {
            (SampleStore::Q15(buf), Sample::Q15(v)) => buf[self.fill_index] = v,
            (SampleStore::Q31(buf), Sample::Q31(v)) => buf[self.fill_index] = v,
            (SampleStore::Float(buf), Sample::Float(v)) => buf[self.fill_index] = v,
            _ => {
                warn!(
                    "Feature '{}' dropped a {:?} sample (stores {:?})",
                    self.name,
                    sample,
                    self.store.kind()
                );
                return;
            }
        }
        self.fill_index = (self.fill_index + 1) % (self.section_count * self.section_size);
        if self.fill_index % self.section_size == 0 {
            self.publish_current();
        }
    }

    /// Convenience for floating point destinations.
    pub fn add_float(&mut self, value: f32) {
        self.add_value(Sample::Float(value));
    }

    /// Convenience for q15 destinations.
    pub fn add_q15(&mut self, value: i16) {
        self.add_value(Sample::Q15(value));
    }

    fn publish_current(&mut self) {
        let s = self.record_section;
        self.published[s] = true;
        self.acknowledged[s] = [false; MAX_RECEIVER_COUNT];
        if self.thresholds.is_some() {
            self.classify(s);
        }
        self.record_section = (s + 1) % self.section_count;
        if self.record_section == 0 {
            self.filled_once = true;
        }
        debug!("Feature '{}' published section {}", self.name, s);
    }

    fn classify(&mut self, section: usize) {
        let Some([normal, warning, danger]) = self.thresholds else {
            return;
        };
        let start = section * self.section_size;
        let mut sum = 0.0f32;
        for i in start..start + self.section_size {
            sum += self.store.value_as_f32(i);
        }
        let value = sum / self.section_size as f32 * self.resolution;
        let state = if value > danger {
            OperationState::Danger
        } else if value > warning {
            OperationState::Warning
        } else if value > normal {
            OperationState::Normal
        } else {
            OperationState::Idle
        };
        if state != self.operation_state {
            debug!(
                "Feature '{}' operation state {:?} -> {:?} (value {:.3})",
                self.name, self.operation_state, state, value
            );
        }
        self.operation_state = state;
    }

    /// True iff the next `n` sections starting at the record section can be
    /// recorded into without overwriting unconsumed or snapshotted data.
    ///
    /// A published section that every receiver has acknowledged counts as
    /// writable; with no receivers registered this is vacuously true, so a
    /// buffer consumed only by streaming never wedges.
    pub fn is_ready_to_record(&self, n: usize) -> bool {
        for k in 0..n {
            let s = (self.record_section + k) % self.section_count;
            if self.locked[s] {
                return false;
            }
            if self.published[s] && !self.all_acknowledged(s) {
                return false;
            }
        }
        true
    }

    /// True iff the next `n` sections at `slot`'s cursor are published,
    /// unlocked, and not yet acknowledged by `slot`.
    pub fn is_ready_to_compute(&self, slot: usize, n: usize) -> bool {
        for k in 0..n {
            let s = (self.compute_cursor[slot] + k) % self.section_count;
            if self.locked[s] || !self.published[s] || self.acknowledged[s][slot] {
                return false;
            }
        }
        true
    }

    fn view_range(&self, slot: usize, n: usize) -> std::ops::Range<usize> {
        // Sections consumed per run divide the ring, so a view never wraps.
        let start = self.compute_cursor[slot] * self.section_size;
        start..start + n * self.section_size
    }

    /// Read-only q15 view of the next `n` sections for `slot`, without
    /// advancing the cursor. `None` when the store holds another kind.
    pub fn q15_view(&self, slot: usize, n: usize) -> Option<&[i16]> {
        match &self.store {
            SampleStore::Q15(buf) => Some(&buf[self.view_range(slot, n)]),
            _ => None,
        }
    }

    /// Read-only q31 view of the next `n` sections for `slot`.
    pub fn q31_view(&self, slot: usize, n: usize) -> Option<&[i32]> {
        match &self.store {
            SampleStore::Q31(buf) => Some(&buf[self.view_range(slot, n)]),
            _ => None,
        }
    }

    /// Read-only floating point view of the next `n` sections for `slot`.
    pub fn float_view(&self, slot: usize, n: usize) -> Option<&[f32]> {
        match &self.store {
            SampleStore::Float(buf) => Some(&buf[self.view_range(slot, n)]),
            _ => None,
        }
    }

    /// Marks the next `n` sections as consumed by `slot` and advances its
    /// cursor. A fully acknowledged, unlocked section becomes writable again.
    pub fn acknowledge(&mut self, slot: usize, n: usize) {
        for _ in 0..n {
            let s = self.compute_cursor[slot];
            self.acknowledged[s][slot] = true;
            self.refresh_published(s);
            self.compute_cursor[slot] = (s + 1) % self.section_count;
        }
    }

    fn all_acknowledged(&self, section: usize) -> bool {
        (0..self.receivers.len()).all(|r| self.acknowledged[section][r])
    }

    fn refresh_published(&mut self, section: usize) {
        if self.locked[section] {
            return;
        }
        if self.published[section] && self.all_acknowledged(section) {
            self.published[section] = false;
        }
    }

    /// Copies the most recently completed section into `out`, scaled to
    /// physical units.
    ///
    /// Streaming is a side read: it takes the last fully recorded section
    /// whether or not every computer has consumed it, holding the section
    /// lock for the duration of the copy so recording cannot tear the
    /// snapshot.
    pub fn stream(&mut self, out: &mut Vec<f32>) {
        let s = (self.record_section + self.section_count - 1) % self.section_count;
        self.locked[s] = true;
        let start = s * self.section_size;
        for i in start..start + self.section_size {
            out.push(self.store.value_as_f32(i) * self.resolution);
        }
        self.locked[s] = false;
        // Acknowledgements received while locked could not unpublish.
        self.refresh_published(s);
    }

    /// Clears indices, flags, and stored values without reallocating.
    pub fn reset(&mut self) {
        self.fill_index = 0;
        self.record_section = 0;
        self.published = [false; MAX_SECTION_COUNT];
        self.locked = [false; MAX_SECTION_COUNT];
        self.acknowledged = [[false; MAX_RECEIVER_COUNT]; MAX_SECTION_COUNT];
        self.compute_cursor = [0; MAX_RECEIVER_COUNT];
        self.filled_once = false;
        self.operation_state = OperationState::Idle;
        self.store.zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q15_feature(sections: usize, size: usize) -> Feature {
        Feature::new("accel-x".into(), ValueKind::Q15, sections, size, 3200, 1.0)
    }

    #[test]
    fn section_publishes_when_filled() {
        let mut f = q15_feature(2, 2);
        f.add_receiver(ComputerId(0));
        f.add_value(Sample::Q15(1));
        assert!(!f.is_ready_to_compute(0, 1));
        f.add_value(Sample::Q15(2));
        assert!(f.is_ready_to_compute(0, 1));
        assert_eq!(f.q15_view(0, 1), Some(&[1i16, 2][..]));
    }

    #[test]
    fn published_section_blocks_recording_until_all_ack() {
        let mut f = q15_feature(2, 1);
        f.add_receiver(ComputerId(0));
        f.add_receiver(ComputerId(1));
        f.add_value(Sample::Q15(7));
        f.add_value(Sample::Q15(8));
        // both sections published, ring is full
        assert!(!f.is_ready_to_record(1));
        f.acknowledge(0, 1);
        assert!(!f.is_ready_to_record(1));
        f.acknowledge(1, 1);
        assert!(f.is_ready_to_record(1));
    }

    #[test]
    fn consumers_have_independent_cursors() {
        let mut f = q15_feature(2, 1);
        f.add_receiver(ComputerId(0));
        f.add_receiver(ComputerId(1));
        f.add_value(Sample::Q15(7));
        f.acknowledge(0, 1);
        assert!(!f.is_ready_to_compute(0, 1));
        assert!(f.is_ready_to_compute(1, 1));
        assert_eq!(f.q15_view(1, 1), Some(&[7i16][..]));
    }

    #[test]
    fn no_double_consumption_before_republish() {
        let mut f = q15_feature(2, 1);
        f.add_receiver(ComputerId(0));
        f.add_value(Sample::Q15(7));
        assert!(f.is_ready_to_compute(0, 1));
        f.acknowledge(0, 1);
        // cursor moved on; section 0 is not offered again until republished
        f.add_value(Sample::Q15(8));
        f.acknowledge(0, 1);
        assert!(!f.is_ready_to_compute(0, 1));
        f.add_value(Sample::Q15(9));
        assert!(f.is_ready_to_compute(0, 1));
        assert_eq!(f.q15_view(0, 1), Some(&[9i16][..]));
    }

    #[test]
    fn readiness_is_monotonic_until_the_next_event() {
        let mut f = q15_feature(2, 2);
        f.add_receiver(ComputerId(0));
        assert!(!f.is_ready_to_compute(0, 1));
        f.add_value(Sample::Q15(1));
        assert!(!f.is_ready_to_compute(0, 1));
        f.add_value(Sample::Q15(2));
        assert!(f.is_ready_to_compute(0, 1));
        assert!(f.is_ready_to_compute(0, 1));
        f.acknowledge(0, 1);
        assert!(!f.is_ready_to_compute(0, 1));
    }

    #[test]
    fn stream_takes_latest_complete_section_scaled() {
        let mut f = Feature::new("vel".into(), ValueKind::Float, 2, 2, 10, 2.0);
        f.add_float(1.0);
        f.add_float(2.0);
        f.add_float(3.0);
        let mut out = Vec::new();
        f.stream(&mut out);
        assert_eq!(out, vec![2.0, 4.0]);
    }

    #[test]
    fn stream_during_lock_defers_unpublish() {
        let mut f = q15_feature(2, 1);
        f.add_receiver(ComputerId(0));
        f.add_value(Sample::Q15(5));
        // ack then stream: the side read must leave the protocol consistent
        f.acknowledge(0, 1);
        let mut out = Vec::new();
        f.stream(&mut out);
        assert_eq!(out, vec![5.0]);
        assert!(f.is_ready_to_record(2));
    }

    #[test]
    fn filled_once_after_a_full_ring_cycle() {
        let mut f = q15_feature(2, 1);
        f.add_value(Sample::Q15(1));
        assert!(!f.filled_once());
        f.add_value(Sample::Q15(2));
        assert!(f.filled_once());
    }

    #[test]
    fn q31_buffers_record_and_view() {
        let mut f = Feature::new("baro".into(), ValueKind::Q31, 2, 2, 25, 1.0);
        f.add_receiver(ComputerId(0));
        f.add_value(Sample::Q31(100_000));
        f.add_value(Sample::Q31(-100_000));
        assert_eq!(f.q31_view(0, 1), Some(&[100_000i32, -100_000][..]));
        assert_eq!(f.q15_view(0, 1), None);
    }

    #[test]
    fn thresholds_classify_on_publish() {
        let mut f = Feature::new("rms".into(), ValueKind::Float, 2, 1, 10, 1.0);
        f.set_thresholds(1.0, 2.0, 3.0);
        f.add_float(0.5);
        assert_eq!(f.operation_state(), OperationState::Idle);
        f.add_float(1.5);
        assert_eq!(f.operation_state(), OperationState::Normal);
        f.add_float(2.5);
        assert_eq!(f.operation_state(), OperationState::Warning);
        f.add_float(9.0);
        assert_eq!(f.operation_state(), OperationState::Danger);
    }

    #[test]
    fn receiver_slots_are_bounded() {
        let mut f = q15_feature(2, 1);
        for i in 0..MAX_RECEIVER_COUNT {
            assert!(f.add_receiver(ComputerId(i)).is_some());
        }
        assert!(f.add_receiver(ComputerId(99)).is_none());
    }

    #[test]
    fn mismatched_sample_kind_is_dropped() {
        let mut f = q15_feature(2, 1);
        f.add_receiver(ComputerId(0));
        f.add_value(Sample::Float(1.0));
        assert!(!f.is_ready_to_compute(0, 1));
    }

    #[test]
    fn reset_clears_state_without_losing_wiring() {
        let mut f = q15_feature(2, 1);
        f.add_receiver(ComputerId(0));
        f.add_value(Sample::Q15(1));
        f.add_value(Sample::Q15(2));
        f.reset();
        assert!(!f.filled_once());
        assert!(f.is_ready_to_record(2));
        assert!(!f.is_ready_to_compute(0, 1));
        assert_eq!(f.receivers().len(), 1);
    }
}
