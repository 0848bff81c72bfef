//! The computation graph: arena-owned buffers and computers plus the driver.
//!
//! All features, computers, and streaming groups are owned by one [`Graph`]
//! and referenced by stable indices, never by pointers between nodes. The
//! graph is wired once through [`GraphBuilder`], which front-loads every
//! structural check; after [`GraphBuilder::build`] succeeds the tick path
//! cannot fail, only backpressure.

pub mod computer;
pub mod feature;
pub mod streaming;

use std::collections::HashMap;

use log::{debug, warn};
use rustfft::FftPlanner;

use crate::error::{EngineError, Result};
use crate::graph::computer::{Computer, SourceSlot, SpectralTransform, Transform, TransformKind};
use crate::graph::feature::{
    Feature, OperationState, Sample, ValueKind, MAX_SECTION_COUNT,
};
use crate::graph::streaming::{StreamSink, StreamingGroup, MAX_GROUP_SIZE};

/// Stable index of a feature buffer within its graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FeatureId(pub(crate) usize);

/// Stable index of a computer within its graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComputerId(pub(crate) usize);

/// A sensor driver feeding raw samples into one feature buffer.
///
/// Sources run on their own cadence; the driver polls them once per tick and
/// records whatever arrived in the meantime.
pub trait SampleSource {
    /// Appends the samples that arrived since the last call to `out`.
    fn acquire(&mut self, out: &mut Vec<Sample>);
}

/// Constructs a [`Graph`], validating the topology as it is declared.
///
/// Every structural defect (unknown names, kind mismatches, section math
/// that does not divide, exhausted receiver slots) is reported here, so the
/// running graph never has to.
pub struct GraphBuilder {
    features: Vec<Feature>,
    computers: Vec<Computer>,
    groups: Vec<StreamingGroup>,
    feature_names: HashMap<String, FeatureId>,
    group_names: HashMap<String, usize>,
    planner: FftPlanner<f32>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        GraphBuilder {
            features: Vec::new(),
            computers: Vec::new(),
            groups: Vec::new(),
            feature_names: HashMap::new(),
            group_names: HashMap::new(),
            planner: FftPlanner::new(),
        }
    }

    /// Declares a feature buffer.
    pub fn add_feature(
        &mut self,
        name: &str,
        kind: ValueKind,
        section_count: usize,
        section_size: usize,
        sampling_rate: u32,
        resolution: f32,
    ) -> Result<FeatureId> {
        if self.feature_names.contains_key(name) {
            return Err(EngineError::DuplicateFeature(name.to_owned()));
        }
        if section_count == 0 || section_count > MAX_SECTION_COUNT {
            return Err(EngineError::invalid(
                name,
                format!("section_count must be in 1..={MAX_SECTION_COUNT}"),
            ));
        }
        if section_size == 0 {
            return Err(EngineError::invalid(name, "section_size must be at least 1"));
        }
        let id = FeatureId(self.features.len());
        self.features.push(Feature::new(
            name.to_owned(),
            kind,
            section_count,
            section_size,
            sampling_rate,
            resolution,
        ));
        self.feature_names.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Declares a computer consuming `sources` (feature name plus sections
    /// consumed per run) into `destinations`.
    ///
    /// Declaration order is execution order; declaring computers sources
    /// before dependents minimizes per-tick latency but is not required for
    /// correctness.
    pub fn add_computer(
        &mut self,
        name: &str,
        kind: TransformKind,
        sources: &[(&str, usize)],
        destinations: &[&str],
    ) -> Result<ComputerId> {
        let id = ComputerId(self.computers.len());
        let mut slots = Vec::with_capacity(sources.len());
        for &(source_name, sections) in sources {
            let fid = self.feature_id(source_name)?;
            let feature = &self.features[fid.0];
            if sections == 0 || feature.section_count() % sections != 0 {
                return Err(EngineError::SectionCountMismatch {
                    computer: name.to_owned(),
                    feature: source_name.to_owned(),
                    sections,
                    section_count: feature.section_count(),
                });
            }
            slots.push((fid, sections));
        }
        let mut dest_ids = Vec::with_capacity(destinations.len());
        for &dest_name in destinations {
            dest_ids.push(self.feature_id(dest_name)?);
        }
        self.check_shape(name, &kind, &slots, &dest_ids)?;

        // Wiring is committed only after every check passed.
        let mut bound = Vec::with_capacity(slots.len());
        for &(fid, sections) in &slots {
            let slot = self.features[fid.0].add_receiver(id).ok_or_else(|| {
                EngineError::ReceiverOverflow {
                    feature: self.features[fid.0].name().to_owned(),
                    max: feature::MAX_RECEIVER_COUNT,
                }
            })?;
            bound.push(SourceSlot {
                feature: fid,
                slot,
                sections,
            });
        }
        for &d in &dest_ids {
            if !self.features[d.0].set_producer(id) {
                return Err(EngineError::ProducerConflict {
                    feature: self.features[d.0].name().to_owned(),
                });
            }
        }
        self.propagate_metadata(&kind, &slots, &dest_ids);

        let transform = self.bind_transform(&kind, &slots);
        self.computers
            .push(Computer::new(name.to_owned(), bound, dest_ids, transform));
        Ok(id)
    }

    /// Declares a streaming group over existing features.
    pub fn add_group(&mut self, name: &str, members: &[&str], send_period_ms: u32) -> Result<()> {
        if self.group_names.contains_key(name) {
            return Err(EngineError::invalid(name, "group is declared more than once"));
        }
        if members.len() > MAX_GROUP_SIZE {
            return Err(EngineError::GroupOverflow {
                group: name.to_owned(),
                max: MAX_GROUP_SIZE,
            });
        }
        let mut ids = Vec::with_capacity(members.len());
        for &m in members {
            ids.push(self.feature_id(m)?);
        }
        self.group_names.insert(name.to_owned(), self.groups.len());
        self.groups
            .push(StreamingGroup::new(name.to_owned(), ids, send_period_ms));
        Ok(())
    }

    /// Finalizes the topology.
    pub fn build(self) -> Graph {
        debug!(
            "Graph built: {} features, {} computers, {} streaming groups",
            self.features.len(),
            self.computers.len(),
            self.groups.len()
        );
        Graph {
            features: self.features,
            computers: self.computers,
            groups: self.groups,
            feature_names: self.feature_names,
            group_names: self.group_names,
            sources: Vec::new(),
            sample_scratch: Vec::new(),
        }
    }

    fn feature_id(&self, name: &str) -> Result<FeatureId> {
        self.feature_names
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownFeature(name.to_owned()))
    }

    fn expect_kind(&self, id: FeatureId, expected: ValueKind) -> Result<()> {
        let feature = &self.features[id.0];
        if feature.kind() != expected {
            return Err(EngineError::KindMismatch {
                feature: feature.name().to_owned(),
                expected,
                actual: feature.kind(),
            });
        }
        Ok(())
    }

    fn window_len(&self, slot: (FeatureId, usize)) -> usize {
        slot.1 * self.features[slot.0 .0].section_size()
    }

    fn check_shape(
        &self,
        name: &str,
        kind: &TransformKind,
        sources: &[(FeatureId, usize)],
        destinations: &[FeatureId],
    ) -> Result<()> {
        let arity = |srcs: usize, dests: usize| -> Result<()> {
            if sources.len() != srcs || destinations.len() != dests {
                return Err(EngineError::invalid(
                    name,
                    format!(
                        "expected {srcs} source(s) and {dests} destination(s), \
                         got {} and {}",
                        sources.len(),
                        destinations.len()
                    ),
                ));
            }
            Ok(())
        };
        match kind {
            TransformKind::SignalRms { .. } | TransformKind::SoundLevel { .. } => {
                arity(1, 1)?;
                self.expect_kind(sources[0].0, ValueKind::Q15)?;
                self.expect_kind(destinations[0], ValueKind::Float)?;
            }
            TransformKind::SectionSum { .. } => {
                if sources.is_empty() || sources.len() != destinations.len() {
                    return Err(EngineError::invalid(
                        name,
                        "section sum needs one destination per source",
                    ));
                }
                for &(s, _) in sources {
                    self.expect_kind(s, ValueKind::Float)?;
                }
                for &d in destinations {
                    self.expect_kind(d, ValueKind::Float)?;
                }
            }
            TransformKind::MultiSourceSum { .. } => {
                if sources.is_empty() || destinations.len() != 1 {
                    return Err(EngineError::invalid(
                        name,
                        "multi-source sum needs at least one source and one destination",
                    ));
                }
                let len = self.window_len(sources[0]);
                for &s in sources {
                    self.expect_kind(s.0, ValueKind::Float)?;
                    if self.window_len(s) != len {
                        return Err(EngineError::invalid(
                            name,
                            "multi-source sum sources must consume equal windows",
                        ));
                    }
                }
                self.expect_kind(destinations[0], ValueKind::Float)?;
                let dest_size = self.features[destinations[0].0].section_size();
                if len % dest_size != 0 {
                    return Err(EngineError::invalid(
                        name,
                        "destination section size must divide the consumed window",
                    ));
                }
            }
            TransformKind::Spectral { low_cut_hz, high_cut_hz, .. } => {
                arity(1, 4)?;
                self.expect_kind(sources[0].0, ValueKind::Q15)?;
                if self.window_len(sources[0]) < 2 {
                    return Err(EngineError::invalid(name, "spectral window is too short"));
                }
                if low_cut_hz >= high_cut_hz {
                    return Err(EngineError::invalid(
                        name,
                        "low cutoff must be below the high cutoff",
                    ));
                }
                self.expect_kind(destinations[0], ValueKind::Q15)?;
                if self.features[destinations[0].0].section_size() % 3 != 0 {
                    return Err(EngineError::invalid(
                        name,
                        "reduced-bin destination section size must hold (index, re, im) triples",
                    ));
                }
                for &d in &destinations[1..] {
                    self.expect_kind(d, ValueKind::Float)?;
                }
            }
        }
        Ok(())
    }

    /// Derives destination sampling metadata from the first source.
    ///
    /// Scalar outputs produce one value per consumed window; element-wise
    /// outputs track the source rate. A resolution configured on the
    /// destination itself is left alone.
    fn propagate_metadata(
        &mut self,
        kind: &TransformKind,
        sources: &[(FeatureId, usize)],
        destinations: &[FeatureId],
    ) {
        let src = &self.features[sources[0].0 .0];
        let src_rate = src.sampling_rate();
        let window = self.window_len(sources[0]) as u32;
        let derived = match kind {
            TransformKind::MultiSourceSum { .. } => src_rate,
            _ => (src_rate / window).max(1),
        };
        for &d in destinations {
            let dest = &mut self.features[d.0];
            if dest.sampling_rate() == 0 {
                let resolution = dest.resolution();
                dest.set_metadata(derived, resolution);
            }
        }
    }

    fn bind_transform(&mut self, kind: &TransformKind, sources: &[(FeatureId, usize)]) -> Transform {
        match *kind {
            TransformKind::SignalRms {
                remove_mean,
                normalize,
                scaling,
            } => Transform::SignalRms {
                remove_mean,
                normalize,
                scaling,
            },
            TransformKind::SectionSum { normalize, rms_input } => {
                Transform::SectionSum { normalize, rms_input }
            }
            TransformKind::MultiSourceSum { normalize, rms_input } => {
                Transform::MultiSourceSum { normalize, rms_input }
            }
            TransformKind::SoundLevel { scaling, offset } => {
                Transform::SoundLevel { scaling, offset }
            }
            TransformKind::Spectral {
                low_cut_hz,
                high_cut_hz,
                min_agitation,
            } => {
                let n = self.window_len(sources[0]);
                Transform::Spectral(SpectralTransform {
                    low_cut_hz,
                    high_cut_hz,
                    min_agitation,
                    fft: self.planner.plan_fft_forward(n),
                })
            }
        }
    }
}

/// The fixed-topology dataflow engine.
pub struct Graph {
    features: Vec<Feature>,
    computers: Vec<Computer>,
    groups: Vec<StreamingGroup>,
    feature_names: HashMap<String, FeatureId>,
    group_names: HashMap<String, usize>,
    sources: Vec<(FeatureId, Box<dyn SampleSource>)>,
    sample_scratch: Vec<Sample>,
}

impl Graph {
    /// Resolves a feature name to its stable index.
    pub fn feature_id(&self, name: &str) -> Result<FeatureId> {
        self.feature_names
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownFeature(name.to_owned()))
    }

    /// Borrows a feature by index.
    pub fn feature(&self, id: FeatureId) -> &Feature {
        &self.features[id.0]
    }

    /// Borrows a feature by name.
    pub fn feature_by_name(&self, name: &str) -> Result<&Feature> {
        Ok(&self.features[self.feature_id(name)?.0])
    }

    /// Borrows a computer by name.
    pub fn computer_by_name(&self, name: &str) -> Option<&Computer> {
        self.computers.iter().find(|c| c.name() == name)
    }

    /// Borrows a streaming group by name.
    pub fn group_by_name(&self, name: &str) -> Result<&StreamingGroup> {
        let idx = self.group_index(name)?;
        Ok(&self.groups[idx])
    }

    fn group_index(&self, name: &str) -> Result<usize> {
        self.group_names
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownGroup(name.to_owned()))
    }

    /// Attaches a sample source to a named feature; polled every tick while
    /// the feature is active.
    pub fn register_source(&mut self, feature: &str, source: Box<dyn SampleSource>) -> Result<()> {
        let id = self.feature_id(feature)?;
        self.sources.push((id, source));
        Ok(())
    }

    /// Records one raw value, honoring backpressure.
    ///
    /// Returns `false` (and drops the value) when the target section still
    /// holds unconsumed data, which keeps recording from ever blocking.
    pub fn add_value(&mut self, id: FeatureId, sample: Sample) -> bool {
        let feature = &mut self.features[id.0];
        if !feature.is_ready_to_record(1) {
            debug!("Feature '{}' backpressured a sample", feature.name());
            return false;
        }
        feature.add_value(sample);
        true
    }

    /// Enables a feature and, recursively, everything that produces it.
    pub fn activate(&mut self, name: &str) -> Result<()> {
        let id = self.feature_id(name)?;
        self.activate_feature(id);
        Ok(())
    }

    /// Disables a feature and cascades to producers nothing else needs.
    pub fn deactivate(&mut self, name: &str) -> Result<()> {
        let id = self.feature_id(name)?;
        self.deactivate_feature(id);
        Ok(())
    }

    /// Installs the normal/warning/danger threshold triple on a feature.
    pub fn set_thresholds(
        &mut self,
        name: &str,
        normal: f32,
        warning: f32,
        danger: f32,
    ) -> Result<()> {
        let id = self.feature_id(name)?;
        self.features[id.0].set_thresholds(normal, warning, danger);
        Ok(())
    }

    /// Marks a feature as required (or not) by streaming; a streaming feature
    /// never deactivates through the cascade.
    pub fn set_streaming(&mut self, name: &str, streaming: bool) -> Result<()> {
        let id = self.feature_id(name)?;
        self.features[id.0].set_streaming(streaming);
        Ok(())
    }

    /// Activates a streaming group and all of its member features.
    pub fn activate_group(&mut self, name: &str) -> Result<()> {
        let idx = self.group_index(name)?;
        self.groups[idx].set_active(true);
        let members: Vec<FeatureId> = self.groups[idx].members().to_vec();
        for m in members {
            self.features[m.0].set_streaming(true);
            self.activate_feature(m);
        }
        Ok(())
    }

    /// Deactivates a streaming group, releasing members the rest of the
    /// graph no longer needs.
    pub fn deactivate_group(&mut self, name: &str) -> Result<()> {
        let idx = self.group_index(name)?;
        self.groups[idx].set_active(false);
        let members: Vec<FeatureId> = self.groups[idx].members().to_vec();
        for m in members {
            self.features[m.0].set_streaming(false);
            if self.is_deactivatable(m) {
                self.deactivate_feature(m);
            }
        }
        Ok(())
    }

    /// Changes a group's send period.
    pub fn set_group_period(&mut self, name: &str, send_period_ms: u32) -> Result<()> {
        let idx = self.group_index(name)?;
        self.groups[idx].set_send_period_ms(send_period_ms);
        Ok(())
    }

    /// Copies a feature's latest complete section into `out`, in physical
    /// units. Takes the same locked snapshot streaming does.
    pub fn read_latest(&mut self, name: &str, out: &mut Vec<f32>) -> Result<()> {
        let id = self.feature_id(name)?;
        self.features[id.0].stream(out);
        Ok(())
    }

    /// Worst classification across active classifying features.
    pub fn operation_state(&self) -> OperationState {
        self.features
            .iter()
            .filter(|f| f.is_active() && f.classifies())
            .map(Feature::operation_state)
            .max()
            .unwrap_or(OperationState::Idle)
    }

    /// Runs one driver pass: poll sources, run computers in declaration
    /// order, then emit any streaming group whose period elapsed.
    pub fn tick(&mut self, now_ms: u32, sink: &mut dyn StreamSink) {
        let Graph {
            features,
            computers,
            sources,
            sample_scratch,
            ..
        } = self;
        for (id, source) in sources.iter_mut() {
            if !features[id.0].is_active() {
                continue;
            }
            sample_scratch.clear();
            source.acquire(sample_scratch);
            for &sample in sample_scratch.iter() {
                let feature = &mut features[id.0];
                if feature.is_ready_to_record(1) {
                    feature.add_value(sample);
                } else {
                    debug!("Feature '{}' backpressured a source sample", feature.name());
                }
            }
        }
        // Inactive computers also get a chance to drain their inputs.
        for c in computers.iter_mut() {
            c.try_run(features);
        }

        let state = self.operation_state();
        let Graph {
            features, groups, ..
        } = self;
        for g in groups.iter_mut() {
            if g.is_active() && g.is_send_time(now_ms) {
                g.emit(features, state, now_ms, sink);
            }
        }
    }

    /// Clears all buffer state without touching topology or activation.
    pub fn reset(&mut self) {
        for f in &mut self.features {
            f.reset();
        }
        warn!("Graph state reset");
    }

    fn activate_feature(&mut self, id: FeatureId) {
        if self.features[id.0].is_active() {
            return;
        }
        self.features[id.0].set_active(true);
        debug!("Feature '{}' activated", self.features[id.0].name());
        if let Some(producer) = self.features[id.0].producer() {
            self.activate_computer(producer);
        }
    }

    fn activate_computer(&mut self, id: ComputerId) {
        if self.computers[id.0].is_active() {
            return;
        }
        self.computers[id.0].set_active(true);
        debug!("Computer '{}' activated", self.computers[id.0].name());
        let sources: Vec<FeatureId> = self.computers[id.0]
            .sources()
            .iter()
            .map(|s| s.feature)
            .collect();
        for f in sources {
            self.activate_feature(f);
        }
    }

    /// A feature can be released when no streaming group claims it and no
    /// active computer consumes it. Re-derived from current flags each time
    /// rather than counted, so the answer cannot drift.
    fn is_deactivatable(&self, id: FeatureId) -> bool {
        let feature = &self.features[id.0];
        !feature.is_streaming()
            && !feature
                .receivers()
                .iter()
                .any(|&c| self.computers[c.0].is_active())
    }

    fn deactivate_feature(&mut self, id: FeatureId) {
        if !self.features[id.0].is_active() {
            return;
        }
        self.features[id.0].set_active(false);
        debug!("Feature '{}' deactivated", self.features[id.0].name());
        if let Some(producer) = self.features[id.0].producer() {
            self.try_deactivate_computer(producer);
        }
    }

    fn try_deactivate_computer(&mut self, id: ComputerId) {
        if !self.computers[id.0].is_active() {
            return;
        }
        let still_needed = self.computers[id.0]
            .destinations()
            .iter()
            .any(|&d| self.features[d.0].is_active());
        if still_needed {
            return;
        }
        self.computers[id.0].set_active(false);
        debug!("Computer '{}' deactivated", self.computers[id.0].name());
        let sources: Vec<FeatureId> = self.computers[id.0]
            .sources()
            .iter()
            .map(|s| s.feature)
            .collect();
        for f in sources {
            if self.is_deactivatable(f) {
                self.deactivate_feature(f);
            }
        }
    }
}
