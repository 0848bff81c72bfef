//! Time-gated bundles of features serialized together for transport.

use log::{debug, warn};

use crate::graph::feature::{Feature, OperationState};
use crate::graph::FeatureId;

/// Upper bound on features per streaming group.
pub const MAX_GROUP_SIZE: usize = 10;

/// Receives streamed records. The wire encoding is the implementor's
/// concern; the engine guarantees section selection, snapshot consistency,
/// and stable member ordering.
pub trait StreamSink {
    /// Starts one record for a group that fired.
    fn begin_record(&mut self, group: &str, timestamp_ms: u32, state: OperationState);
    /// One member feature's latest complete section, in physical units.
    fn feature_values(&mut self, feature: &str, values: &[f32]);
    /// Terminates the record.
    fn end_record(&mut self);
}

/// Sink writing records as delimited text lines, one record per line.
///
/// The format is `group,timestamp,state;feature:v1,v2,...;` and exists for
/// demos and tests; real transports implement [`StreamSink`] themselves.
pub struct TextSink<W> {
    writer: W,
}

impl<W: std::io::Write> TextSink<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        TextSink { writer }
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: std::io::Write> StreamSink for TextSink<W> {
    fn begin_record(&mut self, group: &str, timestamp_ms: u32, state: OperationState) {
        if let Err(e) = write!(self.writer, "{group},{timestamp_ms},{state:?};") {
            warn!("Text sink write failed: {e}");
        }
    }

    fn feature_values(&mut self, feature: &str, values: &[f32]) {
        let mut line = String::with_capacity(16 + values.len() * 8);
        line.push_str(feature);
        line.push(':');
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&format!("{v:.4}"));
        }
        line.push(';');
        if let Err(e) = self.writer.write_all(line.as_bytes()) {
            warn!("Text sink write failed: {e}");
        }
    }

    fn end_record(&mut self) {
        if let Err(e) = writeln!(self.writer) {
            warn!("Text sink write failed: {e}");
        }
    }
}

/// A named, period-gated list of features streamed in registration order.
pub struct StreamingGroup {
    name: String,
    members: Vec<FeatureId>,
    send_period_ms: u32,
    last_sent_ms: u32,
    active: bool,
    scratch: Vec<f32>,
}

impl StreamingGroup {
    pub(crate) fn new(name: String, members: Vec<FeatureId>, send_period_ms: u32) -> Self {
        StreamingGroup {
            name,
            members,
            send_period_ms,
            last_sent_ms: 0,
            active: false,
            scratch: Vec::new(),
        }
    }

    /// Group name, unique within a graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the group currently emits.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub(crate) fn members(&self) -> &[FeatureId] {
        &self.members
    }

    /// Send period in milliseconds.
    pub fn send_period_ms(&self) -> u32 {
        self.send_period_ms
    }

    pub(crate) fn set_send_period_ms(&mut self, period: u32) {
        self.send_period_ms = period;
    }

    /// True when a full period has elapsed since the last send; updates the
    /// last-sent time on a true result.
    ///
    /// The comparison is on the delta, so a wrapping millisecond clock is
    /// handled without special cases.
    pub fn is_send_time(&mut self, now_ms: u32) -> bool {
        if now_ms.wrapping_sub(self.last_sent_ms) >= self.send_period_ms {
            self.last_sent_ms = now_ms;
            return true;
        }
        false
    }

    /// Streams each member's latest complete section to `sink`.
    ///
    /// An inactive group, a group whose members are all inactive, or one with
    /// a member that has not yet completed a full ring cycle emits nothing;
    /// the latter keeps startup records from carrying uninitialized sections.
    pub(crate) fn emit(
        &mut self,
        features: &mut [Feature],
        state: OperationState,
        timestamp_ms: u32,
        sink: &mut dyn StreamSink,
    ) {
        if !self.active {
            return;
        }
        if !self.members.iter().any(|&m| features[m.0].is_active()) {
            debug!("Streaming group '{}' skipped: no active members", self.name);
            return;
        }
        if self.members.iter().any(|&m| !features[m.0].filled_once()) {
            return;
        }
        sink.begin_record(&self.name, timestamp_ms, state);
        for i in 0..self.members.len() {
            let feature = &mut features[self.members[i].0];
            self.scratch.clear();
            feature.stream(&mut self.scratch);
            sink.feature_values(feature.name(), &self.scratch);
        }
        sink.end_record();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_gate_opens_exactly_at_the_period() {
        let mut g = StreamingGroup::new("motor".into(), Vec::new(), 500);
        g.last_sent_ms = 1000;
        assert!(!g.is_send_time(1400));
        assert_eq!(g.last_sent_ms, 1000);
        assert!(g.is_send_time(1500));
        assert_eq!(g.last_sent_ms, 1500);
    }

    #[test]
    fn text_sink_writes_one_line_per_record() {
        let mut sink = TextSink::new(Vec::new());
        sink.begin_record("motor", 1500, OperationState::Normal);
        sink.feature_values("rms-x", &[5.0]);
        sink.feature_values("vel-x", &[1.25, 2.5]);
        sink.end_record();
        let line = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(line, "motor,1500,Normal;rms-x:5.0000;vel-x:1.2500,2.5000;\n");
    }

    #[test]
    fn send_gate_survives_clock_wraparound() {
        let mut g = StreamingGroup::new("motor".into(), Vec::new(), 500);
        g.last_sent_ms = u32::MAX - 100;
        assert!(!g.is_send_time(u32::MAX.wrapping_add(100)));
        assert!(g.is_send_time(u32::MAX.wrapping_add(400)));
    }
}
