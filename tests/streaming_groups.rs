//! Streaming group emission tests: period gating, warmup, member ordering,
//! and the record layout handed to the transport sink.

use anyhow::Result;
use vibeflow::{GraphConfig, OperationState, Sample, StreamSink};

struct Record {
    group: String,
    timestamp_ms: u32,
    state: OperationState,
    fields: Vec<(String, Vec<f32>)>,
}

#[derive(Default)]
struct RecordingSink {
    records: Vec<Record>,
}

impl StreamSink for RecordingSink {
    fn begin_record(&mut self, group: &str, timestamp_ms: u32, state: OperationState) {
        self.records.push(Record {
            group: group.to_owned(),
            timestamp_ms,
            state,
            fields: Vec::new(),
        });
    }

    fn feature_values(&mut self, feature: &str, values: &[f32]) {
        if let Some(record) = self.records.last_mut() {
            record.fields.push((feature.to_owned(), values.to_vec()));
        }
    }

    fn end_record(&mut self) {}
}

const TOPOLOGY: &str = r#"
    [[features]]
    name = "accel-x"
    kind = "q15"
    section_count = 8
    section_size = 2
    sampling_rate = 3200

    [[features]]
    name = "rms-x"
    kind = "float"
    section_count = 2
    section_size = 1
    thresholds = [1.0, 4.0, 6.0]

    [[computers]]
    name = "rms"
    sources = [{ feature = "accel-x", sections = 1 }]
    destinations = ["rms-x"]
    transform = { type = "signal-rms" }

    [[groups]]
    name = "motor"
    members = ["rms-x"]
    send_period_ms = 500
"#;

#[test]
fn group_streams_warmed_up_members_on_its_period() -> Result<()> {
    let mut graph = GraphConfig::from_toml_str(TOPOLOGY)?.build()?;
    graph.activate_group("motor")?;
    assert!(graph.feature_by_name("accel-x")?.is_active());

    let mut sink = RecordingSink::default();
    let accel = graph.feature_id("accel-x")?;

    // First window: the destination ring is only half filled, so the group
    // stays quiet even though the period has elapsed.
    graph.add_value(accel, Sample::Q15(3));
    graph.add_value(accel, Sample::Q15(4));
    graph.tick(500, &mut sink);
    assert!(sink.records.is_empty());

    graph.add_value(accel, Sample::Q15(3));
    graph.add_value(accel, Sample::Q15(4));
    graph.tick(1000, &mut sink);
    assert_eq!(sink.records.len(), 1);

    let record = &sink.records[0];
    assert_eq!(record.group, "motor");
    assert_eq!(record.timestamp_ms, 1000);
    // RMS of [3, 4] is 5.0, above the warning threshold of 4.0
    assert_eq!(record.state, OperationState::Warning);
    assert_eq!(record.fields.len(), 1);
    assert_eq!(record.fields[0].0, "rms-x");
    assert!((record.fields[0].1[0] - 5.0).abs() < 1e-5);
    Ok(())
}

#[test]
fn group_does_not_emit_between_periods() -> Result<()> {
    let mut graph = GraphConfig::from_toml_str(TOPOLOGY)?.build()?;
    graph.activate_group("motor")?;

    let mut sink = RecordingSink::default();
    let accel = graph.feature_id("accel-x")?;
    for _ in 0..2 {
        graph.add_value(accel, Sample::Q15(3));
        graph.add_value(accel, Sample::Q15(4));
        graph.tick(500, &mut sink);
    }
    graph.tick(1000, &mut sink);
    assert_eq!(sink.records.len(), 1);

    // 400 ms after the last send: the gate stays closed
    graph.tick(1400, &mut sink);
    assert_eq!(sink.records.len(), 1);
    graph.tick(1500, &mut sink);
    assert_eq!(sink.records.len(), 2);
    Ok(())
}

#[test]
fn deactivated_group_goes_silent_and_releases_its_members() -> Result<()> {
    let mut graph = GraphConfig::from_toml_str(TOPOLOGY)?.build()?;
    graph.activate_group("motor")?;
    graph.deactivate_group("motor")?;

    assert!(!graph.feature_by_name("rms-x")?.is_active());
    assert!(!graph.feature_by_name("accel-x")?.is_active());

    let mut sink = RecordingSink::default();
    let accel = graph.feature_id("accel-x")?;
    graph.add_value(accel, Sample::Q15(3));
    graph.add_value(accel, Sample::Q15(4));
    graph.tick(5000, &mut sink);
    assert!(sink.records.is_empty());
    Ok(())
}

#[test]
fn group_period_can_be_retuned_at_runtime() -> Result<()> {
    let mut graph = GraphConfig::from_toml_str(TOPOLOGY)?.build()?;
    graph.set_group_period("motor", 100)?;
    assert_eq!(graph.group_by_name("motor")?.send_period_ms(), 100);
    assert!(graph.set_group_period("nope", 100).is_err());
    Ok(())
}
