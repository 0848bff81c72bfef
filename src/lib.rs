//! Fixed-memory feature dataflow engine for condition-monitoring sensor
//! nodes.
//!
//! The engine turns raw sensor samples into derived metrics (RMS, spectral
//! bins, velocity and displacement estimates, sound level) through a fixed
//! topology of ring-buffered [`graph::feature::Feature`]s connected by
//! stateless [`graph::computer::Computer`]s. Buffers publish whole sections
//! to multiple independent consumers without ever blocking the recording
//! path; unused branches of the graph can be power-gated through the
//! activation cascade; streaming groups serialize the latest results on a
//! period.
//!
//! Topologies are declared in TOML via [`GraphConfig`] or wired directly
//! with [`GraphBuilder`], and driven by calling [`Graph::tick`] from the
//! application's main loop.
//!
//! ```
//! use vibeflow::{GraphBuilder, OperationState, Sample, StreamSink, TransformKind, ValueKind};
//!
//! struct Null;
//! impl StreamSink for Null {
//!     fn begin_record(&mut self, _: &str, _: u32, _: OperationState) {}
//!     fn feature_values(&mut self, _: &str, _: &[f32]) {}
//!     fn end_record(&mut self) {}
//! }
//!
//! # fn main() -> vibeflow::Result<()> {
//! let mut b = GraphBuilder::new();
//! b.add_feature("accel-x", ValueKind::Q15, 8, 2, 3200, 1.0)?;
//! b.add_feature("rms-x", ValueKind::Float, 2, 1, 0, 1.0)?;
//! b.add_computer(
//!     "rms",
//!     TransformKind::SignalRms { remove_mean: false, normalize: false, scaling: 1.0 },
//!     &[("accel-x", 1)],
//!     &["rms-x"],
//! )?;
//! let mut graph = b.build();
//! graph.activate("rms-x")?;
//!
//! let accel = graph.feature_id("accel-x")?;
//! graph.add_value(accel, Sample::Q15(3));
//! graph.add_value(accel, Sample::Q15(4));
//! graph.tick(0, &mut Null);
//!
//! let rms = graph.feature_by_name("rms-x")?;
//! assert!(rms.filled_once() || rms.is_active());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dsp;
pub mod error;
pub mod graph;

pub use config::GraphConfig;
pub use error::{EngineError, Result};
pub use graph::computer::TransformKind;
pub use graph::feature::{OperationState, Sample, ValueKind};
pub use graph::streaming::{StreamSink, StreamingGroup, TextSink};
pub use graph::{ComputerId, FeatureId, Graph, GraphBuilder, SampleSource};
