//! Declarative graph configuration.
//!
//! A TOML file (plus `VIBEFLOW_`-prefixed environment overrides) declares the
//! named features, the computers wired between them, and the streaming
//! groups. [`GraphConfig::build`] turns a parsed declaration into a validated
//! [`Graph`]; every wiring defect surfaces here, before the first tick.

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;

use crate::error::Result;
use crate::graph::computer::TransformKind;
use crate::graph::feature::ValueKind;
use crate::graph::{Graph, GraphBuilder};

fn default_resolution() -> f32 {
    1.0
}

fn default_sections() -> usize {
    1
}

/// One declared feature buffer.
#[derive(Clone, Debug, Deserialize)]
pub struct FeatureConfig {
    /// Unique feature name.
    pub name: String,
    /// Value representation of the buffer.
    pub kind: ValueKind,
    /// Number of ring sections.
    pub section_count: usize,
    /// Samples per section.
    pub section_size: usize,
    /// Sampling rate in Hz; 0 (the default) derives it from the producer.
    #[serde(default)]
    pub sampling_rate: u32,
    /// Physical-unit scaling factor.
    #[serde(default = "default_resolution")]
    pub resolution: f32,
    /// Optional normal/warning/danger classification thresholds.
    #[serde(default)]
    pub thresholds: Option<[f32; 3]>,
}

/// One consumed input of a computer.
#[derive(Clone, Debug, Deserialize)]
pub struct SourceConfig {
    /// Source feature name.
    pub feature: String,
    /// Sections consumed per run.
    #[serde(default = "default_sections")]
    pub sections: usize,
}

/// One declared computer.
#[derive(Clone, Debug, Deserialize)]
pub struct ComputerConfig {
    /// Unique computer name.
    pub name: String,
    /// The transform to run.
    pub transform: TransformKind,
    /// Consumed inputs, in slot order.
    pub sources: Vec<SourceConfig>,
    /// Destination feature names, in the transform's output order.
    pub destinations: Vec<String>,
}

/// One declared streaming group.
#[derive(Clone, Debug, Deserialize)]
pub struct GroupConfig {
    /// Unique group name.
    pub name: String,
    /// Member feature names, in emission order.
    pub members: Vec<String>,
    /// Send period in milliseconds.
    pub send_period_ms: u32,
}

/// The full declarative topology.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GraphConfig {
    /// Declared feature buffers.
    #[serde(default)]
    pub features: Vec<FeatureConfig>,
    /// Declared computers, in execution order.
    #[serde(default)]
    pub computers: Vec<ComputerConfig>,
    /// Declared streaming groups.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl GraphConfig {
    /// Loads a topology from a TOML file, with `VIBEFLOW_` environment
    /// variables layered on top.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("VIBEFLOW").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parses a topology from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Instantiates and wires the declared graph.
    pub fn build(&self) -> Result<Graph> {
        let mut builder = GraphBuilder::new();
        for f in &self.features {
            builder.add_feature(
                &f.name,
                f.kind,
                f.section_count,
                f.section_size,
                f.sampling_rate,
                f.resolution,
            )?;
        }
        for c in &self.computers {
            let sources: Vec<(&str, usize)> = c
                .sources
                .iter()
                .map(|s| (s.feature.as_str(), s.sections))
                .collect();
            let destinations: Vec<&str> =
                c.destinations.iter().map(String::as_str).collect();
            builder.add_computer(&c.name, c.transform.clone(), &sources, &destinations)?;
        }
        for g in &self.groups {
            let members: Vec<&str> = g.members.iter().map(String::as_str).collect();
            builder.add_group(&g.name, &members, g.send_period_ms)?;
        }
        let mut graph = builder.build();
        for f in &self.features {
            if let Some([normal, warning, danger]) = f.thresholds {
                graph.set_thresholds(&f.name, normal, warning, danger)?;
            }
        }
        Ok(graph)
    }
}
