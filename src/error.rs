//! Custom error types for the engine.
//!
//! All variants of [`EngineError`] describe construction-time defects: a graph
//! that builds successfully never returns an error from the tick path. At
//! runtime, "not ready" is ordinary backpressure (a `bool`, not an error) and
//! numerical edge cases are clamped locally and logged.

use crate::graph::feature::ValueKind;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while loading configuration or wiring the feature graph.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Unknown feature '{0}' referenced by wiring")]
    UnknownFeature(String),

    #[error("Unknown streaming group '{0}'")]
    UnknownGroup(String),

    #[error("Feature '{0}' is declared more than once")]
    DuplicateFeature(String),

    #[error("Feature '{feature}' cannot accept another receiver (max {max})")]
    ReceiverOverflow { feature: String, max: usize },

    #[error("Streaming group '{group}' cannot hold more than {max} features")]
    GroupOverflow { group: String, max: usize },

    #[error(
        "Computer '{computer}' consumes {sections} section(s) per run from \
         '{feature}', which does not divide its {section_count} sections"
    )]
    SectionCountMismatch {
        computer: String,
        feature: String,
        sections: usize,
        section_count: usize,
    },

    #[error("Feature '{feature}' holds {actual:?} values but {expected:?} was required")]
    KindMismatch {
        feature: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("Feature '{feature}' already has a producing computer")]
    ProducerConflict { feature: String },

    #[error("Invalid parameter for '{context}': {reason}")]
    InvalidParameter { context: String, reason: String },
}

impl EngineError {
    pub(crate) fn invalid(context: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidParameter {
            context: context.into(),
            reason: reason.into(),
        }
    }
}
