pub mod errors;

pub use errors::{KappaError, KappaErrorCategory, KappaResult};

use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Relax,
    ForceConstants,
    Conductivity,
}

impl PipelineStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relax => "relax",
            Self::ForceConstants => "force constants",
            Self::Conductivity => "conductivity",
        }
    }
}

impl Display for PipelineStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Per-structure recoverable failure, collected instead of raised so a single
/// bad structure never aborts a batch that may run for days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: PipelineStage,
    pub structure_index: usize,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: PipelineStage, structure_index: usize, error: &KappaError) -> Self {
        Self {
            stage,
            structure_index,
            message: error.to_string(),
        }
    }
}

impl Display for StageFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} error at {}: {}",
            self.stage, self.structure_index, self.message
        )
    }
}
