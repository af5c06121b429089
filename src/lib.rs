#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod args;
mod collaborator;
mod core;
mod engine;
mod error;
mod hypothesis;
mod io;
#[cfg(feature = "logging")]
mod logging;
mod reference;
mod store;
mod study;
pub mod summary;
#[cfg(test)]
mod testing;
mod utils;

pub use crate::args::{
    Anchor, BalanceArgs, BalanceScope, BaseSelection, CaliperScale, CmAnalysis,
    CmAnalysisBuilder, DuplicateSubjects, ExtractionArgs, ModelType, OutcomeBalance,
    OutcomeModelArgs, PopulationArgs, PriorType, PropensityArgs, Regularization,
    StratificationArgs, TrimArgs, load_analyses, save_analyses,
};
pub use crate::collaborator::{
    AdjustmentRequest, Artifact, Collaborator, ExtractionRequest, FitStatus, OutcomeModel,
    OutcomeModelRequest, PropensityRequest,
};
pub use crate::core::{AnalysisId, ArtifactId, CohortId, Fingerprint, StageKind};
pub use crate::engine::{
    ExecutionSettings, Plan, RunReport, Task, TaskExecution, TaskReport, TaskState,
};
pub use crate::error::*;
pub use crate::hypothesis::{
    AnalysisExclusion, Outcome, TargetComparatorOutcomes, load_hypotheses, save_hypotheses,
};
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::reference::{ReferenceRow, ReferenceTable, RowStatus};
pub use crate::store::ArtifactStore;
pub use crate::study::{Study, StudyConfig, StudyRun};
