use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::{AnalysisId, ArtifactId, CohortId, StageKind};

/// An analysis specification or hypothesis list that cannot be planned.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("analysis {analysis_id}: no {stage} arguments were given")]
    MissingStage {
        analysis_id: AnalysisId,
        stage: &'static str,
    },

    #[error("analysis {analysis_id}: {stage} requires {requires}, which is not configured")]
    MissingUpstream {
        analysis_id: AnalysisId,
        stage: &'static str,
        requires: &'static str,
    },

    #[error("analysis {analysis_id}: invalid {stage} arguments: {reason}")]
    InvalidArguments {
        analysis_id: AnalysisId,
        stage: &'static str,
        reason: String,
    },

    #[error("hypothesis t{target_id}/c{comparator_id} has no outcomes")]
    NoOutcomes {
        target_id: CohortId,
        comparator_id: CohortId,
    },

    #[error("cohort {0} is used as both target and comparator")]
    SameCohort(CohortId),

    #[error("no analyses were given")]
    NoAnalyses,

    #[error("no target-comparator-outcomes were given")]
    NoHypotheses,
}

#[derive(Debug, Error)]
pub enum DuplicateIdError {
    #[error("analysis ID {0} is used more than once")]
    Analysis(AnalysisId),

    #[error("outcome {outcome_id} is listed more than once for t{target_id}/c{comparator_id}")]
    Outcome {
        target_id: CohortId,
        comparator_id: CohortId,
        outcome_id: CohortId,
    },

    #[error("target-comparator pair t{target_id}/c{comparator_id} is listed more than once")]
    Hypothesis {
        target_id: CohortId,
        comparator_id: CohortId,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on '{path}':\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Couldn't encode artifact {id}:\n{source}")]
    Encode {
        id: ArtifactId,
        #[source]
        source: ciborium::ser::Error<io::Error>,
    },

    #[error("Couldn't decode '{path}':\n{source}")]
    Decode {
        path: Utf8PathBuf,
        #[source]
        source: ciborium::de::Error<io::Error>,
    },

    #[error("Couldn't read or write JSON '{path}':\n{source}")]
    Json {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error("Artifact {0} not found in store")]
    NotFound(ArtifactId),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>) -> impl FnOnce(io::Error) -> Self {
        move |source| StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a single task did not commit an artifact.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0:#}")]
    Computation(#[from] anyhow::Error),

    #[error("Task panicked: {0}")]
    Panic(String),

    #[error("Input {0} was not available to the task")]
    MissingInput(ArtifactId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StudyError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    DuplicateId(#[from] DuplicateIdError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Couldn't encode arguments for fingerprinting:\n{0}")]
    Fingerprint(#[from] ciborium::ser::Error<io::Error>),

    #[error("Failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Cycle detected in task graph")]
    Cycle,

    #[error(
        "No {stage} file for analysis {analysis_id}, t{target_id}/c{comparator_id}/o{outcome_id}"
    )]
    NotFound {
        analysis_id: AnalysisId,
        target_id: CohortId,
        comparator_id: CohortId,
        outcome_id: CohortId,
        stage: StageKind,
    },
}
