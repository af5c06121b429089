//! The task graph and everything that walks it.
//!
//! A [`Task`] is one stage of one target-comparator(-outcome) combination. Tasks
//! are organized into a directed acyclic graph where an edge points from a
//! dependency to the task that consumes its artifact. The graph is produced by
//! the [`planner`] and executed by the [`runner`].
//!
//! ## Deduplication
//!
//! Every task is keyed by its [`ArtifactId`], which hashes only the inputs that
//! determine its output. While planning, a task whose key is already in the
//! graph is not added again: the existing node is reused, and the new
//! combination simply points at it. Many (analysis, hypothesis) pairs thus share
//! one extraction, one propensity model, and so on.

pub(crate) mod planner;
pub(crate) mod runner;

use std::collections::BTreeSet;
use std::fmt;

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::args::{
    BalanceArgs, ExtractionArgs, OutcomeModelArgs, PopulationArgs, PropensityArgs,
    StratificationArgs, TrimArgs,
};
use crate::collaborator::AdjustmentRequest;
use crate::core::{ArtifactId, CohortId, StageKind};
use crate::reference::{ReferenceRow, ReferenceTable};

pub use runner::diagnostics::{RunReport, TaskExecution, TaskReport};
pub use runner::{ExecutionSettings, TaskState};

/// Hypothesis-level covariate lists, applied on top of the model arguments.
#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct CovariateLists {
    pub excluded: BTreeSet<i64>,
    pub included: BTreeSet<i64>,
}

/// Arguments that turn a study population into an adjusted population.
#[derive(Debug, Clone)]
pub(crate) struct AdjustmentSpec {
    pub population: PopulationArgs,
    pub trim: Option<TrimArgs>,
    pub stratification: Option<StratificationArgs>,
}

impl AdjustmentSpec {
    pub(crate) fn request(&self, outcome_id: Option<CohortId>) -> AdjustmentRequest<'_> {
        AdjustmentRequest {
            outcome_id,
            population: &self.population,
            trim: self.trim.as_ref(),
            stratification: self.stratification.as_ref(),
        }
    }
}

/// Where an outcome model gets its population from.
#[derive(Debug, Clone)]
pub(crate) enum ModelInput {
    /// A persisted adjusted population.
    Adjusted(NodeIndex),
    /// Derived in memory right before fitting; nothing is persisted.
    Inline {
        population: NodeIndex,
        propensity: Option<NodeIndex>,
        adjustment: AdjustmentSpec,
    },
}

/// The work a task performs, along with the graph nodes it reads from.
#[derive(Debug, Clone)]
pub(crate) enum Work {
    Extraction {
        target_id: CohortId,
        comparator_id: CohortId,
        outcome_ids: BTreeSet<CohortId>,
        args: ExtractionArgs,
    },
    StudyPopulation {
        data: NodeIndex,
        args: PopulationArgs,
    },
    Propensity {
        data: NodeIndex,
        population: NodeIndex,
        args: PropensityArgs,
        covariates: CovariateLists,
    },
    SharedBalance {
        data: NodeIndex,
        population: NodeIndex,
        propensity: NodeIndex,
        adjustment: AdjustmentSpec,
        args: BalanceArgs,
    },
    Adjustment {
        data: NodeIndex,
        population: NodeIndex,
        propensity: Option<NodeIndex>,
        outcome_id: CohortId,
        adjustment: AdjustmentSpec,
    },
    Balance {
        data: NodeIndex,
        adjusted: NodeIndex,
        args: BalanceArgs,
    },
    OutcomeModel {
        data: NodeIndex,
        input: ModelInput,
        outcome_id: CohortId,
        args: OutcomeModelArgs,
        covariates: CovariateLists,
    },
}

impl Work {
    pub(crate) fn stage(&self) -> StageKind {
        match self {
            Work::Extraction { .. } => StageKind::Extraction,
            Work::StudyPopulation { .. } => StageKind::StudyPopulation,
            Work::Propensity { .. } => StageKind::Propensity,
            Work::SharedBalance { .. } => StageKind::SharedBalance,
            Work::Adjustment { .. } => StageKind::Adjustment,
            Work::Balance { .. } => StageKind::Balance,
            Work::OutcomeModel { .. } => StageKind::OutcomeModel,
        }
    }

    pub(crate) fn dependencies(&self) -> Vec<NodeIndex> {
        match *self {
            Work::Extraction { .. } => vec![],
            Work::StudyPopulation { data, .. } => vec![data],
            Work::Propensity {
                data, population, ..
            } => vec![data, population],
            Work::SharedBalance {
                data,
                population,
                propensity,
                ..
            } => vec![data, population, propensity],
            Work::Adjustment {
                data,
                population,
                propensity,
                ..
            } => [Some(data), Some(population), propensity]
                .into_iter()
                .flatten()
                .collect(),
            Work::Balance { data, adjusted, .. } => vec![data, adjusted],
            Work::OutcomeModel {
                data, ref input, ..
            } => match *input {
                ModelInput::Adjusted(adjusted) => vec![data, adjusted],
                ModelInput::Inline {
                    population,
                    propensity,
                    ..
                } => [Some(data), Some(population), propensity]
                    .into_iter()
                    .flatten()
                    .collect(),
            },
        }
    }
}

/// A node of the task graph.
#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) id: ArtifactId,
    pub(crate) label: String,
    pub(crate) work: Work,
}

impl Task {
    pub fn id(&self) -> ArtifactId {
        self.id
    }

    pub fn stage(&self) -> StageKind {
        self.id.stage
    }

    /// Short human-readable name, e.g. `Ps t101_c102`.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// The deduplicated task graph of a study, together with the reference rows it
/// was planned for.
#[derive(Debug, Clone)]
pub struct Plan {
    pub(crate) graph: Graph<Task, ()>,
    pub(crate) rows: Vec<ReferenceRow>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Number of distinct tasks of one stage kind.
    pub fn count(&self, stage: StageKind) -> usize {
        self.tasks().filter(|task| task.stage() == stage).count()
    }

    pub fn task(&self, id: &ArtifactId) -> Option<&Task> {
        self.tasks().find(|task| task.id == *id)
    }

    /// Tasks that `id` consumes directly.
    pub fn dependencies(&self, id: &ArtifactId) -> Vec<ArtifactId> {
        self.graph
            .node_indices()
            .find(|&index| self.graph[index].id == *id)
            .map(|index| {
                self.graph[index]
                    .work
                    .dependencies()
                    .into_iter()
                    .map(|dep| self.graph[dep].id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn rows(&self) -> &[ReferenceRow] {
        &self.rows
    }

    pub fn reference_table(&self) -> ReferenceTable {
        ReferenceTable::new(self.rows.clone())
    }
}

impl fmt::Display for Plan {
    /// Renders the task graph as a Mermaid flowchart.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            writeln!(f, "    {}[\"{}\"]", index.index(), task.label)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
