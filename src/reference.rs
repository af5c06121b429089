//! The reference table: which artifact files answer which question.
//!
//! One row per (analysis, target, comparator, outcome) that was requested and not
//! excluded. Rows name files relative to the study directory; a missing file
//! name means the stage does not apply to that row.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::args::{read_json, write_json};
use crate::core::{AnalysisId, ArtifactId, CohortId, StageKind};
use crate::engine::{RunReport, TaskState, planner};
use crate::error::{StoreError, StudyError};
use crate::store::ArtifactStore;
use crate::study::Request;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRow {
    pub analysis_id: AnalysisId,
    pub description: String,
    pub target_id: CohortId,
    pub comparator_id: CohortId,
    pub outcome_id: CohortId,
    pub outcome_of_interest: bool,
    pub true_effect_size: Option<f64>,
    pub cohort_data_file: Option<String>,
    pub study_pop_file: Option<String>,
    pub ps_file: Option<String>,
    pub shared_balance_file: Option<String>,
    /// The adjusted (trimmed, matched or stratified) population.
    pub strata_file: Option<String>,
    pub balance_file: Option<String>,
    pub outcome_model_file: Option<String>,
}

impl ReferenceRow {
    pub fn file(&self, stage: StageKind) -> Option<&str> {
        let file = match stage {
            StageKind::Extraction => &self.cohort_data_file,
            StageKind::StudyPopulation => &self.study_pop_file,
            StageKind::Propensity => &self.ps_file,
            StageKind::SharedBalance => &self.shared_balance_file,
            StageKind::Adjustment => &self.strata_file,
            StageKind::Balance => &self.balance_file,
            StageKind::OutcomeModel => &self.outcome_model_file,
        };

        file.as_deref()
    }

    pub fn artifact(&self, stage: StageKind) -> Option<ArtifactId> {
        self.file(stage).and_then(|name| name.parse().ok())
    }

    /// Every artifact this row refers to, upstream first.
    pub fn artifacts(&self) -> impl Iterator<Item = ArtifactId> + '_ {
        StageKind::ALL
            .into_iter()
            .filter_map(|stage| self.artifact(stage))
    }

    /// Whether every artifact of this row was committed in the given run.
    pub fn status(&self, report: &RunReport) -> RowStatus {
        let mut failed = Vec::new();
        let mut skipped = Vec::new();

        for id in self.artifacts() {
            match report.state(&id) {
                Some(TaskState::Failed(_)) => failed.push(id.stage),
                Some(TaskState::Skipped { .. }) => skipped.push(id.stage),
                _ => {}
            }
        }

        if failed.is_empty() && skipped.is_empty() {
            RowStatus::Complete
        } else {
            RowStatus::Incomplete { failed, skipped }
        }
    }

    fn matches(
        &self,
        analysis_id: AnalysisId,
        target_id: CohortId,
        comparator_id: CohortId,
        outcome_id: CohortId,
    ) -> bool {
        self.analysis_id == analysis_id
            && self.target_id == target_id
            && self.comparator_id == comparator_id
            && self.outcome_id == outcome_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowStatus {
    Complete,
    /// Stages that failed in the run, and stages skipped because of them.
    Incomplete {
        failed: Vec<StageKind>,
        skipped: Vec<StageKind>,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceTable {
    rows: Vec<ReferenceRow>,
}

impl ReferenceTable {
    /// File name of the persisted table inside the study directory.
    pub const FILE: &'static str = "reference.json";

    pub(crate) fn new(rows: Vec<ReferenceRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[ReferenceRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(
        &self,
        analysis_id: AnalysisId,
        target_id: CohortId,
        comparator_id: CohortId,
        outcome_id: CohortId,
    ) -> Option<&ReferenceRow> {
        self.rows
            .iter()
            .find(|row| row.matches(analysis_id, target_id, comparator_id, outcome_id))
    }

    /// The file planned to hold one stage's artifact for one tuple.
    ///
    /// The file may not exist yet, or ever if its task failed; see
    /// [`ReferenceTable::resolve_committed`].
    pub fn resolve(
        &self,
        analysis_id: AnalysisId,
        target_id: CohortId,
        comparator_id: CohortId,
        outcome_id: CohortId,
        stage: StageKind,
    ) -> Result<&str, StudyError> {
        self.row(analysis_id, target_id, comparator_id, outcome_id)
            .and_then(|row| row.file(stage))
            .ok_or(StudyError::NotFound {
                analysis_id,
                target_id,
                comparator_id,
                outcome_id,
                stage,
            })
    }

    /// Like [`ReferenceTable::resolve`], but fails with
    /// [`StoreError::NotFound`] unless the artifact is committed to `store`.
    pub fn resolve_committed(
        &self,
        analysis_id: AnalysisId,
        target_id: CohortId,
        comparator_id: CohortId,
        outcome_id: CohortId,
        stage: StageKind,
        store: &ArtifactStore,
    ) -> Result<&str, StudyError> {
        let file = self.resolve(analysis_id, target_id, comparator_id, outcome_id, stage)?;

        match file.parse::<ArtifactId>().ok() {
            Some(id) if store.has(&id) => Ok(file),
            Some(id) => Err(StoreError::NotFound(id).into()),
            None => Err(StudyError::NotFound {
                analysis_id,
                target_id,
                comparator_id,
                outcome_id,
                stage,
            }),
        }
    }

    /// Rows referring to at least one artifact that is not in the store.
    pub fn missing<'a>(
        &'a self,
        store: &ArtifactStore,
    ) -> Result<Vec<&'a ReferenceRow>, StoreError> {
        let committed = store.scan()?;

        Ok(self
            .rows
            .iter()
            .filter(|row| row.artifacts().any(|id| !committed.contains(&id)))
            .collect())
    }

    pub fn save(&self, output: impl AsRef<Utf8Path>) -> Result<(), StoreError> {
        write_json(&output.as_ref().join(Self::FILE), self)
    }

    /// Reads the table persisted by the last run in `output`.
    pub fn load(output: impl AsRef<Utf8Path>) -> Result<Self, StoreError> {
        read_json(&output.as_ref().join(Self::FILE))
    }

    /// Derives the table again from the request persisted in `output`,
    /// without touching any artifact.
    pub fn rebuild(output: impl AsRef<Utf8Path>) -> Result<Self, StudyError> {
        let request = Request::load(output.as_ref())?;
        let plan = planner::plan(&request.analyses, &request.hypotheses, &request.exclusions)?;
        Ok(plan.reference_table())
    }
}
