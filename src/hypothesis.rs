//! The hypotheses of interest: which target is compared to which comparator, and
//! for which outcomes.

use std::collections::BTreeSet;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::args::{read_json, write_json};
use crate::core::{AnalysisId, CohortId};
use crate::error::{ConfigurationError, DuplicateIdError, StoreError, StudyError};

/// One outcome cohort of a hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub outcome_id: CohortId,
    /// Outcomes not of interest (negative controls) get no persisted
    /// intermediate populations or per-outcome balance.
    #[serde(default = "yes")]
    pub outcome_of_interest: bool,
    /// Known true relative risk, used only downstream for calibration.
    #[serde(default)]
    pub true_effect_size: Option<f64>,
}

fn yes() -> bool {
    true
}

impl Outcome {
    pub fn of_interest(outcome_id: CohortId) -> Self {
        Self {
            outcome_id,
            outcome_of_interest: true,
            true_effect_size: None,
        }
    }

    /// A negative control outcome with a true relative risk of 1.
    pub fn negative_control(outcome_id: CohortId) -> Self {
        Self {
            outcome_id,
            outcome_of_interest: false,
            true_effect_size: Some(1.0),
        }
    }
}

/// A target-comparator pair with its outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetComparatorOutcomes {
    pub target_id: CohortId,
    pub comparator_id: CohortId,
    pub outcomes: Vec<Outcome>,
    /// Covariates never used in the propensity and outcome models of this pair,
    /// typically the exposure concepts themselves.
    #[serde(default)]
    pub excluded_covariate_ids: BTreeSet<i64>,
    #[serde(default)]
    pub included_covariate_ids: BTreeSet<i64>,
}

impl TargetComparatorOutcomes {
    pub fn new(target_id: CohortId, comparator_id: CohortId, outcomes: Vec<Outcome>) -> Self {
        Self {
            target_id,
            comparator_id,
            outcomes,
            excluded_covariate_ids: BTreeSet::new(),
            included_covariate_ids: BTreeSet::new(),
        }
    }

    /// IDs of all outcomes of this hypothesis.
    pub fn outcome_ids(&self) -> BTreeSet<CohortId> {
        self.outcomes.iter().map(|outcome| outcome.outcome_id).collect()
    }

    pub fn exclude_covariates(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.excluded_covariate_ids.extend(ids);
        self
    }

    pub fn include_covariates(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.included_covariate_ids.extend(ids);
        self
    }

    pub fn outcome(&self, outcome_id: CohortId) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.outcome_id == outcome_id)
    }

    fn validate(&self) -> Result<(), StudyError> {
        let (target_id, comparator_id) = (self.target_id, self.comparator_id);

        if target_id == comparator_id {
            return Err(ConfigurationError::SameCohort(target_id).into());
        }

        if self.outcomes.is_empty() {
            return Err(ConfigurationError::NoOutcomes {
                target_id,
                comparator_id,
            }
            .into());
        }

        let mut seen = BTreeSet::new();
        for outcome in &self.outcomes {
            if !seen.insert(outcome.outcome_id) {
                return Err(DuplicateIdError::Outcome {
                    target_id,
                    comparator_id,
                    outcome_id: outcome.outcome_id,
                }
                .into());
            }
        }

        Ok(())
    }
}

/// Validates a full hypothesis list: each hypothesis on its own, and
/// target-comparator pairs unique across the list.
pub(crate) fn validate_hypotheses(
    hypotheses: &[TargetComparatorOutcomes],
) -> Result<(), StudyError> {
    let mut pairs = BTreeSet::new();

    for tco in hypotheses {
        tco.validate()?;

        if !pairs.insert((tco.target_id, tco.comparator_id)) {
            return Err(DuplicateIdError::Hypothesis {
                target_id: tco.target_id,
                comparator_id: tco.comparator_id,
            }
            .into());
        }
    }

    Ok(())
}

/// Removes an (analysis, target, comparator) combination from the plan,
/// either for all outcomes or for a single one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisExclusion {
    pub analysis_id: AnalysisId,
    pub target_id: CohortId,
    pub comparator_id: CohortId,
    #[serde(default)]
    pub outcome_id: Option<CohortId>,
}

impl AnalysisExclusion {
    pub fn pair(analysis_id: AnalysisId, target_id: CohortId, comparator_id: CohortId) -> Self {
        Self {
            analysis_id,
            target_id,
            comparator_id,
            outcome_id: None,
        }
    }

    pub fn outcome(
        analysis_id: AnalysisId,
        target_id: CohortId,
        comparator_id: CohortId,
        outcome_id: CohortId,
    ) -> Self {
        Self {
            analysis_id,
            target_id,
            comparator_id,
            outcome_id: Some(outcome_id),
        }
    }

    pub fn excludes(
        &self,
        analysis_id: AnalysisId,
        target_id: CohortId,
        comparator_id: CohortId,
        outcome_id: CohortId,
    ) -> bool {
        self.analysis_id == analysis_id
            && self.target_id == target_id
            && self.comparator_id == comparator_id
            && self.outcome_id.is_none_or(|id| id == outcome_id)
    }
}

pub fn save_hypotheses(
    path: impl AsRef<Utf8Path>,
    hypotheses: &[TargetComparatorOutcomes],
) -> Result<(), StoreError> {
    write_json(path.as_ref(), hypotheses)
}

pub fn load_hypotheses(
    path: impl AsRef<Utf8Path>,
) -> Result<Vec<TargetComparatorOutcomes>, StudyError> {
    let hypotheses: Vec<TargetComparatorOutcomes> = read_json(path.as_ref())?;
    validate_hypotheses(&hypotheses)?;
    Ok(hypotheses)
}
