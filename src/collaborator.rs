//! The contract between the engine and the code that does the actual work.
//!
//! The engine never looks inside the intermediate artifacts: cohort data,
//! populations, propensity scores, adjusted populations and balance tables are
//! associated types chosen by the [`Collaborator`] implementation. They only
//! need to be serializable, so they can be committed to the artifact store and
//! read back by later stages or later runs. The fitted outcome model is the one
//! concrete type, since the result summary reads it.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::args::{
    BalanceArgs, ExtractionArgs, OutcomeModelArgs, PopulationArgs, PropensityArgs,
    StratificationArgs, TrimArgs,
};
use crate::core::CohortId;

/// Anything that can be persisted in the artifact store.
pub trait Artifact: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Artifact for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Everything needed to pull one target-comparator pair from the database.
#[derive(Debug)]
pub struct ExtractionRequest<'a> {
    pub target_id: CohortId,
    pub comparator_id: CohortId,
    /// Every outcome cohort of the hypothesis, including excluded ones.
    pub outcome_ids: &'a BTreeSet<CohortId>,
    pub args: &'a ExtractionArgs,
}

#[derive(Debug)]
pub struct PropensityRequest<'a> {
    pub args: &'a PropensityArgs,
    /// Hypothesis-level covariates to leave out, in addition to `args`.
    pub excluded_covariate_ids: &'a BTreeSet<i64>,
    pub included_covariate_ids: &'a BTreeSet<i64>,
}

/// Derivation of an adjusted population.
///
/// Steps are applied in order: outcome-specific restriction (when `outcome_id`
/// is set), trimming, then matching or stratification. Without an outcome the
/// result is the outcome-independent population used for shared balance.
#[derive(Debug)]
pub struct AdjustmentRequest<'a> {
    pub outcome_id: Option<CohortId>,
    pub population: &'a PopulationArgs,
    pub trim: Option<&'a TrimArgs>,
    pub stratification: Option<&'a StratificationArgs>,
}

#[derive(Debug)]
pub struct OutcomeModelRequest<'a> {
    pub outcome_id: CohortId,
    pub args: &'a OutcomeModelArgs,
    pub excluded_covariate_ids: &'a BTreeSet<i64>,
    pub included_covariate_ids: &'a BTreeSet<i64>,
}

/// Convergence status reported by the regression solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FitStatus {
    Ok,
    NoConvergence,
    IllConditioned,
    /// Not enough outcomes to fit anything.
    Skipped,
}

/// A fitted outcome model, as reported by the regression collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeModel {
    pub status: FitStatus,
    /// Log of the hazard, odds or rate ratio of target versus comparator.
    pub log_rr: Option<f64>,
    pub se_log_rr: Option<f64>,
    /// Confidence interval bounds on the log scale, when the solver computes
    /// them from the likelihood profile.
    pub log_lb95: Option<f64>,
    pub log_ub95: Option<f64>,
    pub target_subjects: u64,
    pub comparator_subjects: u64,
    pub target_days: u64,
    pub comparator_days: u64,
    pub target_outcomes: u64,
    pub comparator_outcomes: u64,
}

/// The external services the engine orchestrates.
///
/// Every method must be a deterministic function of its arguments: the engine
/// caches results by the fingerprint of those arguments and will not call a
/// method again for inputs it has seen before, in this run or a previous one.
pub trait Collaborator: Send + Sync {
    type CohortData: Artifact;
    type Population: Artifact;
    type Propensity: Artifact;
    type Adjusted: Artifact;
    type Balance: Artifact;

    fn extract(&self, request: &ExtractionRequest<'_>) -> anyhow::Result<Self::CohortData>;

    fn define_population(
        &self,
        data: &Self::CohortData,
        args: &PopulationArgs,
    ) -> anyhow::Result<Self::Population>;

    fn fit_propensity(
        &self,
        data: &Self::CohortData,
        population: &Self::Population,
        request: &PropensityRequest<'_>,
    ) -> anyhow::Result<Self::Propensity>;

    fn adjust_population(
        &self,
        data: &Self::CohortData,
        population: &Self::Population,
        propensity: Option<&Self::Propensity>,
        request: &AdjustmentRequest<'_>,
    ) -> anyhow::Result<Self::Adjusted>;

    fn compute_balance(
        &self,
        data: &Self::CohortData,
        adjusted: &Self::Adjusted,
        args: &BalanceArgs,
    ) -> anyhow::Result<Self::Balance>;

    fn fit_outcome_model(
        &self,
        data: &Self::CohortData,
        adjusted: &Self::Adjusted,
        request: &OutcomeModelRequest<'_>,
    ) -> anyhow::Result<OutcomeModel>;
}
