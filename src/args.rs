//! Per-stage argument bundles and the [`CmAnalysis`] that packages them.
//!
//! Every bundle is plain data with `serde` support, so a list of analyses can be
//! written to JSON, reviewed, and loaded back for a later run. The only way to
//! obtain a [`CmAnalysis`] is through [`CmAnalysis::builder`] or
//! deserialization followed by [`CmAnalysis::validate`], which rejects stage
//! combinations that reference an unconfigured upstream stage.

use std::collections::BTreeSet;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::AnalysisId;
use crate::error::{ConfigurationError, DuplicateIdError, StoreError, StudyError};

/// What to do with subjects that appear in both the target and the comparator cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DuplicateSubjects {
    #[default]
    Keep,
    RemoveAll,
    KeepFirst,
}

/// Arguments for pulling cohorts and covariates out of the clinical database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionArgs {
    /// Earliest cohort start date to include, `YYYYMMDD`.
    pub study_start_date: Option<String>,
    /// Latest cohort start date to include, `YYYYMMDD`.
    pub study_end_date: Option<String>,
    pub first_exposure_only: bool,
    pub washout_period: u32,
    pub restrict_to_common_period: bool,
    pub remove_duplicate_subjects: DuplicateSubjects,
    /// Maximum number of subjects sampled per cohort, `0` for no limit.
    pub max_cohort_size: u32,
    /// Covariate construction settings, passed through to the extraction
    /// collaborator untouched.
    pub covariate_settings: serde_json::Value,
}

impl Default for ExtractionArgs {
    fn default() -> Self {
        Self {
            study_start_date: None,
            study_end_date: None,
            first_exposure_only: false,
            washout_period: 0,
            restrict_to_common_period: false,
            remove_duplicate_subjects: DuplicateSubjects::Keep,
            max_cohort_size: 0,
            covariate_settings: serde_json::Value::Null,
        }
    }
}

/// Start or end of a cohort episode, used to anchor the time-at-risk window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Anchor {
    #[default]
    CohortStart,
    CohortEnd,
}

/// Arguments defining the study population.
///
/// The first group of fields restricts the target and comparator cohorts and is
/// shared by every outcome. The second group (prior outcomes, time at risk)
/// depends on the outcome and is only applied when an outcome-specific
/// population is derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PopulationArgs {
    pub first_exposure_only: bool,
    pub restrict_to_common_period: bool,
    pub washout_period: u32,
    pub remove_duplicate_subjects: DuplicateSubjects,

    pub remove_subjects_with_prior_outcome: bool,
    pub prior_outcome_lookback: u32,
    pub min_days_at_risk: u32,
    pub risk_window_start: i32,
    pub start_anchor: Anchor,
    pub risk_window_end: i32,
    pub end_anchor: Anchor,
    pub censor_at_new_risk_window: bool,
}

impl Default for PopulationArgs {
    fn default() -> Self {
        Self {
            first_exposure_only: false,
            restrict_to_common_period: false,
            washout_period: 0,
            remove_duplicate_subjects: DuplicateSubjects::Keep,
            remove_subjects_with_prior_outcome: true,
            prior_outcome_lookback: 99999,
            min_days_at_risk: 1,
            risk_window_start: 0,
            start_anchor: Anchor::CohortStart,
            risk_window_end: 0,
            end_anchor: Anchor::CohortEnd,
            censor_at_new_risk_window: false,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct CohortRestrictions {
    first_exposure_only: bool,
    restrict_to_common_period: bool,
    washout_period: u32,
    remove_duplicate_subjects: DuplicateSubjects,
}

#[derive(Serialize)]
pub(crate) struct OutcomeRestrictions {
    remove_subjects_with_prior_outcome: bool,
    prior_outcome_lookback: u32,
    min_days_at_risk: u32,
    risk_window_start: i32,
    start_anchor: Anchor,
    risk_window_end: i32,
    end_anchor: Anchor,
    censor_at_new_risk_window: bool,
}

impl PopulationArgs {
    /// The outcome-independent part of the arguments.
    pub(crate) fn cohort_restrictions(&self) -> CohortRestrictions {
        CohortRestrictions {
            first_exposure_only: self.first_exposure_only,
            restrict_to_common_period: self.restrict_to_common_period,
            washout_period: self.washout_period,
            remove_duplicate_subjects: self.remove_duplicate_subjects,
        }
    }

    /// The part of the arguments that only matters once an outcome is known.
    pub(crate) fn outcome_restrictions(&self) -> OutcomeRestrictions {
        OutcomeRestrictions {
            remove_subjects_with_prior_outcome: self.remove_subjects_with_prior_outcome,
            prior_outcome_lookback: self.prior_outcome_lookback,
            min_days_at_risk: self.min_days_at_risk,
            risk_window_start: self.risk_window_start,
            start_anchor: self.start_anchor,
            risk_window_end: self.risk_window_end,
            end_anchor: self.end_anchor,
            censor_at_new_risk_window: self.censor_at_new_risk_window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PriorType {
    #[default]
    Laplace,
    Normal,
    None,
}

/// Regularization settings handed to the regression collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Regularization {
    pub prior: PriorType,
    pub variance: f64,
    pub use_cross_validation: bool,
    pub folds: u32,
    pub max_iterations: u32,
    pub tolerance: f64,
}

impl Default for Regularization {
    fn default() -> Self {
        Self {
            prior: PriorType::Laplace,
            variance: 1.0,
            use_cross_validation: true,
            folds: 10,
            max_iterations: 1000,
            tolerance: 2e-7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PropensityArgs {
    /// Maximum number of subjects sampled for fitting, `0` for no limit.
    pub max_cohort_size_for_fitting: u32,
    pub error_on_high_correlation: bool,
    pub stop_on_error: bool,
    pub excluded_covariate_ids: BTreeSet<i64>,
    pub included_covariate_ids: BTreeSet<i64>,
    pub regularization: Regularization,
}

impl Default for PropensityArgs {
    fn default() -> Self {
        Self {
            max_cohort_size_for_fitting: 250_000,
            error_on_high_correlation: true,
            stop_on_error: true,
            excluded_covariate_ids: BTreeSet::new(),
            included_covariate_ids: BTreeSet::new(),
            regularization: Regularization::default(),
        }
    }
}

/// Trimming of subjects in the tails of the propensity score distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "method")]
pub enum TrimArgs {
    /// Remove this fraction from each tail.
    ByPs { trim_fraction: f64 },
    /// Keep subjects whose preference score lies within the bounds.
    ToEquipoise { lower: f64, upper: f64 },
    /// Remove subjects whose inverse probability of treatment weight exceeds the maximum.
    ByIptw { max_weight: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum CaliperScale {
    PropensityScore,
    #[default]
    StandardizedLogit,
    Standardized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum BaseSelection {
    #[default]
    All,
    Target,
    Comparator,
}

/// Matching or stratification on the propensity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "method")]
pub enum StratificationArgs {
    MatchOnPs {
        caliper: f64,
        caliper_scale: CaliperScale,
        /// Maximum number of comparators per target, `0` for no limit.
        max_ratio: u32,
        allow_reverse_match: bool,
    },
    MatchOnPsAndCovariates {
        caliper: f64,
        caliper_scale: CaliperScale,
        max_ratio: u32,
        covariate_ids: BTreeSet<i64>,
    },
    StratifyByPs {
        number_of_strata: u32,
        base_selection: BaseSelection,
    },
    StratifyByPsAndCovariates {
        number_of_strata: u32,
        base_selection: BaseSelection,
        covariate_ids: BTreeSet<i64>,
    },
}

impl StratificationArgs {
    pub fn match_on_ps(caliper: f64, max_ratio: u32) -> Self {
        StratificationArgs::MatchOnPs {
            caliper,
            caliper_scale: CaliperScale::StandardizedLogit,
            max_ratio,
            allow_reverse_match: false,
        }
    }

    pub fn stratify_by_ps(number_of_strata: u32) -> Self {
        StratificationArgs::StratifyByPs {
            number_of_strata,
            base_selection: BaseSelection::All,
        }
    }
}

/// Arguments for covariate balance computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BalanceArgs {
    pub subgroup_covariate_id: Option<i64>,
    /// Maximum number of subjects sampled per cohort, `0` for no limit.
    pub max_cohort_size: u32,
    /// Restrict the computation to these covariates; all covariates when empty.
    pub covariate_filter: BTreeSet<i64>,
}

impl Default for BalanceArgs {
    fn default() -> Self {
        Self {
            subgroup_covariate_id: None,
            max_cohort_size: 250_000,
            covariate_filter: BTreeSet::new(),
        }
    }
}

/// Which outcomes get a per-outcome balance computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum BalanceScope {
    #[default]
    OutcomesOfInterest,
    AllOutcomes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeBalance {
    pub args: BalanceArgs,
    pub scope: BalanceScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ModelType {
    #[default]
    Cox,
    Logistic,
    Poisson,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutcomeModelArgs {
    pub model_type: ModelType,
    /// Condition on the matched sets or strata.
    pub stratified: bool,
    pub use_covariates: bool,
    pub inverse_pt_weighting: bool,
    pub interaction_covariate_ids: BTreeSet<i64>,
    pub excluded_covariate_ids: BTreeSet<i64>,
    pub included_covariate_ids: BTreeSet<i64>,
    pub regularization: Regularization,
}

impl Default for OutcomeModelArgs {
    fn default() -> Self {
        Self {
            model_type: ModelType::Cox,
            stratified: false,
            use_covariates: false,
            inverse_pt_weighting: false,
            interaction_covariate_ids: BTreeSet::new(),
            excluded_covariate_ids: BTreeSet::new(),
            included_covariate_ids: BTreeSet::new(),
            regularization: Regularization::default(),
        }
    }
}

/// An immutable analysis specification: one set of arguments for every stage of
/// the cohort method, identified by a user-supplied ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmAnalysis {
    analysis_id: AnalysisId,
    description: String,
    extraction: ExtractionArgs,
    population: PopulationArgs,
    #[serde(default)]
    propensity: Option<PropensityArgs>,
    #[serde(default)]
    trim: Option<TrimArgs>,
    #[serde(default)]
    stratification: Option<StratificationArgs>,
    #[serde(default)]
    shared_balance: Option<BalanceArgs>,
    #[serde(default)]
    balance: Option<OutcomeBalance>,
    #[serde(default)]
    outcome_model: Option<OutcomeModelArgs>,
}

impl CmAnalysis {
    pub fn builder(analysis_id: AnalysisId, description: impl Into<String>) -> CmAnalysisBuilder {
        CmAnalysisBuilder {
            analysis_id,
            description: description.into(),
            extraction: None,
            population: None,
            propensity: None,
            trim: None,
            stratification: None,
            shared_balance: None,
            balance: None,
            outcome_model: None,
        }
    }

    pub fn analysis_id(&self) -> AnalysisId {
        self.analysis_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn extraction(&self) -> &ExtractionArgs {
        &self.extraction
    }

    pub fn population(&self) -> &PopulationArgs {
        &self.population
    }

    pub fn propensity(&self) -> Option<&PropensityArgs> {
        self.propensity.as_ref()
    }

    pub fn trim(&self) -> Option<&TrimArgs> {
        self.trim.as_ref()
    }

    pub fn stratification(&self) -> Option<&StratificationArgs> {
        self.stratification.as_ref()
    }

    pub fn shared_balance(&self) -> Option<&BalanceArgs> {
        self.shared_balance.as_ref()
    }

    pub fn balance(&self) -> Option<&OutcomeBalance> {
        self.balance.as_ref()
    }

    pub fn outcome_model(&self) -> Option<&OutcomeModelArgs> {
        self.outcome_model.as_ref()
    }

    /// Whether trimming, matching or stratification is configured.
    pub fn is_adjusted(&self) -> bool {
        self.trim.is_some() || self.stratification.is_some()
    }

    /// Checks that every configured stage has the upstream stages it needs and
    /// that numeric arguments are in range.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let id = self.analysis_id;

        let missing = |stage, requires| ConfigurationError::MissingUpstream {
            analysis_id: id,
            stage,
            requires,
        };
        let invalid = |stage, reason: String| ConfigurationError::InvalidArguments {
            analysis_id: id,
            stage,
            reason,
        };

        if let Some(trim) = &self.trim {
            if self.propensity.is_none() {
                return Err(missing("trimming", "a propensity model"));
            }

            match *trim {
                TrimArgs::ByPs { trim_fraction } if !(0.0..0.5).contains(&trim_fraction) => {
                    return Err(invalid(
                        "trimming",
                        format!("trim fraction {trim_fraction} is outside [0, 0.5)"),
                    ));
                }
                TrimArgs::ToEquipoise { lower, upper }
                    if !(0.0 <= lower && lower < upper && upper <= 1.0) =>
                {
                    return Err(invalid(
                        "trimming",
                        format!("equipoise bounds [{lower}, {upper}] are not within [0, 1]"),
                    ));
                }
                TrimArgs::ByIptw { max_weight } if !(max_weight > 0.0) => {
                    return Err(invalid(
                        "trimming",
                        format!("maximum weight {max_weight} must be positive"),
                    ));
                }
                _ => {}
            }
        }

        if let Some(stratification) = &self.stratification {
            let stage = match stratification {
                StratificationArgs::MatchOnPs { .. }
                | StratificationArgs::MatchOnPsAndCovariates { .. } => "matching",
                StratificationArgs::StratifyByPs { .. }
                | StratificationArgs::StratifyByPsAndCovariates { .. } => "stratification",
            };

            if self.propensity.is_none() {
                return Err(missing(stage, "a propensity model"));
            }

            match *stratification {
                StratificationArgs::MatchOnPs { caliper, .. }
                | StratificationArgs::MatchOnPsAndCovariates { caliper, .. }
                    if !(caliper >= 0.0) =>
                {
                    return Err(invalid(
                        stage,
                        format!("caliper {caliper} is not a non-negative number"),
                    ));
                }
                StratificationArgs::StratifyByPs {
                    number_of_strata, ..
                }
                | StratificationArgs::StratifyByPsAndCovariates {
                    number_of_strata, ..
                } if number_of_strata < 2 => {
                    return Err(invalid(
                        stage,
                        format!("{number_of_strata} strata, at least 2 are needed"),
                    ));
                }
                _ => {}
            }
        }

        if self.shared_balance.is_some() && !self.is_adjusted() {
            return Err(missing("shared balance", "trimming, matching or stratification"));
        }

        if self.balance.is_some() && !self.is_adjusted() {
            return Err(missing("balance", "trimming, matching or stratification"));
        }

        if let Some(model) = &self.outcome_model {
            if model.stratified && self.stratification.is_none() {
                return Err(missing("stratified outcome model", "matching or stratification"));
            }

            if model.inverse_pt_weighting && self.propensity.is_none() {
                return Err(missing("weighted outcome model", "a propensity model"));
            }

            if !model.interaction_covariate_ids.is_empty() && !model.use_covariates {
                return Err(invalid(
                    "outcome model",
                    "interaction terms require use_covariates".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Builder for [`CmAnalysis`]. Extraction and population arguments are required.
#[derive(Debug, Clone)]
pub struct CmAnalysisBuilder {
    analysis_id: AnalysisId,
    description: String,
    extraction: Option<ExtractionArgs>,
    population: Option<PopulationArgs>,
    propensity: Option<PropensityArgs>,
    trim: Option<TrimArgs>,
    stratification: Option<StratificationArgs>,
    shared_balance: Option<BalanceArgs>,
    balance: Option<OutcomeBalance>,
    outcome_model: Option<OutcomeModelArgs>,
}

impl CmAnalysisBuilder {
    pub fn extraction(mut self, args: ExtractionArgs) -> Self {
        self.extraction = Some(args);
        self
    }

    pub fn population(mut self, args: PopulationArgs) -> Self {
        self.population = Some(args);
        self
    }

    pub fn propensity(mut self, args: PropensityArgs) -> Self {
        self.propensity = Some(args);
        self
    }

    pub fn trim(mut self, args: TrimArgs) -> Self {
        self.trim = Some(args);
        self
    }

    pub fn stratification(mut self, args: StratificationArgs) -> Self {
        self.stratification = Some(args);
        self
    }

    /// Balance over all covariates, computed once per target-comparator pair.
    pub fn shared_balance(mut self, args: BalanceArgs) -> Self {
        self.shared_balance = Some(args);
        self
    }

    /// Balance computed separately for every outcome in `scope`.
    pub fn balance(mut self, args: BalanceArgs, scope: BalanceScope) -> Self {
        self.balance = Some(OutcomeBalance { args, scope });
        self
    }

    pub fn outcome_model(mut self, args: OutcomeModelArgs) -> Self {
        self.outcome_model = Some(args);
        self
    }

    pub fn build(self) -> Result<CmAnalysis, ConfigurationError> {
        let analysis_id = self.analysis_id;
        let required = |stage| ConfigurationError::MissingStage { analysis_id, stage };

        let analysis = CmAnalysis {
            extraction: self.extraction.ok_or_else(|| required("extraction"))?,
            population: self.population.ok_or_else(|| required("population"))?,
            analysis_id,
            description: self.description,
            propensity: self.propensity,
            trim: self.trim,
            stratification: self.stratification,
            shared_balance: self.shared_balance,
            balance: self.balance,
            outcome_model: self.outcome_model,
        };

        analysis.validate()?;
        Ok(analysis)
    }
}

pub(crate) fn write_json<T: Serialize + ?Sized>(
    path: &Utf8Path,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_owned(),
        source,
    })?;

    crate::io::atomic_write(path, &json)
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Utf8Path) -> Result<T, StoreError> {
    let data = fs::read(path).map_err(StoreError::io(path))?;

    serde_json::from_slice(&data).map_err(|source| StoreError::Json {
        path: path.to_owned(),
        source,
    })
}

/// Writes a list of analyses as pretty-printed JSON.
pub fn save_analyses(
    path: impl AsRef<Utf8Path>,
    analyses: &[CmAnalysis],
) -> Result<(), StoreError> {
    write_json(path.as_ref(), analyses)
}

/// Loads and validates a list of analyses written by [`save_analyses`].
pub fn load_analyses(path: impl AsRef<Utf8Path>) -> Result<Vec<CmAnalysis>, StudyError> {
    let analyses: Vec<CmAnalysis> = read_json(path.as_ref())?;

    for analysis in &analyses {
        analysis.validate()?;
    }

    Ok(analyses)
}

/// Every analysis ID must be used once.
pub(crate) fn check_unique_ids(analyses: &[CmAnalysis]) -> Result<(), DuplicateIdError> {
    let mut seen = BTreeSet::new();

    for analysis in analyses {
        if !seen.insert(analysis.analysis_id) {
            return Err(DuplicateIdError::Analysis(analysis.analysis_id));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(id: AnalysisId) -> CmAnalysisBuilder {
        CmAnalysis::builder(id, "test")
            .extraction(ExtractionArgs::default())
            .population(PopulationArgs::default())
    }

    #[test]
    fn test_requires_extraction() {
        let err = CmAnalysis::builder(1, "no data")
            .population(PopulationArgs::default())
            .build()
            .unwrap_err();

        assert!(matches!(
            err,
            ConfigurationError::MissingStage {
                stage: "extraction",
                ..
            }
        ));
    }

    #[test]
    fn test_stratify_without_propensity() {
        let err = base(1)
            .stratification(StratificationArgs::StratifyByPsAndCovariates {
                number_of_strata: 5,
                base_selection: BaseSelection::All,
                covariate_ids: BTreeSet::from([1002]),
            })
            .build()
            .unwrap_err();

        assert!(matches!(
            err,
            ConfigurationError::MissingUpstream {
                stage: "stratification",
                ..
            }
        ));
    }

    #[test]
    fn test_stratified_model_without_strata() {
        let err = base(1)
            .propensity(PropensityArgs::default())
            .outcome_model(OutcomeModelArgs {
                stratified: true,
                ..Default::default()
            })
            .build()
            .unwrap_err();

        assert!(matches!(err, ConfigurationError::MissingUpstream { .. }));
    }

    #[test]
    fn test_balance_needs_adjustment() {
        let err = base(1)
            .propensity(PropensityArgs::default())
            .shared_balance(BalanceArgs::default())
            .build()
            .unwrap_err();

        assert!(matches!(err, ConfigurationError::MissingUpstream { .. }));
    }

    #[test]
    fn test_invalid_trim_fraction() {
        let err = base(1)
            .propensity(PropensityArgs::default())
            .trim(TrimArgs::ByPs { trim_fraction: 0.7 })
            .build()
            .unwrap_err();

        assert!(matches!(err, ConfigurationError::InvalidArguments { .. }));
    }

    #[test]
    fn test_nan_arguments() {
        let err = base(1)
            .propensity(PropensityArgs::default())
            .stratification(StratificationArgs::match_on_ps(f64::NAN, 1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidArguments { .. }));

        let err = base(1)
            .propensity(PropensityArgs::default())
            .trim(TrimArgs::ByIptw {
                max_weight: f64::NAN,
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidArguments { .. }));
    }

    #[test]
    fn test_full_analysis() {
        let analysis = base(3)
            .propensity(PropensityArgs::default())
            .trim(TrimArgs::ToEquipoise {
                lower: 0.25,
                upper: 0.75,
            })
            .stratification(StratificationArgs::match_on_ps(0.2, 1))
            .shared_balance(BalanceArgs::default())
            .balance(BalanceArgs::default(), BalanceScope::OutcomesOfInterest)
            .outcome_model(OutcomeModelArgs {
                stratified: true,
                ..Default::default()
            })
            .build()
            .unwrap();

        assert_eq!(analysis.analysis_id(), 3);
        assert!(analysis.is_adjusted());
    }

    #[test]
    fn test_json_keeps_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("analyses.json");

        let analyses = vec![
            base(1).build().unwrap(),
            base(2)
                .propensity(PropensityArgs::default())
                .stratification(StratificationArgs::stratify_by_ps(5))
                .outcome_model(OutcomeModelArgs::default())
                .build()
                .unwrap(),
        ];

        save_analyses(&path, &analyses).unwrap();
        let loaded = load_analyses(&path).unwrap();

        assert_eq!(loaded, analyses);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("analyses.json");

        let json = serde_json::json!([{
            "analysisId": 1,
            "description": "broken",
            "extraction": {},
            "population": {},
            "trim": { "method": "byPs", "trimFraction": 0.05 }
        }]);
        fs::write(&path, json.to_string()).unwrap();

        assert!(matches!(
            load_analyses(&path),
            Err(StudyError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_ids() {
        let analyses = vec![base(1).build().unwrap(), base(1).build().unwrap()];
        assert!(check_unique_ids(&analyses).is_err());
    }
}
