//! Effect estimates, one row per reference row.

use serde::{Deserialize, Serialize};

use crate::collaborator::{FitStatus, OutcomeModel};
use crate::core::{AnalysisId, CohortId, StageKind};
use crate::error::StoreError;
use crate::reference::{ReferenceRow, ReferenceTable};
use crate::store::ArtifactStore;

const Z_95: f64 = 1.959_963_984_540_054;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Estimate {
    pub rr: f64,
    pub ci95_lb: f64,
    pub ci95_ub: f64,
    /// Two-sided p-value against the null of no effect.
    pub p: f64,
    pub log_rr: f64,
    pub se_log_rr: f64,
}

impl Estimate {
    fn from_model(model: &OutcomeModel) -> Option<Self> {
        if model.status != FitStatus::Ok {
            return None;
        }

        let log_rr = model.log_rr?;
        let se_log_rr = model.se_log_rr?;

        let (log_lb, log_ub) = match (model.log_lb95, model.log_ub95) {
            (Some(lb), Some(ub)) => (lb, ub),
            _ => (log_rr - Z_95 * se_log_rr, log_rr + Z_95 * se_log_rr),
        };

        let p = if se_log_rr > 0.0 {
            erfc((log_rr / se_log_rr).abs() / std::f64::consts::SQRT_2)
        } else {
            f64::NAN
        };

        Some(Self {
            rr: log_rr.exp(),
            ci95_lb: log_lb.exp(),
            ci95_ub: log_ub.exp(),
            p,
            log_rr,
            se_log_rr,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub analysis_id: AnalysisId,
    pub target_id: CohortId,
    pub comparator_id: CohortId,
    pub outcome_id: CohortId,
    pub outcome_of_interest: bool,
    pub true_effect_size: Option<f64>,
    /// `None` when no outcome model was committed for the row.
    pub status: Option<FitStatus>,
    pub estimate: Option<Estimate>,
    pub target_subjects: u64,
    pub comparator_subjects: u64,
    pub target_days: u64,
    pub comparator_days: u64,
    pub target_outcomes: u64,
    pub comparator_outcomes: u64,
}

impl ResultRow {
    fn new(row: &ReferenceRow, model: Option<&OutcomeModel>) -> Self {
        let count = |f: fn(&OutcomeModel) -> u64| model.map_or(0, f);

        Self {
            analysis_id: row.analysis_id,
            target_id: row.target_id,
            comparator_id: row.comparator_id,
            outcome_id: row.outcome_id,
            outcome_of_interest: row.outcome_of_interest,
            true_effect_size: row.true_effect_size,
            status: model.map(|m| m.status),
            estimate: model.and_then(Estimate::from_model),
            target_subjects: count(|m| m.target_subjects),
            comparator_subjects: count(|m| m.comparator_subjects),
            target_days: count(|m| m.target_days),
            comparator_days: count(|m| m.comparator_days),
            target_outcomes: count(|m| m.target_outcomes),
            comparator_outcomes: count(|m| m.comparator_outcomes),
        }
    }
}

/// Reads every committed outcome model referenced by `table`.
///
/// Rows without an outcome model, or whose model is not in the store yet, are
/// reported with empty estimates.
pub fn summarize(
    table: &ReferenceTable,
    store: &ArtifactStore,
) -> Result<Vec<ResultRow>, StoreError> {
    table
        .rows()
        .iter()
        .map(|row| {
            let model = match row.artifact(StageKind::OutcomeModel) {
                Some(id) if store.has(&id) => Some(store.get::<OutcomeModel>(&id)?),
                _ => None,
            };

            Ok::<_, StoreError>(ResultRow::new(row, model.as_ref()))
        })
        .collect()
}

/// Complementary error function, with a fractional error below 1.2e-7.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);

    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));

    let r = t * poly.exp();

    if x >= 0.0 { r } else { 2.0 - r }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecutionSettings, planner, runner};
    use crate::testing::{MockCollaborator, scenario, temp_store};

    fn model(log_rr: f64, se: f64) -> OutcomeModel {
        OutcomeModel {
            status: FitStatus::Ok,
            log_rr: Some(log_rr),
            se_log_rr: Some(se),
            log_lb95: None,
            log_ub95: None,
            target_subjects: 100,
            comparator_subjects: 120,
            target_days: 36500,
            comparator_days: 43800,
            target_outcomes: 12,
            comparator_outcomes: 9,
        }
    }

    #[test]
    fn test_erfc() {
        assert!((erfc(0.0) - 1.0).abs() < 1e-7);
        assert!((erfc(1.0) - 0.157_299_207).abs() < 1e-6);
        assert!((erfc(-1.0) - 1.842_700_793).abs() < 1e-6);
    }

    #[test]
    fn test_estimate() {
        let estimate = Estimate::from_model(&model(Z_95 * 0.5, 0.5)).unwrap();

        assert!((estimate.p - 0.05).abs() < 1e-5);
        assert!((estimate.ci95_lb - 1.0).abs() < 1e-9);
        assert!((estimate.rr - (Z_95 * 0.5).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_profile_interval_wins() {
        let mut m = model(0.2, 0.1);
        m.log_lb95 = Some(0.01);
        m.log_ub95 = Some(0.5);

        let estimate = Estimate::from_model(&m).unwrap();
        assert_eq!(estimate.ci95_lb, 0.01f64.exp());
        assert_eq!(estimate.ci95_ub, 0.5f64.exp());
    }

    #[test]
    fn test_failed_fit_has_no_estimate() {
        let mut m = model(0.2, 0.1);
        m.status = FitStatus::NoConvergence;
        assert!(Estimate::from_model(&m).is_none());
    }

    #[test]
    fn test_summarize() {
        let (_dir, store) = temp_store();
        let (analyses, hypotheses) = scenario();
        let plan = planner::plan(&analyses, &hypotheses, &[]).unwrap();
        let table = plan.reference_table();

        let before = summarize(&table, &store).unwrap();
        assert!(before.iter().all(|row| row.estimate.is_none()));

        let collab = MockCollaborator::default().failing(StageKind::OutcomeModel, Some(5));
        runner::run(&plan, &store, &collab, &ExecutionSettings::new(2)).unwrap();

        let results = summarize(&table, &store).unwrap();
        assert_eq!(results.len(), 6);

        for result in results {
            if result.outcome_id == 5 {
                assert!(result.status.is_none());
            } else {
                let estimate = result.estimate.unwrap();
                assert!(estimate.ci95_lb < estimate.rr && estimate.rr < estimate.ci95_ub);
                assert!(result.target_subjects > 0);
            }
        }
    }
}
