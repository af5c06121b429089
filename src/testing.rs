//! A deterministic collaborator and fixtures for exercising the engine without
//! a database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::bail;
use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::args::{
    BalanceArgs, CmAnalysis, ExtractionArgs, OutcomeModelArgs, PopulationArgs, PropensityArgs,
    StratificationArgs,
};
use crate::collaborator::{
    AdjustmentRequest, Collaborator, ExtractionRequest, FitStatus, OutcomeModel,
    OutcomeModelRequest, PropensityRequest,
};
use crate::core::{CohortId, StageKind};
use crate::hypothesis::{Outcome, TargetComparatorOutcomes};
use crate::store::ArtifactStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Cohorts {
    pub target_id: CohortId,
    pub comparator_id: CohortId,
    pub outcome_ids: BTreeSet<CohortId>,
    pub subjects: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Population {
    pub target: u64,
    pub comparator: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Adjusted {
    pub outcome_id: Option<CohortId>,
    pub target: u64,
    pub comparator: u64,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Error,
    Panic,
}

/// Counts calls per stage and fails or panics on request.
///
/// A fault is keyed by stage and an optional cohort: the target cohort for
/// extraction, the outcome for outcome-specific calls. `None` matches every
/// call of that stage.
#[derive(Debug, Default)]
pub(crate) struct MockCollaborator {
    calls: Mutex<BTreeMap<StageKind, usize>>,
    /// (in flight, peak) per stage
    running: Mutex<BTreeMap<StageKind, (usize, usize)>>,
    delay: Option<Duration>,
    faults: Vec<(StageKind, Option<CohortId>, Fault)>,
}

/// Marks one call as in flight until dropped.
pub(crate) struct Running<'a> {
    mock: &'a MockCollaborator,
    stage: StageKind,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut running = self.mock.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((now, _)) = running.get_mut(&self.stage) {
            *now -= 1;
        }
    }
}

impl MockCollaborator {
    pub fn failing(mut self, stage: StageKind, key: Option<CohortId>) -> Self {
        self.faults.push((stage, key, Fault::Error));
        self
    }

    pub fn panicking(mut self, stage: StageKind, key: Option<CohortId>) -> Self {
        self.faults.push((stage, key, Fault::Panic));
        self
    }

    /// Holds every call for `delay`, so overlapping calls can be observed.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Most calls of `stage` that were ever in flight at once.
    pub fn peak(&self, stage: StageKind) -> usize {
        self.running.lock().unwrap().get(&stage).map_or(0, |&(_, peak)| peak)
    }

    pub fn calls(&self, stage: StageKind) -> usize {
        self.calls.lock().unwrap().get(&stage).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn enter(&self, stage: StageKind, key: Option<CohortId>) -> anyhow::Result<Running<'_>> {
        *self.calls.lock().unwrap().entry(stage).or_default() += 1;

        {
            let mut running = self.running.lock().unwrap();
            let (now, peak) = running.entry(stage).or_default();
            *now += 1;
            *peak = (*peak).max(*now);
        }
        let guard = Running { mock: self, stage };

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let fault = self
            .faults
            .iter()
            .find(|(s, k, _)| *s == stage && (k.is_none() || *k == key));

        match fault {
            Some((_, _, Fault::Error)) => bail!("{stage} failed for {key:?}"),
            Some((_, _, Fault::Panic)) => match key {
                Some(id) => panic!("{stage} blew up on outcome {id}"),
                None => panic!("{stage} blew up"),
            },
            None => Ok(guard),
        }
    }
}

impl Collaborator for MockCollaborator {
    type CohortData = Cohorts;
    type Population = Population;
    type Propensity = Vec<f64>;
    type Adjusted = Adjusted;
    type Balance = Vec<(i64, f64)>;

    fn extract(&self, request: &ExtractionRequest<'_>) -> anyhow::Result<Cohorts> {
        let _running = self.enter(StageKind::Extraction, Some(request.target_id))?;

        Ok(Cohorts {
            target_id: request.target_id,
            comparator_id: request.comparator_id,
            outcome_ids: request.outcome_ids.clone(),
            subjects: 1000 + request.target_id as u64 * 10 + request.comparator_id as u64,
        })
    }

    fn define_population(
        &self,
        data: &Cohorts,
        args: &PopulationArgs,
    ) -> anyhow::Result<Population> {
        let _running = self.enter(StageKind::StudyPopulation, None)?;

        let kept = data.subjects - u64::from(args.washout_period.min(100));
        Ok(Population {
            target: kept / 2,
            comparator: kept - kept / 2,
        })
    }

    fn fit_propensity(
        &self,
        _: &Cohorts,
        population: &Population,
        request: &PropensityRequest<'_>,
    ) -> anyhow::Result<Vec<f64>> {
        let _running = self.enter(StageKind::Propensity, None)?;

        let n = (population.target + population.comparator).min(16);
        let shift = request.excluded_covariate_ids.len() as f64 * 0.01;
        Ok((0..n).map(|i| (i as f64 + 0.5) / n as f64 - shift).collect())
    }

    fn adjust_population(
        &self,
        _: &Cohorts,
        population: &Population,
        propensity: Option<&Vec<f64>>,
        request: &AdjustmentRequest<'_>,
    ) -> anyhow::Result<Adjusted> {
        let _running = self.enter(StageKind::Adjustment, request.outcome_id)?;

        let trimmed = propensity.map_or(0, |scores| scores.len() as u64 / 8);
        let matched = population.target.min(population.comparator) - trimmed;
        Ok(Adjusted {
            outcome_id: request.outcome_id,
            target: matched,
            comparator: matched,
        })
    }

    fn compute_balance(
        &self,
        _: &Cohorts,
        adjusted: &Adjusted,
        args: &BalanceArgs,
    ) -> anyhow::Result<Vec<(i64, f64)>> {
        let _running = self.enter(StageKind::Balance, adjusted.outcome_id)?;

        Ok(args
            .covariate_filter
            .iter()
            .map(|&id| (id, 1.0 / adjusted.target as f64))
            .collect())
    }

    fn fit_outcome_model(
        &self,
        data: &Cohorts,
        adjusted: &Adjusted,
        request: &OutcomeModelRequest<'_>,
    ) -> anyhow::Result<OutcomeModel> {
        let _running = self.enter(StageKind::OutcomeModel, Some(request.outcome_id))?;

        if !data.outcome_ids.contains(&request.outcome_id) {
            bail!("outcome {} was not extracted", request.outcome_id);
        }

        let log_rr = (request.outcome_id as f64 - 3.0) / 10.0;
        let covariates = if request.args.use_covariates { 0.9 } else { 1.0 };
        Ok(OutcomeModel {
            status: FitStatus::Ok,
            log_rr: Some(log_rr),
            se_log_rr: Some(0.2 * covariates),
            log_lb95: None,
            log_ub95: None,
            target_subjects: adjusted.target,
            comparator_subjects: adjusted.comparator,
            target_days: adjusted.target * 365,
            comparator_days: adjusted.comparator * 365,
            target_outcomes: 10 + request.outcome_id as u64,
            comparator_outcomes: 10,
        })
    }
}

/// Two analyses sharing extraction, population and propensity model, differing
/// only in the outcome model, over one hypothesis with three outcomes.
pub(crate) fn scenario() -> (Vec<CmAnalysis>, Vec<TargetComparatorOutcomes>) {
    let analysis = |id, description, use_covariates| {
        CmAnalysis::builder(id, description)
            .extraction(ExtractionArgs::default())
            .population(PopulationArgs::default())
            .propensity(PropensityArgs::default())
            .stratification(StratificationArgs::match_on_ps(0.2, 1))
            .outcome_model(OutcomeModelArgs {
                use_covariates,
                ..Default::default()
            })
            .build()
            .unwrap()
    };

    let analyses = vec![
        analysis(1, "1-on-1 matching", false),
        analysis(2, "1-on-1 matching, adjusted for covariates", true),
    ];

    let hypotheses = vec![TargetComparatorOutcomes::new(
        1,
        2,
        vec![
            Outcome::of_interest(3),
            Outcome::negative_control(4),
            Outcome::negative_control(5),
        ],
    )];

    (analyses, hypotheses)
}

pub(crate) fn temp_store() -> (tempfile::TempDir, ArtifactStore) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap().join("study");
    let store = ArtifactStore::open(root).unwrap();
    (dir, store)
}
