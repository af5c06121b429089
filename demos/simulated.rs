use std::collections::BTreeMap;

use anyhow::bail;
use cohort_method::{
    AdjustmentRequest, BalanceArgs, BalanceScope, CmAnalysis, CohortId, Collaborator,
    ExtractionArgs, ExtractionRequest, FitStatus, Outcome, OutcomeModel, OutcomeModelArgs,
    OutcomeModelRequest, PopulationArgs, PropensityArgs, PropensityRequest, StratificationArgs,
    StudyConfig, TargetComparatorOutcomes, TrimArgs, summary,
};
use serde::{Deserialize, Serialize};

/// This example runs a small study against simulated data.
///
/// Every cohort pair gets a few thousand synthetic subjects with one confounder.
/// Outcome `201` has a true hazard ratio of 2, the negative controls have none.
/// Running the example twice shows that the second run only reads the store.
///
/// Topology per target-comparator pair:
///        [CmData]
///           |
///       [StudyPop]
///           |
///          [Ps] ---------- [SharedBalance]
///         /    \
///   [StratPop]  [Om] (negative controls)
///       |   \
///  [Balance] [Om]

#[derive(Clone, Serialize, Deserialize)]
struct Subject {
    treated: bool,
    confounder: f64,
    days: u32,
    /// Day of the first event, per outcome.
    events: BTreeMap<CohortId, u32>,
}

#[derive(Serialize, Deserialize)]
struct CohortData {
    subjects: Vec<Subject>,
}

#[derive(Serialize, Deserialize)]
struct Population {
    /// Indices into [`CohortData::subjects`].
    subjects: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct Scores {
    /// (subject, propensity score), aligned with [`Population::subjects`].
    scores: Vec<(usize, f64)>,
}

#[derive(Serialize, Deserialize)]
struct Strata {
    /// (subject, stratum)
    members: Vec<(usize, u32)>,
}

#[derive(Serialize, Deserialize)]
struct Balance {
    before: f64,
    after: f64,
}

/// Deterministic xorshift generator.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> f64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

struct Simulation {
    subjects_per_pair: usize,
    /// True hazard ratios; outcomes not listed have none.
    effects: BTreeMap<CohortId, f64>,
}

impl Simulation {
    fn mean_confounder(data: &CohortData, members: impl Iterator<Item = usize>) -> (f64, f64) {
        let (mut t, mut nt, mut c, mut nc): (f64, f64, f64, f64) = (0.0, 0.0, 0.0, 0.0);

        for i in members {
            let subject = &data.subjects[i];
            if subject.treated {
                t += subject.confounder;
                nt += 1.0;
            } else {
                c += subject.confounder;
                nc += 1.0;
            }
        }

        (t / nt.max(1.0), c / nc.max(1.0))
    }
}

impl Collaborator for Simulation {
    type CohortData = CohortData;
    type Population = Population;
    type Propensity = Scores;
    type Adjusted = Strata;
    type Balance = Balance;

    fn extract(&self, request: &ExtractionRequest<'_>) -> anyhow::Result<CohortData> {
        let seed = (request.target_id as u64) << 20 ^ request.comparator_id as u64;
        let mut rng = Rng(0x9E37_79B9 ^ seed);

        let subjects = (0..self.subjects_per_pair)
            .map(|_| {
                let confounder = rng.next() * 2.0 - 1.0;
                let treated = rng.next() < logistic(confounder);
                let days = 30 + (rng.next() * 700.0) as u32;

                let mut events = BTreeMap::new();
                for &outcome_id in request.outcome_ids {
                    let effect = self.effects.get(&outcome_id).copied().unwrap_or(1.0);
                    let rate = 0.0004 * (1.0 + confounder).exp();
                    let rate = if treated { rate * effect } else { rate };
                    let day = (-rng.next().ln() / rate) as u32;
                    if day < days {
                        events.insert(outcome_id, day);
                    }
                }

                Subject {
                    treated,
                    confounder,
                    days,
                    events,
                }
            })
            .collect();

        Ok(CohortData { subjects })
    }

    fn define_population(
        &self,
        data: &CohortData,
        args: &PopulationArgs,
    ) -> anyhow::Result<Population> {
        let subjects = (0..data.subjects.len())
            .filter(|&i| data.subjects[i].days > args.washout_period)
            .collect();

        Ok(Population { subjects })
    }

    fn fit_propensity(
        &self,
        data: &CohortData,
        population: &Population,
        _: &PropensityRequest<'_>,
    ) -> anyhow::Result<Scores> {
        let (t, c) = Self::mean_confounder(data, population.subjects.iter().copied());

        let scores = population
            .subjects
            .iter()
            .map(|&i| (i, logistic((t - c) * 2.0 * data.subjects[i].confounder)))
            .collect();

        Ok(Scores { scores })
    }

    fn adjust_population(
        &self,
        data: &CohortData,
        _: &Population,
        propensity: Option<&Scores>,
        request: &AdjustmentRequest<'_>,
    ) -> anyhow::Result<Strata> {
        let Some(propensity) = propensity else {
            bail!("adjustment needs propensity scores");
        };

        let mut scores: Vec<(usize, f64)> = propensity
            .scores
            .iter()
            .copied()
            .filter(|(i, _)| {
                request
                    .outcome_id
                    .is_none_or(|o| !data.subjects[*i].events.get(&o).is_some_and(|&d| d == 0))
            })
            .collect();

        if let Some(TrimArgs::ByPs { trim_fraction }) = request.trim {
            let cut = (scores.len() as f64 * trim_fraction) as usize;
            scores.sort_by(|a, b| a.1.total_cmp(&b.1));
            scores.drain(..cut.min(scores.len()));
            let keep = scores.len().saturating_sub(cut);
            scores.truncate(keep);
        }

        let strata = match request.stratification {
            Some(StratificationArgs::StratifyByPs {
                number_of_strata, ..
            }) => {
                scores.sort_by(|a, b| a.1.total_cmp(&b.1));
                let per = scores.len().div_ceil(*number_of_strata as usize).max(1);
                scores
                    .iter()
                    .enumerate()
                    .map(|(rank, &(i, _))| (i, (rank / per) as u32))
                    .collect()
            }
            _ => {
                // greedy 1-on-1 matching on the score
                scores.sort_by(|a, b| a.1.total_cmp(&b.1));
                let mut members = Vec::new();
                let mut open: Option<(usize, bool)> = None;
                for &(i, _) in &scores {
                    let treated = data.subjects[i].treated;
                    match open {
                        Some((j, t)) if t != treated => {
                            let stratum = members.len() as u32 / 2;
                            members.push((j, stratum));
                            members.push((i, stratum));
                            open = None;
                        }
                        _ => open = Some((i, treated)),
                    }
                }
                members
            }
        };

        Ok(Strata { members: strata })
    }

    fn compute_balance(
        &self,
        data: &CohortData,
        adjusted: &Strata,
        _: &BalanceArgs,
    ) -> anyhow::Result<Balance> {
        let (t0, c0) = Self::mean_confounder(data, 0..data.subjects.len());
        let (t1, c1) = Self::mean_confounder(data, adjusted.members.iter().map(|&(i, _)| i));

        Ok(Balance {
            before: t0 - c0,
            after: t1 - c1,
        })
    }

    fn fit_outcome_model(
        &self,
        data: &CohortData,
        adjusted: &Strata,
        request: &OutcomeModelRequest<'_>,
    ) -> anyhow::Result<OutcomeModel> {
        let mut model = OutcomeModel {
            status: FitStatus::Ok,
            log_rr: None,
            se_log_rr: None,
            log_lb95: None,
            log_ub95: None,
            target_subjects: 0,
            comparator_subjects: 0,
            target_days: 0,
            comparator_days: 0,
            target_outcomes: 0,
            comparator_outcomes: 0,
        };

        for &(i, _) in &adjusted.members {
            let subject = &data.subjects[i];
            let event = subject.events.get(&request.outcome_id);
            let days = event.copied().unwrap_or(subject.days) as u64;

            if subject.treated {
                model.target_subjects += 1;
                model.target_days += days;
                model.target_outcomes += event.is_some() as u64;
            } else {
                model.comparator_subjects += 1;
                model.comparator_days += days;
                model.comparator_outcomes += event.is_some() as u64;
            }
        }

        if model.target_outcomes == 0 || model.comparator_outcomes == 0 {
            model.status = FitStatus::Skipped;
            return Ok(model);
        }

        let rate = |outcomes: u64, days: u64| outcomes as f64 / days as f64;
        model.log_rr = Some(
            (rate(model.target_outcomes, model.target_days)
                / rate(model.comparator_outcomes, model.comparator_days))
            .ln(),
        );
        model.se_log_rr = Some(
            (1.0 / model.target_outcomes as f64 + 1.0 / model.comparator_outcomes as f64).sqrt(),
        );

        Ok(model)
    }
}

fn main() -> anyhow::Result<()> {
    #[cfg(feature = "logging")]
    cohort_method::init_logging()?;

    let base = |id, description| {
        CmAnalysis::builder(id, description)
            .extraction(ExtractionArgs::default())
            .population(PopulationArgs {
                washout_period: 60,
                ..Default::default()
            })
            .propensity(PropensityArgs::default())
    };

    let analyses = vec![
        base(1, "1-on-1 matching")
            .stratification(StratificationArgs::match_on_ps(0.2, 1))
            .shared_balance(BalanceArgs::default())
            .balance(BalanceArgs::default(), BalanceScope::OutcomesOfInterest)
            .outcome_model(OutcomeModelArgs {
                stratified: true,
                ..Default::default()
            })
            .build()?,
        base(2, "Stratification on the PS, trimmed")
            .trim(TrimArgs::ByPs {
                trim_fraction: 0.05,
            })
            .stratification(StratificationArgs::stratify_by_ps(5))
            .outcome_model(OutcomeModelArgs {
                stratified: true,
                ..Default::default()
            })
            .build()?,
    ];

    let outcomes = || {
        vec![
            Outcome {
                true_effect_size: Some(2.0),
                ..Outcome::of_interest(201)
            },
            Outcome {
                true_effect_size: Some(1.0),
                ..Outcome::negative_control(301)
            },
            Outcome {
                true_effect_size: Some(1.0),
                ..Outcome::negative_control(302)
            },
        ]
    };

    let study = StudyConfig::new("target/demo-study")
        .analyses(analyses)
        .hypothesis(TargetComparatorOutcomes::new(101, 102, outcomes()))
        .hypothesis(TargetComparatorOutcomes::new(103, 102, outcomes()))
        .finish()?;

    println!("{}", study);

    let run = study.run(&Simulation {
        subjects_per_pair: 4000,
        effects: BTreeMap::from([(201, 2.0)]),
    })?;

    println!(
        "{} computed, {} cached, {} failed, {} skipped",
        run.report.computed(),
        run.report.cached(),
        run.report.failed(),
        run.report.skipped()
    );

    for result in summary::summarize(&run.table, study.store())? {
        match result.estimate {
            Some(estimate) => println!(
                "analysis {} t{} c{} o{}: HR {:.2} ({:.2}-{:.2}), p = {:.3}, true {:?}",
                result.analysis_id,
                result.target_id,
                result.comparator_id,
                result.outcome_id,
                estimate.rr,
                estimate.ci95_lb,
                estimate.ci95_ub,
                estimate.p,
                result.true_effect_size,
            ),
            None => println!(
                "analysis {} t{} c{} o{}: {:?}",
                result.analysis_id,
                result.target_id,
                result.comparator_id,
                result.outcome_id,
                result.status
            ),
        }
    }

    Ok(())
}
