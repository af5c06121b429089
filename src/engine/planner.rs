//! Derivation of the deduplicated task graph.
//!
//! For every stage the planner hashes a *projection* of the inputs: the
//! stage's own arguments and the fingerprints of the upstream tasks, and
//! nothing else. Analysis IDs and descriptions are never part of a projection,
//! so two analyses that only differ downstream of a stage share that stage.
//!
//! The fingerprint of the outcome-specific adjusted population is computed for
//! every outcome, whether or not that population is persisted. Outcome models
//! chain off that fingerprint, which keeps their identity independent of the
//! outcome-of-interest flag.

use std::collections::{BTreeSet, HashMap};

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::args::{
    BalanceArgs, BalanceScope, CmAnalysis, CohortRestrictions, ExtractionArgs, OutcomeModelArgs,
    OutcomeRestrictions, PropensityArgs, StratificationArgs, TrimArgs, check_unique_ids,
};
use crate::core::{ArtifactId, CohortId, Fingerprint, StageKind};
use crate::engine::{AdjustmentSpec, CovariateLists, ModelInput, Plan, Task, Work};
use crate::error::{ConfigurationError, StudyError};
use crate::hypothesis::{AnalysisExclusion, Outcome, TargetComparatorOutcomes, validate_hypotheses};
use crate::reference::ReferenceRow;

#[derive(Serialize)]
struct ExtractionKey<'a> {
    stage: StageKind,
    target_id: CohortId,
    comparator_id: CohortId,
    outcome_ids: &'a BTreeSet<CohortId>,
    args: &'a ExtractionArgs,
}

#[derive(Serialize)]
struct PopulationKey {
    stage: StageKind,
    data: Fingerprint,
    restrictions: CohortRestrictions,
}

#[derive(Serialize)]
struct PropensityKey<'a> {
    stage: StageKind,
    population: Fingerprint,
    args: &'a PropensityArgs,
    covariates: &'a CovariateLists,
}

#[derive(Serialize)]
struct SharedBalanceKey<'a> {
    stage: StageKind,
    population: Fingerprint,
    propensity: Fingerprint,
    trim: Option<&'a TrimArgs>,
    stratification: Option<&'a StratificationArgs>,
    args: &'a BalanceArgs,
}

#[derive(Serialize)]
struct AdjustmentKey<'a> {
    stage: StageKind,
    population: Fingerprint,
    propensity: Option<Fingerprint>,
    outcome_id: CohortId,
    restrictions: OutcomeRestrictions,
    trim: Option<&'a TrimArgs>,
    stratification: Option<&'a StratificationArgs>,
}

#[derive(Serialize)]
struct BalanceKey<'a> {
    stage: StageKind,
    adjusted: Fingerprint,
    args: &'a BalanceArgs,
}

#[derive(Serialize)]
struct OutcomeModelKey<'a> {
    stage: StageKind,
    adjusted: Fingerprint,
    args: &'a OutcomeModelArgs,
    covariates: &'a CovariateLists,
}

/// Request-scoped planning state. The fingerprint index is the deduplication
/// cache: it lives exactly as long as one planning call.
struct Planner {
    graph: Graph<Task, ()>,
    index: HashMap<ArtifactId, NodeIndex>,
}

impl Planner {
    fn new() -> Self {
        Self {
            graph: Graph::new(),
            index: HashMap::new(),
        }
    }

    fn fingerprint(&self, index: NodeIndex) -> Fingerprint {
        self.graph[index].id.fingerprint
    }

    fn file_name(&self, index: NodeIndex) -> String {
        self.graph[index].id.file_name()
    }

    /// Adds a task unless one with the same identity already exists.
    ///
    /// The `work` closure is only evaluated for new tasks.
    fn add(
        &mut self,
        id: ArtifactId,
        label: impl FnOnce() -> String,
        work: impl FnOnce() -> Work,
    ) -> NodeIndex {
        if let Some(&index) = self.index.get(&id) {
            return index;
        }

        let work = work();
        debug_assert_eq!(work.stage(), id.stage);

        let dependencies = work.dependencies();
        let index = self.graph.add_node(Task {
            id,
            label: format!("{} {}", id.stage, label()),
            work,
        });

        for dependency in dependencies {
            self.graph.add_edge(dependency, index, ());
        }

        self.index.insert(id, index);
        index
    }

    /// Plans all non-excluded outcomes of one hypothesis under one analysis.
    fn plan_pair(
        &mut self,
        analysis: &CmAnalysis,
        tco: &TargetComparatorOutcomes,
        outcomes: &[&Outcome],
        rows: &mut Vec<ReferenceRow>,
    ) -> Result<(), StudyError> {
        let (target_id, comparator_id) = (tco.target_id, tco.comparator_id);
        let pair = format!("t{target_id}_c{comparator_id}");

        let covariates = CovariateLists {
            excluded: tco.excluded_covariate_ids.clone(),
            included: tco.included_covariate_ids.clone(),
        };

        let adjustment = AdjustmentSpec {
            population: analysis.population().clone(),
            trim: analysis.trim().cloned(),
            stratification: analysis.stratification().cloned(),
        };

        // all outcomes of the hypothesis, so exclusions never change the data
        let outcome_ids = tco.outcome_ids();

        let id = ArtifactId::new(
            StageKind::Extraction,
            Fingerprint::of(&ExtractionKey {
                stage: StageKind::Extraction,
                target_id,
                comparator_id,
                outcome_ids: &outcome_ids,
                args: analysis.extraction(),
            })?,
        );
        let data = self.add(
            id,
            || pair.clone(),
            || Work::Extraction {
                target_id,
                comparator_id,
                outcome_ids,
                args: analysis.extraction().clone(),
            },
        );

        let id = ArtifactId::new(
            StageKind::StudyPopulation,
            Fingerprint::of(&PopulationKey {
                stage: StageKind::StudyPopulation,
                data: self.fingerprint(data),
                restrictions: analysis.population().cohort_restrictions(),
            })?,
        );
        let population = self.add(
            id,
            || pair.clone(),
            || Work::StudyPopulation {
                data,
                args: analysis.population().clone(),
            },
        );

        let propensity = match analysis.propensity() {
            Some(args) => {
                let id = ArtifactId::new(
                    StageKind::Propensity,
                    Fingerprint::of(&PropensityKey {
                        stage: StageKind::Propensity,
                        population: self.fingerprint(population),
                        args,
                        covariates: &covariates,
                    })?,
                );
                Some(self.add(
                    id,
                    || pair.clone(),
                    || Work::Propensity {
                        data,
                        population,
                        args: args.clone(),
                        covariates: covariates.clone(),
                    },
                ))
            }
            None => None,
        };

        let shared_balance = match (analysis.shared_balance(), propensity) {
            (Some(args), Some(propensity)) => {
                let id = ArtifactId::new(
                    StageKind::SharedBalance,
                    Fingerprint::of(&SharedBalanceKey {
                        stage: StageKind::SharedBalance,
                        population: self.fingerprint(population),
                        propensity: self.fingerprint(propensity),
                        trim: analysis.trim(),
                        stratification: analysis.stratification(),
                        args,
                    })?,
                );
                Some(self.add(
                    id,
                    || pair.clone(),
                    || Work::SharedBalance {
                        data,
                        population,
                        propensity,
                        adjustment: adjustment.clone(),
                        args: args.clone(),
                    },
                ))
            }
            _ => None,
        };

        for outcome in outcomes {
            let outcome_id = outcome.outcome_id;
            let label = || format!("{pair}_o{outcome_id}");

            let adjusted_fp = Fingerprint::of(&AdjustmentKey {
                stage: StageKind::Adjustment,
                population: self.fingerprint(population),
                propensity: propensity.map(|index| self.fingerprint(index)),
                outcome_id,
                restrictions: analysis.population().outcome_restrictions(),
                trim: analysis.trim(),
                stratification: analysis.stratification(),
            })?;

            let balance_args = analysis.balance().and_then(|balance| {
                let wanted = match balance.scope {
                    BalanceScope::OutcomesOfInterest => outcome.outcome_of_interest,
                    BalanceScope::AllOutcomes => true,
                };
                wanted.then_some(&balance.args)
            });

            // Adjusted populations of negative controls are only persisted
            // when a per-outcome balance reads them.
            let materialize =
                analysis.is_adjusted() && (outcome.outcome_of_interest || balance_args.is_some());

            let adjusted = materialize.then(|| {
                self.add(
                    ArtifactId::new(StageKind::Adjustment, adjusted_fp),
                    label,
                    || Work::Adjustment {
                        data,
                        population,
                        propensity,
                        outcome_id,
                        adjustment: adjustment.clone(),
                    },
                )
            });

            let balance = match (balance_args, adjusted) {
                (Some(args), Some(adjusted)) => {
                    let id = ArtifactId::new(
                        StageKind::Balance,
                        Fingerprint::of(&BalanceKey {
                            stage: StageKind::Balance,
                            adjusted: adjusted_fp,
                            args,
                        })?,
                    );
                    Some(self.add(id, label, || Work::Balance {
                        data,
                        adjusted,
                        args: args.clone(),
                    }))
                }
                _ => None,
            };

            let model = match analysis.outcome_model() {
                Some(args) => {
                    let id = ArtifactId::new(
                        StageKind::OutcomeModel,
                        Fingerprint::of(&OutcomeModelKey {
                            stage: StageKind::OutcomeModel,
                            adjusted: adjusted_fp,
                            args,
                            covariates: &covariates,
                        })?,
                    );
                    let input = match adjusted {
                        Some(adjusted) => ModelInput::Adjusted(adjusted),
                        None => ModelInput::Inline {
                            population,
                            propensity,
                            adjustment: adjustment.clone(),
                        },
                    };
                    Some(self.add(id, label, || Work::OutcomeModel {
                        data,
                        input,
                        outcome_id,
                        args: args.clone(),
                        covariates: covariates.clone(),
                    }))
                }
                None => None,
            };

            rows.push(ReferenceRow {
                analysis_id: analysis.analysis_id(),
                description: analysis.description().to_string(),
                target_id,
                comparator_id,
                outcome_id,
                outcome_of_interest: outcome.outcome_of_interest,
                true_effect_size: outcome.true_effect_size,
                cohort_data_file: Some(self.file_name(data)),
                study_pop_file: Some(self.file_name(population)),
                ps_file: propensity.map(|index| self.file_name(index)),
                shared_balance_file: shared_balance.map(|index| self.file_name(index)),
                strata_file: adjusted.map(|index| self.file_name(index)),
                balance_file: balance.map(|index| self.file_name(index)),
                outcome_model_file: model.map(|index| self.file_name(index)),
            });
        }

        Ok(())
    }
}

/// Validates the request and derives the deduplicated task graph.
///
/// Fails before anything is computed if an analysis is inconsistent, if IDs
/// are repeated, or if there is nothing to plan.
pub fn plan(
    analyses: &[CmAnalysis],
    hypotheses: &[TargetComparatorOutcomes],
    exclusions: &[AnalysisExclusion],
) -> Result<Plan, StudyError> {
    if analyses.is_empty() {
        return Err(ConfigurationError::NoAnalyses.into());
    }

    if hypotheses.is_empty() {
        return Err(ConfigurationError::NoHypotheses.into());
    }

    check_unique_ids(analyses)?;

    for analysis in analyses {
        analysis.validate()?;
    }

    validate_hypotheses(hypotheses)?;

    let known: BTreeSet<_> = analyses.iter().map(CmAnalysis::analysis_id).collect();
    for exclusion in exclusions {
        if !known.contains(&exclusion.analysis_id) {
            tracing::warn!(
                "exclusion refers to unknown analysis {}, ignoring it",
                exclusion.analysis_id
            );
        }
    }

    let mut planner = Planner::new();
    let mut rows = Vec::new();

    for analysis in analyses {
        for tco in hypotheses {
            let outcomes: Vec<&Outcome> = tco
                .outcomes
                .iter()
                .filter(|outcome| {
                    !exclusions.iter().any(|exclusion| {
                        exclusion.excludes(
                            analysis.analysis_id(),
                            tco.target_id,
                            tco.comparator_id,
                            outcome.outcome_id,
                        )
                    })
                })
                .collect();

            if outcomes.is_empty() {
                tracing::debug!(
                    "analysis {} excluded for t{}_c{}",
                    analysis.analysis_id(),
                    tco.target_id,
                    tco.comparator_id
                );
                continue;
            }

            planner.plan_pair(analysis, tco, &outcomes, &mut rows)?;
        }
    }

    rows.sort_by_key(|row| {
        (
            row.analysis_id,
            row.target_id,
            row.comparator_id,
            row.outcome_id,
        )
    });

    tracing::info!(
        "planned {} distinct tasks for {} reference rows",
        planner.graph.node_count(),
        rows.len()
    );

    Ok(Plan {
        graph: planner.graph,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{
        BalanceArgs, ExtractionArgs, OutcomeModelArgs, PopulationArgs, PropensityArgs,
        StratificationArgs,
    };

    fn analysis(id: i64, description: &str) -> crate::args::CmAnalysisBuilder {
        CmAnalysis::builder(id, description)
            .extraction(ExtractionArgs::default())
            .population(PopulationArgs::default())
            .propensity(PropensityArgs::default())
            .stratification(StratificationArgs::match_on_ps(0.2, 1))
    }

    fn hypothesis() -> TargetComparatorOutcomes {
        TargetComparatorOutcomes::new(
            1,
            2,
            vec![
                Outcome::of_interest(3),
                Outcome::negative_control(4),
                Outcome::negative_control(5),
            ],
        )
    }

    fn ids(plan: &Plan, stage: StageKind) -> BTreeSet<ArtifactId> {
        plan.tasks()
            .filter(|t| t.stage() == stage)
            .map(Task::id)
            .collect()
    }

    #[test]
    fn test_two_analyses_share_upstream() {
        let a1 = analysis(1, "Cox")
            .outcome_model(OutcomeModelArgs::default())
            .build()
            .unwrap();
        let a2 = analysis(2, "Cox with covariates")
            .outcome_model(OutcomeModelArgs {
                use_covariates: true,
                ..Default::default()
            })
            .build()
            .unwrap();

        let plan = plan(&[a1, a2], &[hypothesis()], &[]).unwrap();

        assert_eq!(plan.count(StageKind::Extraction), 1);
        assert_eq!(plan.count(StageKind::StudyPopulation), 1);
        assert_eq!(plan.count(StageKind::Propensity), 1);
        assert_eq!(plan.count(StageKind::OutcomeModel), 6);
        // only the outcome of interest gets a persisted matched population
        assert_eq!(plan.count(StageKind::Adjustment), 1);
        assert_eq!(plan.rows().len(), 6);
    }

    #[test]
    fn test_description_and_id_are_irrelevant() {
        let build = |id, description: &str| {
            analysis(id, description)
                .shared_balance(BalanceArgs::default())
                .balance(BalanceArgs::default(), BalanceScope::AllOutcomes)
                .outcome_model(OutcomeModelArgs::default())
                .build()
                .unwrap()
        };

        let a = plan(&[build(1, "first")], &[hypothesis()], &[]).unwrap();
        let b = plan(&[build(99, "renamed")], &[hypothesis()], &[]).unwrap();

        for stage in StageKind::ALL {
            assert_eq!(ids(&a, stage), ids(&b, stage), "{stage} differs");
        }

        let files = |plan: &Plan| -> Vec<_> {
            plan.rows()
                .iter()
                .map(|row| (row.strata_file.clone(), row.outcome_model_file.clone()))
                .collect()
        };
        assert_eq!(files(&a), files(&b));
    }

    #[test]
    fn test_equal_extraction_args_share_fingerprint() {
        let a1 = analysis(1, "match").build().unwrap();
        let a2 = CmAnalysis::builder(2, "stratify")
            .extraction(ExtractionArgs::default())
            .population(PopulationArgs {
                washout_period: 365,
                ..Default::default()
            })
            .build()
            .unwrap();

        let plan = plan(&[a1, a2], &[hypothesis()], &[]).unwrap();

        assert_eq!(plan.count(StageKind::Extraction), 1);
        assert_eq!(plan.count(StageKind::StudyPopulation), 2);

        let rows = plan.rows();
        assert!(rows.iter().all(|r| r.cohort_data_file == rows[0].cohort_data_file));
    }

    #[test]
    fn test_outcome_restrictions_do_not_split_population() {
        let a1 = analysis(1, "lookback 365")
            .population(PopulationArgs {
                prior_outcome_lookback: 365,
                ..Default::default()
            })
            .outcome_model(OutcomeModelArgs::default())
            .build()
            .unwrap();
        let a2 = analysis(2, "lookback all")
            .outcome_model(OutcomeModelArgs::default())
            .build()
            .unwrap();

        let plan = plan(&[a1, a2], &[hypothesis()], &[]).unwrap();

        assert_eq!(plan.count(StageKind::StudyPopulation), 1);
        assert_eq!(plan.count(StageKind::Propensity), 1);
        assert_eq!(plan.count(StageKind::OutcomeModel), 6);
    }

    #[test]
    fn test_shared_versus_outcome_balance() {
        let shared = analysis(1, "shared")
            .shared_balance(BalanceArgs::default())
            .build()
            .unwrap();
        let plan1 = plan(&[shared], &[hypothesis()], &[]).unwrap();
        assert_eq!(plan1.count(StageKind::SharedBalance), 1);
        assert_eq!(plan1.count(StageKind::Balance), 0);

        let per_outcome = analysis(1, "per outcome")
            .balance(BalanceArgs::default(), BalanceScope::AllOutcomes)
            .build()
            .unwrap();
        let plan2 = plan(&[per_outcome], &[hypothesis()], &[]).unwrap();
        assert_eq!(plan2.count(StageKind::SharedBalance), 0);
        assert_eq!(plan2.count(StageKind::Balance), 3);
        assert_eq!(plan2.count(StageKind::Adjustment), 3);
    }

    #[test]
    fn test_negative_controls_skip_balance_by_default() {
        let analysis = analysis(1, "interest only")
            .balance(BalanceArgs::default(), BalanceScope::OutcomesOfInterest)
            .outcome_model(OutcomeModelArgs::default())
            .build()
            .unwrap();

        let plan = plan(&[analysis], &[hypothesis()], &[]).unwrap();
        assert_eq!(plan.count(StageKind::Balance), 1);

        for row in plan.rows() {
            assert_eq!(row.balance_file.is_some(), row.outcome_of_interest);
            assert_eq!(row.strata_file.is_some(), row.outcome_of_interest);
            assert!(row.outcome_model_file.is_some());
        }
    }

    #[test]
    fn test_unadjusted_analysis() {
        let analysis = CmAnalysis::builder(1, "crude")
            .extraction(ExtractionArgs::default())
            .population(PopulationArgs::default())
            .outcome_model(OutcomeModelArgs::default())
            .build()
            .unwrap();

        let plan = plan(&[analysis], &[hypothesis()], &[]).unwrap();

        assert_eq!(plan.count(StageKind::Propensity), 0);
        assert_eq!(plan.count(StageKind::Adjustment), 0);
        assert_eq!(plan.count(StageKind::OutcomeModel), 3);
        assert!(plan.rows().iter().all(|row| row.ps_file.is_none()));
    }

    #[test]
    fn test_exclusion_keeps_shared_artifacts() {
        let a1 = analysis(1, "one")
            .outcome_model(OutcomeModelArgs::default())
            .build()
            .unwrap();
        let a2 = analysis(2, "two")
            .outcome_model(OutcomeModelArgs {
                use_covariates: true,
                ..Default::default()
            })
            .build()
            .unwrap();

        let excluded = plan(
            &[a1.clone(), a2.clone()],
            &[hypothesis()],
            &[AnalysisExclusion::pair(2, 1, 2)],
        )
        .unwrap();

        assert!(excluded.rows().iter().all(|row| row.analysis_id == 1));
        assert_eq!(excluded.rows().len(), 3);
        assert_eq!(excluded.count(StageKind::Propensity), 1);
        assert_eq!(excluded.count(StageKind::OutcomeModel), 3);

        let only_first = plan(&[a1], &[hypothesis()], &[]).unwrap();
        for stage in StageKind::ALL {
            assert_eq!(ids(&excluded, stage), ids(&only_first, stage));
        }
    }

    #[test]
    fn test_single_outcome_exclusion() {
        let a1 = analysis(1, "one")
            .outcome_model(OutcomeModelArgs::default())
            .build()
            .unwrap();

        let plan = plan(&[a1], &[hypothesis()], &[AnalysisExclusion::outcome(1, 1, 2, 4)]).unwrap();

        assert_eq!(plan.rows().len(), 2);
        assert!(plan.rows().iter().all(|row| row.outcome_id != 4));
        assert_eq!(plan.count(StageKind::OutcomeModel), 2);
    }

    #[test]
    fn test_duplicate_analysis_id() {
        let a = analysis(1, "a").build().unwrap();
        let b = analysis(1, "b").build().unwrap();

        assert!(matches!(
            plan(&[a, b], &[hypothesis()], &[]),
            Err(StudyError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_hypothesis_covariates_split_propensity() {
        let a = analysis(1, "a").build().unwrap();
        let first = hypothesis().exclude_covariates([1001]);
        let second = TargetComparatorOutcomes::new(1, 6, vec![Outcome::of_interest(3)]);

        let plan = plan(&[a], &[first, second], &[]).unwrap();

        assert_eq!(plan.count(StageKind::Extraction), 2);
        assert_eq!(plan.count(StageKind::Propensity), 2);
    }

    #[test]
    fn test_outcome_set_is_part_of_extraction() {
        let a = analysis(1, "a")
            .outcome_model(OutcomeModelArgs::default())
            .build()
            .unwrap();

        let mut grown = hypothesis();
        grown.outcomes.push(Outcome::negative_control(9));

        let before = plan(&[a.clone()], &[hypothesis()], &[]).unwrap();
        let after = plan(&[a.clone()], &[grown.clone()], &[]).unwrap();

        let data_file = |plan: &Plan| {
            let row = plan.rows().iter().find(|r| r.outcome_id == 3).unwrap();
            row.cohort_data_file.clone().unwrap()
        };

        assert_ne!(data_file(&before), data_file(&after));
        assert_ne!(
            ids(&before, StageKind::OutcomeModel),
            ids(&after, StageKind::OutcomeModel)
        );

        // excluding the new outcome again keeps the data extracted for it
        let excluded = plan(&[a], &[grown], &[AnalysisExclusion::outcome(1, 1, 2, 9)]).unwrap();
        assert_eq!(data_file(&excluded), data_file(&after));
        assert_eq!(excluded.rows().len(), before.rows().len());
    }

    #[test]
    fn test_dependencies_point_upstream() {
        let a = analysis(1, "a")
            .outcome_model(OutcomeModelArgs::default())
            .build()
            .unwrap();
        let plan = plan(&[a], &[hypothesis()], &[]).unwrap();

        assert!(petgraph::algo::toposort(&plan.graph, None).is_ok());

        let row = plan.rows().iter().find(|r| r.outcome_id == 3).unwrap();
        let model = row.artifact(StageKind::OutcomeModel).unwrap();
        let adjusted = row.artifact(StageKind::Adjustment).unwrap();
        assert!(plan.dependencies(&model).contains(&adjusted));

        // negative control models read the population and scores directly
        let control = plan.rows().iter().find(|r| r.outcome_id == 4).unwrap();
        let model = control.artifact(StageKind::OutcomeModel).unwrap();
        let deps = plan.dependencies(&model);
        assert!(deps.contains(&control.artifact(StageKind::Propensity).unwrap()));
        assert!(deps.contains(&control.artifact(StageKind::StudyPopulation).unwrap()));
    }
}
