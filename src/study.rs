use std::fmt;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;

use crate::args::{CmAnalysis, load_analyses, read_json, save_analyses, write_json};
use crate::collaborator::Collaborator;
use crate::core::StageKind;
use crate::engine::{ExecutionSettings, Plan, RunReport, planner, runner};
use crate::error::{StoreError, StudyError};
use crate::hypothesis::{
    AnalysisExclusion, TargetComparatorOutcomes, load_hypotheses, save_hypotheses,
};
use crate::io::as_overhead;
use crate::reference::{ReferenceRow, ReferenceTable, RowStatus};
use crate::store::ArtifactStore;

/// Everything a study was asked to compute, persisted next to its artifacts.
#[derive(Debug, Clone, Default)]
pub(crate) struct Request {
    pub analyses: Vec<CmAnalysis>,
    pub hypotheses: Vec<TargetComparatorOutcomes>,
    pub exclusions: Vec<AnalysisExclusion>,
}

impl Request {
    pub(crate) const ANALYSES: &'static str = "analyses.json";
    pub(crate) const HYPOTHESES: &'static str = "hypotheses.json";
    pub(crate) const EXCLUSIONS: &'static str = "exclusions.json";

    pub(crate) fn save(&self, dir: &Utf8Path) -> Result<(), StoreError> {
        save_analyses(dir.join(Self::ANALYSES), &self.analyses)?;
        save_hypotheses(dir.join(Self::HYPOTHESES), &self.hypotheses)?;
        write_json(&dir.join(Self::EXCLUSIONS), &self.exclusions)
    }

    /// Reads a request from `dir`. The exclusion list is optional.
    pub(crate) fn load(dir: &Utf8Path) -> Result<Self, StudyError> {
        let analyses = load_analyses(dir.join(Self::ANALYSES))?;
        let hypotheses = load_hypotheses(dir.join(Self::HYPOTHESES))?;

        let path = dir.join(Self::EXCLUSIONS);
        let exclusions = if path.is_file() {
            read_json(&path)?
        } else {
            Vec::new()
        };

        Ok(Self {
            analyses,
            hypotheses,
            exclusions,
        })
    }
}

/// Builder for a [`Study`].
///
/// ```rust,ignore
/// let study = StudyConfig::new("output/study")
///     .analyses(analyses)
///     .hypotheses(hypotheses)
///     .exclude(AnalysisExclusion::pair(2, 101, 102))
///     .threads(8)
///     .finish()?;
/// ```
#[derive(Debug, Clone)]
pub struct StudyConfig {
    output: Utf8PathBuf,
    request: Request,
    settings: ExecutionSettings,
}

impl StudyConfig {
    /// Starts a configuration whose artifacts go to `output`.
    pub fn new(output: impl Into<Utf8PathBuf>) -> Self {
        Self {
            output: output.into(),
            request: Request::default(),
            settings: ExecutionSettings::default(),
        }
    }

    /// Reads `analyses.json`, `hypotheses.json` and, if present,
    /// `exclusions.json` from `dir`.
    pub fn from_dir(
        dir: impl AsRef<Utf8Path>,
        output: impl Into<Utf8PathBuf>,
    ) -> Result<Self, StudyError> {
        Ok(Self {
            request: Request::load(dir.as_ref())?,
            ..Self::new(output)
        })
    }

    pub fn analysis(mut self, analysis: CmAnalysis) -> Self {
        self.request.analyses.push(analysis);
        self
    }

    pub fn analyses(mut self, analyses: impl IntoIterator<Item = CmAnalysis>) -> Self {
        self.request.analyses.extend(analyses);
        self
    }

    pub fn hypothesis(mut self, hypothesis: TargetComparatorOutcomes) -> Self {
        self.request.hypotheses.push(hypothesis);
        self
    }

    pub fn hypotheses(
        mut self,
        hypotheses: impl IntoIterator<Item = TargetComparatorOutcomes>,
    ) -> Self {
        self.request.hypotheses.extend(hypotheses);
        self
    }

    pub fn exclude(mut self, exclusion: AnalysisExclusion) -> Self {
        self.request.exclusions.push(exclusion);
        self
    }

    pub fn exclusions(mut self, exclusions: impl IntoIterator<Item = AnalysisExclusion>) -> Self {
        self.request.exclusions.extend(exclusions);
        self
    }

    /// Number of workers; `1` runs every task on the calling thread.
    pub fn threads(mut self, threads: usize) -> Self {
        self.settings = self.settings.with_threads(threads);
        self
    }

    pub fn stage_limit(mut self, stage: StageKind, limit: usize) -> Self {
        self.settings = self.settings.stage_limit(stage, limit);
        self
    }

    pub fn settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Validates the request, plans the task graph and opens the store.
    pub fn finish(self) -> Result<Study, StudyError> {
        let plan = planner::plan(
            &self.request.analyses,
            &self.request.hypotheses,
            &self.request.exclusions,
        )?;

        let store = ArtifactStore::open(self.output)?;

        Ok(Study {
            store,
            plan,
            settings: self.settings,
            request: self.request,
        })
    }
}

/// A planned study bound to its output directory.
#[derive(Debug)]
pub struct Study {
    store: ArtifactStore,
    plan: Plan,
    settings: ExecutionSettings,
    request: Request,
}

impl Study {
    pub fn config(output: impl Into<Utf8PathBuf>) -> StudyConfig {
        StudyConfig::new(output)
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn execution_settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Computes every artifact that is not yet in the store and writes the
    /// reference table.
    ///
    /// Task failures do not make this fail: they are reported per task in
    /// [`StudyRun::report`] and per row through [`StudyRun::statuses`]. Running
    /// again after fixing the cause computes only what is missing.
    pub fn run<C: Collaborator>(&self, collab: &C) -> Result<StudyRun, StudyError> {
        eprintln!(
            "Running {} in {}.",
            style("cohort-method").red(),
            style(self.store.root()).blue()
        );

        let s = Instant::now();

        self.request.save(self.store.root())?;

        let report = runner::run(&self.plan, &self.store, collab, &self.settings)?;

        let table = self.plan.reference_table();
        table.save(self.store.root())?;

        tracing::info!(
            "Saved reference table with {} rows {}",
            table.len(),
            as_overhead(s)
        );

        Ok(StudyRun { table, report })
    }
}

impl fmt::Display for Study {
    /// The task graph as a Mermaid flowchart.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.plan, f)
    }
}

/// Result of [`Study::run`].
#[derive(Debug, Clone)]
pub struct StudyRun {
    pub table: ReferenceTable,
    pub report: RunReport,
}

impl StudyRun {
    /// Whether every row has all of its artifacts.
    pub fn is_complete(&self) -> bool {
        self.report.is_success()
    }

    pub fn statuses(&self) -> impl Iterator<Item = (&ReferenceRow, RowStatus)> {
        self.table
            .rows()
            .iter()
            .map(|row| (row, row.status(&self.report)))
    }

    pub fn incomplete(&self) -> impl Iterator<Item = (&ReferenceRow, RowStatus)> {
        self.statuses()
            .filter(|(_, status)| *status != RowStatus::Complete)
    }
}
