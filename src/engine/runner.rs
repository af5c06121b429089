pub(crate) mod diagnostics;

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::Instant;

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::collaborator::{
    Collaborator, ExtractionRequest, OutcomeModel, OutcomeModelRequest, PropensityRequest,
};
use crate::core::{ArtifactId, StageKind};
use crate::engine::{ModelInput, Plan, Task, Work};
use crate::error::{StoreError, StudyError, TaskError};
use crate::io::as_overhead;
use crate::store::ArtifactStore;
use crate::utils::{STYLE_RUN, STYLE_TASK};

use diagnostics::{RunReport, TaskExecution};

/// How many tasks may run at the same time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSettings {
    threads: usize,
    stage_limits: BTreeMap<StageKind, usize>,
}

impl Default for ExecutionSettings {
    /// One worker per detected core.
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);

        Self::new(threads)
    }
}

impl ExecutionSettings {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            stage_limits: BTreeMap::new(),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Caps the number of concurrently running tasks of one stage kind, e.g.
    /// to keep the number of open database connections down.
    pub fn stage_limit(mut self, stage: StageKind, limit: usize) -> Self {
        self.stage_limits.insert(stage, limit.max(1));
        self
    }

    /// Effective concurrency for one stage kind.
    pub fn limit(&self, stage: StageKind) -> usize {
        self.stage_limits
            .get(&stage)
            .copied()
            .unwrap_or(self.threads)
            .min(self.threads)
    }
}

/// Lifecycle of a single task within one run.
#[derive(Debug, Clone)]
pub enum TaskState {
    Planned,
    Running,
    /// The artifact is in the store. `cached` is set when it was already there
    /// and nothing was computed.
    Committed { cached: bool },
    Failed(Arc<TaskError>),
    /// Not attempted because `upstream` failed.
    Skipped { upstream: ArtifactId },
}

impl TaskState {
    pub fn is_committed(&self) -> bool {
        matches!(self, TaskState::Committed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskState::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TaskState::Skipped { .. })
    }
}

/// A loaded or freshly computed artifact, kept in memory while consumers are
/// still waiting for it.
enum Output<C: Collaborator> {
    CohortData(Arc<C::CohortData>),
    Population(Arc<C::Population>),
    Propensity(Arc<C::Propensity>),
    Adjusted(Arc<C::Adjusted>),
    Balance(Arc<C::Balance>),
    Model(Arc<OutcomeModel>),
}

impl<C: Collaborator> Clone for Output<C> {
    fn clone(&self) -> Self {
        match self {
            Output::CohortData(v) => Output::CohortData(Arc::clone(v)),
            Output::Population(v) => Output::Population(Arc::clone(v)),
            Output::Propensity(v) => Output::Propensity(Arc::clone(v)),
            Output::Adjusted(v) => Output::Adjusted(Arc::clone(v)),
            Output::Balance(v) => Output::Balance(Arc::clone(v)),
            Output::Model(v) => Output::Model(Arc::clone(v)),
        }
    }
}

impl<C: Collaborator> Output<C> {
    fn load(store: &ArtifactStore, id: &ArtifactId) -> Result<Self, StoreError> {
        Ok(match id.stage {
            StageKind::Extraction => Output::CohortData(Arc::new(store.get(id)?)),
            StageKind::StudyPopulation => Output::Population(Arc::new(store.get(id)?)),
            StageKind::Propensity => Output::Propensity(Arc::new(store.get(id)?)),
            StageKind::Adjustment => Output::Adjusted(Arc::new(store.get(id)?)),
            StageKind::SharedBalance | StageKind::Balance => {
                Output::Balance(Arc::new(store.get(id)?))
            }
            StageKind::OutcomeModel => Output::Model(Arc::new(store.get(id)?)),
        })
    }

    fn commit(&self, store: &ArtifactStore, id: &ArtifactId) -> Result<String, StoreError> {
        match self {
            Output::CohortData(v) => store.put(id, v.as_ref()),
            Output::Population(v) => store.put(id, v.as_ref()),
            Output::Propensity(v) => store.put(id, v.as_ref()),
            Output::Adjusted(v) => store.put(id, v.as_ref()),
            Output::Balance(v) => store.put(id, v.as_ref()),
            Output::Model(v) => store.put(id, v.as_ref()),
        }
    }

    fn cohort_data(&self) -> Option<&C::CohortData> {
        match self {
            Output::CohortData(v) => Some(v.as_ref()),
            _ => None,
        }
    }

    fn population(&self) -> Option<&C::Population> {
        match self {
            Output::Population(v) => Some(v.as_ref()),
            _ => None,
        }
    }

    fn propensity(&self) -> Option<&C::Propensity> {
        match self {
            Output::Propensity(v) => Some(v.as_ref()),
            _ => None,
        }
    }

    fn adjusted(&self) -> Option<&C::Adjusted> {
        match self {
            Output::Adjusted(v) => Some(v.as_ref()),
            _ => None,
        }
    }
}

/// Upstream artifacts handed to a single task.
struct Inputs<'a, C: Collaborator> {
    plan: &'a Plan,
    outputs: HashMap<NodeIndex, Output<C>>,
}

impl<C: Collaborator> Inputs<'_, C> {
    fn get<'s, T: ?Sized>(
        &'s self,
        index: NodeIndex,
        pick: impl Fn(&'s Output<C>) -> Option<&'s T>,
    ) -> Result<&'s T, TaskError> {
        self.outputs
            .get(&index)
            .and_then(pick)
            .ok_or_else(|| TaskError::MissingInput(self.plan.graph[index].id))
    }
}

/// Runs the collaborator for one task and commits its artifact.
fn execute<C: Collaborator>(
    collab: &C,
    store: &ArtifactStore,
    task: &Task,
    inputs: &Inputs<'_, C>,
) -> Result<Output<C>, TaskError> {
    let output = match &task.work {
        Work::Extraction {
            target_id,
            comparator_id,
            outcome_ids,
            args,
        } => {
            let request = ExtractionRequest {
                target_id: *target_id,
                comparator_id: *comparator_id,
                outcome_ids,
                args,
            };
            Output::CohortData(Arc::new(collab.extract(&request)?))
        }
        Work::StudyPopulation { data, args } => {
            let data = inputs.get(*data, Output::cohort_data)?;
            Output::Population(Arc::new(collab.define_population(data, args)?))
        }
        Work::Propensity {
            data,
            population,
            args,
            covariates,
        } => {
            let data = inputs.get(*data, Output::cohort_data)?;
            let population = inputs.get(*population, Output::population)?;
            let request = PropensityRequest {
                args,
                excluded_covariate_ids: &covariates.excluded,
                included_covariate_ids: &covariates.included,
            };
            Output::Propensity(Arc::new(collab.fit_propensity(data, population, &request)?))
        }
        Work::SharedBalance {
            data,
            population,
            propensity,
            adjustment,
            args,
        } => {
            let data = inputs.get(*data, Output::cohort_data)?;
            let population = inputs.get(*population, Output::population)?;
            let propensity = inputs.get(*propensity, Output::propensity)?;
            let adjusted = collab.adjust_population(
                data,
                population,
                Some(propensity),
                &adjustment.request(None),
            )?;
            Output::Balance(Arc::new(collab.compute_balance(data, &adjusted, args)?))
        }
        Work::Adjustment {
            data,
            population,
            propensity,
            outcome_id,
            adjustment,
        } => {
            let data = inputs.get(*data, Output::cohort_data)?;
            let population = inputs.get(*population, Output::population)?;
            let propensity = propensity
                .map(|index| inputs.get(index, Output::propensity))
                .transpose()?;
            let adjusted = collab.adjust_population(
                data,
                population,
                propensity,
                &adjustment.request(Some(*outcome_id)),
            )?;
            Output::Adjusted(Arc::new(adjusted))
        }
        Work::Balance {
            data,
            adjusted,
            args,
        } => {
            let data = inputs.get(*data, Output::cohort_data)?;
            let adjusted = inputs.get(*adjusted, Output::adjusted)?;
            Output::Balance(Arc::new(collab.compute_balance(data, adjusted, args)?))
        }
        Work::OutcomeModel {
            data,
            input,
            outcome_id,
            args,
            covariates,
        } => {
            let data = inputs.get(*data, Output::cohort_data)?;
            let request = OutcomeModelRequest {
                outcome_id: *outcome_id,
                args,
                excluded_covariate_ids: &covariates.excluded,
                included_covariate_ids: &covariates.included,
            };

            let model = match input {
                ModelInput::Adjusted(adjusted) => {
                    let adjusted = inputs.get(*adjusted, Output::adjusted)?;
                    collab.fit_outcome_model(data, adjusted, &request)?
                }
                ModelInput::Inline {
                    population,
                    propensity,
                    adjustment,
                } => {
                    let population = inputs.get(*population, Output::population)?;
                    let propensity = propensity
                        .map(|index| inputs.get(index, Output::propensity))
                        .transpose()?;
                    let adjusted = collab.adjust_population(
                        data,
                        population,
                        propensity,
                        &adjustment.request(Some(*outcome_id)),
                    )?;
                    collab.fit_outcome_model(data, &adjusted, &request)?
                }
            };

            Output::Model(Arc::new(model))
        }
    };

    output.commit(store, &task.id)?;
    Ok(output)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

/// What a worker reports back to the coordinator.
struct Done<C: Collaborator> {
    index: NodeIndex,
    /// `Ok(None)` when the artifact was already in the store at dispatch time.
    result: Result<Option<Output<C>>, TaskError>,
    /// Inputs the worker had to read from the store.
    loaded: Vec<(NodeIndex, Output<C>)>,
    execution: Option<TaskExecution>,
}

/// Runs one task on a worker. A panic anywhere in here, loading inputs
/// included, is reported as a failed task, so the coordinator always hears back.
fn work<C: Collaborator>(
    plan: &Plan,
    store: &ArtifactStore,
    collab: &C,
    index: NodeIndex,
    outputs: HashMap<NodeIndex, Output<C>>,
) -> Done<C> {
    match catch_unwind(AssertUnwindSafe(|| attempt(plan, store, collab, index, outputs))) {
        Ok(done) => done,
        Err(panic) => Done {
            index,
            result: Err(TaskError::Panic(panic_message(panic))),
            loaded: Vec::new(),
            execution: None,
        },
    }
}

fn attempt<C: Collaborator>(
    plan: &Plan,
    store: &ArtifactStore,
    collab: &C,
    index: NodeIndex,
    outputs: HashMap<NodeIndex, Output<C>>,
) -> Done<C> {
    let task = &plan.graph[index];
    let mut done = Done {
        index,
        result: Ok(None),
        loaded: Vec::new(),
        execution: None,
    };

    // another process may have committed it since planning
    if store.has(&task.id) {
        return done;
    }

    let mut inputs = Inputs { plan, outputs };

    for dep in task.work.dependencies() {
        if inputs.outputs.contains_key(&dep) {
            continue;
        }

        match Output::<C>::load(store, &plan.graph[dep].id) {
            Ok(output) => {
                done.loaded.push((dep, output.clone()));
                inputs.outputs.insert(dep, output);
            }
            Err(e) => {
                done.result = Err(e.into());
                return done;
            }
        }
    }

    let span = tracing::span!(Level::INFO, "task", name = task.label());
    span.pb_set_style(&STYLE_TASK);
    span.pb_set_message(&format!("Running {}", task.label()));
    let _enter = span.enter();

    let start = Instant::now();

    let result = match catch_unwind(AssertUnwindSafe(|| execute(collab, store, task, &inputs))) {
        Ok(result) => result,
        Err(panic) => Err(TaskError::Panic(panic_message(panic))),
    };

    done.execution = Some(TaskExecution {
        start,
        duration: start.elapsed(),
    });
    done.result = result.map(Some);
    done
}

/// Coordinator state. Lives on the calling thread for the duration of one run.
struct Scheduler<'a, C: Collaborator> {
    plan: &'a Plan,
    settings: &'a ExecutionSettings,
    states: Vec<TaskState>,
    dependents: Vec<Vec<NodeIndex>>,
    /// Uncommitted dependencies per task.
    waiting: Vec<usize>,
    /// Planned dependents per task that have not been dispatched yet.
    consumers: Vec<usize>,
    ready: BTreeSet<NodeIndex>,
    running: BTreeMap<StageKind, usize>,
    in_flight: usize,
    memo: HashMap<NodeIndex, Output<C>>,
    executions: HashMap<NodeIndex, TaskExecution>,
    span: tracing::Span,
}

impl<'a, C: Collaborator> Scheduler<'a, C> {
    fn new(
        plan: &'a Plan,
        store: &ArtifactStore,
        settings: &'a ExecutionSettings,
        span: tracing::Span,
    ) -> Self {
        let graph = &plan.graph;

        let states: Vec<TaskState> = graph
            .node_indices()
            .map(|index| {
                if store.has(&graph[index].id) {
                    TaskState::Committed { cached: true }
                } else {
                    TaskState::Planned
                }
            })
            .collect();

        let mut dependents = vec![Vec::new(); graph.node_count()];
        for edge in graph.raw_edges() {
            dependents[edge.source().index()].push(edge.target());
        }

        let planned = |index: NodeIndex| matches!(states[index.index()], TaskState::Planned);

        let waiting: Vec<usize> = graph
            .node_indices()
            .map(|index| {
                graph
                    .neighbors_directed(index, Direction::Incoming)
                    .filter(|&dep| planned(dep))
                    .count()
            })
            .collect();

        let consumers = dependents
            .iter()
            .map(|list| list.iter().filter(|&&dependent| planned(dependent)).count())
            .collect();

        let ready = graph
            .node_indices()
            .filter(|&index| planned(index) && waiting[index.index()] == 0)
            .collect();

        Self {
            plan,
            settings,
            states,
            dependents,
            waiting,
            consumers,
            ready,
            running: BTreeMap::new(),
            in_flight: 0,
            memo: HashMap::new(),
            executions: HashMap::new(),
            span,
        }
    }

    fn pending(&self) -> usize {
        self.states
            .iter()
            .filter(|state| matches!(state, TaskState::Planned))
            .count()
    }

    /// Lowest-indexed ready task whose stage still has a free slot.
    fn next(&mut self) -> Option<NodeIndex> {
        if self.in_flight >= self.settings.threads() {
            return None;
        }

        let index = self.ready.iter().copied().find(|&index| {
            let stage = self.plan.graph[index].stage();
            self.running.get(&stage).copied().unwrap_or(0) < self.settings.limit(stage)
        })?;

        self.ready.remove(&index);
        Some(index)
    }

    /// Marks the task as running and collects the inputs already in memory.
    fn dispatch(&mut self, index: NodeIndex) -> HashMap<NodeIndex, Output<C>> {
        let plan = self.plan;
        let task = &plan.graph[index];

        tracing::debug!("dispatching {}", task.label());

        self.states[index.index()] = TaskState::Running;
        *self.running.entry(task.stage()).or_default() += 1;
        self.in_flight += 1;

        let mut inputs = HashMap::new();
        for dep in task.work.dependencies() {
            if let Some(output) = self.memo.get(&dep) {
                inputs.insert(dep, output.clone());
            }
            self.release(dep);
        }

        inputs
    }

    /// One consumer of `index` no longer needs its output.
    fn release(&mut self, index: NodeIndex) {
        let consumers = &mut self.consumers[index.index()];
        *consumers = consumers.saturating_sub(1);

        if *consumers == 0 {
            self.memo.remove(&index);
        }
    }

    fn complete(&mut self, done: Done<C>) {
        let plan = self.plan;
        let Done {
            index,
            result,
            loaded,
            execution,
        } = done;
        let task = &plan.graph[index];

        if let Some(count) = self.running.get_mut(&task.stage()) {
            *count = count.saturating_sub(1);
        }
        self.in_flight = self.in_flight.saturating_sub(1);

        for (dep, output) in loaded {
            if self.consumers[dep.index()] > 0 {
                self.memo.entry(dep).or_insert(output);
            }
        }

        match result {
            Ok(output) => {
                match execution {
                    Some(execution) => {
                        tracing::info!(
                            "committed {} in {:.2?}",
                            task.label(),
                            execution.duration
                        );
                        self.executions.insert(index, execution);
                    }
                    None => tracing::debug!("{} was committed concurrently", task.label()),
                }

                self.states[index.index()] = TaskState::Committed {
                    cached: output.is_none(),
                };

                if let Some(output) = output
                    && self.consumers[index.index()] > 0
                {
                    self.memo.insert(index, output);
                }

                for &dependent in &self.dependents[index.index()] {
                    let waiting = &mut self.waiting[dependent.index()];
                    *waiting = waiting.saturating_sub(1);

                    if *waiting == 0 && matches!(self.states[dependent.index()], TaskState::Planned)
                    {
                        self.ready.insert(dependent);
                    }
                }
            }
            Err(error) => {
                tracing::error!("{} failed: {}", task.label(), error);

                if let Some(execution) = execution {
                    self.executions.insert(index, execution);
                }

                self.states[index.index()] = TaskState::Failed(Arc::new(error));
                self.skip_dependents(index);
            }
        }

        self.span.pb_inc(1);
    }

    /// Marks every planned transitive dependent of a failed task as skipped.
    fn skip_dependents(&mut self, failed: NodeIndex) {
        let plan = self.plan;
        let upstream = plan.graph[failed].id;

        let mut queue: VecDeque<NodeIndex> =
            self.dependents[failed.index()].iter().copied().collect();

        while let Some(index) = queue.pop_front() {
            if !matches!(self.states[index.index()], TaskState::Planned) {
                continue;
            }

            let task = &plan.graph[index];
            tracing::warn!(
                "skipping {}, upstream {} failed",
                task.label(),
                plan.graph[failed].label()
            );

            self.states[index.index()] = TaskState::Skipped { upstream };
            self.ready.remove(&index);

            for dep in task.work.dependencies() {
                self.release(dep);
            }

            self.span.pb_inc(1);
            queue.extend(self.dependents[index.index()].iter().copied());
        }
    }

    fn finish(self) -> RunReport {
        RunReport::new(self.plan, self.states, self.executions)
    }
}

/// Executes every planned task that is not yet in the store.
///
/// With a single thread, tasks run on the calling thread in plan order. With
/// more, the calling thread coordinates and a `rayon` pool does the work. A
/// failing task never aborts the run: its dependents are skipped and everything
/// else proceeds, so the returned report always covers the whole plan.
pub(crate) fn run<C: Collaborator>(
    plan: &Plan,
    store: &ArtifactStore,
    collab: &C,
    settings: &ExecutionSettings,
) -> Result<RunReport, StudyError> {
    petgraph::algo::toposort(&plan.graph, None).map_err(|_| StudyError::Cycle)?;

    let s = Instant::now();

    let span = tracing::span!(Level::INFO, "running_tasks");
    let mut scheduler = Scheduler::<C>::new(plan, store, settings, span.clone());

    let pending = scheduler.pending();
    tracing::info!(
        "{} of {} tasks to compute, {} already in the store",
        pending,
        plan.len(),
        plan.len() - pending
    );

    span.pb_set_length(pending as u64);
    span.pb_set_style(&STYLE_RUN);
    span.pb_set_message("Running tasks...");
    let _enter = span.enter();

    if settings.threads() == 1 {
        while let Some(index) = scheduler.next() {
            let inputs = scheduler.dispatch(index);
            let done = work(plan, store, collab, index, inputs);
            scheduler.complete(done);
        }
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.threads())
            .thread_name(|i| format!("cm-worker-{i}"))
            .build()?;

        pool.in_place_scope(|scope| {
            let (sender, receiver) = channel::<Done<C>>();

            loop {
                while let Some(index) = scheduler.next() {
                    let inputs = scheduler.dispatch(index);
                    let sender = sender.clone();

                    scope.spawn(move |_| {
                        let done = work(plan, store, collab, index, inputs);
                        // the coordinator outlives every worker
                        let _ = sender.send(done);
                    });
                }

                if scheduler.in_flight == 0 {
                    break;
                }

                match receiver.recv() {
                    Ok(done) => scheduler.complete(done),
                    Err(_) => break,
                }
            }
        });
    }

    let report = scheduler.finish();

    tracing::info!(
        "Run complete! {} computed, {} cached, {} failed, {} skipped {}",
        report.computed(),
        report.cached(),
        report.failed(),
        report.skipped(),
        as_overhead(s)
    );

    Ok(report)
}
