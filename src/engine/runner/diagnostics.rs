use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;

use crate::core::ArtifactId;
use crate::engine::{Plan, TaskState};
use crate::error::TaskError;

#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Final state of one task after a run.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: ArtifactId,
    pub label: String,
    pub state: TaskState,
    /// Set for tasks that actually ran, whether they succeeded or not.
    pub execution: Option<TaskExecution>,
}

/// Outcome of [`Study::run`](crate::Study::run): one entry per task in the
/// plan, in plan order.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    tasks: Vec<TaskReport>,
    index: HashMap<ArtifactId, usize>,
}

impl RunReport {
    pub(crate) fn new(
        plan: &Plan,
        states: Vec<TaskState>,
        mut executions: HashMap<NodeIndex, TaskExecution>,
    ) -> Self {
        let tasks: Vec<_> = plan
            .graph
            .node_indices()
            .zip(states)
            .map(|(index, state)| {
                let task = &plan.graph[index];
                TaskReport {
                    id: task.id,
                    label: task.label.clone(),
                    state,
                    execution: executions.remove(&index),
                }
            })
            .collect();

        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| (task.id, i))
            .collect();

        Self { tasks, index }
    }

    pub fn tasks(&self) -> &[TaskReport] {
        &self.tasks
    }

    pub fn state(&self, id: &ArtifactId) -> Option<&TaskState> {
        self.index.get(id).map(|&i| &self.tasks[i].state)
    }

    fn count(&self, predicate: impl Fn(&TaskState) -> bool) -> usize {
        self.tasks.iter().filter(|task| predicate(&task.state)).count()
    }

    /// Tasks computed and committed during this run.
    pub fn computed(&self) -> usize {
        self.count(|state| matches!(state, TaskState::Committed { cached: false }))
    }

    /// Tasks whose artifact was already in the store.
    pub fn cached(&self) -> usize {
        self.count(|state| matches!(state, TaskState::Committed { cached: true }))
    }

    pub fn failed(&self) -> usize {
        self.count(TaskState::is_failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(TaskState::is_skipped)
    }

    /// Whether every task of the plan has a committed artifact.
    pub fn is_success(&self) -> bool {
        self.tasks.iter().all(|task| task.state.is_committed())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&TaskReport, &TaskError)> {
        self.tasks.iter().filter_map(|task| match &task.state {
            TaskState::Failed(error) => Some((task, error.as_ref())),
            _ => None,
        })
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by status.
    ///
    /// * **Green** to **Red**: computed, from fastest to slowest
    /// * **Blue**: cached
    /// * **Salmon**: failed
    /// * **Gray**: skipped
    pub fn render_mermaid(&self, plan: &Plan) -> String {
        Mermaid { report: self, plan }.to_string()
    }
}

struct Mermaid<'a> {
    report: &'a RunReport,
    plan: &'a Plan,
}

impl Mermaid<'_> {
    /// Maps a duration onto a green-yellow-red gradient.
    fn heat(value: f64, min: f64, max: f64) -> String {
        let t = (value - min) / (max - min);

        let (r, g) = if t < 0.5 {
            ((255.0 * t * 2.0) as u8, 255)
        } else {
            (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
        };

        format!("#{r:02X}{g:02X}00")
    }
}

impl Display for Mermaid<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let computed = self
            .report
            .tasks
            .iter()
            .filter(|task| matches!(task.state, TaskState::Committed { cached: false }))
            .filter_map(|task| task.execution)
            .map(|execution| execution.duration.as_secs_f64());

        let (mut min, mut max) = computed.fold((f64::MAX, f64::MIN), |(lo, hi), secs| {
            (lo.min(secs), hi.max(secs))
        });

        if min > max {
            min = 0.0;
            max = 0.0;
        }

        if (max - min).abs() < f64::EPSILON {
            max = min + 1.0;
        }

        for (i, task) in self.report.tasks.iter().enumerate() {
            let name = task.label.replace('"', "\\\"");

            let (extra, color) = match (&task.state, task.execution) {
                (TaskState::Committed { cached: false }, Some(execution)) => (
                    format!("{:.2?}", execution.duration),
                    Self::heat(execution.duration.as_secs_f64(), min, max),
                ),
                (TaskState::Committed { .. }, _) => ("Cached".into(), "#ADD8E6".into()),
                (TaskState::Failed(_), _) => ("Failed".into(), "#FA8072".into()),
                (TaskState::Skipped { .. }, _) => ("Skipped".into(), "#D3D3D3".into()),
                (TaskState::Planned | TaskState::Running, _) => {
                    ("Pending".into(), "#FFFFFF".into())
                }
            };

            writeln!(f, "    {i}[\"{name}\\n{extra}\"]")?;
            writeln!(f, "    style {i} fill:{color}")?;
        }

        for edge in self.plan.graph.raw_edges() {
            let source = &self.plan.graph[edge.source()];
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source().index(),
                source.stage().prefix(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use crate::engine::{ExecutionSettings, planner, runner};
    use crate::testing::{MockCollaborator, scenario, temp_store};

    #[test]
    fn test_mermaid_marks_failures() {
        let (_dir, store) = temp_store();
        let (analyses, hypotheses) = scenario();
        let plan = planner::plan(&analyses, &hypotheses, &[]).unwrap();
        let collab = MockCollaborator::default().failing(StageKind::Propensity, None);

        let report = runner::run(&plan, &store, &collab, &ExecutionSettings::new(1)).unwrap();
        let mermaid = report.render_mermaid(&plan);

        assert!(mermaid.starts_with("graph LR"));
        assert!(mermaid.contains("Failed"));
        assert!(mermaid.contains("Skipped"));
        assert!(mermaid.contains("-- \"Ps\" -->"));
        assert_eq!(mermaid.matches("fill:").count(), plan.len());
    }

    #[test]
    fn test_counts_add_up() {
        let (_dir, store) = temp_store();
        let (analyses, hypotheses) = scenario();
        let plan = planner::plan(&analyses, &hypotheses, &[]).unwrap();
        let collab = MockCollaborator::default().failing(StageKind::OutcomeModel, Some(3));

        let report = runner::run(&plan, &store, &collab, &ExecutionSettings::new(2)).unwrap();

        assert!(!report.is_success());
        assert_eq!(
            report.computed() + report.cached() + report.failed() + report.skipped(),
            plan.len()
        );
        for (task, _) in report.failures() {
            assert_eq!(task.id.stage, StageKind::OutcomeModel);
            assert!(task.execution.is_some());
            assert!(report.state(&task.id).unwrap().is_failed());
        }
    }
}
