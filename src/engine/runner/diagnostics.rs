use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use crate::engine::TaskGraph;
use crate::engine::TaskExecution;
use crate::engine::node::{Failure, NodeState};
use crate::error::{BuildError, SharedError};

/// Outcome of a graph run.
///
/// Holds the terminal state of every task that was selected for the run, the
/// order in which they reached it and how long the executed ones took.
#[derive(Debug, Default)]
pub struct Report {
    /// Terminal state per task name.
    pub states: BTreeMap<String, NodeState>,
    /// Task names in the order they became terminal.
    pub order: Vec<String>,
    /// Timings of tasks whose body ran.
    pub execution_times: HashMap<String, TaskExecution>,
}

impl Report {
    pub fn state(&self, name: &str) -> Option<&NodeState> {
        self.states.get(name)
    }

    pub fn is_success(&self) -> bool {
        self.states.values().all(NodeState::is_complete)
    }

    /// Tasks whose own guard or body failed, in completion order. Upstream
    /// failures are left out since they only repeat one of these.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &SharedError)> {
        self.order.iter().filter_map(|name| match self.states.get(name) {
            Some(NodeState::Failed(Failure::Error(error))) => Some((name.as_str(), error)),
            _ => None,
        })
    }

    /// Converts the report into an error carrying the first root cause, if any
    /// task failed.
    pub fn into_result(self) -> Result<Self, BuildError> {
        if let Some((name, error)) = self.failures().next() {
            return Err(BuildError::Task(name.to_string(), error.clone()));
        }
        Ok(self)
    }

    fn count(&self, predicate: impl Fn(&NodeState) -> bool) -> usize {
        self.states.values().filter(|s| predicate(s)).count()
    }

    /// One line summary for logging.
    pub fn summary(&self) -> String {
        format!(
            "{} tasks: {} succeeded, {} skipped, {} failed",
            self.states.len(),
            self.count(|s| matches!(s, NodeState::Succeeded)),
            self.count(|s| matches!(s, NodeState::Skipped)),
            self.count(NodeState::is_failed),
        )
    }

    /// Renders the graph as a Mermaid diagram, each task colored by the state
    /// it ended in.
    ///
    /// * **Green**: Succeeded
    /// * **Grey**: Skipped
    /// * **Red**: Failed
    /// * **Orange**: Failed because of a predecessor
    /// * **White**: Not part of this run
    pub fn render_mermaid<C>(&self, graph: &TaskGraph<C>) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for index in graph.graph.node_indices() {
            let task = &graph.graph[index];
            let name = task.name().replace('"', "\\\"");

            let (label, color) = match self.states.get(task.name()) {
                Some(NodeState::Succeeded) => {
                    let time = self
                        .execution_times
                        .get(task.name())
                        .map(|t| format!("{:.2?}", t.duration))
                        .unwrap_or_default();
                    (time, "#90EE90")
                }
                Some(NodeState::Skipped) => ("Skipped".to_string(), "#D3D3D3"),
                Some(NodeState::Failed(Failure::Error(_))) => ("Failed".to_string(), "#FF6B6B"),
                Some(NodeState::Failed(Failure::Upstream(origin))) => {
                    (format!("Blocked by {origin}"), "#FFB347")
                }
                Some(NodeState::Pending | NodeState::Running) | None => {
                    ("Not run".to_string(), "#FFFFFF")
                }
            };

            let _ = writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {:?} fill:{}", index.index(), color);
        }

        for edge in graph.graph.raw_edges() {
            let _ = writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            );
        }

        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::GraphBuilder;
    use anyhow::anyhow;

    #[test]
    fn test_summary_and_mermaid() {
        let mut builder = GraphBuilder::<()>::new();
        builder.task("Ok").run(|_| Ok(()));
        builder.task("Skip").only_if(|_| false).run(|_| Ok(()));
        builder.task("Bad").run(|_| Err(anyhow!("nope")));
        builder.task("Blocked").after(["Bad"]).run(|_| Ok(()));
        let graph = builder.build().unwrap();

        let report = graph.run_default(&()).unwrap();

        assert_eq!(
            report.summary(),
            "5 tasks: 1 succeeded, 1 skipped, 3 failed"
        );
        assert_eq!(report.failures().count(), 1);

        let mermaid = report.render_mermaid(&graph);
        assert!(mermaid.contains("fill:#D3D3D3"));
        assert!(mermaid.contains("Blocked by Bad"));
        assert!(mermaid.contains("fill:#FF6B6B"));
    }
}
