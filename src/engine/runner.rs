mod diagnostics;

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use console::style;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::graph::TaskGraph;
use crate::engine::node::{Failure, NodeState};
use crate::error::SharedError;
use crate::utils::{STYLE_GRAPH, STYLE_TASK};

pub use diagnostics::Report;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

enum Event {
    /// The guard passed and the body is about to run.
    Started(NodeIndex),
    Finished(NodeIndex, NodeState, Option<TaskExecution>),
}

/// Turns a panic payload into an error.
fn panic_message(panic: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    if let Some(s) = panic.downcast_ref::<&str>() {
        anyhow!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        anyhow!("Task panicked: {s}")
    } else {
        anyhow!("Task panicked with unknown payload")
    }
}

/// Executes the selected nodes of the graph on the rayon thread pool.
///
/// The calling thread acts as the scheduler: it keeps a count of unfinished
/// predecessors for every node and spawns a node as soon as its count drops
/// to zero. Workers report back over a channel.
///
/// Before spawning, the scheduler inspects the predecessors. If any of them
/// failed, the node is marked as failed without ever reaching a worker, so
/// neither its guard nor its body run.
pub(crate) fn run_tasks_parallel<C: Sync>(
    graph: &TaskGraph<C>,
    context: &C,
    nodes_to_run: &HashSet<NodeIndex>,
) -> Report {
    // Build a map from a dependency to the nodes that depend on it.
    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    // A dependency only counts if it's also in the set of nodes to run.
    let mut dependency_counts: HashMap<NodeIndex, usize> = nodes_to_run
        .iter()
        .map(|&i| {
            (
                i,
                graph
                    .predecessor_indices(i)
                    .filter(|dep| nodes_to_run.contains(dep))
                    .count(),
            )
        })
        .collect();

    let mut states: HashMap<NodeIndex, NodeState> = nodes_to_run
        .iter()
        .map(|&i| (i, NodeState::Pending))
        .collect();

    let total_tasks = nodes_to_run.len();
    let mut completed_tasks = 0;
    let mut report = Report::default();

    if total_tasks == 0 {
        return report;
    }

    let root_span = tracing::span!(Level::INFO, "building_tasks");
    root_span.pb_set_length(total_tasks as u64);
    root_span.pb_set_style(&STYLE_GRAPH);
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    // The scheduler loop blocks on the channel, so it must not occupy one of
    // the pool's workers.
    rayon::in_place_scope(|s| {
        let (sender, receiver) = channel::<Event>();

        let spawn_task = |index: NodeIndex, states: &HashMap<NodeIndex, NodeState>| {
            let upstream = graph
                .predecessor_indices(index)
                .find_map(|dep| match states.get(&dep) {
                    Some(NodeState::Failed(Failure::Upstream(origin))) => Some(origin.clone()),
                    Some(NodeState::Failed(Failure::Error(_))) => {
                        Some(graph.graph[dep].name().to_string())
                    }
                    _ => None,
                });

            if let Some(origin) = upstream {
                let _ = sender.send(Event::Finished(
                    index,
                    NodeState::Failed(Failure::Upstream(origin)),
                    None,
                ));
                return;
            }

            let task = &graph.graph[index];
            let sender = sender.clone();

            s.spawn(move |_| {
                let span = tracing::span!(Level::INFO, "task", name = task.name());
                span.pb_set_style(&STYLE_TASK);
                span.pb_set_message(&format!("Running {}", task.name()));
                let _enter = span.enter();

                if let Some(guard) = &task.guard {
                    match catch_unwind(AssertUnwindSafe(|| guard(context))) {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::info!("Skipping {}, guard not met", style(task.name()).dim());
                            let _ = sender.send(Event::Finished(index, NodeState::Skipped, None));
                            return;
                        }
                        Err(panic) => {
                            let error = SharedError::from(panic_message(panic));
                            let state = NodeState::Failed(Failure::Error(error));
                            let _ = sender.send(Event::Finished(index, state, None));
                            return;
                        }
                    }
                }

                let _ = sender.send(Event::Started(index));
                let start = Instant::now();

                let output = match &task.body {
                    Some(body) => match catch_unwind(AssertUnwindSafe(|| body(context))) {
                        Ok(result) => result,
                        Err(panic) => Err(panic_message(panic)),
                    },
                    None => Ok(()),
                };

                let execution = TaskExecution {
                    start,
                    duration: start.elapsed(),
                };

                let state = match output {
                    Ok(()) => NodeState::Succeeded,
                    Err(error) => {
                        tracing::error!("Task {} failed: {:#}", style(task.name()).red(), error);
                        NodeState::Failed(Failure::Error(SharedError::from(error)))
                    }
                };

                let _ = sender.send(Event::Finished(index, state, Some(execution)));
            });
        };

        // Seed initial tasks
        let mut ready: Vec<_> = dependency_counts
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&index, _)| index)
            .collect();
        ready.sort();
        for index in ready {
            spawn_task(index, &states);
        }

        // Scheduler loop
        while completed_tasks < total_tasks {
            let event = match receiver.recv() {
                Ok(event) => event,
                Err(_) => break,
            };

            let (completed_index, state, execution) = match event {
                Event::Started(index) => {
                    states.insert(index, NodeState::Running);
                    continue;
                }
                Event::Finished(index, state, execution) => (index, state, execution),
            };

            let name = graph.graph[completed_index].name().to_string();
            if let Some(execution) = execution {
                report.execution_times.insert(name.clone(), execution);
            }
            report.order.push(name);
            states.insert(completed_index, state);
            completed_tasks += 1;
            root_span.pb_inc(1);

            // Unlock dependents
            if let Some(dependents_of_completed) = dependents.get(&completed_index) {
                for &index in dependents_of_completed {
                    if let Some(count) = dependency_counts.get_mut(&index) {
                        *count -= 1;
                        if *count == 0 {
                            spawn_task(index, &states);
                        }
                    }
                }
            }
        }
    });

    report.states = states
        .into_iter()
        .map(|(index, state)| (graph.graph[index].name().to_string(), state))
        .collect();

    tracing::info!("{}", report.summary());
    report
}
