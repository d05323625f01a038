use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use crate::engine::node::{Body, Guard, TaskNode};
use crate::engine::runner::{Report, run_tasks_parallel};
use crate::error::GraphError;

/// Name of the implicit root node.
pub const DEFAULT_TARGET: &str = "Default";

/// Collects task definitions before they are validated into a [`TaskGraph`].
///
/// # Example
///
/// ```rust
/// use dehumidifier::engine::GraphBuilder;
///
/// let mut builder = GraphBuilder::<()>::new();
/// builder.task("Clean").run(|_| Ok(()));
/// builder.task("Build").after(["Clean"]).run(|_| Ok(()));
/// builder.default_target(["Build"]);
///
/// let graph = builder.build().unwrap();
/// let report = graph.run_default(&()).unwrap();
/// assert!(report.is_success());
/// ```
pub struct GraphBuilder<C> {
    nodes: Vec<TaskNode<C>>,
    terminals: Option<Vec<Cow<'static, str>>>,
}

impl<C> Default for GraphBuilder<C> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            terminals: None,
        }
    }
}

impl<C> GraphBuilder<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the definition of a task. The task is registered once
    /// [`TaskDef::run`] or [`TaskDef::register`] is called.
    pub fn task(&mut self, name: impl Into<Cow<'static, str>>) -> TaskDef<'_, C> {
        TaskDef {
            builder: self,
            name: name.into(),
            description: None,
            predecessors: Vec::new(),
            guard: None,
        }
    }

    /// Declares the nodes the implicit [`DEFAULT_TARGET`] depends on. Without
    /// this, every node that nothing else depends on is used.
    pub fn default_target<I, S>(&mut self, terminals: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'static, str>>,
    {
        self.terminals = Some(terminals.into_iter().map(Into::into).collect());
        self
    }

    /// Validates the definitions and links them into a graph.
    pub fn build(self) -> Result<TaskGraph<C>, GraphError> {
        let mut graph = DiGraph::<TaskNode<C>, ()>::new();
        let mut index = HashMap::new();

        for node in self.nodes {
            if node.name == DEFAULT_TARGET || index.contains_key(node.name.as_ref()) {
                return Err(GraphError::DuplicateTask(node.name.into_owned()));
            }
            let name = node.name.to_string();
            index.insert(name, graph.add_node(node));
        }

        let mut missing = Vec::new();
        let mut edges = Vec::new();

        for node in graph.node_indices() {
            for predecessor in &graph[node].predecessors {
                match index.get(predecessor.as_ref()) {
                    Some(&source) => edges.push((source, node)),
                    None => missing.push((graph[node].name.to_string(), predecessor.to_string())),
                }
            }
        }

        let terminals: Vec<Cow<'static, str>> = match self.terminals {
            Some(terminals) => terminals,
            None => graph
                .node_indices()
                .filter(|&i| {
                    !edges.iter().any(|&(source, _)| source == i)
                })
                .map(|i| graph[i].name.clone())
                .collect(),
        };

        let default = graph.add_node(TaskNode {
            name: Cow::Borrowed(DEFAULT_TARGET),
            description: None,
            predecessors: terminals.clone(),
            guard: None,
            body: None,
        });

        for terminal in &terminals {
            match index.get(terminal.as_ref()) {
                Some(&source) => edges.push((source, default)),
                None => missing.push((DEFAULT_TARGET.to_string(), terminal.to_string())),
            }
        }

        if !missing.is_empty() {
            return Err(GraphError::MissingPredecessors(missing));
        }

        for (source, target) in edges {
            graph.update_edge(source, target, ());
        }
        index.insert(DEFAULT_TARGET.to_string(), default);

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(GraphError::Cycle(graph[cycle.node_id()].name.to_string()));
        }

        Ok(TaskGraph {
            graph,
            index,
            default,
        })
    }
}

/// A task definition in progress.
pub struct TaskDef<'a, C> {
    builder: &'a mut GraphBuilder<C>,
    name: Cow<'static, str>,
    description: Option<Cow<'static, str>>,
    predecessors: Vec<Cow<'static, str>>,
    guard: Option<Guard<C>>,
}

impl<'a, C> TaskDef<'a, C> {
    pub fn describe(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds predecessors. The task will not start until all of them are done.
    pub fn after<I, S>(mut self, predecessors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'static, str>>,
    {
        for predecessor in predecessors {
            let predecessor = predecessor.into();
            if !self.predecessors.contains(&predecessor) {
                self.predecessors.push(predecessor);
            }
        }
        self
    }

    /// Sets the run guard, evaluated once all predecessors are done. When it
    /// returns `false` the task is skipped.
    pub fn only_if<F>(mut self, guard: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Registers the task with the given body.
    pub fn run<F>(self, body: F)
    where
        F: Fn(&C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.finish(Some(Box::new(body)));
    }

    /// Registers the task without a body.
    pub fn register(self) {
        self.finish(None);
    }

    fn finish(self, body: Option<Body<C>>) {
        self.builder.nodes.push(TaskNode {
            name: self.name,
            description: self.description,
            predecessors: self.predecessors,
            guard: self.guard,
            body,
        });
    }
}

/// A validated, acyclic set of tasks.
pub struct TaskGraph<C> {
    pub(crate) graph: DiGraph<TaskNode<C>, ()>,
    index: HashMap<String, NodeIndex>,
    default: NodeIndex,
}

impl<C> TaskGraph<C> {
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&TaskNode<C>> {
        self.index.get(name).map(|&i| &self.graph[i])
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode<C>> {
        self.graph.node_weights()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Names of every task that runs when `target` is requested, in a valid
    /// execution order.
    pub fn plan(&self, target: &str) -> Result<Vec<&str>, GraphError> {
        let selected = self.select(target)?;
        let order = petgraph::algo::toposort(&self.graph, None)
            .map_err(|cycle| GraphError::Cycle(self.graph[cycle.node_id()].name.to_string()))?;

        Ok(order
            .into_iter()
            .filter(|i| selected.contains(i))
            .map(|i| self.graph[i].name())
            .collect())
    }

    /// The target and all of its transitive predecessors.
    pub(crate) fn select(&self, target: &str) -> Result<HashSet<NodeIndex>, GraphError> {
        let &start = self
            .index
            .get(target)
            .ok_or_else(|| GraphError::UnknownTask(target.to_string()))?;

        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut selected = HashSet::new();
        while let Some(index) = dfs.next(reversed) {
            selected.insert(index);
        }

        Ok(selected)
    }

    pub(crate) fn predecessor_indices(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Incoming)
    }
}

impl<C: Sync> TaskGraph<C> {
    /// Runs `target` and everything it transitively depends on.
    ///
    /// Task failures don't make this return `Err`; they are recorded in the
    /// returned [`Report`].
    pub fn run(&self, target: &str, context: &C) -> Result<Report, GraphError> {
        let selected = self.select(target)?;
        Ok(run_tasks_parallel(self, context, &selected))
    }

    pub fn run_default(&self, context: &C) -> Result<Report, GraphError> {
        self.run(self.graph[self.default].name(), context)
    }
}

impl<C> std::fmt::Display for TaskGraph<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name().replace('"', "\\\"");
            if task.has_guard() {
                writeln!(f, "    {:?}{{\"{}\"}}", index.index(), name)?;
            } else {
                writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
            }
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
