use std::borrow::Cow;
use std::fmt::{Debug, Formatter};

use crate::error::SharedError;

pub(crate) type Guard<C> = Box<dyn Fn(&C) -> bool + Send + Sync>;
pub(crate) type Body<C> = Box<dyn Fn(&C) -> anyhow::Result<()> + Send + Sync>;

/// A unit of work in the task graph.
///
/// The guard and the body both receive the shared context by reference. A
/// node without a body only exists to group its predecessors.
pub struct TaskNode<C> {
    pub(crate) name: Cow<'static, str>,
    pub(crate) description: Option<Cow<'static, str>>,
    pub(crate) predecessors: Vec<Cow<'static, str>>,
    pub(crate) guard: Option<Guard<C>>,
    pub(crate) body: Option<Body<C>>,
}

impl<C> TaskNode<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn predecessors(&self) -> impl Iterator<Item = &str> {
        self.predecessors.iter().map(|p| p.as_ref())
    }

    pub fn has_guard(&self) -> bool {
        self.guard.is_some()
    }
}

impl<C> Debug for TaskNode<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("predecessors", &self.predecessors)
            .field("guard", &self.guard.is_some())
            .field("body", &self.body.is_some())
            .finish()
    }
}

/// Why a node ended up [`NodeState::Failed`].
#[derive(Debug, Clone)]
pub enum Failure {
    /// The node's own guard or body failed.
    Error(SharedError),
    /// A predecessor failed; holds the name of the node where the failure
    /// originated. Neither guard nor body were evaluated.
    Upstream(String),
}

/// Life cycle of a node during a single run.
///
/// `Pending -> Skipped`, `Pending -> Running -> Succeeded` and
/// `Pending -> Running -> Failed` are the only transitions, except for
/// upstream failures which go from `Pending` straight to `Failed`.
#[derive(Debug, Clone, Default)]
pub enum NodeState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Skipped,
    Failed(Failure),
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Skipped | NodeState::Failed(_)
        )
    }

    /// Terminal states that let dependents proceed.
    pub fn is_complete(&self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, NodeState::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Succeeded => "succeeded",
            NodeState::Skipped => "skipped",
            NodeState::Failed(Failure::Error(_)) => "failed",
            NodeState::Failed(Failure::Upstream(_)) => "failed (upstream)",
        }
    }
}
