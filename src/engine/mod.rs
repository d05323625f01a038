mod graph;
mod node;
mod runner;

pub use crate::engine::graph::{DEFAULT_TARGET, GraphBuilder, TaskDef, TaskGraph};
pub use crate::engine::node::{Failure, NodeState, TaskNode};
pub use crate::engine::runner::{Report, TaskExecution};
