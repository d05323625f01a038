use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

/// A failure that can be observed by more than one party.
///
/// Ledger waiters and the run report all hold the same underlying error, so
/// the original cause chain is preserved no matter who surfaces it.
#[derive(Clone)]
pub struct SharedError(pub(crate) Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The error this was created from.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(e: anyhow::Error) -> Self {
        SharedError(Arc::new(e))
    }
}

impl Display for SharedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

impl Debug for SharedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task '{0}' is registered more than once")]
    DuplicateTask(String),

    #[error("Tasks depend on undeclared predecessors: {}", format_missing(.0))]
    MissingPredecessors(Vec<(String, String)>),

    #[error("Cycle detected in task graph at task '{0}'")]
    Cycle(String),

    #[error("Unknown task '{0}'")]
    UnknownTask(String),
}

fn format_missing(missing: &[(String, String)]) -> String {
    missing
        .iter()
        .map(|(task, dep)| format!("'{task}' -> '{dep}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Game directory '{0}' does not exist")]
    MissingGame(Utf8PathBuf),

    #[error("'{0}' is not a game folder name")]
    InvalidGame(String),

    #[error("Build ID not provided.")]
    MissingBuildId,

    #[error("Build {0} has no version entry")]
    UnknownBuild(u32),

    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Couldn't read '{0}'.\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Couldn't decode '{0}'.\n{1}")]
    Json(Utf8PathBuf, serde_json::Error),

    #[error("Invalid metadata in '{0}': {1}")]
    Invalid(Utf8PathBuf, String),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Couldn't start {tool}.\n{source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },

    #[error("{tool} returned exit code {}.", .code.map_or_else(|| "<signal>".to_string(), |c| c.to_string()))]
    Exit { tool: String, code: Option<i32> },

    #[error("{tool}: {message}")]
    Output { tool: String, message: String },
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("'{0}' has not been produced yet")]
    Unset(&'static str),

    #[error("'{0}' has already been produced")]
    AlreadySet(&'static str),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Task '{0}' failed")]
    Task(String, #[source] SharedError),
}
