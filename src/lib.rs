#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;
mod utils;

pub mod context;
pub mod engine;
pub mod framework;
pub mod git;
pub mod keyvalues;
pub mod ledger;
pub mod metadata;
pub mod nuget;
pub mod pipeline;
pub mod process;
pub mod processor;
pub mod steam;

pub use crate::context::{BuildContext, Services, Settings};
pub use crate::core::Hash32;
pub use crate::engine::{DEFAULT_TARGET, GraphBuilder, Report, TaskGraph};
pub use crate::error::*;
pub use crate::ledger::WorkLedger;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
