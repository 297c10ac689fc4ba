#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod error;
mod fingerprint;
mod graph;
mod interval;
mod param;
mod requires;
mod runner;
mod target;
mod task;
mod utils;

pub use crate::config::{DEFAULT_SALT_LEN, Settings};
pub use crate::error::*;
pub use crate::fingerprint::{
    Algorithm, Fingerprint, HEX_LEN, SaltedVersions, collision_probability, salted_version,
    salted_version_with,
};
pub use crate::graph::{Node, TaskGraph};
pub use crate::interval::{DateInterval, IntervalKind};
pub use crate::param::{Canonical, Param, Params, Value};
pub use crate::requires::{Dep, Requires};
pub use crate::runner::{Entry, Outcome, Report, RunContext, Runner};
pub use crate::target::{AtomicFile, PathTemplate, Target, TargetSpec, resolve, salted_target};
pub use crate::task::{Descriptor, Task, TaskId};
pub use crate::utils::init_logging;

pub use petgraph::graph::NodeIndex;
