pub use anyhow::Error as RuntimeError;
use thiserror::Error;

use crate::task::TaskId;

/// A parameter value that has no canonical textual form.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RenderError {
    #[error("non-finite float {0} has no canonical rendering")]
    NonFinite(f64),

    #[error("{type_name}: {reason}")]
    Custom {
        type_name: &'static str,
        reason: String,
    },
}

/// Configuration errors detected while assembling a task graph or computing
/// its salted versions. None of these are recoverable by retrying.
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Task '{kind}': significant parameter '{param}' cannot be rendered.\n{source}")]
    Unrenderable {
        kind: String,
        param: String,
        source: RenderError,
    },

    #[error("Task '{task}' depends on '{reference}', which is not part of the graph")]
    Dangling { task: TaskId, reference: TaskId },

    #[error("Task '{task}' depends on '{reference}', which matches several tasks in the graph")]
    AmbiguousReference { task: TaskId, reference: TaskId },

    #[error("Identity '{0}' matches several tasks in the graph")]
    Ambiguous(TaskId),

    #[error("Cycle detected in task graph at '{0}'")]
    Cycle(TaskId),

    #[error("Node {0} does not belong to this graph")]
    UnknownNode(usize),
}

/// A path template that cannot be parsed or filled.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TargetError {
    #[error("Unclosed '{{' at byte {offset} in template '{template}'")]
    Unclosed { template: String, offset: usize },

    #[error("Unmatched '}}' at byte {offset} in template '{template}'")]
    Unmatched { template: String, offset: usize },

    #[error("Empty placeholder at byte {offset} in template '{template}'")]
    Empty { template: String, offset: usize },

    #[error("Unknown placeholder '{{{name}}}' in template '{template}'")]
    Unknown { template: String, name: String },

    #[error("Parameter '{name}' cannot be rendered into a path.\n{source}")]
    Param { name: String, source: RenderError },

    #[error("Salt length must be between 1 and 64, got '{0}'")]
    SaltLength(String),

    #[error("Template '{0}' resolves to an empty path")]
    EmptyPath(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse configuration file.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value '{value}' for environment variable {var}")]
    Env { var: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Error while resolving the task graph.\n{0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Task '{0}': couldn't resolve target.\n{1}")]
    Target(TaskId, TargetError),

    #[error("Task '{0}':\n{1}")]
    Task(TaskId, RuntimeError),

    #[error("Tasks '{first}' and '{second}' both write to '{path}'")]
    TargetConflict {
        path: camino::Utf8PathBuf,
        first: TaskId,
        second: TaskId,
    },

    #[error("Task '{task}' finished without writing its target '{path}'")]
    MissingOutput { task: TaskId, path: camino::Utf8PathBuf },

    #[error("Failed to build thread pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
