//! The task descriptor: what a node in the graph is and what it needs.
//!
//! A [Task] is identified by its kind, its manually bumped code version and
//! its significant parameters. Together these form the task's [TaskId], which
//! is also the last segment of the message hashed into the salted version.
//!
//! The code version is never inferred. Bump it whenever the logic of a task
//! changes in a way that must invalidate previously written outputs.

use std::borrow::Cow;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use crate::error::FingerprintError;
use crate::param::{Params, Value};
use crate::requires::Requires;
use crate::runner::RunContext;
use crate::target::TargetSpec;

/// A unit of work in a task graph.
///
/// Implementations must be deterministic: `requires` and `output` should be
/// pure functions of the task's kind, version and parameters.
///
/// # Example
///
/// ```rust
/// use saltgraph::{Params, Requires, Task, TargetSpec};
///
/// struct Stream {
///     date: chrono::NaiveDate,
/// }
///
/// impl Task for Stream {
///     fn kind(&self) -> &str {
///         "Stream"
///     }
///
///     fn code_version(&self) -> &str {
///         "1.0"
///     }
///
///     fn params(&self) -> Params {
///         Params::new().significant("date", self.date)
///     }
///
///     fn output(&self) -> Option<TargetSpec> {
///         Some(TargetSpec::new("data/stream/{date}-{salt}.tsv"))
///     }
/// }
/// ```
pub trait Task: Send + Sync + 'static {
    /// Stable name of the task's type or role.
    fn kind(&self) -> &str;

    /// Manually maintained version of the task's logic.
    fn code_version(&self) -> &str;

    fn params(&self) -> Params {
        Params::new()
    }

    /// Upstream tasks, in any nesting.
    fn requires(&self) -> Requires {
        Requires::None
    }

    /// Where the task writes its result. Tasks without an output always run.
    fn output(&self) -> Option<TargetSpec> {
        None
    }

    /// The work itself. On success the task must have written its output
    /// target, if it declares one.
    fn run(&self, _: &RunContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Identity string of a task: `kind,code_version[,name=value...]`, with the
/// significant parameters sorted by name and rendered canonically.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(id: impl AsRef<str>) -> Self {
        TaskId(Arc::from(id.as_ref()))
    }

    /// Builds the identity of `task`.
    ///
    /// Fails if one of the significant parameters has no canonical rendering.
    /// Insignificant parameters are never rendered.
    pub fn of(task: &dyn Task) -> Result<Self, FingerprintError> {
        let kind = task.kind();
        let params = task.params();

        let mut id = String::new();
        id.push_str(kind);
        id.push(',');
        id.push_str(task.code_version());

        for (name, value) in params.significant_iter() {
            let text = value
                .canonical()
                .map_err(|source| FingerprintError::Unrenderable {
                    kind: kind.to_string(),
                    param: name.to_string(),
                    source,
                })?;

            id.push(',');
            id.push_str(name);
            id.push('=');
            id.push_str(&text);
        }

        Ok(TaskId(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", &self.0)
    }
}

impl serde::Serialize for TaskId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        TaskId(value.into())
    }
}

type WorkFn = Arc<dyn Fn(&RunContext) -> anyhow::Result<()> + Send + Sync>;

/// A task described by plain data instead of a dedicated type.
///
/// Useful for graphs assembled at runtime, for example from a configuration
/// file, and in tests.
#[derive(Clone)]
pub struct Descriptor {
    kind: Cow<'static, str>,
    code_version: Cow<'static, str>,
    params: Params,
    requires: Requires,
    output: Option<TargetSpec>,
    work: Option<WorkFn>,
}

impl Descriptor {
    pub fn new(kind: impl Into<Cow<'static, str>>, code_version: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: kind.into(),
            code_version: code_version.into(),
            params: Params::new(),
            requires: Requires::None,
            output: None,
            work: None,
        }
    }

    pub fn significant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name, value, true);
        self
    }

    pub fn insignificant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name, value, false);
        self
    }

    pub fn requires(mut self, requires: impl Into<Requires>) -> Self {
        self.requires = requires.into();
        self
    }

    pub fn output(mut self, output: TargetSpec) -> Self {
        self.output = Some(output);
        self
    }

    pub fn work<F>(mut self, work: F) -> Self
    where
        F: Fn(&RunContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.work = Some(Arc::new(work));
        self
    }

    pub fn shared(self) -> Arc<dyn Task> {
        Arc::new(self)
    }
}

impl Task for Descriptor {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn code_version(&self) -> &str {
        &self.code_version
    }

    fn params(&self) -> Params {
        self.params.clone()
    }

    fn requires(&self) -> Requires {
        self.requires.clone()
    }

    fn output(&self) -> Option<TargetSpec> {
        self.output.clone()
    }

    fn run(&self, ctx: &RunContext) -> anyhow::Result<()> {
        match &self.work {
            Some(work) => work(ctx),
            None => Ok(()),
        }
    }
}

impl Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("kind", &self.kind)
            .field("code_version", &self.code_version)
            .field("params", &self.params)
            .field("requires", &self.requires)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}
