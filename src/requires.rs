//! Declared dependencies and their flattening.
//!
//! A task declares what it needs as an arbitrarily nested [`Requires`]
//! structure. The salted version only sees the flattened sequence, so the
//! flattening order is part of the hash contract:
//!
//! * sequences keep their element order,
//! * nested structures are walked depth-first, left to right,
//! * keyed collections are walked in ascending key order, whatever order the
//!   entries were inserted in.

use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::task::{Task, TaskId};

/// Raw, possibly nested, dependency declaration of a task.
#[derive(Clone, Default)]
pub enum Requires {
    /// No dependencies.
    #[default]
    None,
    /// A single upstream task.
    Task(Arc<dyn Task>),
    /// An upstream task referenced by identity. It must be reachable from the
    /// roots the graph is assembled from, otherwise the reference dangles.
    Id(TaskId),
    /// An ordered sequence.
    Seq(Vec<Requires>),
    /// A keyed collection, flattened in key order.
    Keyed(Vec<(String, Requires)>),
}

impl Requires {
    pub fn none() -> Self {
        Requires::None
    }

    pub fn task<T: Task>(task: T) -> Self {
        Requires::Task(Arc::new(task))
    }

    pub fn shared(task: Arc<dyn Task>) -> Self {
        Requires::Task(task)
    }

    pub fn id(id: impl Into<TaskId>) -> Self {
        Requires::Id(id.into())
    }

    pub fn seq<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Requires>,
    {
        Requires::Seq(items.into_iter().map(Into::into).collect())
    }

    /// Any map-like collection, e.g. a `HashMap<String, Requires>`. Iteration
    /// order of the source collection doesn't matter.
    pub fn keyed<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Requires)>,
        K: Into<String>,
    {
        Requires::Keyed(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.flatten().is_empty()
    }

    /// Flattens the declaration into the ordered list of direct dependencies.
    pub fn flatten(&self) -> Vec<Dep> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }

    fn collect_into(&self, out: &mut Vec<Dep>) {
        match self {
            Requires::None => {}
            Requires::Task(task) => out.push(Dep::Task(task.clone())),
            Requires::Id(id) => out.push(Dep::Id(id.clone())),
            Requires::Seq(items) => {
                for item in items {
                    item.collect_into(out);
                }
            }
            Requires::Keyed(entries) => {
                let mut sorted: Vec<_> = entries.iter().collect();
                // stable, so repeated keys keep their relative order
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                for (_, item) in sorted {
                    item.collect_into(out);
                }
            }
        }
    }
}

impl From<Arc<dyn Task>> for Requires {
    fn from(task: Arc<dyn Task>) -> Self {
        Requires::Task(task)
    }
}

impl From<TaskId> for Requires {
    fn from(id: TaskId) -> Self {
        Requires::Id(id)
    }
}

impl From<Vec<Requires>> for Requires {
    fn from(items: Vec<Requires>) -> Self {
        Requires::Seq(items)
    }
}

impl FromIterator<Requires> for Requires {
    fn from_iter<I: IntoIterator<Item = Requires>>(iter: I) -> Self {
        Requires::Seq(iter.into_iter().collect())
    }
}

impl Debug for Requires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requires::None => write!(f, "None"),
            Requires::Task(task) => write!(f, "Task({})", task.kind()),
            Requires::Id(id) => write!(f, "Id({id})"),
            Requires::Seq(items) => f.debug_list().entries(items).finish(),
            Requires::Keyed(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k, v)))
                .finish(),
        }
    }
}

/// A direct dependency after flattening.
#[derive(Clone)]
pub enum Dep {
    Task(Arc<dyn Task>),
    Id(TaskId),
}

impl Debug for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dep::Task(task) => write!(f, "Task({})", task.kind()),
            Dep::Id(id) => write!(f, "Id({id})"),
        }
    }
}
