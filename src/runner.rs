//! The execution gate and a reference parallel runner.
//!
//! Before a task runs its salted target is resolved. If the target already
//! exists the task is cached: nothing runs, and its own dependencies aren't
//! even visited. Otherwise the task runs and must leave its target behind.
//! Tasks that declare no target always run.

mod report;

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::Settings;
use crate::error::{BuildError, RuntimeError};
use crate::fingerprint::{Fingerprint, SaltedVersions};
use crate::graph::TaskGraph;
use crate::target::{Target, resolve};
use crate::task::{Task, TaskId};
use crate::utils::{STYLE_BUILD, STYLE_TASK};

pub use report::{Entry, Outcome, Report};

/// What a running task gets to see.
#[derive(Debug, Clone)]
pub struct RunContext {
    id: TaskId,
    fingerprint: Fingerprint,
    output: Option<Target>,
    inputs: Vec<Option<Target>>,
}

impl RunContext {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The target this task must write, if it declares one.
    pub fn output(&self) -> Option<&Target> {
        self.output.as_ref()
    }

    /// Like [`RunContext::output`], but fails for tasks without a target.
    pub fn target(&self) -> anyhow::Result<&Target> {
        self.output
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Task '{}' declares no output", self.id))
    }

    /// Targets of the direct dependencies, in flattened declaration order.
    pub fn inputs(&self) -> &[Option<Target>] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> Option<&Target> {
        self.inputs.get(index)?.as_ref()
    }
}

pub struct Runner {
    settings: Settings,
}

/// Everything known about a graph before anything runs.
struct Plan {
    graph: TaskGraph,
    fingerprints: HashMap<NodeIndex, Fingerprint>,
    targets: HashMap<NodeIndex, Option<Target>>,
    cached: HashSet<NodeIndex>,
    pending: HashSet<NodeIndex>,
}

impl Runner {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Brings every root up to date, running whatever isn't cached.
    pub fn build<I>(&self, roots: I) -> Result<Report, BuildError>
    where
        I: IntoIterator<Item = Arc<dyn Task>>,
    {
        let plan = self.plan(roots)?;

        let pool = match self.settings.threads {
            Some(threads) => Some(rayon::ThreadPoolBuilder::new().num_threads(threads).build()?),
            None => None,
        };

        let durations = run_tasks_parallel(&plan, pool.as_ref())?;

        Ok(plan.into_report(|index| {
            durations
                .get(&index)
                .map(|&duration| Outcome::Executed { duration })
        }))
    }

    /// Resolves everything and reports what [`Runner::build`] would do,
    /// without running a single task.
    pub fn dry_run<I>(&self, roots: I) -> Result<Report, BuildError>
    where
        I: IntoIterator<Item = Arc<dyn Task>>,
    {
        let plan = self.plan(roots)?;
        let pending = plan.pending.clone();
        Ok(plan.into_report(|index| pending.contains(&index).then_some(Outcome::Pending)))
    }

    fn plan<I>(&self, roots: I) -> Result<Plan, BuildError>
    where
        I: IntoIterator<Item = Arc<dyn Task>>,
    {
        let graph = TaskGraph::assemble(roots)?;
        let fingerprints = SaltedVersions::new(&graph, self.settings.algorithm).all();

        // Every target is resolved up front, a bad template or two tasks
        // sharing a path fail the build before anything has run.
        let mut targets = HashMap::with_capacity(graph.len());
        let mut writers: HashMap<Utf8PathBuf, NodeIndex> = HashMap::new();
        for &index in graph.topological() {
            let node = &graph[index];
            let target = match node.task().output() {
                Some(spec) => Some(
                    resolve(node.task().as_ref(), fingerprints[&index], &spec, &self.settings)
                        .map_err(|e| BuildError::Target(node.id().clone(), e))?,
                ),
                None => None,
            };

            if let Some(target) = &target {
                if let Some(&other) = writers.get(target.path()) {
                    return Err(BuildError::TargetConflict {
                        path: target.path().to_owned(),
                        first: graph[other].id().clone(),
                        second: node.id().clone(),
                    });
                }
                writers.insert(target.path().to_owned(), index);
            }

            targets.insert(index, target);
        }

        let mut cached = HashSet::new();
        let mut pending = HashSet::new();
        let mut stack = graph.roots().to_vec();

        while let Some(index) = stack.pop() {
            if cached.contains(&index) || pending.contains(&index) {
                continue;
            }

            match &targets[&index] {
                Some(target) if target.exists() => {
                    tracing::debug!(task = %graph[index].id(), path = %target.path(), "cached");
                    cached.insert(index);
                }
                _ => {
                    pending.insert(index);
                    stack.extend(graph[index].dependencies());
                }
            }
        }

        tracing::info!(
            tasks = graph.len(),
            cached = cached.len(),
            pending = pending.len(),
            "resolved task graph"
        );

        Ok(Plan {
            graph,
            fingerprints,
            targets,
            cached,
            pending,
        })
    }
}

impl Plan {
    fn into_report<F>(self, outcome: F) -> Report
    where
        F: Fn(NodeIndex) -> Option<Outcome>,
    {
        let Plan {
            graph,
            fingerprints,
            mut targets,
            cached,
            ..
        } = self;

        let entries = graph
            .topological()
            .iter()
            .map(|&index| {
                let node = &graph[index];
                let outcome = if cached.contains(&index) {
                    Outcome::Cached
                } else {
                    outcome(index).unwrap_or(Outcome::Pruned)
                };

                Entry {
                    index: index.index(),
                    id: node.id().clone(),
                    fingerprint: fingerprints[&index],
                    target: targets.remove(&index).flatten(),
                    dependencies: node.dependencies().iter().map(|d| d.index()).collect(),
                    outcome,
                }
            })
            .collect();

        Report::new(entries)
    }
}

type TaskResult = (NodeIndex, Result<Duration, BuildError>);

/// Runs `op` on the calling thread, with spawns going to `pool` or to the
/// global pool.
fn in_place_scope<'scope, OP, R>(pool: Option<&rayon::ThreadPool>, op: OP) -> R
where
    OP: FnOnce(&rayon::Scope<'scope>) -> R,
{
    match pool {
        Some(pool) => pool.in_place_scope(op),
        None => rayon::in_place_scope(op),
    }
}

/// Executes all pending tasks, each one as soon as its pending dependencies
/// are done.
///
/// The calling thread only schedules: it waits on a channel for results and
/// spawns the dependents that became ready, so it never occupies a worker.
/// After the first failure nothing new is spawned, tasks already running are
/// allowed to finish.
fn run_tasks_parallel(
    plan: &Plan,
    pool: Option<&rayon::ThreadPool>,
) -> Result<HashMap<NodeIndex, Duration>, BuildError> {
    let graph = &plan.graph;
    let pending = &plan.pending;

    let mut dependency_counts: HashMap<NodeIndex, usize> = pending
        .iter()
        .map(|&index| {
            let unique: HashSet<_> = graph[index]
                .dependencies()
                .iter()
                .filter(|dep| pending.contains(dep))
                .collect();
            (index, unique.len())
        })
        .collect();

    let mut durations = HashMap::with_capacity(pending.len());

    if pending.is_empty() {
        tracing::info!("Nothing to do, all targets exist");
        return Ok(durations);
    }

    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(pending.len() as u64);
    root_span.pb_set_style(&STYLE_BUILD);
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    in_place_scope(pool, |s| -> Result<(), BuildError> {
        let (sender, receiver) = channel::<TaskResult>();

        let spawn_task = |index: NodeIndex| {
            let node = &graph[index];
            let task = node.task().clone();
            let sender = sender.clone();

            let ctx = RunContext {
                id: node.id().clone(),
                fingerprint: plan.fingerprints[&index],
                output: plan.targets[&index].clone(),
                inputs: node
                    .dependencies()
                    .iter()
                    .map(|dep| plan.targets[dep].clone())
                    .collect(),
            };

            s.spawn(move |_| {
                let span = tracing::span!(Level::INFO, "task", id = %ctx.id);
                span.pb_set_style(&STYLE_TASK);
                span.pb_set_message(&format!("Running {}", ctx.id));
                let _enter = span.enter();

                let start = Instant::now();
                let result = run_task(task.as_ref(), &ctx);
                let duration = start.elapsed();

                let result = result.map(|()| duration);
                match &result {
                    Ok(_) => tracing::info!(task = %ctx.id, ?duration, "executed"),
                    Err(e) => tracing::error!(task = %ctx.id, "{e}"),
                }

                // the receiver outlives every spawned task
                let _ = sender.send((index, result));
            });
        };

        let mut running = 0usize;
        for (&index, &count) in &dependency_counts {
            if count == 0 {
                spawn_task(index);
                running += 1;
            }
        }

        let mut failure = None;

        while running > 0 {
            let Ok((index, result)) = receiver.recv() else {
                break;
            };
            running -= 1;

            let duration = match result {
                Ok(duration) => duration,
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                    continue;
                }
            };

            durations.insert(index, duration);
            root_span.pb_inc(1);

            if failure.is_some() {
                continue;
            }

            for dependent in graph.dependents(index) {
                if let Some(count) = dependency_counts.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        spawn_task(dependent);
                        running += 1;
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })?;

    tracing::info!("Build complete!");
    Ok(durations)
}

/// Runs one task behind the gate's postcondition: a task with a target must
/// have written it.
fn run_task(task: &dyn Task, ctx: &RunContext) -> Result<(), BuildError> {
    let result = match catch_unwind(AssertUnwindSafe(|| task.run(ctx))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(RuntimeError::msg(msg))
        }
    };

    result.map_err(|e| BuildError::Task(ctx.id.clone(), e))?;

    match &ctx.output {
        Some(target) if !target.exists() => Err(BuildError::MissingOutput {
            task: ctx.id.clone(),
            path: target.path().to_owned(),
        }),
        _ => Ok(()),
    }
}
