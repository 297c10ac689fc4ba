//! The dependency graph assembled from a set of root tasks.
//!
//! Tasks only know how to declare their direct dependencies. Walking those
//! declarations from the requested roots yields a read-only DAG. Two task
//! instances become one node only when they are interchangeable: same
//! identity, same dependency nodes in the same order, same declared output,
//! and same values for the insignificant parameters that appear in the output
//! path. The graph is rebuilt for every run and never persisted.
//!
//! Assembly is where configuration errors surface: unrenderable significant
//! parameters, references to tasks that are not part of the graph or that
//! match several of them, and cycles.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::sync::Arc;

use petgraph::Graph;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;

use crate::error::FingerprintError;
use crate::requires::Dep;
use crate::target::TargetSpec;
use crate::task::{Task, TaskId};

/// A single task in the graph together with its ordered direct dependencies.
pub struct Node {
    id: TaskId,
    task: Arc<dyn Task>,
    dependencies: Vec<NodeIndex>,
}

impl Node {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    /// Direct dependencies in flattened declaration order.
    pub fn dependencies(&self) -> &[NodeIndex] {
        &self.dependencies
    }
}

/// Read-only view of the task DAG reachable from a set of roots.
///
/// Edges point from a dependency to its dependent.
pub struct TaskGraph {
    graph: Graph<Node, ()>,
    index: HashMap<TaskId, Vec<NodeIndex>>,
    roots: Vec<NodeIndex>,
    order: Vec<NodeIndex>,
}

/// Everything about a task instance that decides whether it can share a node,
/// apart from its dependencies.
#[derive(Clone, PartialEq, Eq, Hash)]
struct Shape {
    id: TaskId,
    output: Option<TargetSpec>,
    partition: Vec<(String, String)>,
}

impl Shape {
    fn of(task: &dyn Task) -> Result<Self, FingerprintError> {
        let id = TaskId::of(task)?;
        let output = task.output();
        let partition = match &output {
            Some(spec) => spec.partition(&task.params()),
            None => Vec::new(),
        };

        Ok(Self {
            id,
            output,
            partition,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum Slot {
    Node(NodeIndex),
    Id(TaskId),
}

/// A task whose dependencies are still being placed.
struct Frame {
    task: Arc<dyn Task>,
    shape: Shape,
    requires: std::vec::IntoIter<Dep>,
    slots: Vec<Slot>,
}

struct Assembler {
    graph: Graph<Node, ()>,
    interned: HashMap<(Shape, Vec<Slot>), NodeIndex>,
    slots: HashMap<NodeIndex, Vec<Slot>>,
    /// Instances already placed, held so that no address is reused while
    /// the walk runs.
    placed: HashMap<*const (), (NodeIndex, Arc<dyn Task>)>,
}

fn address(task: &Arc<dyn Task>) -> *const () {
    Arc::as_ptr(task).cast::<()>()
}

impl Assembler {
    fn frame(task: Arc<dyn Task>) -> Result<Frame, FingerprintError> {
        let shape = Shape::of(task.as_ref())?;
        let requires = task.requires().flatten().into_iter();

        Ok(Frame {
            task,
            shape,
            requires,
            slots: Vec::new(),
        })
    }

    /// Places `root` and everything it depends on, dependencies first, and
    /// returns its node.
    fn place(&mut self, root: Arc<dyn Task>) -> Result<NodeIndex, FingerprintError> {
        if let Some(&(index, _)) = self.placed.get(&address(&root)) {
            return Ok(index);
        }

        let mut frame = Self::frame(root)?;
        let mut path = HashSet::from([frame.shape.clone()]);
        // ancestors of `frame`, innermost last
        let mut stack: Vec<Frame> = Vec::new();

        loop {
            match frame.requires.next() {
                Some(Dep::Id(id)) => frame.slots.push(Slot::Id(id)),
                Some(Dep::Task(task)) => {
                    if let Some(&(index, _)) = self.placed.get(&address(&task)) {
                        frame.slots.push(Slot::Node(index));
                        continue;
                    }

                    let child = Self::frame(task)?;
                    // A task can't need an instance of itself, however deep.
                    if !path.insert(child.shape.clone()) {
                        return Err(FingerprintError::Cycle(child.shape.id));
                    }
                    stack.push(std::mem::replace(&mut frame, child));
                }
                None => {
                    path.remove(&frame.shape);

                    match stack.pop() {
                        Some(parent) => {
                            let done = std::mem::replace(&mut frame, parent);
                            let index = self.intern(done);
                            frame.slots.push(Slot::Node(index));
                        }
                        None => return Ok(self.intern(frame)),
                    }
                }
            }
        }
    }

    /// Returns the node for a finished frame, adding one unless an
    /// interchangeable instance was placed before. The first one seen is kept.
    fn intern(&mut self, frame: Frame) -> NodeIndex {
        let Frame {
            task, shape, slots, ..
        } = frame;

        let key = (shape, slots);
        let index = match self.interned.get(&key) {
            Some(&index) => index,
            None => {
                let index = self.graph.add_node(Node {
                    id: key.0.id.clone(),
                    task: task.clone(),
                    dependencies: Vec::new(),
                });
                self.slots.insert(index, key.1.clone());
                self.interned.insert(key, index);
                index
            }
        };

        self.placed.insert(address(&task), (index, task));
        index
    }
}

impl TaskGraph {
    /// Walks the declared dependencies of `roots` and builds the graph.
    pub fn assemble<I>(roots: I) -> Result<Self, FingerprintError>
    where
        I: IntoIterator<Item = Arc<dyn Task>>,
    {
        let mut asm = Assembler {
            graph: Graph::new(),
            interned: HashMap::new(),
            slots: HashMap::new(),
            placed: HashMap::new(),
        };

        let mut root_nodes = Vec::new();
        for task in roots {
            let index = asm.place(task)?;
            if !root_nodes.contains(&index) {
                root_nodes.push(index);
            }
        }

        let Assembler {
            mut graph,
            mut slots,
            ..
        } = asm;

        let mut index: HashMap<TaskId, Vec<NodeIndex>> = HashMap::new();
        for node in graph.node_indices() {
            index.entry(graph[node].id.clone()).or_default().push(node);
        }

        // References by identity can only be checked once every task reachable
        // from the roots is known.
        for node in graph.node_indices() {
            let list = slots.remove(&node).unwrap_or_default();
            let mut dependencies = Vec::with_capacity(list.len());

            for slot in list {
                let dependency = match slot {
                    Slot::Node(dependency) => dependency,
                    Slot::Id(id) => match index.get(&id).map(Vec::as_slice) {
                        Some(&[dependency]) => dependency,
                        Some([_, _, ..]) => {
                            return Err(FingerprintError::AmbiguousReference {
                                task: graph[node].id.clone(),
                                reference: id,
                            });
                        }
                        _ => {
                            return Err(FingerprintError::Dangling {
                                task: graph[node].id.clone(),
                                reference: id,
                            });
                        }
                    },
                };
                dependencies.push(dependency);
            }

            for &dependency in &dependencies {
                graph.update_edge(dependency, node, ());
            }
            graph[node].dependencies = dependencies;
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| FingerprintError::Cycle(graph[cycle.node_id()].id.clone()))?;

        tracing::debug!(tasks = graph.node_count(), "assembled task graph");

        Ok(Self {
            graph,
            index,
            roots: root_nodes,
            order,
        })
    }

    /// Number of distinct tasks.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn roots(&self) -> &[NodeIndex] {
        &self.roots
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.graph.node_weight(index)
    }

    /// The node with identity `id`, if exactly one node has it.
    pub fn find(&self, id: &TaskId) -> Option<NodeIndex> {
        match self.find_all(id) {
            &[index] => Some(index),
            _ => None,
        }
    }

    /// Every node with identity `id`. Tasks partitioned by an insignificant
    /// parameter share their identity but not their node.
    pub fn find_all(&self, id: &TaskId) -> &[NodeIndex] {
        self.index.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// All nodes, every dependency listed before its dependents.
    pub fn topological(&self) -> &[NodeIndex] {
        &self.order
    }

    /// Nodes that list `index` as a direct dependency.
    pub fn dependents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .neighbors_directed(index, petgraph::Direction::Outgoing)
    }
}

impl std::ops::Index<NodeIndex> for TaskGraph {
    type Output = Node;

    fn index(&self, index: NodeIndex) -> &Self::Output {
        &self.graph[index]
    }
}

/// Renders the graph as a Mermaid flowchart.
impl Display for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for &index in &self.order {
            let name = self.graph[index].id.as_str().replace('"', "#quot;");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for &index in &self.order {
            for dependency in &self.graph[index].dependencies {
                writeln!(f, "    {} --> {}", dependency.index(), index.index())?;
            }
        }

        Ok(())
    }
}
