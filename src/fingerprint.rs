//! Salted versions: content addresses for tasks and their whole lineage.
//!
//! The salted version of a task is the hash of a message built from
//!
//! 1. the lowercase hex salted versions of its direct dependencies, in
//!    flattened declaration order, concatenated without separator;
//! 2. followed by the task's identity string,
//!    `kind,code_version[,name=value...]` (see [`TaskId::of`]).
//!
//! Because every dependency contributes its own salted version, a change
//! anywhere upstream (a kind, a code version, a significant parameter)
//! changes the digest of every task downstream of it, and of nothing else.
//!
//! Computation is pure and memoized per graph: a dependency shared by many
//! tasks is hashed exactly once.
//!
//! ## Short salts
//!
//! Output paths usually embed only a prefix of the digest
//! ([`Fingerprint::salt`]). A prefix of `n` hex characters has `16^n`
//! possible values, so over `N` distinct tasks the chance that two of them
//! share a salt is roughly `N² / 2 · 16^-n` (see [`collision_probability`]).
//! Six characters is fine for a few hundred outputs of one task family; the
//! full digest is always kept alongside the salt.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::FingerprintError;
use crate::graph::TaskGraph;
use crate::task::{Task, TaskId};

/// Length of a full digest in hex characters.
pub const HEX_LEN: usize = 64;

/// A 32-byte digest identifying a task and its lineage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Fingerprint([u8; 32]);

impl<T> From<T> for Fingerprint
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Fingerprint(value.into())
    }
}

impl Fingerprint {
    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(HEX_LEN);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// The first `len` hex characters of the digest, at most the full digest.
    pub fn salt(self, len: usize) -> String {
        let mut hex = self.to_hex();
        hex.truncate(len.min(HEX_LEN));
        hex
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Hash function used for salted versions. Both produce 256-bit digests over
/// the same message, but their digests are of course unrelated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Sha256,
    Blake3,
}

impl Algorithm {
    pub fn digest(self, message: &[u8]) -> Fingerprint {
        match self {
            Algorithm::Sha256 => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&Sha256::digest(message));
                Fingerprint(bytes)
            }
            Algorithm::Blake3 => blake3::Hasher::new().update(message).finalize().into(),
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Algorithm::Sha256),
            "blake3" => Ok(Algorithm::Blake3),
            other => Err(format!("unknown hash algorithm '{other}'")),
        }
    }
}

/// Memoized salted versions over one [`TaskGraph`].
pub struct SaltedVersions<'g> {
    graph: &'g TaskGraph,
    algorithm: Algorithm,
    memo: HashMap<NodeIndex, Fingerprint>,
}

impl<'g> SaltedVersions<'g> {
    pub fn new(graph: &'g TaskGraph, algorithm: Algorithm) -> Self {
        Self {
            graph,
            algorithm,
            memo: HashMap::with_capacity(graph.len()),
        }
    }

    pub fn graph(&self) -> &'g TaskGraph {
        self.graph
    }

    /// Salted version of the task at `index`.
    ///
    /// Dependencies are resolved first, bottom-up, and every result is kept so
    /// that shared ancestors are hashed once.
    pub fn get(&mut self, index: NodeIndex) -> Result<Fingerprint, FingerprintError> {
        if self.graph.node(index).is_none() {
            return Err(FingerprintError::UnknownNode(index.index()));
        }

        // Post-order walk with an explicit stack, deep chains don't grow the
        // call stack.
        let mut stack = vec![(index, false)];

        while let Some((node, expanded)) = stack.pop() {
            if self.memo.contains_key(&node) {
                continue;
            }

            if expanded {
                let message = self.message_for(node);
                let fingerprint = self.algorithm.digest(message.as_bytes());
                tracing::debug!(task = %self.graph[node].id(), %fingerprint, "salted version");
                self.memo.insert(node, fingerprint);
            } else {
                stack.push((node, true));
                for &dependency in self.graph[node].dependencies().iter().rev() {
                    if !self.memo.contains_key(&dependency) {
                        stack.push((dependency, false));
                    }
                }
            }
        }

        Ok(self.memo[&index])
    }

    /// Salted version of the task with identity `id`, `None` if no task in
    /// the graph has it.
    pub fn get_by_id(&mut self, id: &TaskId) -> Result<Option<Fingerprint>, FingerprintError> {
        match self.graph.find_all(id) {
            [] => Ok(None),
            &[index] => self.get(index).map(Some),
            _ => Err(FingerprintError::Ambiguous(id.clone())),
        }
    }

    /// The exact message hashed for the task at `index`.
    pub fn message(&mut self, index: NodeIndex) -> Result<String, FingerprintError> {
        if self.graph.node(index).is_none() {
            return Err(FingerprintError::UnknownNode(index.index()));
        }
        for &dependency in self.graph[index].dependencies() {
            self.get(dependency)?;
        }
        Ok(self.message_for(index))
    }

    /// Salted versions of every task in the graph.
    pub fn all(mut self) -> HashMap<NodeIndex, Fingerprint> {
        for &index in self.graph.topological() {
            if self.memo.contains_key(&index) {
                continue;
            }
            // topological order: every dependency is already memoized
            let message = self.message_for(index);
            let fingerprint = self.algorithm.digest(message.as_bytes());
            self.memo.insert(index, fingerprint);
        }
        self.memo
    }

    /// Requires the salted versions of all dependencies to be memoized.
    fn message_for(&self, index: NodeIndex) -> String {
        let node = &self.graph[index];
        let id = node.id().as_str();
        let mut message = String::with_capacity(node.dependencies().len() * HEX_LEN + id.len());

        for dependency in node.dependencies() {
            message.push_str(&self.memo[dependency].to_hex());
        }

        message.push_str(id);
        message
    }
}

/// Salted version of a single task, computed with SHA-256.
///
/// Every call assembles the task's graph from scratch; to fingerprint many
/// tasks of one graph, use [`SaltedVersions`].
pub fn salted_version(task: Arc<dyn Task>) -> Result<Fingerprint, FingerprintError> {
    salted_version_with(task, Algorithm::Sha256)
}

pub fn salted_version_with(
    task: Arc<dyn Task>,
    algorithm: Algorithm,
) -> Result<Fingerprint, FingerprintError> {
    let graph = TaskGraph::assemble([task])?;
    let root = graph.roots()[0];
    SaltedVersions::new(&graph, algorithm).get(root)
}

/// Approximate probability that at least two of `tasks` distinct tasks share
/// the same salt of `salt_len` hex characters (birthday bound,
/// `N² / 2 · 16^-n`, capped at 1).
pub fn collision_probability(tasks: u64, salt_len: usize) -> f64 {
    let n = tasks as f64;
    let space = 16f64.powi(salt_len.min(HEX_LEN) as i32);
    (n * n / 2.0 / space).min(1.0)
}
