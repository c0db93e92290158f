//! Acquisition chain: the validated tree of acquisition objects.
//!
//! A chain is assembled incrementally with [`ChainBuilder::add`], which creates
//! the master as a root on first use, and frozen by [`ChainBuilder::build`]
//! into an immutable [`AcquisitionChain`]. Structural rules are enforced as
//! early as possible:
//!
//! - a node has at most one parent and no cycles (checked by `add`)
//! - names are unique within a chain (checked by `add`)
//! - a node belongs to one chain only (checked by `add` and `validate`)
//! - exactly one root, which must be a master (checked by `build`)
//! - hardware-triggered children sit under a master able to drive them
//!   (checked by `build`)
//!
//! The [`ExecutionPlan`] groups the tree into levels by depth: a parent is
//! always in an earlier level than its children, and independent branches
//! share a level so their calls run concurrently.
//!
//! # Example
//!
//! ```rust,ignore
//! let timer = AcqNode::master(SoftwareTimerMaster::new("timer", 0.1, 10));
//! let diode = AcqNode::slave(ReadableSlave::new("diode", diode_adapter));
//!
//! let mut builder = ChainBuilder::new();
//! builder.add(&timer, &diode)?;
//! let chain = builder.build()?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::acquisition::{AcqNode, Discipline};
use crate::channel::Channel;
use crate::error::{ChainError, ScanError, ScanResult};

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

/// Index of a node inside one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Position in insertion order
    pub fn index(&self) -> usize {
        self.0
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Incremental chain builder.
#[derive(Debug)]
pub struct ChainBuilder {
    id: u64,
    nodes: Vec<AcqNode>,
    parent: Vec<Option<NodeId>>,
    children: Vec<Vec<NodeId>>,
    by_uid: HashMap<u64, NodeId>,
    by_name: HashMap<String, NodeId>,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            id: NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            parent: Vec::new(),
            children: Vec::new(),
            by_uid: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Insert `child` under `master`, creating `master` as a root if it is new.
    ///
    /// Children of one master keep their insertion order, which is also their
    /// trigger order.
    pub fn add(&mut self, master: &AcqNode, child: &AcqNode) -> Result<&mut Self, ChainError> {
        if !master.is_master() {
            return Err(ChainError::NotAMaster(master.name().to_string()));
        }
        if master.ptr_eq(child) {
            return Err(ChainError::Cycle {
                master: master.name().to_string(),
                child: child.name().to_string(),
            });
        }
        self.check_admissible(master)?;
        self.check_admissible(child)?;

        if let Some(&child_id) = self.by_uid.get(&child.uid()) {
            if let Some(parent_id) = self.parent[child_id.0] {
                return Err(ChainError::AlreadyHasParent {
                    child: child.name().to_string(),
                    parent: self.nodes[parent_id.0].name().to_string(),
                });
            }
            if let Some(&master_id) = self.by_uid.get(&master.uid()) {
                if self.is_ancestor(child_id, master_id) {
                    return Err(ChainError::Cycle {
                        master: master.name().to_string(),
                        child: child.name().to_string(),
                    });
                }
            }
        }

        let master_id = self.insert(master)?;
        let child_id = self.insert(child)?;
        self.parent[child_id.0] = Some(master_id);
        self.children[master_id.0].push(child_id);
        Ok(self)
    }

    /// Add a master with no children (a chain of one node).
    pub fn add_root(&mut self, master: &AcqNode) -> Result<&mut Self, ChainError> {
        if !master.is_master() {
            return Err(ChainError::NotAMaster(master.name().to_string()));
        }
        self.check_admissible(master)?;
        self.insert(master)?;
        Ok(self)
    }

    fn check_admissible(&self, node: &AcqNode) -> Result<(), ChainError> {
        if node.owner().is_some_and(|owner| owner != self.id) {
            return Err(ChainError::ForeignNode(node.name().to_string()));
        }
        if let Some(&existing) = self.by_name.get(node.name()) {
            if !self.nodes[existing.0].ptr_eq(node) {
                return Err(ChainError::DuplicateName(node.name().to_string()));
            }
        }
        Ok(())
    }

    fn is_ancestor(&self, candidate: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == candidate {
                return true;
            }
            match self.parent[node.0] {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    fn insert(&mut self, node: &AcqNode) -> Result<NodeId, ChainError> {
        if let Some(&id) = self.by_uid.get(&node.uid()) {
            return Ok(id);
        }
        if !node.claim(self.id) {
            return Err(ChainError::ForeignNode(node.name().to_string()));
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(node.clone());
        self.parent.push(None);
        self.children.push(Vec::new());
        self.by_uid.insert(node.uid(), id);
        self.by_name.insert(node.name().to_string(), id);
        Ok(id)
    }

    /// Freeze the tree into a validated chain.
    pub fn build(self) -> Result<AcquisitionChain, ChainError> {
        if self.nodes.is_empty() {
            return Err(ChainError::Empty);
        }
        let roots: Vec<NodeId> = (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| self.parent[id.0].is_none())
            .collect();
        if roots.len() > 1 {
            return Err(ChainError::MultipleRoots(
                roots
                    .iter()
                    .map(|id| self.nodes[id.0].name().to_string())
                    .collect(),
            ));
        }
        let root = roots.first().copied().ok_or(ChainError::Cycle {
            master: self.nodes[0].name().to_string(),
            child: self.nodes[0].name().to_string(),
        })?;

        let plan = ExecutionPlan::compute(root, &self.children);
        let chain = AcquisitionChain {
            inner: Arc::new(ChainInner {
                id: self.id,
                root,
                nodes: self.nodes,
                parent: self.parent,
                children: self.children,
                by_uid: self.by_uid,
                plan,
                consumed: AtomicBool::new(false),
            }),
        };
        chain.validate()?;
        Ok(chain)
    }
}

// =============================================================================
// Execution plan
// =============================================================================

/// Ordered levels of a chain.
///
/// Level 0 holds the root; level `n + 1` holds the children of level `n` in
/// insertion order. Prepare runs levels top-down, stop runs them bottom-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    levels: Vec<Vec<NodeId>>,
}

impl ExecutionPlan {
    fn compute(root: NodeId, children: &[Vec<NodeId>]) -> Self {
        let mut levels = Vec::new();
        let mut current = vec![root];
        while !current.is_empty() {
            let next: Vec<NodeId> = current
                .iter()
                .flat_map(|id| children[id.0].iter().copied())
                .collect();
            levels.push(current);
            current = next;
        }
        Self { levels }
    }

    /// Levels from the root down
    pub fn levels(&self) -> &[Vec<NodeId>] {
        &self.levels
    }

    /// Number of levels
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Levels from the leaves up
    pub fn bottom_up(&self) -> impl Iterator<Item = &Vec<NodeId>> {
        self.levels.iter().rev()
    }

    /// Level containing `id`
    pub fn level_of(&self, id: NodeId) -> Option<usize> {
        self.levels.iter().position(|level| level.contains(&id))
    }
}

// =============================================================================
// Chain
// =============================================================================

#[derive(Debug)]
struct ChainInner {
    id: u64,
    root: NodeId,
    nodes: Vec<AcqNode>,
    parent: Vec<Option<NodeId>>,
    children: Vec<Vec<NodeId>>,
    by_uid: HashMap<u64, NodeId>,
    plan: ExecutionPlan,
    consumed: AtomicBool,
}

/// Validated, immutable tree of acquisition objects.
///
/// Cloning is cheap. A chain is consumed by the first scan run that uses it.
#[derive(Debug, Clone)]
pub struct AcquisitionChain {
    inner: Arc<ChainInner>,
}

/// Serializable description of a chain, stored in scan metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainDescription {
    /// Root master name
    pub root: String,
    /// Masters with their direct children and channels
    pub masters: Vec<MasterDescription>,
}

/// One master entry of a [`ChainDescription`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterDescription {
    /// Master name
    pub name: String,
    /// Timing discipline
    pub discipline: Discipline,
    /// Direct children in trigger order
    pub children: Vec<String>,
    /// Channels of the master and its slave children
    pub channels: Vec<String>,
}

impl AcquisitionChain {
    /// Root master
    pub fn root(&self) -> &AcqNode {
        &self.inner.nodes[self.inner.root.0]
    }

    /// All nodes in insertion order
    pub fn nodes(&self) -> &[AcqNode] {
        &self.inner.nodes
    }

    /// Node by id
    pub fn node(&self, id: NodeId) -> &AcqNode {
        &self.inner.nodes[id.0]
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Always false for a built chain
    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    /// Node by name
    pub fn find(&self, name: &str) -> Option<&AcqNode> {
        self.inner.nodes.iter().find(|node| node.name() == name)
    }

    fn id_of(&self, node: &AcqNode) -> Option<NodeId> {
        self.inner.by_uid.get(&node.uid()).copied()
    }

    /// Parent of a node, for traversal only
    pub fn parent_of(&self, node: &AcqNode) -> Option<&AcqNode> {
        let id = self.id_of(node)?;
        self.inner.parent[id.0].map(|parent| self.node(parent))
    }

    /// Direct children of a node in insertion order
    pub fn children_of(&self, node: &AcqNode) -> Vec<AcqNode> {
        self.id_of(node)
            .map(|id| {
                self.inner.children[id.0]
                    .iter()
                    .map(|child| self.node(*child).clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Execution plan computed at build time
    pub fn execution_plan(&self) -> &ExecutionPlan {
        &self.inner.plan
    }

    /// Recompute the execution plan from the tree
    pub fn compute_execution_plan(&self) -> ExecutionPlan {
        ExecutionPlan::compute(self.inner.root, &self.inner.children)
    }

    /// Nodes of each level, top-down
    pub fn levels(&self) -> Vec<Vec<AcqNode>> {
        self.inner
            .plan
            .levels()
            .iter()
            .map(|level| level.iter().map(|id| self.node(*id).clone()).collect())
            .collect()
    }

    /// Every channel of every node, in plan order
    pub fn channels(&self) -> Vec<Channel> {
        self.levels()
            .iter()
            .flatten()
            .flat_map(|node| node.channels().iter().cloned())
            .collect()
    }

    /// Re-check the structural rules.
    pub fn validate(&self) -> Result<(), ChainError> {
        let inner = &self.inner;

        for node in &inner.nodes {
            if node.owner() != Some(inner.id) {
                return Err(ChainError::ForeignNode(node.name().to_string()));
            }
        }

        let roots: Vec<String> = inner
            .parent
            .iter()
            .enumerate()
            .filter(|(_, parent)| parent.is_none())
            .map(|(index, _)| inner.nodes[index].name().to_string())
            .collect();
        if roots.len() != 1 {
            return Err(ChainError::MultipleRoots(roots));
        }
        if !self.root().is_master() {
            return Err(ChainError::NotAMaster(self.root().name().to_string()));
        }

        // every node reachable from the root, each exactly once
        let mut seen = vec![false; inner.nodes.len()];
        let mut queue = VecDeque::from([inner.root]);
        while let Some(id) = queue.pop_front() {
            if std::mem::replace(&mut seen[id.0], true) {
                return Err(ChainError::Cycle {
                    master: self.root().name().to_string(),
                    child: self.node(id).name().to_string(),
                });
            }
            queue.extend(inner.children[id.0].iter().copied());
        }
        if let Some(index) = seen.iter().position(|visited| !visited) {
            return Err(ChainError::MultipleRoots(vec![
                self.root().name().to_string(),
                inner.nodes[index].name().to_string(),
            ]));
        }

        for (index, parent) in inner.parent.iter().enumerate() {
            let Some(parent) = parent else { continue };
            let parent = self.node(*parent);
            let child = &inner.nodes[index];
            if child.requires_hardware_trigger() && !parent.emits_hardware_trigger() {
                return Err(ChainError::IncompatibleTiming {
                    parent: parent.name().to_string(),
                    child: child.name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// True once a scan run has taken the chain
    pub fn is_consumed(&self) -> bool {
        self.inner.consumed.load(Ordering::Acquire)
    }

    /// Mark the chain as run. Fails if it already was.
    pub(crate) fn consume(&self) -> ScanResult<()> {
        if self.inner.consumed.swap(true, Ordering::AcqRel) {
            return Err(ScanError::ChainReused);
        }
        Ok(())
    }

    /// Description stored in scan metadata
    pub fn describe(&self) -> ChainDescription {
        let masters = self
            .levels()
            .into_iter()
            .flatten()
            .filter(|node| node.is_master())
            .map(|master| {
                let children = self.children_of(&master);
                let mut channels: Vec<String> =
                    master.channels().iter().map(|c| c.name().to_string()).collect();
                channels.extend(
                    children
                        .iter()
                        .filter(|child| !child.is_master())
                        .flat_map(|child| child.channels().iter().map(|c| c.name().to_string())),
                );
                MasterDescription {
                    name: master.name().to_string(),
                    discipline: master.discipline().unwrap_or_default(),
                    children: children.iter().map(|c| c.name().to_string()).collect(),
                    channels,
                }
            })
            .collect();
        ChainDescription {
            root: self.root().name().to_string(),
            masters,
        }
    }
}

impl fmt::Display for AcquisitionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn walk(
            chain: &AcquisitionChain,
            id: NodeId,
            depth: usize,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            let node = chain.node(id);
            let kind = if node.is_master() { "master" } else { "slave" };
            writeln!(f, "{:indent$}{} ({})", "", node.name(), kind, indent = depth * 2)?;
            for child in &chain.inner.children[id.0] {
                walk(chain, *child, depth + 1, f)?;
            }
            Ok(())
        }
        walk(self, self.inner.root, 0, f)
    }
}
