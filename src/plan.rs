//! Installation plans produced by the resolver.
//!
//! A plan is a list of nodes in dependency-first order: every node's
//! dependencies appear strictly earlier. Nodes refer to their dependencies by
//! index into the same list.

use crate::formula::{DependencyKind, Formula};
use crate::version::Version;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// What the installer does with a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Install,
    Upgrade { from: Version },
    /// The installed version already satisfies every requirement
    Skip,
}

impl Action {
    pub fn changes_state(&self) -> bool {
        !matches!(self, Action::Skip)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Install => f.write_str("install"),
            Action::Upgrade { .. } => f.write_str("upgrade"),
            Action::Skip => f.write_str("skip"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub name: String,
    /// Absent for skipped nodes whose formula the store no longer knows
    pub formula: Option<Arc<Formula>>,
    pub version: Version,
    pub variants: BTreeSet<String>,
    /// Plan indices of direct dependencies
    pub dependencies: Vec<usize>,
    /// Edge kind for each entry of `dependencies`
    pub dependency_kinds: Vec<DependencyKind>,
    pub action: Action,
    /// Named by the user
    pub requested: bool,
    /// False for nodes only needed to build other nodes
    pub retained: bool,
}

impl ResolvedNode {
    pub fn is_build_only(&self) -> bool {
        !self.retained
    }
}

/// A soft edge removed so resolution could succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedEdge {
    pub from: String,
    pub to: String,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Default)]
pub struct InstallationPlan {
    nodes: Vec<ResolvedNode>,
    dropped: Vec<DroppedEdge>,
}

impl InstallationPlan {
    pub(crate) fn new(nodes: Vec<ResolvedNode>, dropped: Vec<DroppedEdge>) -> Self {
        let plan = Self { nodes, dropped };
        debug_assert!(plan.is_topologically_ordered());
        plan
    }

    pub fn nodes(&self) -> &[ResolvedNode] {
        &self.nodes
    }

    pub fn dropped(&self) -> &[DroppedEdge] {
        &self.dropped
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Names in plan order
    pub fn names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Nodes that install or upgrade something
    pub fn changes(&self) -> impl Iterator<Item = &ResolvedNode> {
        self.nodes.iter().filter(|n| n.action.changes_state())
    }

    /// Stop treating `names` as user requests, so their receipts keep
    /// marking them as dependencies
    pub(crate) fn unmark_requested(&mut self, names: &[&str]) {
        for node in &mut self.nodes {
            if names.contains(&node.name.as_str()) {
                node.requested = false;
            }
        }
    }

    /// Every dependency index is smaller than its dependent's index
    pub fn is_topologically_ordered(&self) -> bool {
        self.nodes
            .iter()
            .enumerate()
            .all(|(i, node)| node.dependencies.iter().all(|&d| d < i))
    }
}

/// Human-readable preview of a plan, one line per node plus dropped edges
pub fn plan_summary(plan: &InstallationPlan) -> Vec<String> {
    let mut lines: Vec<String> = plan
        .nodes()
        .iter()
        .map(|node| {
            let mut line = match &node.action {
                Action::Install => format!("install {} {}", node.name, node.version),
                Action::Upgrade { from } => {
                    format!("upgrade {} {} -> {}", node.name, from, node.version)
                }
                Action::Skip => format!("skip {} {} (already installed)", node.name, node.version),
            };
            if !node.variants.is_empty() {
                let variants: Vec<&str> = node.variants.iter().map(String::as_str).collect();
                line.push_str(&format!(" [{}]", variants.join(",")));
            }
            if node.is_build_only() && node.action.changes_state() {
                line.push_str(" (build only)");
            }
            line
        })
        .collect();

    lines.extend(plan.dropped().iter().map(|edge| {
        format!(
            "dropped {} dependency {} -> {}",
            edge.kind.as_str(),
            edge.from,
            edge.to
        )
    }));
    lines
}
