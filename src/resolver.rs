//! Dependency resolution.
//!
//! Turns a set of requested [`PackageSpec`]s into an [`InstallationPlan`].
//! Resolution is greedy with bounded backtracking rather than a complete
//! solver:
//!
//! - Nodes live in a flat table, one per package name, so a diamond yields a
//!   single shared node. Edges are indices into the table.
//! - A FIFO work queue re-selects a node whenever its requirements change.
//!   An installed receipt that satisfies every requirement wins and its
//!   dependencies are not expanded; otherwise the highest satisfying formula
//!   version is picked.
//! - When nothing satisfies a node, optional/recommended requirements are
//!   relaxed according to [`SoftEdgePolicy`], then a requester whose
//!   requirement alone blocks the node is moved to an older version.
//! - Once the queue drains, unreachable nodes are pruned and an iterative
//!   depth-first search emits the plan in dependency-first order, reporting
//!   cycles.
//!
//! Resolution never touches the filesystem and keeps no state between calls.
//!
//! # Examples
//!
//! ```no_run
//! use kegbrew::formula::JsonFormulaStore;
//! use kegbrew::resolver::{ResolveOptions, Resolver};
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = JsonFormulaStore::load(Path::new("formula"))?;
//!     let resolver = Resolver::new(&store, ResolveOptions::default());
//!     let plan = resolver.resolve(&["wget".parse()?], &[])?;
//!     for line in kegbrew::plan::plan_summary(&plan) {
//!         println!("{}", line);
//!     }
//!     Ok(())
//! }
//! ```

use crate::cancel::CancellationToken;
use crate::config::SoftEdgePolicy;
use crate::formula::{Dependency, DependencyKind, Formula, FormulaStore};
use crate::plan::{Action, DroppedEdge, InstallationPlan, ResolvedNode};
use crate::receipt::Receipt;
use crate::version::{PackageSpec, Version, VersionConstraint};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Upper bound on queue pops, guarding against selections that never settle
const MAX_STEPS: usize = 1_000_000;
const SUGGESTION_THRESHOLD: f64 = 0.85;
const MAX_SUGGESTIONS: usize = 3;

/// One requirement on a package, with the chain of packages that led to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementTrace {
    pub constraint: VersionConstraint,
    pub variants: BTreeSet<String>,
    /// From the user request down to the requesting package
    pub chain: Vec<String>,
}

impl fmt::Display for RequirementTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.constraint.is_any() {
            f.write_str("any version")?;
        } else {
            write!(f, "{}", self.constraint)?;
        }
        if !self.variants.is_empty() {
            let variants: Vec<&str> = self.variants.iter().map(String::as_str).collect();
            write!(f, " [{}]", variants.join(","))?;
        }
        if self.chain.is_empty() {
            f.write_str(" (requested)")
        } else {
            write!(f, " (required by {})", self.chain.join(" -> "))
        }
    }
}

fn format_chain(chain: &[String]) -> String {
    if chain.is_empty() {
        String::new()
    } else {
        format!(" (required by {})", chain.join(" -> "))
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!("; did you mean {}?", suggestions.join(", "))
    }
}

fn format_requirements(requirements: &[RequirementTrace]) -> String {
    requirements
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn installed_note(installed: &bool) -> &'static str {
    if *installed { " (installed)" } else { "" }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No formula named '{name}'{}{}", format_chain(.chain), format_suggestions(.suggestions))]
    FormulaNotFound {
        name: String,
        chain: Vec<String>,
        suggestions: Vec<String>,
    },

    #[error("No version of '{name}'{} satisfies: {}", format_chain(.chain), format_requirements(.constraints))]
    VersionConflict {
        name: String,
        constraints: Vec<RequirementTrace>,
        chain: Vec<String>,
    },

    #[error("Circular dependency: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("'{name}' conflicts with '{other}'{}", installed_note(.installed))]
    Conflict {
        name: String,
        other: String,
        /// `other` is already installed rather than part of the plan
        installed: bool,
    },

    #[error("Gave up resolving '{name}' after {attempts} backtracking attempts")]
    BacktrackLimit { name: String, attempts: usize },

    #[error("Resolution cancelled")]
    Cancelled,
}

/// Resolution failure as shown to the user
pub type ConflictReport = ResolveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub soft_edge_policy: SoftEdgePolicy,
    /// Follow build edges (build-only nodes are staged but not kept)
    pub include_build_dependencies: bool,
    pub max_backtracks: usize,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            soft_edge_policy: SoftEdgePolicy::Warn,
            include_build_dependencies: true,
            max_backtracks: 64,
        }
    }
}

/// Read-only resolver over a formula store
pub struct Resolver<'a> {
    store: &'a dyn FormulaStore,
    options: ResolveOptions,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a dyn FormulaStore, options: ResolveOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    /// Resolve `requests` against the store, preferring `installed` packages
    pub fn resolve(
        &self,
        requests: &[PackageSpec],
        installed: &[Receipt],
    ) -> Result<InstallationPlan, ResolveError> {
        self.resolve_with_cancel(requests, installed, &CancellationToken::new())
    }

    pub fn resolve_with_cancel(
        &self,
        requests: &[PackageSpec],
        installed: &[Receipt],
        cancel: &CancellationToken,
    ) -> Result<InstallationPlan, ResolveError> {
        tracing::debug!("Resolving {} requests", requests.len());
        let mut graph = Graph::new(self, installed);
        graph.seed(requests);
        graph.run(cancel)?;
        graph.finish(requests)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requester {
    User(usize),
    Node(usize),
}

#[derive(Debug, Clone)]
struct Requirement {
    requester: Requester,
    constraint: VersionConstraint,
    variants: BTreeSet<String>,
    kind: DependencyKind,
}

#[derive(Debug, Clone)]
enum Choice {
    /// Keep the installed receipt
    Installed(Version),
    Formula(Arc<Formula>),
}

impl Choice {
    fn version(&self) -> &Version {
        match self {
            Choice::Installed(version) => version,
            Choice::Formula(formula) => &formula.version,
        }
    }

    fn same_as(&self, other: &Choice) -> bool {
        match (self, other) {
            (Choice::Installed(a), Choice::Installed(b)) => a == b,
            (Choice::Formula(a), Choice::Formula(b)) => a.version == b.version,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Node {
    name: String,
    /// All known versions, newest first; loaded on first selection
    candidates: Option<Vec<Arc<Formula>>>,
    requirements: Vec<Requirement>,
    choice: Option<Choice>,
    /// Versions ruled out by backtracking. Ordered so `1.0` and `1.0.0` are
    /// one entry.
    excluded: BTreeSet<Version>,
    /// Outgoing edges of the current choice, in declaration order
    edges: Vec<(usize, Dependency)>,
}

impl Node {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            candidates: None,
            requirements: Vec::new(),
            choice: None,
            excluded: BTreeSet::new(),
            edges: Vec::new(),
        }
    }

    fn latest(&self) -> Option<&Version> {
        self.candidates
            .as_ref()
            .and_then(|c| c.first())
            .map(|f| &f.version)
    }

    fn candidates(&self) -> &[Arc<Formula>] {
        self.candidates.as_deref().unwrap_or(&[])
    }

    /// Union of every requirement's variant flags
    fn variants(&self) -> BTreeSet<String> {
        self.requirements
            .iter()
            .flat_map(|r| r.variants.iter().cloned())
            .collect()
    }

    fn accepts(&self, formula: &Formula, skip: Option<usize>) -> bool {
        let latest = self.latest();
        self.requirements
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != skip)
            .all(|(_, r)| {
                r.constraint.matches(&formula.version, latest)
                    && r.variants.iter().all(|v| formula.supports_variant(v))
            })
    }

    /// Highest non-excluded candidate accepted by every requirement except
    /// `skip`
    fn best_candidate(&self, skip: Option<usize>) -> Option<Arc<Formula>> {
        self.candidates()
            .iter()
            .filter(|f| !self.excluded.contains(&f.version))
            .find(|f| self.accepts(f, skip))
            .cloned()
    }
}

struct Graph<'r, 'a> {
    resolver: &'r Resolver<'a>,
    installed: HashMap<&'r str, &'r Receipt>,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    queue: VecDeque<usize>,
    queued: Vec<bool>,
    /// (requesting node, target name) pairs removed by relaxation
    dropped: HashSet<(usize, String)>,
    dropped_edges: Vec<(usize, DroppedEdge)>,
    backtracks: usize,
}

impl<'r, 'a> Graph<'r, 'a> {
    fn new(resolver: &'r Resolver<'a>, installed: &'r [Receipt]) -> Self {
        Self {
            resolver,
            installed: installed.iter().map(|r| (r.name.as_str(), r)).collect(),
            nodes: Vec::new(),
            index: HashMap::new(),
            queue: VecDeque::new(),
            queued: Vec::new(),
            dropped: HashSet::new(),
            dropped_edges: Vec::new(),
            backtracks: 0,
        }
    }

    fn policy(&self) -> SoftEdgePolicy {
        self.resolver.options.soft_edge_policy
    }

    fn intern(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node::new(name));
        self.queued.push(false);
        self.index.insert(name.to_string(), idx);
        idx
    }

    fn enqueue(&mut self, idx: usize) {
        if !self.queued[idx] {
            self.queued[idx] = true;
            self.queue.push_back(idx);
        }
    }

    fn seed(&mut self, requests: &[PackageSpec]) {
        for (i, spec) in requests.iter().enumerate() {
            let idx = self.intern(&spec.name);
            self.nodes[idx].requirements.push(Requirement {
                requester: Requester::User(i),
                constraint: spec.constraint.clone(),
                variants: spec.variants.clone(),
                kind: DependencyKind::Runtime,
            });
            self.enqueue(idx);
        }
    }

    fn run(&mut self, cancel: &CancellationToken) -> Result<(), ResolveError> {
        let mut steps = 0;
        while let Some(idx) = self.queue.pop_front() {
            if cancel.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }
            self.queued[idx] = false;

            steps += 1;
            if steps > MAX_STEPS {
                return Err(ResolveError::BacktrackLimit {
                    name: self.nodes[idx].name.clone(),
                    attempts: self.backtracks,
                });
            }

            self.select(idx)?;
        }
        Ok(())
    }

    fn load(&mut self, idx: usize) {
        if self.nodes[idx].candidates.is_some() {
            return;
        }
        let mut candidates: Vec<Arc<Formula>> = self
            .resolver
            .store
            .lookup_formula(&self.nodes[idx].name)
            .into_iter()
            .map(Arc::new)
            .collect();
        candidates.sort_by(|a, b| b.version.cmp(&a.version));
        tracing::debug!(
            "Loaded {} versions of {}",
            candidates.len(),
            self.nodes[idx].name
        );
        self.nodes[idx].candidates = Some(candidates);
    }

    /// The installed version, if it satisfies every requirement
    fn installed_choice(&self, idx: usize) -> Option<Choice> {
        let node = &self.nodes[idx];
        let receipt = self.installed.get(node.name.as_str())?;
        if node.excluded.contains(&receipt.version) {
            return None;
        }
        let latest = node.latest();
        node.requirements
            .iter()
            .all(|r| receipt.satisfies(&r.constraint, &r.variants, latest))
            .then(|| Choice::Installed(receipt.version.clone()))
    }

    fn select(&mut self, idx: usize) -> Result<(), ResolveError> {
        if self.nodes[idx].requirements.is_empty() {
            // Every requester went away
            self.set_choice(idx, None);
            return Ok(());
        }
        self.load(idx);

        if let Some(choice) = self.installed_choice(idx) {
            tracing::debug!("Keeping installed {} {}", self.nodes[idx].name, choice.version());
            self.set_choice(idx, Some(choice));
            return Ok(());
        }

        if let Some(formula) = self.nodes[idx].best_candidate(None) {
            tracing::debug!("Selected {} {}", formula.name, formula.version);
            self.set_choice(idx, Some(Choice::Formula(formula)));
            return Ok(());
        }

        if self.relax(idx) {
            return self.select(idx);
        }

        if self.nodes[idx].candidates().is_empty() {
            return Err(ResolveError::FormulaNotFound {
                name: self.nodes[idx].name.clone(),
                chain: self.chain_of(idx),
                suggestions: self.suggestions(&self.nodes[idx].name),
            });
        }

        if self.backtrack(idx)? {
            return Ok(());
        }

        Err(self.conflict(idx))
    }

    /// Drop soft requirements that stand in the way. Returns whether any
    /// requirement was dropped.
    fn relax(&mut self, idx: usize) -> bool {
        if self.policy() == SoftEdgePolicy::Strict {
            return false;
        }
        let node = &self.nodes[idx];
        let soft: Vec<usize> = node
            .requirements
            .iter()
            .enumerate()
            .filter(|(_, r)| r.kind.is_soft() && matches!(r.requester, Requester::Node(_)))
            .map(|(i, _)| i)
            .collect();
        if soft.is_empty() {
            return false;
        }

        let hard_only = Node {
            name: node.name.clone(),
            candidates: node.candidates.clone(),
            requirements: node
                .requirements
                .iter()
                .filter(|r| !r.kind.is_soft())
                .cloned()
                .collect(),
            choice: None,
            excluded: node.excluded.clone(),
            edges: Vec::new(),
        };

        let to_drop: Vec<usize> = if hard_only.requirements.is_empty() {
            // Only soft requesters: the node disappears
            soft
        } else {
            let Some(candidate) = hard_only.best_candidate(None) else {
                return false;
            };
            let latest = node.latest();
            soft.into_iter()
                .filter(|&i| {
                    let r = &node.requirements[i];
                    !(r.constraint.matches(&candidate.version, latest)
                        && r.variants.iter().all(|v| candidate.supports_variant(v)))
                })
                .collect()
        };

        if to_drop.is_empty() {
            return false;
        }
        for i in to_drop.into_iter().rev() {
            self.drop_requirement(idx, i);
        }
        true
    }

    fn drop_requirement(&mut self, idx: usize, req: usize) {
        let requirement = self.nodes[idx].requirements.remove(req);
        let Requester::Node(from) = requirement.requester else {
            return;
        };
        self.nodes[from].edges.retain(|(t, _)| *t != idx);
        self.dropped.insert((from, self.nodes[idx].name.clone()));

        let edge = DroppedEdge {
            from: self.nodes[from].name.clone(),
            to: self.nodes[idx].name.clone(),
            kind: requirement.kind,
        };
        match self.policy() {
            SoftEdgePolicy::Warn => {
                tracing::warn!(
                    "Dropping {} dependency {} -> {}: no compatible version",
                    edge.kind.as_str(),
                    edge.from,
                    edge.to
                );
                self.dropped_edges.push((from, edge));
            }
            SoftEdgePolicy::Drop => {
                tracing::debug!("Dropping {} -> {}", edge.from, edge.to);
            }
            SoftEdgePolicy::Strict => {}
        }
    }

    /// Exclude the current version of a requester whose requirement alone
    /// blocks `idx`. Returns whether a requester was requeued.
    fn backtrack(&mut self, idx: usize) -> Result<bool, ResolveError> {
        let max = self.resolver.options.max_backtracks;
        if max == 0 {
            return Ok(false);
        }

        let node = &self.nodes[idx];
        let blocker = node
            .requirements
            .iter()
            .enumerate()
            .filter_map(|(i, r)| match r.requester {
                Requester::Node(j) => Some((i, j)),
                Requester::User(_) => None,
            })
            .filter(|&(i, _)| node.best_candidate(Some(i)).is_some())
            .find_map(|(_, j)| {
                let current = self.nodes[j].choice.as_ref()?.version().clone();
                self.has_alternative(j, &current).then_some((j, current))
            });

        let Some((j, current)) = blocker else {
            return Ok(false);
        };

        if self.backtracks >= max {
            return Err(ResolveError::BacktrackLimit {
                name: self.nodes[idx].name.clone(),
                attempts: self.backtracks,
            });
        }
        self.backtracks += 1;

        tracing::debug!(
            "Backtracking: excluding {} {} to satisfy {}",
            self.nodes[j].name,
            current,
            self.nodes[idx].name
        );
        self.nodes[j].excluded.insert(current);
        self.enqueue(j);
        Ok(true)
    }

    fn has_alternative(&self, j: usize, current: &Version) -> bool {
        let node = &self.nodes[j];
        node.candidates()
            .iter()
            .filter(|f| &f.version != current && !node.excluded.contains(&f.version))
            .any(|f| node.accepts(f, None))
    }

    /// Switch a node's choice, retracting old edges and adding new ones
    fn set_choice(&mut self, idx: usize, choice: Option<Choice>) {
        let version_changed = match (&self.nodes[idx].choice, &choice) {
            (Some(old), Some(new)) => old.version() != new.version(),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if version_changed {
            // Relaxations were judged against the old version's edges
            self.dropped.retain(|(from, _)| *from != idx);
            self.dropped_edges.retain(|(from, _)| *from != idx);
        }

        let deps: Vec<Dependency> = match &choice {
            Some(Choice::Formula(formula)) => {
                let variants = self.nodes[idx].variants();
                let include_build = self.resolver.options.include_build_dependencies;
                formula
                    .dependencies
                    .iter()
                    .filter(|d| formula.follows(d, &variants))
                    .filter(|d| include_build || d.kind != DependencyKind::Build)
                    .filter(|d| !self.dropped.contains(&(idx, d.name().to_string())))
                    .cloned()
                    .collect()
            }
            _ => Vec::new(),
        };

        let node = &self.nodes[idx];
        let unchanged = match (&node.choice, &choice) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_as(b),
            _ => false,
        } && node.edges.len() == deps.len()
            && node.edges.iter().zip(&deps).all(|((_, a), b)| a == b);
        if unchanged {
            return;
        }

        // Retract
        let old_edges = std::mem::take(&mut self.nodes[idx].edges);
        for (target, _) in old_edges {
            self.nodes[target]
                .requirements
                .retain(|r| r.requester != Requester::Node(idx));
            self.enqueue(target);
        }

        self.nodes[idx].choice = choice;

        // Add
        for dep in deps {
            let target = self.intern(dep.name());
            self.nodes[target].requirements.push(Requirement {
                requester: Requester::Node(idx),
                constraint: dep.spec.constraint.clone(),
                variants: dep.spec.variants.clone(),
                kind: dep.kind,
            });
            self.nodes[idx].edges.push((target, dep));
            self.enqueue(target);
        }
    }

    /// Names from a user request down to `idx`, following first requesters
    fn chain_of(&self, idx: usize) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = idx;
        while seen.insert(current) {
            let Some(requirement) = self.nodes[current].requirements.first() else {
                break;
            };
            match requirement.requester {
                Requester::User(_) => break,
                Requester::Node(j) => {
                    chain.push(self.nodes[j].name.clone());
                    current = j;
                }
            }
        }
        chain.reverse();
        chain
    }

    fn suggestions(&self, name: &str) -> Vec<String> {
        let mut scored: Vec<(f64, String)> = self
            .resolver
            .store
            .all_names()
            .into_iter()
            .map(|candidate| (strsim::jaro_winkler(name, &candidate), candidate))
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|(_, name)| name)
            .collect()
    }

    fn conflict(&self, idx: usize) -> ResolveError {
        let node = &self.nodes[idx];
        let constraints = node
            .requirements
            .iter()
            .map(|r| {
                let chain = match r.requester {
                    Requester::User(_) => Vec::new(),
                    Requester::Node(j) => {
                        let mut chain = self.chain_of(j);
                        chain.push(self.nodes[j].name.clone());
                        chain
                    }
                };
                RequirementTrace {
                    constraint: r.constraint.clone(),
                    variants: r.variants.clone(),
                    chain,
                }
            })
            .collect();

        ResolveError::VersionConflict {
            name: node.name.clone(),
            constraints,
            chain: self.chain_of(idx),
        }
    }

    /// Prune, order and label the settled graph
    fn finish(self, requests: &[PackageSpec]) -> Result<InstallationPlan, ResolveError> {
        let mut roots = Vec::new();
        for spec in requests {
            if let Some(&idx) = self.index.get(&spec.name) {
                if !roots.contains(&idx) {
                    roots.push(idx);
                }
            }
        }

        // Build edges first, then declaration order
        let ordered_edges: Vec<Vec<(usize, DependencyKind)>> = self
            .nodes
            .iter()
            .map(|node| {
                let mut edges: Vec<(usize, DependencyKind)> = node
                    .edges
                    .iter()
                    .filter(|(t, _)| self.nodes[*t].choice.is_some())
                    .map(|(t, d)| (*t, d.kind))
                    .collect();
                edges.sort_by_key(|(_, kind)| *kind != DependencyKind::Build);
                edges
            })
            .collect();

        let order = self.post_order(&roots, &ordered_edges)?;
        let retained = self.retained(&roots, &ordered_edges);

        let mut position = vec![usize::MAX; self.nodes.len()];
        for (pos, &idx) in order.iter().enumerate() {
            position[idx] = pos;
        }

        let mut nodes = Vec::with_capacity(order.len());
        for &idx in &order {
            let node = &self.nodes[idx];
            let Some(choice) = &node.choice else {
                continue;
            };
            let receipt = self.installed.get(node.name.as_str());

            let (formula, action, variants) = match choice {
                Choice::Installed(version) => {
                    let formula = node
                        .candidates()
                        .iter()
                        .find(|f| &f.version == version)
                        .cloned();
                    let variants = receipt.map(|r| r.variants.clone()).unwrap_or_default();
                    (formula, Action::Skip, variants)
                }
                Choice::Formula(formula) => {
                    let action = match receipt {
                        Some(receipt) => Action::Upgrade {
                            from: receipt.version.clone(),
                        },
                        None => Action::Install,
                    };
                    (Some(Arc::clone(formula)), action, node.variants())
                }
            };

            let (dependencies, dependency_kinds): (Vec<usize>, Vec<DependencyKind>) = node
                .edges
                .iter()
                .filter(|(t, _)| position[*t] != usize::MAX)
                .map(|(t, d)| (position[*t], d.kind))
                .unzip();

            nodes.push(ResolvedNode {
                name: node.name.clone(),
                formula,
                version: choice.version().clone(),
                variants,
                dependencies,
                dependency_kinds,
                action,
                requested: roots.contains(&idx),
                retained: retained[idx],
            });
        }

        self.check_conflicts(&nodes)?;

        let dropped = self
            .dropped_edges
            .into_iter()
            .filter(|(from, _)| position[*from] != usize::MAX)
            .map(|(_, edge)| edge)
            .collect();

        tracing::debug!("Resolved plan with {} nodes", nodes.len());
        Ok(InstallationPlan::new(nodes, dropped))
    }

    /// Reject a plan that puts two conflicting packages side by side, or
    /// that installs something an installed package conflicts with
    fn check_conflicts(&self, nodes: &[ResolvedNode]) -> Result<(), ResolveError> {
        for node in nodes {
            let Some(formula) = &node.formula else {
                continue;
            };
            for other in &formula.conflicts {
                match nodes.iter().find(|n| &n.name == other) {
                    Some(peer) if peer.name != node.name => {
                        // Two installed packages are an existing state
                        if node.action == Action::Skip && peer.action == Action::Skip {
                            continue;
                        }
                        return Err(ResolveError::Conflict {
                            name: node.name.clone(),
                            other: other.clone(),
                            installed: false,
                        });
                    }
                    Some(_) => {}
                    None if node.action != Action::Skip
                        && self.installed.contains_key(other.as_str()) =>
                    {
                        return Err(ResolveError::Conflict {
                            name: node.name.clone(),
                            other: other.clone(),
                            installed: true,
                        });
                    }
                    None => {}
                }
            }
        }

        let mut installed: Vec<&&Receipt> = self
            .installed
            .values()
            .filter(|r| nodes.iter().all(|n| n.name != r.name))
            .collect();
        installed.sort_by(|a, b| a.name.cmp(&b.name));
        for receipt in installed {
            let declared = self
                .resolver
                .store
                .lookup_formula(&receipt.name)
                .into_iter()
                .find(|f| f.version == receipt.version);
            let Some(declared) = declared else {
                continue;
            };
            if let Some(node) = nodes
                .iter()
                .find(|n| n.action != Action::Skip && declared.conflicts.contains(&n.name))
            {
                return Err(ResolveError::Conflict {
                    name: node.name.clone(),
                    other: receipt.name.clone(),
                    installed: true,
                });
            }
        }
        Ok(())
    }

    /// Iterative DFS post-order from the roots; a grey target is a cycle
    fn post_order(
        &self,
        roots: &[usize],
        edges: &[Vec<(usize, DependencyKind)>],
    ) -> Result<Vec<usize>, ResolveError> {
        const WHITE: u8 = 0;
        const GREY: u8 = 1;
        const BLACK: u8 = 2;

        let mut color = vec![WHITE; self.nodes.len()];
        let mut order = Vec::new();

        for &root in roots {
            if color[root] != WHITE || self.nodes[root].choice.is_none() {
                continue;
            }
            color[root] = GREY;
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                if let Some(&(target, _)) = edges[node].get(next) {
                    frame.1 += 1;
                    match color[target] {
                        WHITE => {
                            color[target] = GREY;
                            stack.push((target, 0));
                        }
                        GREY => {
                            let start = stack
                                .iter()
                                .position(|(n, _)| *n == target)
                                .unwrap_or(0);
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|(n, _)| self.nodes[*n].name.clone())
                                .collect();
                            cycle.push(self.nodes[target].name.clone());
                            return Err(ResolveError::CircularDependency { cycle });
                        }
                        _ => {}
                    }
                } else {
                    color[node] = BLACK;
                    order.push(node);
                    stack.pop();
                }
            }
        }

        Ok(order)
    }

    /// Reachability from the roots over non-build edges
    fn retained(&self, roots: &[usize], edges: &[Vec<(usize, DependencyKind)>]) -> Vec<bool> {
        let mut retained = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = roots.to_vec();
        while let Some(idx) = stack.pop() {
            if retained[idx] {
                continue;
            }
            retained[idx] = true;
            stack.extend(
                edges[idx]
                    .iter()
                    .filter(|(_, kind)| *kind != DependencyKind::Build)
                    .map(|(t, _)| *t),
            );
        }
        retained
    }
}
