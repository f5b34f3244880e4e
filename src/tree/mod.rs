//! The build-state tree: studies, their node trees and root networks, and
//! the dense (node, root network) matrix of build entries.
//!
//! The tree is an arena keyed by id; build entries live in a map keyed by
//! `(NodeId, RootNetworkId)` rather than as object links, so invalidation is
//! a map scan and there is no cyclic ownership. Every entry sits behind its
//! own async mutex: mutation is linearizable per entry and never coarser.
//! The structural lock is never held across an entry lock or a remote call.
//!
//! Tree operations mutate state only. Everything that must be physically
//! removed downstream (variants, results, reports) is returned to the caller
//! as a [`CleanupPlan`] for the deletion coordinator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, Notify, RwLock};
use tracing::{debug, info};

use crate::cleanup::CleanupPlan;
use crate::domain::{
    BuildEntry, BuildError, BuildStatus, ComputationKind, ModificationRef, NetworkId, Node, NodeId,
    ReportCategory, ReportId, ResultId, RootNetwork, RootNetworkId, Study, StudyId, VariantId,
};

/// How far an invalidation reaches from its starting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScope {
    SelfOnly,
    SelfAndDescendants,
}

/// A build entry and its settle signal. Builders waiting on an in-flight
/// build park on `settled` and are woken whenever the entry reaches a stable
/// state (terminal build, reset or invalidation).
pub struct EntrySlot {
    state: Mutex<BuildEntry>,
    settled: Notify,
}

impl EntrySlot {
    fn new(entry: BuildEntry) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(entry),
            settled: Notify::new(),
        })
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, BuildEntry> {
        self.state.lock().await
    }

    pub(crate) fn notify_settled(&self) {
        self.settled.notify_waiters();
    }

    pub(crate) fn settled(&self) -> tokio::sync::futures::Notified<'_> {
        self.settled.notified()
    }
}

/// Variant duplication work produced by [`BuildStateTree::duplicate_root_network`]:
/// each built source variant must be cloned under the target name already
/// recorded in the duplicated entries, so lookups stay valid once the
/// physical clone lands.
#[derive(Debug, Clone)]
pub struct CloneVariantsPlan {
    pub network: NetworkId,
    pub pairs: Vec<(VariantId, VariantId)>,
}

struct StudyState {
    study: Study,
    nodes: HashMap<NodeId, Node>,
    root_networks: HashMap<RootNetworkId, RootNetwork>,
}

impl StudyState {
    fn subtree_of(&self, root: NodeId) -> Vec<NodeId> {
        let mut stack = vec![root];
        let mut out = Vec::new();
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.children.iter().copied());
            }
        }
        out
    }
}

#[derive(Default)]
struct TreeInner {
    studies: HashMap<StudyId, StudyState>,
    node_index: HashMap<NodeId, StudyId>,
    root_network_index: HashMap<RootNetworkId, StudyId>,
    entries: HashMap<(NodeId, RootNetworkId), Arc<EntrySlot>>,
}

impl TreeInner {
    fn study_of_node(&self, node: NodeId) -> Result<&StudyState, BuildError> {
        let study = self
            .node_index
            .get(&node)
            .ok_or(BuildError::UnknownNode(node))?;
        self.studies
            .get(study)
            .ok_or(BuildError::UnknownStudy(*study))
    }

    fn root_network(&self, root_network: RootNetworkId) -> Result<&RootNetwork, BuildError> {
        let study = self
            .root_network_index
            .get(&root_network)
            .ok_or(BuildError::UnknownRootNetwork(root_network))?;
        self.studies
            .get(study)
            .and_then(|state| state.root_networks.get(&root_network))
            .ok_or(BuildError::UnknownRootNetwork(root_network))
    }

    fn slot(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
    ) -> Result<Arc<EntrySlot>, BuildError> {
        if !self.node_index.contains_key(&node) {
            return Err(BuildError::UnknownNode(node));
        }
        self.root_network(root_network)?;
        self.entries
            .get(&(node, root_network))
            .cloned()
            .ok_or(BuildError::EntryNotFound { node, root_network })
    }
}

/// The shared mutable core: one instance per process, handed to the variant
/// builder, the deletion coordinator and the study service.
#[derive(Default)]
pub struct BuildStateTree {
    inner: RwLock<TreeInner>,
}

impl BuildStateTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty study with its root node. Root networks are attached
    /// separately; until then the study has no build entries.
    pub async fn create_study(&self) -> Study {
        let study = Study {
            id: StudyId::new(),
            root_node: NodeId::new(),
        };
        let root = Node {
            id: study.root_node,
            study: study.id,
            parent: None,
            children: Vec::new(),
            modifications: Vec::new(),
        };

        let mut inner = self.inner.write().await;
        inner.node_index.insert(root.id, study.id);
        inner.studies.insert(
            study.id,
            StudyState {
                study: study.clone(),
                nodes: HashMap::from([(root.id, root)]),
                root_networks: HashMap::new(),
            },
        );
        info!(study = %study.id, root_node = %study.root_node, "study created");
        study
    }

    /// Attach a base network to a study, creating one unbuilt entry per
    /// existing node, each seeded with a fresh modification report id.
    pub async fn add_root_network(
        &self,
        study: StudyId,
        network: NetworkId,
    ) -> Result<RootNetworkId, BuildError> {
        let mut inner = self.inner.write().await;
        let state = inner
            .studies
            .get_mut(&study)
            .ok_or(BuildError::UnknownStudy(study))?;

        let root_network = RootNetwork {
            id: RootNetworkId::new(),
            study,
            network,
            root_report: ReportId::new(),
        };
        let id = root_network.id;
        state.root_networks.insert(id, root_network);

        let nodes: Vec<NodeId> = state.nodes.keys().copied().collect();
        for node in &nodes {
            inner
                .entries
                .insert((*node, id), EntrySlot::new(BuildEntry::new(ReportId::new())));
        }
        inner.root_network_index.insert(id, study);
        info!(%study, root_network = %id, linked_nodes = nodes.len(), "root network attached");
        Ok(id)
    }

    /// Add a modification step under `parent`, creating one unbuilt entry
    /// per existing root network.
    pub async fn add_node(
        &self,
        parent: NodeId,
        modifications: Vec<ModificationRef>,
    ) -> Result<NodeId, BuildError> {
        self.insert_node(parent, modifications, None).await
    }

    /// Duplicate `source` under `target_parent`. The new node's entries copy
    /// the source entries' build status, variant and result references
    /// verbatim: duplication preserves prior results by reference instead of
    /// re-running computations. Only the modification report identity is
    /// fresh.
    pub async fn duplicate_node(
        &self,
        source: NodeId,
        target_parent: NodeId,
    ) -> Result<NodeId, BuildError> {
        let (modifications, seeds) = {
            let inner = self.inner.read().await;
            let state = inner.study_of_node(source)?;
            let node = state
                .nodes
                .get(&source)
                .ok_or(BuildError::UnknownNode(source))?;
            let mut seeds = HashMap::new();
            for root_network in state.root_networks.keys() {
                if let Some(slot) = inner.entries.get(&(source, *root_network)) {
                    seeds.insert(*root_network, slot.clone());
                }
            }
            (node.modifications.clone(), seeds)
        };

        // Snapshot source entries outside the structural lock.
        let mut snapshots = HashMap::new();
        for (root_network, slot) in seeds {
            let mut entry = slot.lock().await.clone();
            entry.report_refs
                .insert(ReportCategory::Modification, ReportId::new());
            entry.build_epoch = 0;
            snapshots.insert(root_network, entry);
        }

        self.insert_node(target_parent, modifications, Some(snapshots))
            .await
    }

    async fn insert_node(
        &self,
        parent: NodeId,
        modifications: Vec<ModificationRef>,
        seeds: Option<HashMap<RootNetworkId, BuildEntry>>,
    ) -> Result<NodeId, BuildError> {
        let mut inner = self.inner.write().await;
        let study = *inner
            .node_index
            .get(&parent)
            .ok_or(BuildError::UnknownNode(parent))?;
        let state = inner
            .studies
            .get_mut(&study)
            .ok_or(BuildError::UnknownStudy(study))?;

        let id = NodeId::new();
        state
            .nodes
            .get_mut(&parent)
            .ok_or(BuildError::UnknownNode(parent))?
            .children
            .push(id);
        state.nodes.insert(
            id,
            Node {
                id,
                study,
                parent: Some(parent),
                children: Vec::new(),
                modifications,
            },
        );

        let root_networks: Vec<RootNetworkId> = state.root_networks.keys().copied().collect();
        let mut seeds = seeds.unwrap_or_default();
        for root_network in &root_networks {
            let entry = seeds
                .remove(root_network)
                .unwrap_or_else(|| BuildEntry::new(ReportId::new()));
            inner.entries.insert((id, *root_network), EntrySlot::new(entry));
        }
        inner.node_index.insert(id, study);
        debug!(%study, node = %id, %parent, linked_root_networks = root_networks.len(), "node created");
        Ok(id)
    }

    /// Reset affected entries to `NotBuilt` and detach their variant, result
    /// and computation report references. Pure state mutation: the returned
    /// plan is what the caller hands to the deletion coordinator.
    pub async fn invalidate(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
        scope: InvalidateScope,
    ) -> Result<CleanupPlan, BuildError> {
        let (network, targets) = {
            let inner = self.inner.read().await;
            let state = inner.study_of_node(node)?;
            let network = inner.root_network(root_network)?.network;
            let nodes = match scope {
                InvalidateScope::SelfOnly => vec![node],
                InvalidateScope::SelfAndDescendants => state.subtree_of(node),
            };
            let mut targets = Vec::new();
            for id in nodes {
                targets.push(inner.slot(id, root_network)?);
            }
            (network, targets)
        };

        let mut plan = CleanupPlan::default();
        for slot in targets {
            let refs = slot.lock().await.invalidate();
            plan.absorb(network, refs);
            slot.notify_settled();
        }
        debug!(%node, %root_network, ?scope, "entries invalidated");
        Ok(self.retain_unshared(plan).await)
    }

    /// Invalidate a node across every root network of its study.
    pub async fn invalidate_all(
        &self,
        node: NodeId,
        scope: InvalidateScope,
    ) -> Result<CleanupPlan, BuildError> {
        let root_networks: Vec<RootNetworkId> = {
            let inner = self.inner.read().await;
            inner
                .study_of_node(node)?
                .root_networks
                .keys()
                .copied()
                .collect()
        };
        let mut plan = CleanupPlan::default();
        for root_network in root_networks {
            plan.merge(self.invalidate(node, root_network, scope).await?);
        }
        Ok(plan)
    }

    /// Replace a node's modification list. Changing modifications makes the
    /// node's own builds and every descendant's stale, on every root
    /// network.
    pub async fn update_modifications(
        &self,
        node: NodeId,
        modifications: Vec<ModificationRef>,
    ) -> Result<CleanupPlan, BuildError> {
        {
            let mut inner = self.inner.write().await;
            let study = *inner
                .node_index
                .get(&node)
                .ok_or(BuildError::UnknownNode(node))?;
            let state = inner
                .studies
                .get_mut(&study)
                .ok_or(BuildError::UnknownStudy(study))?;
            state
                .nodes
                .get_mut(&node)
                .ok_or(BuildError::UnknownNode(node))?
                .modifications = modifications;
        }
        self.invalidate_all(node, InvalidateScope::SelfAndDescendants)
            .await
    }

    /// Remove a node and all of its descendants, with their entries on every
    /// root network. Structural removal is synchronous; the plan covers
    /// everything that still exists physically.
    pub async fn delete_subtree(&self, node: NodeId) -> Result<CleanupPlan, BuildError> {
        let removed = {
            let mut inner = self.inner.write().await;
            let study = *inner
                .node_index
                .get(&node)
                .ok_or(BuildError::UnknownNode(node))?;
            let state = inner
                .studies
                .get_mut(&study)
                .ok_or(BuildError::UnknownStudy(study))?;
            if state.study.root_node == node {
                return Err(BuildError::CannotDeleteRoot);
            }

            let subtree = state.subtree_of(node);
            let parent = state.nodes.get(&node).and_then(|n| n.parent);
            if let Some(parent) = parent.and_then(|p| state.nodes.get_mut(&p)) {
                parent.children.retain(|child| *child != node);
            }
            for id in &subtree {
                state.nodes.remove(id);
            }

            let networks: HashMap<RootNetworkId, NetworkId> = state
                .root_networks
                .values()
                .map(|rn| (rn.id, rn.network))
                .collect();
            let mut removed = Vec::new();
            for id in &subtree {
                inner.node_index.remove(id);
                for (root_network, network) in &networks {
                    if let Some(slot) = inner.entries.remove(&(*id, *root_network)) {
                        removed.push((*network, slot));
                    }
                }
            }
            info!(%node, removed_nodes = subtree.len(), "subtree removed from tree");
            removed
        };

        Ok(self.detach_removed(removed).await)
    }

    /// Detach one root network's whole column of entries. Other root
    /// networks' entries are untouched.
    pub async fn remove_root_network(
        &self,
        root_network: RootNetworkId,
    ) -> Result<CleanupPlan, BuildError> {
        let (removed, root_report) = {
            let mut inner = self.inner.write().await;
            let study = inner
                .root_network_index
                .remove(&root_network)
                .ok_or(BuildError::UnknownRootNetwork(root_network))?;
            let state = inner
                .studies
                .get_mut(&study)
                .ok_or(BuildError::UnknownStudy(study))?;
            let rn = state
                .root_networks
                .remove(&root_network)
                .ok_or(BuildError::UnknownRootNetwork(root_network))?;
            let nodes: Vec<NodeId> = state.nodes.keys().copied().collect();
            let mut removed = Vec::new();
            for node in nodes {
                if let Some(slot) = inner.entries.remove(&(node, root_network)) {
                    removed.push((rn.network, slot));
                }
            }
            info!(%root_network, entries = removed.len(), "root network detached");
            (removed, rn.root_report)
        };

        let mut plan = self.detach_removed(removed).await;
        plan.reports.push(root_report);
        Ok(plan)
    }

    /// Duplicate a root network within its study. Terminal entries keep
    /// their build status under fresh variant names; an in-flight build
    /// copies as unbuilt. Result references are not carried over (results
    /// belong to the source baseline). The returned plan maps each built
    /// source variant to the target name the new entries already record.
    pub async fn duplicate_root_network(
        &self,
        source: RootNetworkId,
    ) -> Result<(RootNetworkId, CloneVariantsPlan), BuildError> {
        let (study, network, snapshots) = {
            let inner = self.inner.read().await;
            let rn = inner.root_network(source)?;
            let state = inner
                .studies
                .get(&rn.study)
                .ok_or(BuildError::UnknownStudy(rn.study))?;
            let mut snapshots = Vec::new();
            for node in state.nodes.keys() {
                if let Some(slot) = inner.entries.get(&(*node, source)) {
                    snapshots.push((*node, slot.clone()));
                }
            }
            (rn.study, rn.network, snapshots)
        };

        let mut pairs = Vec::new();
        let mut seeded = Vec::new();
        for (node, slot) in snapshots {
            let source_entry = slot.lock().await.clone();
            let mut entry = BuildEntry::new(ReportId::new());
            // Only terminal entries have a variant that physically exists;
            // an in-flight build's claim copies as unbuilt.
            if source_entry.status.is_terminal() {
                if let Some(source_variant) = source_entry.variant_id {
                    let target_variant = VariantId::fresh();
                    entry.status = source_entry.status;
                    entry.variant_id = Some(target_variant.clone());
                    pairs.push((source_variant, target_variant));
                }
            }
            seeded.push((node, entry));
        }

        let mut inner = self.inner.write().await;
        let state = inner
            .studies
            .get_mut(&study)
            .ok_or(BuildError::UnknownStudy(study))?;
        let root_network = RootNetwork {
            id: RootNetworkId::new(),
            study,
            network,
            root_report: ReportId::new(),
        };
        let id = root_network.id;
        state.root_networks.insert(id, root_network);
        for (node, entry) in seeded {
            inner.entries.insert((node, id), EntrySlot::new(entry));
        }
        inner.root_network_index.insert(id, study);
        info!(source_root_network = %source, new_root_network = %id, variants = pairs.len(), "root network duplicated");
        Ok((id, CloneVariantsPlan { network, pairs }))
    }

    /// Tear down a whole study: every node, every root network, every entry.
    pub async fn delete_study(&self, study: StudyId) -> Result<CleanupPlan, BuildError> {
        let (removed, root_reports) = {
            let mut inner = self.inner.write().await;
            let state = inner
                .studies
                .remove(&study)
                .ok_or(BuildError::UnknownStudy(study))?;
            let mut removed = Vec::new();
            let mut root_reports = Vec::new();
            for rn in state.root_networks.values() {
                inner.root_network_index.remove(&rn.id);
                root_reports.push(rn.root_report);
            }
            for node in state.nodes.keys() {
                inner.node_index.remove(node);
                for rn in state.root_networks.values() {
                    if let Some(slot) = inner.entries.remove(&(*node, rn.id)) {
                        removed.push((rn.network, slot));
                    }
                }
            }
            info!(%study, entries = removed.len(), "study removed from tree");
            (removed, root_reports)
        };

        let mut plan = self.detach_removed(removed).await;
        plan.reports.extend(root_reports);
        Ok(plan)
    }

    async fn detach_removed(&self, removed: Vec<(NetworkId, Arc<EntrySlot>)>) -> CleanupPlan {
        let mut plan = CleanupPlan::default();
        for (network, slot) in removed {
            let refs = slot.lock().await.detach_all();
            plan.absorb(network, refs);
            slot.notify_settled();
        }
        self.retain_unshared(plan).await
    }

    /// Drop from a plan every variant, result and report id a live entry
    /// still references. Duplicated nodes share those ids by reference;
    /// physical deletion must wait for the last referent to go.
    async fn retain_unshared(&self, mut plan: CleanupPlan) -> CleanupPlan {
        if plan.is_empty() {
            return plan;
        }
        let slots: Vec<Arc<EntrySlot>> = {
            let inner = self.inner.read().await;
            inner.entries.values().cloned().collect()
        };
        let mut live_variants = HashSet::new();
        let mut live_results = HashSet::new();
        let mut live_reports = HashSet::new();
        for slot in slots {
            let entry = slot.lock().await;
            if let Some(variant) = &entry.variant_id {
                live_variants.insert(variant.clone());
            }
            live_results.extend(entry.result_refs.values().copied());
            live_reports.extend(entry.report_refs.values().copied());
        }
        for variants in plan.variants.values_mut() {
            variants.retain(|variant| !live_variants.contains(variant));
            variants.sort();
            variants.dedup();
        }
        plan.variants.retain(|_, variants| !variants.is_empty());
        for results in plan.results.values_mut() {
            results.retain(|result| !live_results.contains(result));
            results.sort();
            results.dedup();
        }
        plan.results.retain(|_, results| !results.is_empty());
        plan.reports.retain(|report| !live_reports.contains(report));
        plan.reports.sort();
        plan.reports.dedup();
        plan
    }

    // --- lookups ---

    pub async fn build_status(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
    ) -> Result<BuildStatus, BuildError> {
        let slot = self.entry_slot(node, root_network).await?;
        let status = slot.lock().await.status;
        Ok(status)
    }

    pub async fn variant_id(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
    ) -> Result<Option<VariantId>, BuildError> {
        let slot = self.entry_slot(node, root_network).await?;
        let variant = slot.lock().await.variant_id.clone();
        Ok(variant)
    }

    pub async fn report_id(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
        category: ReportCategory,
    ) -> Result<Option<ReportId>, BuildError> {
        let slot = self.entry_slot(node, root_network).await?;
        let report = slot.lock().await.report_refs.get(&category).copied();
        Ok(report)
    }

    pub async fn result_ref(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
        kind: ComputationKind,
    ) -> Result<Option<ResultId>, BuildError> {
        let slot = self.entry_slot(node, root_network).await?;
        let result = slot.lock().await.result_refs.get(&kind).copied();
        Ok(result)
    }

    pub async fn root_networks(&self, study: StudyId) -> Result<Vec<RootNetworkId>, BuildError> {
        let inner = self.inner.read().await;
        let state = inner
            .studies
            .get(&study)
            .ok_or(BuildError::UnknownStudy(study))?;
        Ok(state.root_networks.keys().copied().collect())
    }

    pub async fn node_count(&self, study: StudyId) -> Result<usize, BuildError> {
        let inner = self.inner.read().await;
        let state = inner
            .studies
            .get(&study)
            .ok_or(BuildError::UnknownStudy(study))?;
        Ok(state.nodes.len())
    }

    // --- per-entry mutators ---

    pub async fn set_build_status(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
        status: BuildStatus,
    ) -> Result<(), BuildError> {
        let slot = self.entry_slot(node, root_network).await?;
        slot.lock().await.status = status;
        if status.is_terminal() {
            slot.notify_settled();
        }
        Ok(())
    }

    pub async fn set_variant_id(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
        variant: VariantId,
    ) -> Result<(), BuildError> {
        let slot = self.entry_slot(node, root_network).await?;
        slot.lock().await.variant_id = Some(variant);
        Ok(())
    }

    /// Record a computation result for an entry; the previous result id of
    /// the same kind, if any, is returned so the caller can retire it.
    pub async fn set_result_ref(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
        kind: ComputationKind,
        result: ResultId,
    ) -> Result<Option<ResultId>, BuildError> {
        let slot = self.entry_slot(node, root_network).await?;
        let previous = slot.lock().await.result_refs.insert(kind, result);
        Ok(previous)
    }

    pub async fn set_report_ref(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
        category: ReportCategory,
        report: ReportId,
    ) -> Result<Option<ReportId>, BuildError> {
        let slot = self.entry_slot(node, root_network).await?;
        let previous = slot.lock().await.report_refs.insert(category, report);
        Ok(previous)
    }

    // --- internals shared with the builder ---

    pub(crate) async fn entry_slot(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
    ) -> Result<Arc<EntrySlot>, BuildError> {
        let inner = self.inner.read().await;
        inner.slot(node, root_network)
    }

    pub(crate) async fn parent_of(&self, node: NodeId) -> Result<Option<NodeId>, BuildError> {
        let inner = self.inner.read().await;
        let state = inner.study_of_node(node)?;
        Ok(state
            .nodes
            .get(&node)
            .ok_or(BuildError::UnknownNode(node))?
            .parent)
    }

    pub(crate) async fn modifications_of(
        &self,
        node: NodeId,
    ) -> Result<Vec<ModificationRef>, BuildError> {
        let inner = self.inner.read().await;
        let state = inner.study_of_node(node)?;
        Ok(state
            .nodes
            .get(&node)
            .ok_or(BuildError::UnknownNode(node))?
            .modifications
            .clone())
    }

    pub(crate) async fn network_of(
        &self,
        root_network: RootNetworkId,
    ) -> Result<NetworkId, BuildError> {
        let inner = self.inner.read().await;
        Ok(inner.root_network(root_network)?.network)
    }
}
