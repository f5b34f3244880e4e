//! High-level study mutations, wiring the tree, the builder and the
//! deletion coordinator together. This is the surface study-mutation
//! handlers call in-process.
//!
//! Ordering contract: every tree mutation commits synchronously before its
//! cleanup fan-out is submitted, so a crash in between leaves only
//! physically orphaned resources that nothing references anymore, never
//! tree state pointing at deleted resources.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::builder::{MaterializeOutcome, NodeBuilder};
use crate::cleanup::{CleanupHandle, DeletionCoordinator};
use crate::config::Config;
use crate::domain::{
    BuildError, BuildStatus, ComputationKind, ModificationRef, NetworkId, NodeId, ReportCategory,
    ReportId, ResultId, RootNetworkId, Study, StudyId, VariantId,
};
use crate::executor::TaskExecutor;
use crate::stores::{ModificationApplier, ReportStore, ResultStore, VariantStore};
use crate::tree::{BuildStateTree, InvalidateScope};

pub struct StudyService {
    pub cfg: Config,
    pub tree: Arc<BuildStateTree>,
    pub builder: Arc<NodeBuilder>,
    pub cleanup: Arc<DeletionCoordinator>,
    pub executor: Arc<TaskExecutor>,
}

impl StudyService {
    pub fn new(
        cfg: Config,
        variants: Arc<dyn VariantStore>,
        applier: Arc<dyn ModificationApplier>,
        results: HashMap<ComputationKind, Arc<dyn ResultStore>>,
        reports: Arc<dyn ReportStore>,
    ) -> Self {
        let executor = Arc::new(TaskExecutor::new(cfg.executor.max_concurrent_tasks));
        let tree = Arc::new(BuildStateTree::new());
        let cleanup = Arc::new(DeletionCoordinator::new(
            executor.clone(),
            variants.clone(),
            results,
            reports,
        ));
        let builder = Arc::new(NodeBuilder::new(
            tree.clone(),
            variants,
            applier,
            cleanup.clone(),
            executor.clone(),
            &cfg.build,
        ));
        Self {
            cfg,
            tree,
            builder,
            cleanup,
            executor,
        }
    }

    /// Import a study: root node plus its first root network.
    pub async fn create_study(
        &self,
        network: NetworkId,
    ) -> Result<(Study, RootNetworkId), BuildError> {
        let study = self.tree.create_study().await;
        let root_network = self.tree.add_root_network(study.id, network).await?;
        Ok((study, root_network))
    }

    pub async fn add_root_network(
        &self,
        study: StudyId,
        network: NetworkId,
    ) -> Result<RootNetworkId, BuildError> {
        self.tree.add_root_network(study, network).await
    }

    pub async fn add_node(
        &self,
        parent: NodeId,
        modifications: Vec<ModificationRef>,
    ) -> Result<NodeId, BuildError> {
        self.tree.add_node(parent, modifications).await
    }

    pub async fn duplicate_node(
        &self,
        source: NodeId,
        target_parent: NodeId,
    ) -> Result<NodeId, BuildError> {
        self.tree.duplicate_node(source, target_parent).await
    }

    /// Replace a node's modification list and schedule removal of every
    /// variant and result this made stale, on the node and its descendants.
    pub async fn update_modifications(
        &self,
        node: NodeId,
        modifications: Vec<ModificationRef>,
    ) -> Result<CleanupHandle, BuildError> {
        let plan = self.tree.update_modifications(node, modifications).await?;
        Ok(self.cleanup.execute(plan))
    }

    pub async fn invalidate_node(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
        scope: InvalidateScope,
    ) -> Result<CleanupHandle, BuildError> {
        let plan = self.tree.invalidate(node, root_network, scope).await?;
        Ok(self.cleanup.execute(plan))
    }

    pub async fn build_node(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
    ) -> Result<MaterializeOutcome, BuildError> {
        self.builder.materialize(node, root_network).await
    }

    /// Explicit rebuild: drop the entry's current build, then materialize.
    pub async fn rebuild_node(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
    ) -> Result<MaterializeOutcome, BuildError> {
        let plan = self
            .tree
            .invalidate(node, root_network, InvalidateScope::SelfOnly)
            .await?;
        self.cleanup.execute(plan).detach();
        self.builder.materialize(node, root_network).await
    }

    /// Attach a finished computation result to an entry. A superseded result
    /// of the same kind is retired in the foreground so the caller learns
    /// about an unreachable result store; the superseded report goes through
    /// the best-effort fan-out.
    pub async fn record_result(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
        kind: ComputationKind,
        result: ResultId,
        report: ReportId,
    ) -> Result<(), BuildError> {
        let previous = self
            .tree
            .set_result_ref(node, root_network, kind, result)
            .await?;
        let previous_report = self
            .tree
            .set_report_ref(node, root_network, ReportCategory::Computation(kind), report)
            .await?;

        if let Some(previous) = previous {
            self.cleanup.delete_result(kind, previous).await?;
        }
        if let Some(previous_report) = previous_report {
            let mut plan = crate::cleanup::CleanupPlan::default();
            plan.reports.push(previous_report);
            self.cleanup.execute(plan).detach();
        }
        Ok(())
    }

    pub async fn build_status(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
    ) -> Result<BuildStatus, BuildError> {
        self.tree.build_status(node, root_network).await
    }

    pub async fn variant_id(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
    ) -> Result<Option<VariantId>, BuildError> {
        self.tree.variant_id(node, root_network).await
    }

    /// Remove a node and its descendants. Tree state goes synchronously;
    /// the remote fan-out runs behind the returned handle.
    pub async fn delete_subtree(&self, node: NodeId) -> Result<CleanupHandle, BuildError> {
        let plan = self.tree.delete_subtree(node).await?;
        Ok(self.cleanup.execute(plan))
    }

    pub async fn remove_root_network(
        &self,
        root_network: RootNetworkId,
    ) -> Result<CleanupHandle, BuildError> {
        let plan = self.tree.remove_root_network(root_network).await?;
        Ok(self.cleanup.execute(plan))
    }

    /// Duplicate a baseline: copy its column of entries, then clone the
    /// built variants. A failed clone rolls the copy back.
    pub async fn duplicate_root_network(
        &self,
        source: RootNetworkId,
    ) -> Result<RootNetworkId, BuildError> {
        let (copy, plan) = self.tree.duplicate_root_network(source).await?;
        if let Err(e) = self.builder.clone_variants(&plan).await {
            let rollback = self.tree.remove_root_network(copy).await?;
            self.cleanup.execute(rollback).detach();
            return Err(e);
        }
        Ok(copy)
    }

    pub async fn delete_study(&self, study: StudyId) -> Result<CleanupHandle, BuildError> {
        let plan = self.tree.delete_study(study).await?;
        info!(%study, "study deleted, remote cleanup scheduled");
        Ok(self.cleanup.execute(plan))
    }

    /// Drain every background task. Cleanup submitted before this call runs
    /// to completion.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }
}
