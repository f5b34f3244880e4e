//! Variant lifecycle: materializing a node's network snapshot on a root
//! network by cloning its parent's variant and applying the node's
//! modification list.
//!
//! The build protocol around an entry: claim it (`Building`, variant name
//! recorded, epoch bumped) before any remote write, settle it with a
//! terminal status after. The remote work runs on the executor so a caller
//! abandoning the wait never leaves the entry claimed forever; an entry
//! whose epoch moved under an in-flight build discards its variant instead
//! of settling.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{info, warn};

use crate::cleanup::DeletionCoordinator;
use crate::config::BuildConfig;
use crate::domain::{
    BuildError, BuildStatus, NetworkId, NodeId, ReportCategory, ReportId, RootNetworkId, VariantId,
};
use crate::executor::TaskExecutor;
use crate::stores::{ApplyOutcome, ModificationApplier, VariantStore};
use crate::tree::{BuildStateTree, CloneVariantsPlan};

/// What a materialize call observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// This call performed the build.
    Built {
        variant: VariantId,
        status: BuildStatus,
    },
    /// The entry was already terminal; no clone was performed.
    AlreadyBuilt {
        variant: VariantId,
        status: BuildStatus,
    },
    /// The build finished after the entry was invalidated; its variant was
    /// handed to cleanup and the entry stays unbuilt.
    Discarded,
}

impl MaterializeOutcome {
    pub fn variant(&self) -> Option<&VariantId> {
        match self {
            MaterializeOutcome::Built { variant, .. }
            | MaterializeOutcome::AlreadyBuilt { variant, .. } => Some(variant),
            MaterializeOutcome::Discarded => None,
        }
    }
}

pub struct NodeBuilder {
    tree: Arc<BuildStateTree>,
    variants: Arc<dyn VariantStore>,
    applier: Arc<dyn ModificationApplier>,
    cleanup: Arc<DeletionCoordinator>,
    executor: Arc<TaskExecutor>,
    staleness: chrono::Duration,
    build_wait: Duration,
}

impl NodeBuilder {
    pub fn new(
        tree: Arc<BuildStateTree>,
        variants: Arc<dyn VariantStore>,
        applier: Arc<dyn ModificationApplier>,
        cleanup: Arc<DeletionCoordinator>,
        executor: Arc<TaskExecutor>,
        cfg: &BuildConfig,
    ) -> Self {
        Self {
            tree,
            variants,
            applier,
            cleanup,
            executor,
            staleness: chrono::Duration::seconds(cfg.staleness_seconds as i64),
            build_wait: Duration::from_secs(cfg.build_wait_seconds),
        }
    }

    /// Materialize the (node, root network) entry.
    ///
    /// Idempotent on a terminal entry. If another build is in flight the
    /// call waits for it to settle (both callers then observe the same
    /// terminal variant) up to the configured bound, after which it fails
    /// with `ConcurrentBuild`. The parent entry must be terminal first.
    pub async fn materialize(
        &self,
        node: NodeId,
        root_network: RootNetworkId,
    ) -> Result<MaterializeOutcome, BuildError> {
        let network = self.tree.network_of(root_network).await?;
        let slot = self.tree.entry_slot(node, root_network).await?;
        let parent = self.tree.parent_of(node).await?;
        let modifications = self.tree.modifications_of(node).await?;
        let deadline = Instant::now() + self.build_wait;

        // Claim the entry, or wait on whoever holds the claim.
        let (variant, epoch, report, source, leftover) = loop {
            let source = match parent {
                Some(parent) => self.parent_variant(parent, root_network).await?,
                None => VariantId::initial(),
            };

            let wait = {
                let mut entry = slot.lock().await;
                match entry.effective_status(Utc::now(), self.staleness) {
                    status if status.is_terminal() => match entry.variant_id.clone() {
                        Some(variant) => {
                            return Ok(MaterializeOutcome::AlreadyBuilt { variant, status })
                        }
                        None => {
                            // A terminal entry carries its variant through
                            // every transition in this crate; a missing one
                            // is corrupted state, so rebuild rather than
                            // report a build that never happened.
                            warn!(%node, %root_network, %status, "terminal entry without a variant, rebuilding");
                            entry.reset_build();
                            continue;
                        }
                    },
                    BuildStatus::Building => {
                        // Register interest before releasing the entry lock,
                        // or a settle landing in between would be missed.
                        let mut wait = Box::pin(slot.settled());
                        wait.as_mut().enable();
                        wait
                    }
                    _ => {
                        // A stale claim may have left a half-made variant.
                        let leftover = entry.variant_id.take();
                        let variant = VariantId::fresh();
                        let epoch = entry.begin_build(variant.clone(), Utc::now());
                        let report = *entry
                            .report_refs
                            .entry(ReportCategory::Modification)
                            .or_insert_with(ReportId::new);
                        break (variant, epoch, report, source, leftover);
                    }
                }
            };

            if timeout_at(deadline, wait).await.is_err() {
                return Err(BuildError::ConcurrentBuild { node, root_network });
            }
        };

        if let Some(leftover) = leftover {
            warn!(%node, %root_network, variant = %leftover, "discarding variant of an abandoned build");
            self.cleanup.discard_variant(network, leftover).detach();
        }

        // The remote clone+apply runs on the executor: abandoning the await
        // below never aborts it, so the entry always settles.
        let task = {
            let variants = self.variants.clone();
            let applier = self.applier.clone();
            let cleanup = self.cleanup.clone();
            let slot = slot.clone();
            let variant = variant.clone();
            async move {
                if let Err(e) = variants.clone_variant(network, &source, &variant).await {
                    let mut entry = slot.lock().await;
                    if entry.build_epoch == epoch {
                        entry.reset_build();
                    }
                    drop(entry);
                    slot.notify_settled();
                    return Err(BuildError::VariantStoreUnavailable(e.to_string()));
                }

                let status = match applier
                    .apply(network, &variant, &modifications, report)
                    .await
                {
                    Ok(ApplyOutcome::Clean) => BuildStatus::Built,
                    Ok(ApplyOutcome::Warnings) => BuildStatus::BuiltWithWarning,
                    Ok(ApplyOutcome::Errors) => BuildStatus::BuiltWithError,
                    Err(e) => {
                        warn!(%node, %root_network, error = %e, "modification application failed");
                        BuildStatus::BuiltWithError
                    }
                };

                let mut entry = slot.lock().await;
                if entry.build_epoch != epoch {
                    drop(entry);
                    info!(%node, %root_network, variant = %variant, "entry invalidated during build, discarding variant");
                    cleanup.discard_variant(network, variant).detach();
                    return Ok(MaterializeOutcome::Discarded);
                }
                entry.complete_build(status);
                drop(entry);
                slot.notify_settled();
                info!(%node, %root_network, variant = %variant, %status, "node materialized");
                Ok(MaterializeOutcome::Built { variant, status })
            }
        };

        match self.executor.submit(task).await {
            Ok(result) => result,
            Err(e) => Err(BuildError::BuildTaskFailed(e.to_string())),
        }
    }

    async fn parent_variant(
        &self,
        parent: NodeId,
        root_network: RootNetworkId,
    ) -> Result<VariantId, BuildError> {
        let slot = self.tree.entry_slot(parent, root_network).await?;
        let entry = slot.lock().await;
        if !entry.status.is_terminal() {
            return Err(BuildError::ParentNotBuilt {
                parent,
                status: entry.status,
            });
        }
        entry
            .variant_id
            .clone()
            .ok_or(BuildError::ParentNotBuilt {
                parent,
                status: entry.status,
            })
    }

    /// Physically remove a snapshot; already absent counts as removed.
    pub async fn delete_variant(
        &self,
        network: NetworkId,
        variant: &VariantId,
    ) -> Result<(), BuildError> {
        self.variants
            .delete_variant(network, variant)
            .await
            .map(|_| ())
            .map_err(|e| BuildError::VariantStoreUnavailable(e.to_string()))
    }

    /// Bulk-clone the built variants of a duplicated root network under the
    /// target names its entries already record.
    pub async fn clone_variants(&self, plan: &CloneVariantsPlan) -> Result<(), BuildError> {
        for (source, target) in &plan.pairs {
            self.variants
                .clone_variant(plan.network, source, target)
                .await
                .map_err(|e| BuildError::VariantStoreUnavailable(e.to_string()))?;
        }
        info!(network = %plan.network, variants = plan.pairs.len(), "root network variants cloned");
        Ok(())
    }
}
