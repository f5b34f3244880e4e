//! Fan-out deletion of remote resources detached from the tree.
//!
//! Tree state is always removed synchronously before a plan reaches this
//! coordinator, so nothing listed here is reachable from the tree anymore.
//! Every remote store gets one independent bulk task; a failing store is
//! logged and never fails the aggregate or its siblings. Submitted tasks run
//! to completion even if the initiating caller has moved on.

use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::{
    BuildError, ComputationKind, DetachedRefs, NetworkId, ReportId, ResultId, VariantId,
};
use crate::executor::TaskExecutor;
use crate::stores::{ReportStore, ResultStore, VariantStore};

/// Everything a tree mutation detached and handed over for physical removal.
#[derive(Debug, Default, Clone)]
pub struct CleanupPlan {
    pub variants: HashMap<NetworkId, Vec<VariantId>>,
    pub results: HashMap<ComputationKind, Vec<ResultId>>,
    pub reports: Vec<ReportId>,
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.variants.values().all(Vec::is_empty)
            && self.results.values().all(Vec::is_empty)
            && self.reports.is_empty()
    }

    /// Fold one entry's detached references into the plan.
    pub fn absorb(&mut self, network: NetworkId, refs: DetachedRefs) {
        if let Some(variant) = refs.variant_id {
            self.variants.entry(network).or_default().push(variant);
        }
        for (kind, result) in refs.results {
            self.results.entry(kind).or_default().push(result);
        }
        self.reports.extend(refs.reports);
    }

    pub fn merge(&mut self, other: CleanupPlan) {
        for (network, variants) in other.variants {
            self.variants.entry(network).or_default().extend(variants);
        }
        for (kind, results) in other.results {
            self.results.entry(kind).or_default().extend(results);
        }
        self.reports.extend(other.reports);
    }
}

/// Join handle over one fan-out: resolves once every branch has finished,
/// and always resolves successfully. Exists for observability and tests;
/// production callers usually [`detach`](CleanupHandle::detach) it.
pub struct CleanupHandle {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl CleanupHandle {
    /// Number of independent store tasks this fan-out submitted.
    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every branch. Branch failures were already logged inside the
    /// tasks; a panicked task is logged here. Never an error for the caller.
    pub async fn join(self) {
        for outcome in futures::future::join_all(self.handles).await {
            if let Err(e) = outcome {
                warn!(error = %e, "cleanup task did not run to completion");
            }
        }
    }

    /// Let the fan-out finish in the background.
    pub fn detach(self) {}
}

/// Fans deletion calls out to the variant, result and report stores.
pub struct DeletionCoordinator {
    executor: Arc<TaskExecutor>,
    variants: Arc<dyn VariantStore>,
    results: HashMap<ComputationKind, Arc<dyn ResultStore>>,
    reports: Arc<dyn ReportStore>,
}

impl DeletionCoordinator {
    pub fn new(
        executor: Arc<TaskExecutor>,
        variants: Arc<dyn VariantStore>,
        results: HashMap<ComputationKind, Arc<dyn ResultStore>>,
        reports: Arc<dyn ReportStore>,
    ) -> Self {
        Self {
            executor,
            variants,
            results,
            reports,
        }
    }

    /// Launch the fan-out: one bulk task per distinct remote store, all
    /// concurrent, best-effort. Returns immediately.
    pub fn execute(&self, plan: CleanupPlan) -> CleanupHandle {
        let mut handles = Vec::new();

        if !plan.reports.is_empty() {
            let store = self.reports.clone();
            let reports = plan.reports;
            handles.push(self.executor.submit_tracked("report cleanup", async move {
                store.delete_many(&reports).await?;
                Ok(())
            }));
        }

        for (kind, results) in plan.results {
            if results.is_empty() {
                continue;
            }
            match self.results.get(&kind) {
                Some(store) => {
                    let store = store.clone();
                    handles.push(self.executor.submit_tracked("result cleanup", async move {
                        debug!(kind = %kind, count = results.len(), "deleting computation results");
                        store.delete_many(&results).await?;
                        Ok(())
                    }));
                }
                None => warn!(kind = %kind, count = results.len(), "no result store registered, results left behind"),
            }
        }

        for (network, variants) in plan.variants {
            if variants.is_empty() {
                continue;
            }
            let store = self.variants.clone();
            handles.push(self.executor.submit_tracked("variant cleanup", async move {
                for variant in &variants {
                    store.delete_variant(network, variant).await?;
                }
                Ok(())
            }));
        }

        debug!(
            tasks = handles.len(),
            kinds = self.results.keys().map(|k| k.to_string()).sorted().join(", "),
            "cleanup fan-out submitted"
        );
        CleanupHandle { handles }
    }

    /// Retire a single variant, e.g. one produced by a build that lost to an
    /// invalidation.
    pub fn discard_variant(&self, network: NetworkId, variant: VariantId) -> CleanupHandle {
        let mut plan = CleanupPlan::default();
        plan.variants.entry(network).or_default().push(variant);
        self.execute(plan)
    }

    /// Retire one superseded computation result in the foreground. Unlike
    /// the fan-out, an unreachable store is reported to the caller.
    pub async fn delete_result(
        &self,
        kind: ComputationKind,
        result: ResultId,
    ) -> Result<(), BuildError> {
        match self.results.get(&kind) {
            Some(store) => store
                .delete_many(&[result])
                .await
                .map_err(|e| BuildError::ResultStoreUnavailable(e.to_string())),
            None => {
                warn!(kind = %kind, "no result store registered, result left behind");
                Ok(())
            }
        }
    }
}
