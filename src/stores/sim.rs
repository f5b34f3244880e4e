//! In-memory store implementations used by tests and local simulation runs.
//! They support failure and latency injection so concurrency and best-effort
//! cleanup behavior can be exercised without any remote service.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

use crate::domain::{ModificationRef, NetworkId, ReportId, ResultId, VariantId};

use super::{ApplyOutcome, DeleteOutcome, ModificationApplier, ReportStore, ResultStore, StoreError, VariantStore};

/// In-memory variant store tracking the snapshot sets of each network.
#[derive(Default)]
pub struct SimVariantStore {
    networks: Mutex<HashMap<NetworkId, HashSet<VariantId>>>,
    clone_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    failing: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl SimVariantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a network holding only its initial snapshot.
    pub fn seed_network(&self, network: NetworkId) {
        self.networks
            .lock()
            .entry(network)
            .or_insert_with(|| HashSet::from([VariantId::initial()]));
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every call, widening race windows in concurrency tests.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn clone_count(&self) -> usize {
        self.clone_calls.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, network: NetworkId, variant: &VariantId) -> bool {
        self.networks
            .lock()
            .get(&network)
            .is_some_and(|variants| variants.contains(variant))
    }

    async fn simulate_call(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VariantStore for SimVariantStore {
    async fn clone_variant(
        &self,
        network: NetworkId,
        source: &VariantId,
        target: &VariantId,
    ) -> Result<(), StoreError> {
        self.simulate_call().await?;
        self.clone_calls.fetch_add(1, Ordering::SeqCst);
        let mut networks = self.networks.lock();
        let variants = networks
            .get_mut(&network)
            .ok_or(StoreError::UnknownNetwork(network))?;
        if !variants.contains(source) {
            return Err(StoreError::Unavailable(format!(
                "source variant {} missing in network {}",
                source, network
            )));
        }
        variants.insert(target.clone());
        Ok(())
    }

    async fn delete_variant(
        &self,
        network: NetworkId,
        variant: &VariantId,
    ) -> Result<DeleteOutcome, StoreError> {
        self.simulate_call().await?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut networks = self.networks.lock();
        match networks.get_mut(&network) {
            Some(variants) => {
                if variants.remove(variant) {
                    Ok(DeleteOutcome::Deleted)
                } else {
                    Ok(DeleteOutcome::AlreadyAbsent)
                }
            }
            None => Ok(DeleteOutcome::AlreadyAbsent),
        }
    }

    async fn list_variants(&self, network: NetworkId) -> Result<Vec<VariantId>, StoreError> {
        self.simulate_call().await?;
        let networks = self.networks.lock();
        let variants = networks
            .get(&network)
            .ok_or(StoreError::UnknownNetwork(network))?;
        Ok(variants.iter().cloned().collect())
    }
}

/// In-memory result store recording which ids were deleted.
#[derive(Default)]
pub struct SimResultStore {
    deleted: Mutex<Vec<ResultId>>,
    delete_calls: AtomicUsize,
    failing: AtomicBool,
}

impl SimResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn deleted(&self) -> Vec<ResultId> {
        self.deleted.lock().clone()
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultStore for SimResultStore {
    async fn delete_many(&self, results: &[ResultId]) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        self.deleted.lock().extend_from_slice(results);
        Ok(())
    }
}

/// In-memory report store with the same contract as the result stores.
#[derive(Default)]
pub struct SimReportStore {
    deleted: Mutex<Vec<ReportId>>,
    delete_calls: AtomicUsize,
    failing: AtomicBool,
}

impl SimReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn deleted(&self) -> Vec<ReportId> {
        self.deleted.lock().clone()
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportStore for SimReportStore {
    async fn delete_many(&self, reports: &[ReportId]) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        self.deleted.lock().extend_from_slice(reports);
        Ok(())
    }
}

/// Modification applier returning a configurable outcome.
pub struct SimApplier {
    outcome: Mutex<ApplyOutcome>,
    applied: Mutex<Vec<(VariantId, usize)>>,
    failing: AtomicBool,
}

impl Default for SimApplier {
    fn default() -> Self {
        Self {
            outcome: Mutex::new(ApplyOutcome::Clean),
            applied: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }
}

impl SimApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, outcome: ApplyOutcome) {
        *self.outcome.lock() = outcome;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Variants modifications were applied to, with the modification count.
    pub fn applied(&self) -> Vec<(VariantId, usize)> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl ModificationApplier for SimApplier {
    async fn apply(
        &self,
        _network: NetworkId,
        variant: &VariantId,
        modifications: &[ModificationRef],
        _report: ReportId,
    ) -> Result<ApplyOutcome, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        self.applied
            .lock()
            .push((variant.clone(), modifications.len()));
        Ok(*self.outcome.lock())
    }
}
