//! Interfaces of the external stores the core coordinates: the variant store
//! owning physical network snapshots, one result store per computation kind,
//! the report store and the modification applier. Wire formats live behind
//! these seams and are out of scope here.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ModificationRef, NetworkId, ReportId, ResultId, VariantId};

#[cfg(feature = "sim")]
pub mod sim;

/// Remote store failure, transient from the core's point of view.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unknown network: {0}")]
    UnknownNetwork(NetworkId),
}

/// Outcome of a variant deletion; an already absent variant is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

/// Outcome of applying a node's modification list to a variant; picks the
/// terminal build status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Clean,
    Warnings,
    Errors,
}

/// Owner of physical network snapshots.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VariantStore: Send + Sync {
    /// Clone `source` into a new snapshot named `target` within `network`.
    async fn clone_variant(
        &self,
        network: NetworkId,
        source: &VariantId,
        target: &VariantId,
    ) -> Result<(), StoreError>;

    /// Remove a snapshot; deleting an absent variant is not an error.
    async fn delete_variant(
        &self,
        network: NetworkId,
        variant: &VariantId,
    ) -> Result<DeleteOutcome, StoreError>;

    async fn list_variants(&self, network: NetworkId) -> Result<Vec<VariantId>, StoreError>;
}

/// One store per computation kind; deletion is bulk and must tolerate
/// unknown ids.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn delete_many(&self, results: &[ResultId]) -> Result<(), StoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn delete_many(&self, reports: &[ReportId]) -> Result<(), StoreError>;
}

/// Applies a node's ordered modification list to a freshly cloned variant,
/// logging into the entry's modification report.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModificationApplier: Send + Sync {
    async fn apply(
        &self,
        network: NetworkId,
        variant: &VariantId,
        modifications: &[ModificationRef],
        report: ReportId,
    ) -> Result<ApplyOutcome, StoreError>;
}
