use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use super::ids::{NodeId, ReportId, ResultId, RootNetworkId, VariantId};

/// Errors raised by build-state tree and variant lifecycle operations.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no build entry linked for node {node} on root network {root_network}")]
    EntryNotFound {
        node: NodeId,
        root_network: RootNetworkId,
    },
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("unknown root network: {0}")]
    UnknownRootNetwork(RootNetworkId),
    #[error("unknown study: {0}")]
    UnknownStudy(super::ids::StudyId),
    #[error("a build is already in progress for node {node} on root network {root_network}")]
    ConcurrentBuild {
        node: NodeId,
        root_network: RootNetworkId,
    },
    #[error("parent node {parent} is not built (status: {status})")]
    ParentNotBuilt { parent: NodeId, status: BuildStatus },
    #[error("the root node of a study cannot be deleted on its own")]
    CannotDeleteRoot,
    #[error("variant store unavailable: {0}")]
    VariantStoreUnavailable(String),
    #[error("result store unavailable: {0}")]
    ResultStoreUnavailable(String),
    #[error("build task failed: {0}")]
    BuildTaskFailed(String),
}

/// Build state of one (node, root network) entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BuildStatus {
    NotBuilt,
    Building,
    Built,
    BuiltWithWarning,
    BuiltWithError,
}

impl BuildStatus {
    /// A build has run to completion, successfully or not. Only terminal
    /// entries expose a variant a child build may clone from.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Built | BuildStatus::BuiltWithWarning | BuildStatus::BuiltWithError
        )
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_built" => Ok(BuildStatus::NotBuilt),
            "building" => Ok(BuildStatus::Building),
            "built" => Ok(BuildStatus::Built),
            "built_with_warning" => Ok(BuildStatus::BuiltWithWarning),
            "built_with_error" => Ok(BuildStatus::BuiltWithError),
            _ => Err(format!("Unknown build status: {}", s)),
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::NotBuilt => write!(f, "not_built"),
            BuildStatus::Building => write!(f, "building"),
            BuildStatus::Built => write!(f, "built"),
            BuildStatus::BuiltWithWarning => write!(f, "built_with_warning"),
            BuildStatus::BuiltWithError => write!(f, "built_with_error"),
        }
    }
}

/// Remote computation kinds whose results can be attached to a build entry.
///
/// Each kind maps to its own result store with an independent failure domain.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ComputationKind {
    LoadFlow,
    SecurityAnalysis,
    SensitivityAnalysis,
    ShortCircuit,
    ShortCircuitOneBus,
    VoltageInit,
    DynamicSimulation,
    DynamicSecurityAnalysis,
    StateEstimation,
    PccMin,
}

/// Key of a build entry's report map: one report per modification
/// application, one per computation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportCategory {
    Modification,
    Computation(ComputationKind),
}

/// Variant/result/report references detached from an entry, handed to the
/// deletion coordinator by the caller. Detaching never performs I/O.
#[derive(Debug, Default, Clone)]
pub struct DetachedRefs {
    pub variant_id: Option<VariantId>,
    pub results: Vec<(ComputationKind, ResultId)>,
    pub reports: Vec<ReportId>,
}

/// The per (node, root network) build record.
///
/// Invariant: `variant_id` is present iff `status != NotBuilt`. A `Building`
/// entry already carries the variant name its build is producing, so an
/// invalidation racing the build can hand the name to cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEntry {
    pub status: BuildStatus,
    pub variant_id: Option<VariantId>,
    pub result_refs: HashMap<ComputationKind, ResultId>,
    pub report_refs: HashMap<ReportCategory, ReportId>,
    /// When the in-flight build claimed this entry; used for staleness.
    pub building_since: Option<DateTime<Utc>>,
    /// Bumped by every invalidation and build claim; a build whose claim
    /// epoch no longer matches must discard its result.
    pub build_epoch: u64,
}

impl BuildEntry {
    /// A fresh, unbuilt entry seeded with its modification report identity.
    pub fn new(modification_report: ReportId) -> Self {
        Self {
            status: BuildStatus::NotBuilt,
            variant_id: None,
            result_refs: HashMap::new(),
            report_refs: HashMap::from([(ReportCategory::Modification, modification_report)]),
            building_since: None,
            build_epoch: 0,
        }
    }

    /// Status as seen by rebuild decisions: a `Building` entry older than the
    /// staleness window is reported `NotBuilt` (self-healing after a crash
    /// left it claimed forever).
    pub fn effective_status(&self, now: DateTime<Utc>, staleness: Duration) -> BuildStatus {
        match (self.status, self.building_since) {
            (BuildStatus::Building, Some(since)) if now - since > staleness => {
                BuildStatus::NotBuilt
            }
            (status, _) => status,
        }
    }

    /// Claim the entry for a build: records the variant being produced,
    /// moves to `Building` and returns the claim epoch.
    pub fn begin_build(&mut self, variant: VariantId, now: DateTime<Utc>) -> u64 {
        self.status = BuildStatus::Building;
        self.variant_id = Some(variant);
        self.building_since = Some(now);
        self.build_epoch += 1;
        self.build_epoch
    }

    /// Settle a successful claim with its terminal status.
    pub fn complete_build(&mut self, status: BuildStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.building_since = None;
    }

    /// Undo a claim whose clone never happened (variant store failure).
    pub fn reset_build(&mut self) {
        self.status = BuildStatus::NotBuilt;
        self.variant_id = None;
        self.building_since = None;
    }

    /// Reset to `NotBuilt`, detaching the variant, every result and every
    /// computation report. The modification report identity is stable and
    /// survives invalidation.
    pub fn invalidate(&mut self) -> DetachedRefs {
        let refs = DetachedRefs {
            variant_id: self.variant_id.take(),
            results: self.result_refs.drain().collect(),
            reports: self.detach_computation_reports(),
        };
        self.status = BuildStatus::NotBuilt;
        self.building_since = None;
        self.build_epoch += 1;
        refs
    }

    /// Detach everything, modification report included. Used when the entry
    /// itself is being removed from the tree.
    pub fn detach_all(&mut self) -> DetachedRefs {
        let mut refs = self.invalidate();
        refs.reports.extend(self.report_refs.drain().map(|(_, id)| id));
        refs
    }

    fn detach_computation_reports(&mut self) -> Vec<ReportId> {
        let detached: Vec<ReportCategory> = self
            .report_refs
            .keys()
            .filter(|category| matches!(category, ReportCategory::Computation(_)))
            .copied()
            .collect();
        detached
            .into_iter()
            .filter_map(|category| self.report_refs.remove(&category))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    #[rstest]
    #[case(BuildStatus::NotBuilt, "not_built", false)]
    #[case(BuildStatus::Building, "building", false)]
    #[case(BuildStatus::Built, "built", true)]
    #[case(BuildStatus::BuiltWithWarning, "built_with_warning", true)]
    #[case(BuildStatus::BuiltWithError, "built_with_error", true)]
    fn test_status_display_roundtrip(
        #[case] status: BuildStatus,
        #[case] text: &str,
        #[case] terminal: bool,
    ) {
        assert_eq!(status.to_string(), text);
        assert_eq!(text.parse::<BuildStatus>().unwrap(), status);
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn test_computation_kinds_are_distinct_in_display() {
        let rendered: std::collections::HashSet<String> =
            ComputationKind::iter().map(|k| k.to_string()).collect();
        assert_eq!(rendered.len(), ComputationKind::iter().count());
        assert!(rendered.contains("load-flow"));
        assert!(rendered.contains("short-circuit-one-bus"));
    }

    #[test]
    fn test_new_entry_starts_unbuilt_with_stable_report() {
        let report = ReportId::new();
        let entry = BuildEntry::new(report);
        assert_eq!(entry.status, BuildStatus::NotBuilt);
        assert!(entry.variant_id.is_none());
        assert!(entry.result_refs.is_empty());
        assert_eq!(
            entry.report_refs.get(&ReportCategory::Modification),
            Some(&report)
        );
    }

    #[test]
    fn test_invalidate_detaches_everything_but_modification_report() {
        let report = ReportId::new();
        let mut entry = BuildEntry::new(report);
        entry.begin_build(VariantId::fresh(), Utc::now());
        entry.complete_build(BuildStatus::Built);
        entry
            .result_refs
            .insert(ComputationKind::LoadFlow, ResultId::new());
        let lf_report = ReportId::new();
        entry.report_refs.insert(
            ReportCategory::Computation(ComputationKind::LoadFlow),
            lf_report,
        );

        let refs = entry.invalidate();

        assert_eq!(entry.status, BuildStatus::NotBuilt);
        assert!(entry.variant_id.is_none());
        assert!(entry.result_refs.is_empty());
        assert!(refs.variant_id.is_some());
        assert_eq!(refs.results.len(), 1);
        assert_eq!(refs.reports, vec![lf_report]);
        assert_eq!(
            entry.report_refs.get(&ReportCategory::Modification),
            Some(&report)
        );
    }

    #[test]
    fn test_stale_building_reads_as_not_built() {
        let mut entry = BuildEntry::new(ReportId::new());
        let started = Utc::now() - Duration::seconds(3600);
        entry.status = BuildStatus::Building;
        entry.variant_id = Some(VariantId::fresh());
        entry.building_since = Some(started);

        let now = Utc::now();
        assert_eq!(
            entry.effective_status(now, Duration::seconds(600)),
            BuildStatus::NotBuilt
        );
        assert_eq!(
            entry.effective_status(now, Duration::seconds(7200)),
            BuildStatus::Building
        );
    }

    #[test]
    fn test_invalidation_bumps_epoch_past_claims() {
        let mut entry = BuildEntry::new(ReportId::new());
        let epoch = entry.begin_build(VariantId::fresh(), Utc::now());
        let refs = entry.invalidate();
        assert!(refs.variant_id.is_some());
        assert!(entry.build_epoch > epoch);
    }

    #[test]
    fn test_status_serde_representation() {
        let json = serde_json::to_string(&BuildStatus::BuiltWithWarning).unwrap();
        assert_eq!(json, "\"BuiltWithWarning\"");
    }
}
