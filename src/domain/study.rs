use serde::{Deserialize, Serialize};

use super::ids::{ModificationRef, NetworkId, NodeId, ReportId, RootNetworkId, StudyId};

/// One modification step in a study's node tree.
///
/// A node never moves to a different parent; its ordered modification list is
/// the only mutable attribute, and changing it invalidates the node and all
/// of its descendants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub study: StudyId,
    /// `None` for the study's root node.
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub modifications: Vec<ModificationRef>,
}

/// An independent base-network baseline within a study. A study may hold
/// several, e.g. for parallel what-if baselines sharing one modification
/// tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootNetwork {
    pub id: RootNetworkId,
    pub study: StudyId,
    /// The physical network whose variants back this baseline's builds.
    pub network: NetworkId,
    pub root_report: ReportId,
}

/// One logical analysis session: a node tree plus its root networks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub id: StudyId,
    pub root_node: NodeId,
}
