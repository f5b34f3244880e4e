//! End-to-end lifecycle tests over the in-memory simulation stores: build,
//! invalidate, rebuild and delete across a small study tree.

use std::collections::HashMap;
use std::sync::{Arc, Once};

use grid_study_core::builder::MaterializeOutcome;
use grid_study_core::config::Config;
use grid_study_core::domain::{
    BuildError, BuildStatus, ComputationKind, ModificationRef, NetworkId, ReportId, ResultId,
};
use grid_study_core::service::StudyService;
use grid_study_core::stores::sim::{SimApplier, SimReportStore, SimResultStore, SimVariantStore};
use grid_study_core::stores::ResultStore;
use grid_study_core::tree::InvalidateScope;

struct Rig {
    service: StudyService,
    variants: Arc<SimVariantStore>,
    load_flow: Arc<SimResultStore>,
    security: Arc<SimResultStore>,
    reports: Arc<SimReportStore>,
    network: NetworkId,
}

static TRACING: Once = Once::new();

fn rig() -> Rig {
    TRACING.call_once(grid_study_core::telemetry::init_tracing);

    let variants = Arc::new(SimVariantStore::new());
    let load_flow = Arc::new(SimResultStore::new());
    let security = Arc::new(SimResultStore::new());
    let reports = Arc::new(SimReportStore::new());

    let mut results: HashMap<ComputationKind, Arc<dyn ResultStore>> = HashMap::new();
    results.insert(ComputationKind::LoadFlow, load_flow.clone());
    results.insert(ComputationKind::SecurityAnalysis, security.clone());

    let service = StudyService::new(
        Config::default(),
        variants.clone(),
        Arc::new(SimApplier::new()),
        results,
        reports.clone(),
    );

    let network = NetworkId::new();
    variants.seed_network(network);

    Rig {
        service,
        variants,
        load_flow,
        security,
        reports,
        network,
    }
}

fn built_variant(outcome: &MaterializeOutcome) -> grid_study_core::domain::VariantId {
    outcome.variant().cloned().expect("expected a built variant")
}

#[tokio::test]
async fn test_build_then_invalidate_ancestor_detaches_whole_chain() {
    let rig = rig();
    let (study, rn) = rig.service.create_study(rig.network).await.unwrap();
    let node_b = rig
        .service
        .add_node(study.root_node, vec![ModificationRef::new()])
        .await
        .unwrap();

    // Build A then B; B clones from A's variant.
    let v_a = built_variant(&rig.service.build_node(study.root_node, rn).await.unwrap());
    let v_b = built_variant(&rig.service.build_node(node_b, rn).await.unwrap());
    assert!(rig.variants.contains(rig.network, &v_a));
    assert!(rig.variants.contains(rig.network, &v_b));

    let lf_result = ResultId::new();
    rig.service
        .record_result(node_b, rn, ComputationKind::LoadFlow, lf_result, ReportId::new())
        .await
        .unwrap();

    // Invalidate A with descendants: both entries reset, every detached id
    // scheduled for removal.
    let handle = rig
        .service
        .invalidate_node(study.root_node, rn, InvalidateScope::SelfAndDescendants)
        .await
        .unwrap();
    for node in [study.root_node, node_b] {
        assert_eq!(
            rig.service.build_status(node, rn).await.unwrap(),
            BuildStatus::NotBuilt
        );
        assert!(rig.service.variant_id(node, rn).await.unwrap().is_none());
    }
    handle.join().await;
    assert!(!rig.variants.contains(rig.network, &v_a));
    assert!(!rig.variants.contains(rig.network, &v_b));
    assert_eq!(rig.load_flow.deleted(), vec![lf_result]);

    // B cannot be rebuilt before A is.
    let err = rig.service.build_node(node_b, rn).await.unwrap_err();
    assert!(matches!(err, BuildError::ParentNotBuilt { .. }));

    // Rebuilding bottom-up works again.
    rig.service.build_node(study.root_node, rn).await.unwrap();
    let rebuilt = rig.service.build_node(node_b, rn).await.unwrap();
    assert!(matches!(rebuilt, MaterializeOutcome::Built { .. }));
}

#[tokio::test]
async fn test_remove_root_network_spares_other_baselines() {
    let rig = rig();
    let (study, rn1) = rig.service.create_study(rig.network).await.unwrap();
    let network2 = NetworkId::new();
    rig.variants.seed_network(network2);
    let rn2 = rig
        .service
        .add_root_network(study.id, network2)
        .await
        .unwrap();

    let v1 = built_variant(&rig.service.build_node(study.root_node, rn1).await.unwrap());
    let v2 = built_variant(&rig.service.build_node(study.root_node, rn2).await.unwrap());

    let handle = rig.service.remove_root_network(rn1).await.unwrap();
    handle.join().await;

    assert!(!rig.variants.contains(rig.network, &v1));
    assert!(rig.variants.contains(network2, &v2));
    assert_eq!(
        rig.service.variant_id(study.root_node, rn2).await.unwrap(),
        Some(v2)
    );
    assert!(matches!(
        rig.service.build_status(study.root_node, rn1).await.unwrap_err(),
        BuildError::UnknownRootNetwork(_)
    ));
}

#[tokio::test]
async fn test_delete_subtree_bulk_tasks_and_synchronous_tree_removal() {
    let rig = rig();
    let (study, rn) = rig.service.create_study(rig.network).await.unwrap();
    let child = rig.service.add_node(study.root_node, Vec::new()).await.unwrap();
    let grandchild = rig.service.add_node(child, Vec::new()).await.unwrap();

    rig.service.build_node(study.root_node, rn).await.unwrap();
    let v_child = built_variant(&rig.service.build_node(child, rn).await.unwrap());
    let v_grandchild = built_variant(&rig.service.build_node(grandchild, rn).await.unwrap());

    for node in [child, grandchild] {
        rig.service
            .record_result(node, rn, ComputationKind::LoadFlow, ResultId::new(), ReportId::new())
            .await
            .unwrap();
        rig.service
            .record_result(
                node,
                rn,
                ComputationKind::SecurityAnalysis,
                ResultId::new(),
                ReportId::new(),
            )
            .await
            .unwrap();
    }

    let handle = rig.service.delete_subtree(child).await.unwrap();
    // Gone from the tree before any remote deletion ran.
    assert!(matches!(
        rig.service.build_status(child, rn).await.unwrap_err(),
        BuildError::UnknownNode(_)
    ));
    // One variant task, one per computation kind with results, one report
    // task; never one task per id.
    assert_eq!(handle.task_count(), 4);
    handle.join().await;

    assert!(!rig.variants.contains(rig.network, &v_child));
    assert!(!rig.variants.contains(rig.network, &v_grandchild));
    assert_eq!(rig.load_flow.delete_calls(), 1);
    assert_eq!(rig.load_flow.deleted().len(), 2);
    assert_eq!(rig.security.delete_calls(), 1);
    // Four computation reports plus two modification reports.
    assert_eq!(rig.reports.deleted().len(), 6);
}

#[tokio::test]
async fn test_failing_result_store_never_fails_the_deletion() {
    let rig = rig();
    let (study, rn) = rig.service.create_study(rig.network).await.unwrap();
    let child = rig.service.add_node(study.root_node, Vec::new()).await.unwrap();
    rig.service.build_node(study.root_node, rn).await.unwrap();
    let v_child = built_variant(&rig.service.build_node(child, rn).await.unwrap());
    rig.service
        .record_result(child, rn, ComputationKind::LoadFlow, ResultId::new(), ReportId::new())
        .await
        .unwrap();

    rig.load_flow.set_failing(true);
    let handle = rig.service.delete_subtree(child).await.unwrap();
    // The aggregate resolves even though one store is down, and the variant
    // deletion still went through.
    handle.join().await;
    assert!(!rig.variants.contains(rig.network, &v_child));
    assert!(rig.load_flow.deleted().is_empty());
}

#[tokio::test]
async fn test_delete_study_cascades_and_drains_on_shutdown() {
    let rig = rig();
    let (study, rn) = rig.service.create_study(rig.network).await.unwrap();
    let child = rig.service.add_node(study.root_node, Vec::new()).await.unwrap();
    let v_root = built_variant(&rig.service.build_node(study.root_node, rn).await.unwrap());
    let v_child = built_variant(&rig.service.build_node(child, rn).await.unwrap());

    rig.service.delete_study(study.id).await.unwrap().detach();
    rig.service.shutdown().await;

    assert!(!rig.variants.contains(rig.network, &v_root));
    assert!(!rig.variants.contains(rig.network, &v_child));
    assert!(matches!(
        rig.service.build_status(study.root_node, rn).await.unwrap_err(),
        BuildError::UnknownNode(_)
    ));
}

#[tokio::test]
async fn test_duplicated_baseline_is_independent() {
    let rig = rig();
    let (study, rn) = rig.service.create_study(rig.network).await.unwrap();
    let v_source = built_variant(&rig.service.build_node(study.root_node, rn).await.unwrap());

    let copy = rig.service.duplicate_root_network(rn).await.unwrap();
    let v_copy = rig
        .service
        .variant_id(study.root_node, copy)
        .await
        .unwrap()
        .expect("duplicated entry keeps its build");
    assert_ne!(v_copy, v_source);
    assert!(rig.variants.contains(rig.network, &v_copy));
    assert_eq!(
        rig.service.build_status(study.root_node, copy).await.unwrap(),
        BuildStatus::Built
    );

    // Invalidating the copy leaves the source baseline built.
    rig.service
        .invalidate_node(study.root_node, copy, InvalidateScope::SelfOnly)
        .await
        .unwrap()
        .join()
        .await;
    assert!(rig.variants.contains(rig.network, &v_source));
    assert!(!rig.variants.contains(rig.network, &v_copy));
    assert_eq!(
        rig.service.variant_id(study.root_node, rn).await.unwrap(),
        Some(v_source)
    );
}
