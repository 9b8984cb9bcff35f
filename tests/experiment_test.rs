//! Experiment progress, throttling and termination.

mod common;

use common::{harness, register_model};
use medai_runner::domain::models::{
    Experiment, ExperimentStatus, NewStudy, StudyId, TransitionOutcome,
};
use medai_runner::domain::ports::Store;
use medai_runner::services::{ExperimentProgress, EXPERIMENT_IN_FLIGHT_CEILING};
use serde_json::json;

async fn members(store: &Store, count: usize) -> Vec<StudyId> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let study = store
            .studies
            .insert_new(&NewStudy::new(format!("exp-{i}")))
            .await
            .unwrap()
            .unwrap();
        ids.push(study.id);
    }
    ids
}

async fn running_experiment(store: &Store, model: medai_runner::domain::models::ModelId, studies: &[StudyId]) -> Experiment {
    let experiment = store.experiments.create("trial", model, Some(3), studies).await.unwrap();
    assert_eq!(experiment.status, ExperimentStatus::New);
    store
        .experiments
        .transition(experiment.id, ExperimentStatus::Running)
        .await
        .unwrap();
    store.experiments.get(experiment.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_creation_stops_at_in_flight_ceiling() {
    let h = harness().await;
    let store = h.store().clone();
    let model = register_model(&store, "CXR", "CR", 1).await;
    let studies = members(&store, 8).await;
    let experiment = running_experiment(&store, model.id, &studies).await;
    let controller = &h.runtime.experiments;

    let mut created_total = 0;
    loop {
        match controller.advance_experiment(&experiment, 3).await.unwrap() {
            ExperimentProgress::Advanced { created, throttled: false, .. } => {
                assert!(!created.is_empty());
                created_total += created.len();
            }
            ExperimentProgress::Advanced { created, throttled: true, .. } => {
                assert!(created.is_empty());
                break;
            }
            ExperimentProgress::Completed => panic!("nothing has finished yet"),
        }
    }
    assert_eq!(created_total, 6);
    let counts = store.experiments.counts(&experiment).await.unwrap();
    assert!(counts.in_flight >= EXPERIMENT_IN_FLIGHT_CEILING);
    assert_eq!(counts.unevaluated, 2);
}

#[tokio::test]
async fn test_completes_only_when_every_member_is_terminal() {
    let h = harness().await;
    let store = h.store().clone();
    let model = register_model(&store, "CXR", "CR", 1).await;
    let studies = members(&store, 2).await;
    let experiment = running_experiment(&store, model.id, &studies).await;
    let controller = &h.runtime.experiments;

    let ExperimentProgress::Advanced { created, .. } = controller.advance_experiment(&experiment, 5).await.unwrap() else {
        panic!("expected progress");
    };
    assert_eq!(created.len(), 2);

    // A failure while a sibling is still running is retried on the same row
    store.evaluations.fail(created[1], None).await.unwrap();
    let ExperimentProgress::Advanced { retried, created: more, .. } =
        controller.advance_experiment(&experiment, 5).await.unwrap()
    else {
        panic!("expected retry");
    };
    assert_eq!(retried, vec![created[1]]);
    assert!(more.is_empty());

    store.evaluations.complete(created[0], &json!({"ok": true}), None).await.unwrap();
    assert_ne!(
        controller.advance_experiment(&experiment, 5).await.unwrap(),
        ExperimentProgress::Completed,
        "a member is still in flight"
    );

    store.evaluations.complete(created[1], &json!({"ok": true}), None).await.unwrap();
    assert_eq!(
        controller.advance_experiment(&experiment, 5).await.unwrap(),
        ExperimentProgress::Completed
    );
    let stored = store.experiments.get(experiment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExperimentStatus::Completed);
}

#[tokio::test]
async fn test_driver_sweep_leaves_new_and_stopped_experiments_alone() {
    let h = harness().await;
    let store = h.store().clone();
    let model = register_model(&store, "CXR", "CR", 1).await;
    let studies = members(&store, 2).await;
    let fresh = store.experiments.create("fresh", model.id, None, &studies[..1]).await.unwrap();
    let stopped = store.experiments.create("stopped", model.id, None, &studies[1..]).await.unwrap();

    let controller = &h.runtime.experiments;
    assert_eq!(
        controller.start_experiment(stopped.id).await.unwrap(),
        TransitionOutcome::Applied
    );
    controller.stop_experiment(stopped.id, "operator request").await.unwrap();

    let progress = controller.advance_all(5).await.unwrap();
    assert!(progress.is_empty());
    assert!(h.dispatcher.batches().await.is_empty());

    let fresh = store.experiments.get(fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, ExperimentStatus::New);
}
