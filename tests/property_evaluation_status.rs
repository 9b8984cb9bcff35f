use medai_runner::adapters::sqlite::{create_migrated_test_pool, sqlite_store};
use medai_runner::domain::models::{
    EvalJob, EvaluationStatus, Model, ModelId, NewStudy, TransitionOutcome,
};
use medai_runner::DomainError;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

fn any_status() -> impl Strategy<Value = EvaluationStatus> {
    prop::sample::select(EvaluationStatus::ALL.to_vec())
}

proptest! {
    /// Property: COMPLETED is absorbing and every other status has an exit
    #[test]
    fn prop_only_completed_is_absorbing(status in any_status()) {
        let exits = status.valid_transitions();
        prop_assert_eq!(exits.is_empty(), status == EvaluationStatus::Completed);
        prop_assert!(!status.can_transition_to(status), "no self transitions");
    }

    /// Property: sources_of is the inverse of the transition table
    #[test]
    fn prop_sources_invert_transitions(from in any_status(), to in any_status()) {
        prop_assert_eq!(
            EvaluationStatus::sources_of(to).contains(&from),
            from.can_transition_to(to)
        );
    }

    /// Property: status names round-trip
    #[test]
    fn prop_status_names_round_trip(status in any_status()) {
        prop_assert_eq!(EvaluationStatus::from_str(status.as_str()), Some(status));
        prop_assert_eq!(EvaluationStatus::from_str(&status.as_str().to_lowercase()), Some(status));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: the store enforces the transition table
    ///
    /// For any sequence of requested statuses, a request is applied exactly
    /// when the table allows it, is a no-op when already there, and is
    /// rejected otherwise; the stored status always matches a model of the
    /// table.
    #[test]
    fn prop_store_follows_transition_table(targets in prop::collection::vec(any_status(), 1..12)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let pool = create_migrated_test_pool().await.unwrap();
            let store = sqlite_store(&pool);
            let model = store.models.create_model(&Model {
                id: ModelId(0),
                image: "registry/m:1".to_string(),
                display_name: "m".to_string(),
                input_type: "CXR".to_string(),
                modality: "CR".to_string(),
                has_image_output: false,
                concurrency: 1,
            }).await.unwrap();
            store.models.upsert_job(&EvalJob::new(model.id)).await.unwrap();
            let study = store.studies.insert_new(&NewStudy::new("s")).await.unwrap().unwrap();
            let id = store.evaluations.create_running(model.id, &[study.id]).await.unwrap()[0];

            let mut expected = EvaluationStatus::Running;
            for to in targets {
                let result = store.evaluations.transition(id, to).await;
                if expected == to {
                    prop_assert!(matches!(result, Ok(TransitionOutcome::Unchanged)));
                } else if expected.can_transition_to(to) {
                    prop_assert!(matches!(result, Ok(TransitionOutcome::Applied)));
                    expected = to;
                } else {
                    let rejected = matches!(result, Err(DomainError::InvalidStateTransition { .. }));
                    prop_assert!(rejected, "{:?} -> {:?} should be rejected", expected, to);
                }
                let stored = store.evaluations.get(id).await.unwrap().unwrap();
                prop_assert_eq!(stored.status, expected);
            }

            // One row per (model, study), whatever happened above
            let duplicate = store.evaluations.create_running(model.id, &[study.id]).await;
            let is_duplicate = matches!(duplicate, Err(DomainError::DuplicateEvaluation { .. }));
            prop_assert!(is_duplicate);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
