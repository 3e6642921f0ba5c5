// Version lifecycle scenarios: open/close preconditions, the accessioning
// hand-off, and the guarantees around concurrent callers.

mod fixtures;

use std::sync::Arc;

use accession_flow::collaborators::{ObjectStore, VersionEvent, VersionMetadata};
use accession_flow::error::{LifecycleError, PreconditionFailure, ServiceError};
use accession_flow::lifecycle::{
    CloseOptions, OpenOptions, VersionLifecycleController, VersionPhase,
};
use accession_flow::steps::{StatusUpdate, StepKey, StepStatus, StepStore, VersionKey};
use accession_flow::workflows::{ACCESSION_WORKFLOW, ASSEMBLY_WORKFLOW, VERSIONING_WORKFLOW};
use fixtures::{Stack, OBJECT};

fn described() -> CloseOptions {
    CloseOptions::default().metadata(VersionMetadata::new("Fixed title typo", "minor").by("jdoe"))
}

#[tokio::test]
async fn test_open_never_accessioned_object_fails() {
    let stack = Stack::new();
    stack.objects.register(OBJECT).await;

    let err = stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::NotAccessioned { .. }));

    let state = stack.controller.current_state(OBJECT).await.unwrap();
    assert_eq!(state.phase(), VersionPhase::Unaccessioned);
}

#[tokio::test]
async fn test_assume_accessioned_opens_first_version() {
    let stack = Stack::new();
    stack.objects.register(OBJECT).await;

    let metadata = VersionMetadata::new("Migrated record", "major");
    let version = stack
        .controller
        .open(
            OBJECT,
            OpenOptions::default()
                .assume_accessioned()
                .metadata(metadata.clone()),
        )
        .await
        .unwrap();
    assert_eq!(version, 2);

    let events = stack.objects.events(OBJECT).await;
    assert_eq!(events, vec![VersionEvent::Opened { version: 2, metadata }]);
}

#[tokio::test]
async fn test_full_version_cycle() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;
    assert_eq!(
        stack.controller.current_state(OBJECT).await.unwrap().phase(),
        VersionPhase::Accessioned
    );

    let version = stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap();
    assert_eq!(version, 2);
    assert_eq!(
        stack.controller.current_state(OBJECT).await.unwrap().phase(),
        VersionPhase::Open
    );

    let closed = stack.controller.close(OBJECT, described()).await.unwrap();
    assert_eq!(closed, 2);
    assert_eq!(
        stack.controller.current_state(OBJECT).await.unwrap().phase(),
        VersionPhase::Accessioning
    );

    let submit = stack
        .store
        .find(&StepKey::new(OBJECT, VERSIONING_WORKFLOW, 2, "submit-version"))
        .await
        .unwrap();
    assert_eq!(submit.status, StepStatus::Completed);

    let start = stack
        .store
        .find(&StepKey::new(OBJECT, ACCESSION_WORKFLOW, 2, "start-accession"))
        .await
        .unwrap();
    assert_eq!(start.status, StepStatus::Queued);
    assert!(start.active_version);

    stack.finish_accessioning(OBJECT, 2).await;
    assert_eq!(
        stack.controller.current_state(OBJECT).await.unwrap().phase(),
        VersionPhase::Accessioned
    );

    let notified = stack.indexer.notified().await;
    assert_eq!(
        notified,
        vec![
            StepKey::new(OBJECT, ACCESSION_WORKFLOW, 1, "end-accession"),
            StepKey::new(OBJECT, ACCESSION_WORKFLOW, 2, "end-accession"),
        ]
    );

    let events = stack.objects.events(OBJECT).await;
    assert!(matches!(events.as_slice(), [VersionEvent::Closed { version: 2, .. }]));

    let lifecycles: Vec<(String, u32)> = stack
        .service
        .lifecycle_milestones(OBJECT)
        .await
        .unwrap()
        .into_iter()
        .map(|m| (m.lifecycle, m.version))
        .collect();
    assert!(lifecycles.contains(&("opened".to_string(), 2)));
    assert!(lifecycles.contains(&("accessioned".to_string(), 1)));
    assert!(lifecycles.contains(&("accessioned".to_string(), 2)));
}

#[tokio::test]
async fn test_open_twice_fails_already_open() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;
    stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap();

    let err = stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::AlreadyOpen { version: 2, .. }));
}

#[tokio::test]
async fn test_open_while_accessioning_fails() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;
    stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap();
    stack.controller.close(OBJECT, described()).await.unwrap();

    let err = stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Precondition {
            failure: PreconditionFailure::AccessioningInProgress { version: 2 },
            ..
        }
    ));
}

#[tokio::test]
async fn test_close_without_description_leaves_accessioning_untouched() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;
    stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap();

    let err = stack
        .controller
        .close(OBJECT, CloseOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Precondition {
            failure: PreconditionFailure::MissingDescription { version: 2 },
            ..
        }
    ));

    let significance_only = CloseOptions::default().metadata(VersionMetadata {
        description: Some("New scans".to_string()),
        significance: None,
        user: None,
    });
    let err = stack
        .controller
        .close(OBJECT, significance_only)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Precondition {
            failure: PreconditionFailure::MissingSignificance { version: 2 },
            ..
        }
    ));

    let accession = stack
        .store
        .steps_for(&VersionKey::new(OBJECT, ACCESSION_WORKFLOW, 2))
        .await
        .unwrap();
    assert!(accession.is_empty());
    assert_eq!(
        stack.controller.current_state(OBJECT).await.unwrap().phase(),
        VersionPhase::Open
    );
}

#[tokio::test]
async fn test_close_uses_recorded_metadata() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;
    stack
        .controller
        .open(
            OBJECT,
            OpenOptions::default().metadata(VersionMetadata::new("Added OCR", "minor")),
        )
        .await
        .unwrap();

    stack
        .controller
        .close(OBJECT, CloseOptions::default())
        .await
        .unwrap();
    let events = stack.objects.events(OBJECT).await;
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        VersionEvent::Closed { version: 2, metadata } if metadata.description.as_deref() == Some("Added OCR")
    ));
}

#[tokio::test]
async fn test_close_requires_open_version() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;

    let err = stack.controller.close(OBJECT, described()).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Precondition {
            failure: PreconditionFailure::NotOpen { version: 1 },
            ..
        }
    ));
}

#[tokio::test]
async fn test_close_refuses_existing_accessioning() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;
    stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap();
    stack
        .service
        .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 2, None)
        .await
        .unwrap();

    let err = stack.controller.close(OBJECT, described()).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Precondition {
            failure: PreconditionFailure::AccessioningAlreadyExists { version: 2 },
            ..
        }
    ));
    let submit = stack
        .store
        .find(&StepKey::new(OBJECT, VERSIONING_WORKFLOW, 2, "submit-version"))
        .await
        .unwrap();
    assert_ne!(submit.status, StepStatus::Completed);
    assert!(stack.objects.events(OBJECT).await.is_empty());
}

#[tokio::test]
async fn test_close_is_recorded_when_accessioning_cannot_be_enqueued() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;
    stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap();
    stack.queue.fail_queue("accessionWF_default").await;

    let start = StepKey::new(OBJECT, ACCESSION_WORKFLOW, 2, "start-accession");
    let err = stack.controller.close(OBJECT, described()).await.unwrap_err();
    match &err {
        LifecycleError::StrandedDispatch {
            version: 2, source, ..
        } => {
            assert_eq!(source.stranded_steps(), vec![&start]);
        }
        other => panic!("unexpected error: {other}"),
    }

    let events = stack.objects.events(OBJECT).await;
    assert!(matches!(events.as_slice(), [VersionEvent::Closed { version: 2, .. }]));
    assert_eq!(
        stack.controller.current_state(OBJECT).await.unwrap().phase(),
        VersionPhase::Accessioning
    );
    assert_eq!(stack.store.find(&start).await.unwrap().status, StepStatus::Queued);

    // Recovery re-enqueues; closing again is refused.
    stack.queue.recover_queue("accessionWF_default").await;
    let job = stack.service.redispatch(&start).await.unwrap();
    assert_eq!(job.job.process, "start-accession");
    assert!(stack.controller.close(OBJECT, described()).await.is_err());
    assert_eq!(stack.objects.events(OBJECT).await.len(), 1);
}

#[tokio::test]
async fn test_interrupted_close_can_be_retried() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;
    stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap();
    // Submitted, but the accessioning workflow was never created.
    stack
        .service
        .update_status(StatusUpdate::completed(StepKey::new(
            OBJECT,
            VERSIONING_WORKFLOW,
            2,
            "submit-version",
        )))
        .await
        .unwrap();
    assert_eq!(
        stack.controller.current_state(OBJECT).await.unwrap().phase(),
        VersionPhase::Unaccessioned
    );

    let closed = stack.controller.close(OBJECT, described()).await.unwrap();
    assert_eq!(closed, 2);
    assert_eq!(
        stack.controller.current_state(OBJECT).await.unwrap().phase(),
        VersionPhase::Accessioning
    );
    let events = stack.objects.events(OBJECT).await;
    assert!(matches!(events.as_slice(), [VersionEvent::Closed { version: 2, .. }]));
}

#[tokio::test]
async fn test_close_waits_for_assembly() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;
    stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap();
    stack
        .service
        .instantiate_workflow(OBJECT, ASSEMBLY_WORKFLOW, 2, None)
        .await
        .unwrap();

    let err = stack.controller.close(OBJECT, described()).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Precondition {
            failure: PreconditionFailure::AssemblyIncomplete { version: 2 },
            ..
        }
    ));
}

#[tokio::test]
async fn test_accessioned_is_monotonic() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;
    let terminal = StepKey::new(OBJECT, ACCESSION_WORKFLOW, 1, "end-accession");

    let err = stack
        .service
        .update_status(StatusUpdate::new(terminal.clone(), StepStatus::Waiting))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AccessionedImmutable(_)));
    let err = stack
        .service
        .update_error(&terminal, "replayed failure", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AccessionedImmutable(_)));

    stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap();
    stack.controller.close(OBJECT, described()).await.unwrap();

    let v1 = stack.service.version_state(OBJECT, 1).await.unwrap();
    assert_eq!(v1.phase(), VersionPhase::Accessioned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opens_yield_one_version() {
    let stack = Arc::new(Stack::new());
    stack.register_accessioned(OBJECT).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let stack = Arc::clone(&stack);
        handles.push(tokio::spawn(async move {
            stack.controller.open(OBJECT, OpenOptions::default()).await
        }));
    }

    let mut opened = Vec::new();
    let mut already_open = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(version) => opened.push(version),
            Err(LifecycleError::AlreadyOpen { .. }) => already_open += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(opened, vec![2]);
    assert_eq!(already_open, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_open_and_close_one_succeeds() {
    let stack = Arc::new(Stack::new());
    stack.register_accessioned(OBJECT).await;
    stack
        .controller
        .open(OBJECT, OpenOptions::default())
        .await
        .unwrap();

    let opener = {
        let stack = Arc::clone(&stack);
        tokio::spawn(async move { stack.controller.open(OBJECT, OpenOptions::default()).await })
    };
    let closer = {
        let stack = Arc::clone(&stack);
        tokio::spawn(async move { stack.controller.close(OBJECT, described()).await })
    };

    let opened = opener.await.unwrap();
    let closed = closer.await.unwrap();
    assert!(opened.is_err());
    assert_eq!(closed.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_controllers_open_one_version() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;

    // Each controller has its own lock map, as separate service instances
    // sharing one store would.
    let mut handles = Vec::new();
    for _ in 0..6 {
        let controller = VersionLifecycleController::new(
            stack.service.clone(),
            stack.objects.clone(),
            stack.preservation.clone(),
        );
        handles.push(tokio::spawn(async move {
            controller.open(OBJECT, OpenOptions::default()).await
        }));
    }

    let mut opened = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(version) => opened.push(version),
            Err(LifecycleError::AlreadyOpen { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(opened, vec![2]);
    assert_eq!(stack.objects.current_version(OBJECT).await.unwrap(), 2);
    let v3 = stack
        .store
        .steps_for(&VersionKey::new(OBJECT, VERSIONING_WORKFLOW, 3))
        .await
        .unwrap();
    assert!(v3.is_empty());
}
