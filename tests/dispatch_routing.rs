// Routing of a full accessioning run and recovery from enqueue failures.

mod fixtures;

use std::collections::HashMap;

use accession_flow::dispatch::QueueAddress;
use accession_flow::error::{ResolveError, ServiceError};
use accession_flow::steps::{StatusUpdate, StepKey, StepStatus, StepStore};
use accession_flow::workflows::ACCESSION_WORKFLOW;
use fixtures::{Stack, OBJECT};

#[tokio::test]
async fn test_accessioning_uses_configured_routes() {
    let stack = Stack::new();
    stack.register_accessioned(OBJECT).await;

    let queues: HashMap<String, QueueAddress> = stack
        .queue
        .jobs()
        .await
        .into_iter()
        .map(|(queue, job)| (job.process, queue))
        .collect();

    assert_eq!(queues["shelve"], QueueAddress::new("accessionWF_shelve"));
    assert_eq!(queues["publish"], QueueAddress::new("accessionWF_publish"));
    assert_eq!(
        queues["sdr-ingest-transfer"],
        QueueAddress::in_fabric("preservation", "preservation_ingest")
    );
    assert_eq!(queues["stage"], QueueAddress::new("accessionWF_default"));
    assert!(!queues.contains_key("sdr-ingest-received"));
}

#[tokio::test]
async fn test_lane_selects_queue() {
    let stack = Stack::new();
    stack.objects.register(OBJECT).await;
    stack
        .service
        .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, Some("low"))
        .await
        .unwrap();

    let jobs = stack.queue.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].0, QueueAddress::new("accessionWF_low"));
    assert_eq!(jobs[0].1.lane, "low");
}

#[tokio::test]
async fn test_failed_enqueue_is_surfaced_then_redispatched() {
    let stack = Stack::new();
    stack.objects.register(OBJECT).await;
    stack
        .service
        .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
        .await
        .unwrap();
    stack.queue.fail_queue("accessionWF_default").await;

    let start = StepKey::new(OBJECT, ACCESSION_WORKFLOW, 1, "start-accession");
    let err = stack
        .service
        .update_status(StatusUpdate::completed(start))
        .await
        .unwrap_err();
    let stranded: Vec<StepKey> = match &err {
        ServiceError::Resolve(ResolveError::Dispatch(e)) => {
            e.stranded_steps().into_iter().cloned().collect()
        }
        other => panic!("unexpected error: {other}"),
    };
    let stage = StepKey::new(OBJECT, ACCESSION_WORKFLOW, 1, "stage");
    assert_eq!(stranded, vec![stage.clone()]);
    assert_eq!(stack.store.find(&stage).await.unwrap().status, StepStatus::Queued);

    stack.queue.recover_queue("accessionWF_default").await;
    let job = stack.service.redispatch(&stage).await.unwrap();
    assert_eq!(job.queue, QueueAddress::new("accessionWF_default"));
    assert_eq!(job.job.process, "stage");
}
