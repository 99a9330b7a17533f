mod common;

use std::time::Duration;

use common::{engine_over, request, run_spec, FlakyQueue, FlakyRepository};
use runway_engine::{
    lock::LockConfig,
    model::{ParentRun, RunStatus, WaitpointKind, WaitpointStatus},
    payload::IoPacket,
    repository::RunRepository,
    waitpoints::CreateWaitpointOptions,
    EngineError,
};
use runway_id::EnvId;

fn short_lease() -> LockConfig {
    LockConfig {
        lease_duration: Duration::from_millis(50),
        acquire_timeout: Duration::from_millis(200),
        retry_interval: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn dequeue_survives_a_write_slower_than_the_lease() {
    let repository = FlakyRepository::new();
    let queue = FlakyQueue::new();
    let engine = engine_over(&repository, &queue, short_lease());
    let env = EnvId::new();
    let run = engine.trigger(run_spec(env, None)).await.unwrap();

    repository.delay_updates(Duration::from_millis(200));
    let leased = engine.dequeue_from_master_queue(&request(1, None)).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].run_id, run.id);

    let stored = repository.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Dequeued);
    assert_eq!(
        stored.lease.map(|lease| lease.lease_id),
        Some(leased[0].lease.lease_id)
    );
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 0);
}

#[tokio::test]
async fn lease_running_out_before_admission_leaves_the_run_queued() {
    let repository = FlakyRepository::new();
    let queue = FlakyQueue::new();
    let engine = engine_over(&repository, &queue, short_lease());
    let env = EnvId::new();
    let run = engine.trigger(run_spec(env, None)).await.unwrap();

    repository.delay_reads(Duration::from_millis(100));
    let leased = engine.dequeue_from_master_queue(&request(1, None)).await.unwrap();
    assert!(leased.is_empty());
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 1);
    let stored = repository.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Pending);

    repository.delay_reads(Duration::ZERO);
    let leased = engine.dequeue_from_master_queue(&request(1, None)).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].run_id, run.id);
}

#[tokio::test]
async fn failed_lease_write_puts_the_run_back() {
    let repository = FlakyRepository::new();
    let queue = FlakyQueue::new();
    let engine = engine_over(&repository, &queue, LockConfig::default());
    let env = EnvId::new();
    let run = engine.trigger(run_spec(env, None)).await.unwrap();

    repository.fail_updates(true);
    let err = engine
        .dequeue_from_master_queue(&request(1, None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Repository(_)));
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 1);
    assert_eq!(
        repository.get_run(&run.id).await.unwrap().unwrap().status,
        RunStatus::Pending
    );

    repository.fail_updates(false);
    let leased = engine.dequeue_from_master_queue(&request(1, None)).await.unwrap();
    assert_eq!(leased[0].run_id, run.id);
}

#[tokio::test]
async fn failed_enqueue_rolls_back_the_trigger() {
    let repository = FlakyRepository::new();
    let queue = FlakyQueue::new();
    let engine = engine_over(&repository, &queue, LockConfig::default());
    let env = EnvId::new();
    let spec = run_spec(env, None);

    queue.fail_enqueue(true);
    let err = engine.trigger(spec.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::Queue(_)));
    assert!(repository
        .find_run(&env, &spec.friendly_id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 0);

    queue.fail_enqueue(false);
    let run = engine.trigger(spec).await.unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 1);
}

#[tokio::test]
async fn failed_block_restores_queue_and_binding() {
    let repository = FlakyRepository::new();
    let queue = FlakyQueue::new();
    let engine = engine_over(&repository, &queue, LockConfig::default());
    let env = EnvId::new();
    let run = engine.trigger(run_spec(env, None)).await.unwrap();
    let token = engine
        .create_waitpoint(&env, WaitpointKind::ManualToken, CreateWaitpointOptions::default())
        .await
        .unwrap()
        .waitpoint;

    repository.fail_updates(true);
    assert!(engine.block_run_on(&env, &run.id, &token.id).await.is_err());
    repository.fail_updates(false);

    let stored = repository.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Pending);
    assert_eq!(stored.blocking_waitpoint, None);
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 1);
    assert!(repository.blocked_runs(&token.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_resume_is_retried_by_the_stranded_sweep() {
    let repository = FlakyRepository::new();
    let queue = FlakyQueue::new();
    let engine = engine_over(&repository, &queue, LockConfig::default());
    let env = EnvId::new();
    let run = engine.trigger(run_spec(env, None)).await.unwrap();
    let token = engine
        .create_waitpoint(&env, WaitpointKind::ManualToken, CreateWaitpointOptions::default())
        .await
        .unwrap()
        .waitpoint;
    engine.block_run_on(&env, &run.id, &token.id).await.unwrap();

    queue.fail_enqueue(true);
    let err = engine
        .complete_waitpoint(&env, &token.id, None)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    queue.fail_enqueue(false);

    let stored = repository.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Blocked);
    assert_eq!(stored.blocking_waitpoint, Some(token.id));
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 0);
    assert_eq!(
        engine.get_waitpoint(&env, &token.id).await.unwrap().status,
        WaitpointStatus::Completed
    );

    let resumed = engine.waitpoints().resume_stranded_runs(10).await.unwrap();
    assert_eq!(resumed, 1);
    let stored = repository.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Pending);
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 1);
    assert!(repository.blocked_runs(&token.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn parent_left_blocked_by_a_failed_resume_is_recovered() {
    let repository = FlakyRepository::new();
    let queue = FlakyQueue::new();
    let engine = engine_over(&repository, &queue, LockConfig::default());
    let env = EnvId::new();

    let parent = engine.trigger(run_spec(env, None)).await.unwrap();
    let leased = engine.dequeue_from_master_queue(&request(1, None)).await.unwrap();
    assert_eq!(leased[0].run_id, parent.id);

    let mut child_spec = run_spec(env, None);
    child_spec.parent = Some(ParentRun {
        run_id: parent.id,
        resume_on_completion: true,
    });
    let child = engine.trigger(child_spec).await.unwrap();
    let child_lease = engine.dequeue_from_master_queue(&request(1, None)).await.unwrap();
    assert_eq!(child_lease[0].run_id, child.id);

    queue.fail_enqueue(true);
    assert!(engine
        .complete_run(
            &env,
            &child.id,
            &child_lease[0].lease.lease_id,
            IoPacket::new("{}", "application/json"),
        )
        .await
        .is_err());
    queue.fail_enqueue(false);

    assert_eq!(
        repository.get_run(&child.id).await.unwrap().unwrap().status,
        RunStatus::Completed
    );
    assert_eq!(
        repository.get_run(&parent.id).await.unwrap().unwrap().status,
        RunStatus::Blocked
    );

    assert_eq!(engine.waitpoints().resume_stranded_runs(10).await.unwrap(), 1);
    assert_eq!(
        repository.get_run(&parent.id).await.unwrap().unwrap().status,
        RunStatus::Pending
    );
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 1);
}

#[tokio::test]
async fn failed_cancel_write_keeps_the_run_queued() {
    let repository = FlakyRepository::new();
    let queue = FlakyQueue::new();
    let engine = engine_over(&repository, &queue, LockConfig::default());
    let env = EnvId::new();
    let run = engine.trigger(run_spec(env, None)).await.unwrap();

    repository.fail_updates(true);
    assert!(engine.cancel_run(&env, &run.id).await.is_err());
    repository.fail_updates(false);

    assert_eq!(
        repository.get_run(&run.id).await.unwrap().unwrap().status,
        RunStatus::Pending
    );
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 1);
}
