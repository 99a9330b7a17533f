mod common;

use bytes::Bytes;
use common::{engine, offloading_engine, request, run_spec};
use runway_engine::{
    model::{Output, ParentRun, PayloadPacket, Run, RunStatus, WaitpointKind, WaitpointStatus},
    payload::{IoPacket, ObjectStore},
    waitpoints::CreateWaitpointOptions,
    EngineError,
};
use runway_id::{EnvId, WaitpointId};

fn json_output(body: &'static str) -> Output {
    Output::success(PayloadPacket::Inline {
        data: Bytes::from_static(body.as_bytes()),
        data_type: "application/json".to_string(),
    })
}

#[tokio::test]
async fn completing_twice_keeps_the_first_output() {
    let engine = engine();
    let env = EnvId::new();
    let token = engine
        .create_waitpoint(&env, WaitpointKind::ManualToken, CreateWaitpointOptions::default())
        .await
        .unwrap()
        .waitpoint;

    let first = engine
        .complete_waitpoint(&env, &token.id, Some(json_output("{\"ok\":true}")))
        .await
        .unwrap();
    let second = engine
        .complete_waitpoint(&env, &token.id, Some(json_output("{\"ok\":true}")))
        .await
        .unwrap();

    assert!(!first.already_completed);
    assert!(second.already_completed);
    assert_eq!(first.waitpoint.output, second.waitpoint.output);
    assert_eq!(first.waitpoint.completed_at, second.waitpoint.completed_at);
}

#[tokio::test]
async fn blocked_run_is_not_dequeued_until_completion() {
    let engine = engine();
    let env = EnvId::new();
    let run = engine.trigger(run_spec(env, None)).await.unwrap();
    let token = engine
        .create_waitpoint(&env, WaitpointKind::ManualToken, CreateWaitpointOptions::default())
        .await
        .unwrap()
        .waitpoint;

    let blocked = engine.block_run_on(&env, &run.id, &token.id).await.unwrap();
    assert_eq!(blocked.status, RunStatus::Blocked);
    assert!(engine
        .dequeue_from_master_queue(&request(10, None))
        .await
        .unwrap()
        .is_empty());

    let completion = engine
        .complete_waitpoint(&env, &token.id, None)
        .await
        .unwrap();
    assert_eq!(completion.resumed_runs, vec![run.id]);

    let leased = engine.dequeue_from_master_queue(&request(10, None)).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].run_id, run.id);
}

#[tokio::test]
async fn one_completion_resumes_every_bound_run() {
    let engine = engine();
    let env = EnvId::new();
    let token = engine
        .create_waitpoint(&env, WaitpointKind::ManualToken, CreateWaitpointOptions::default())
        .await
        .unwrap()
        .waitpoint;

    let mut blocked = Vec::new();
    for _ in 0..3 {
        let run = engine.trigger(run_spec(env, None)).await.unwrap();
        engine.block_run_on(&env, &run.id, &token.id).await.unwrap();
        blocked.push(run.id);
    }
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 0);

    let mut resumed = engine
        .complete_waitpoint(&env, &token.id, None)
        .await
        .unwrap()
        .resumed_runs;
    resumed.sort();
    blocked.sort();
    assert_eq!(resumed, blocked);
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 3);
}

#[tokio::test]
async fn cross_environment_completion_is_not_found() {
    let engine = engine();
    let owner = EnvId::new();
    let intruder = EnvId::new();
    let token = engine
        .create_waitpoint(&owner, WaitpointKind::ManualToken, CreateWaitpointOptions::default())
        .await
        .unwrap()
        .waitpoint;

    let err = engine
        .complete_waitpoint(&intruder, &token.id, Some(json_output("1")))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { kind: "waitpoint", .. }));

    let err = engine
        .complete_waitpoint_token(&intruder, &token.id, IoPacket::new("1", "application/json"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let stored = engine.get_waitpoint(&owner, &token.id).await.unwrap();
    assert_eq!(stored.status, WaitpointStatus::Pending);
}

#[tokio::test]
async fn token_completion_exports_the_data() {
    let engine = engine();
    let env = EnvId::new();
    let token = engine
        .create_waitpoint(&env, WaitpointKind::ManualToken, CreateWaitpointOptions::default())
        .await
        .unwrap()
        .waitpoint;

    let data = IoPacket::from_json(Some(&serde_json::json!({ "approved": true }))).unwrap();
    let completion = engine
        .complete_waitpoint_token(&env, &token.id, data)
        .await
        .unwrap();

    let output = completion.waitpoint.output.unwrap();
    assert!(!output.is_error);
    assert_eq!(
        output.packet,
        PayloadPacket::Inline {
            data: Bytes::from_static(b"{\"approved\":true}"),
            data_type: "application/json".to_string(),
        }
    );
}

#[tokio::test]
async fn duplicate_token_completion_keeps_the_offloaded_output() {
    let (engine, store) = offloading_engine(4);
    let env = EnvId::new();
    let token = engine
        .create_waitpoint(&env, WaitpointKind::ManualToken, CreateWaitpointOptions::default())
        .await
        .unwrap()
        .waitpoint;

    let first = engine
        .complete_waitpoint_token(
            &env,
            &token.id,
            IoPacket::new("\"first-value\"", "application/json"),
        )
        .await
        .unwrap();
    assert!(!first.already_completed);
    let Some(PayloadPacket::Reference { storage_key, .. }) =
        first.waitpoint.output.map(|output| output.packet)
    else {
        panic!("large token data should be offloaded");
    };

    let second = engine
        .complete_waitpoint_token(
            &env,
            &token.id,
            IoPacket::new("\"SECOND-value\"", "application/json"),
        )
        .await
        .unwrap();
    assert!(second.already_completed);
    assert_eq!(
        second.waitpoint.output.map(|output| output.packet),
        Some(PayloadPacket::Reference {
            storage_key: storage_key.clone(),
            data_type: "application/json".to_string(),
        })
    );

    let stored = store.get(&storage_key).await.unwrap();
    assert_eq!(stored, Some(Bytes::from_static(b"\"first-value\"")));
    assert_eq!(store.len().await, 1);
}

async fn leased_parent_with_child(
    engine: &runway_engine::RunEngine,
    env: EnvId,
) -> (Run, Run, WaitpointId) {
    let parent = engine.trigger(run_spec(env, None)).await.unwrap();
    let parent_lease = engine.dequeue_from_master_queue(&request(1, None)).await.unwrap();
    assert_eq!(parent_lease[0].run_id, parent.id);

    let mut child_spec = run_spec(env, None);
    child_spec.parent = Some(ParentRun {
        run_id: parent.id,
        resume_on_completion: true,
    });
    let child = engine.trigger(child_spec).await.unwrap();

    let blocked = engine.get_run(&env, &parent.id).await.unwrap();
    assert_eq!(blocked.status, RunStatus::Blocked);
    let waitpoint_id = blocked.blocking_waitpoint.unwrap();
    (parent, child, waitpoint_id)
}

#[tokio::test]
async fn parent_resumes_when_child_completes() {
    let engine = engine();
    let env = EnvId::new();
    let (parent, child, waitpoint_id) = leased_parent_with_child(&engine, env).await;

    let child_lease = engine.dequeue_from_master_queue(&request(1, None)).await.unwrap();
    assert_eq!(child_lease[0].run_id, child.id);

    engine
        .complete_run(
            &env,
            &child.id,
            &child_lease[0].lease.lease_id,
            IoPacket::new("{\"rows\":3}", "application/json"),
        )
        .await
        .unwrap();

    let parent_now = engine.get_run(&env, &parent.id).await.unwrap();
    assert_eq!(parent_now.status, RunStatus::Pending);
    assert_eq!(parent_now.blocking_waitpoint, None);
    let resumed = engine.dequeue_from_master_queue(&request(1, None)).await.unwrap();
    assert_eq!(resumed[0].run_id, parent.id);

    let waitpoint = engine.get_waitpoint(&env, &waitpoint_id).await.unwrap();
    assert_eq!(waitpoint.kind, WaitpointKind::RunCompletion);
    assert_eq!(waitpoint.completed_by_run, Some(child.id));
    assert!(!waitpoint.output.unwrap().is_error);
}

#[tokio::test]
async fn failed_child_hands_an_error_to_the_parent() {
    let engine = engine();
    let env = EnvId::new();
    let (parent, child, waitpoint_id) = leased_parent_with_child(&engine, env).await;

    let child_lease = engine.dequeue_from_master_queue(&request(1, None)).await.unwrap();
    engine
        .fail_run(
            &env,
            &child.id,
            &child_lease[0].lease.lease_id,
            IoPacket::new("{\"message\":\"boom\"}", "application/json"),
        )
        .await
        .unwrap();

    let waitpoint = engine.get_waitpoint(&env, &waitpoint_id).await.unwrap();
    assert_eq!(waitpoint.status, WaitpointStatus::Completed);
    assert!(waitpoint.output.unwrap().is_error);
    assert_eq!(
        engine.get_run(&env, &parent.id).await.unwrap().status,
        RunStatus::Pending
    );
}

#[tokio::test]
async fn cancelling_a_child_releases_the_parent() {
    let engine = engine();
    let env = EnvId::new();
    let (parent, child, waitpoint_id) = leased_parent_with_child(&engine, env).await;

    let cancelled = engine.cancel_run(&env, &child.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Failed);
    // Only the resumed parent is left in the queue.
    assert_eq!(engine.length_of_env_queue(&env).await.unwrap(), 1);

    let waitpoint = engine.get_waitpoint(&env, &waitpoint_id).await.unwrap();
    assert!(waitpoint.output.unwrap().is_error);
    assert_eq!(
        engine.get_run(&env, &parent.id).await.unwrap().status,
        RunStatus::Pending
    );
}
