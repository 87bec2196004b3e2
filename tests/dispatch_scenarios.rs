//! End-to-end dispatch scenarios against in-memory backends and the
//! scripted container runtime.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use agent_hub::agents::{AgentDescriptor, Integration, ResourceLimits};
use agent_hub::config::DispatcherConfig;
use agent_hub::db::{ExecutionStore, InMemoryStore, JobStore};
use agent_hub::error::{Error, LaunchFailureKind, LockError, QueueError};
use agent_hub::jobs::{Job, JobState, Priority};
use agent_hub::observability::ObserverEvent;
use agent_hub::queue::{JobQueue, MemoryQueue};
use agent_hub::sandbox::testing::{RuntimeCall, Script, ScriptedRuntime};
use agent_hub::sandbox::{ExecutionState, ExitStatus};

use support::{IMAGE, context, fast_config, hub, hub_with, wait_terminal};

fn short_timeout(agent_id: &str, image: &str) -> AgentDescriptor {
    AgentDescriptor::new(agent_id, image).with_limits(ResourceLimits {
        timeout_secs: 1,
        ..ResourceLimits::default()
    })
}

#[tokio::test]
async fn valid_agent_succeeds_with_result() {
    let h = hub(fast_config()).await;
    h.dispatcher.start().await.unwrap();

    let job_id = h.dispatcher.submit_job("echo", context()).await.unwrap();
    let status = wait_terminal(&h.dispatcher, job_id).await;
    h.dispatcher.shutdown().await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.attempt_count, 1);
    assert_eq!(status.error, None);

    let result_ref = status.result_ref.expect("succeeded job carries a result");
    let output = h.contexts.read_result(&result_ref).await.unwrap();
    assert_eq!(output.agent_id.as_deref(), Some("echo"));
    assert_eq!(output.results.len(), 1);

    let records = h.store.list_executions(job_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, ExecutionState::ExitedOk);
    assert!(records[0].is_closed());
    assert!(records[0].stdout_ref.is_some());
}

#[tokio::test]
async fn disallowed_integration_fails_immediately() {
    let h = hub(fast_config()).await;
    h.registry
        .register(AgentDescriptor::new("crawler", IMAGE).with_integration(Integration::HttpEgress))
        .await
        .unwrap();
    h.dispatcher.start().await.unwrap();

    let job_id = h.dispatcher.submit_job("crawler", context()).await.unwrap();
    let status = wait_terminal(&h.dispatcher, job_id).await;
    h.dispatcher.shutdown().await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt_count, 1);
    let error = status.error.unwrap();
    assert!(error.starts_with("PolicyViolation"), "{error}");
    assert!(error.contains("http_egress"), "{error}");
    assert!(h.runtime.specs().await.is_empty());
    assert!(h.events.events().iter().any(|e| matches!(
        e,
        ObserverEvent::PolicyDenied { rule, .. } if rule == "integration_not_allowed"
    )));
}

#[tokio::test]
async fn timeout_is_killed_and_fails_after_retries() {
    let config = DispatcherConfig {
        max_attempts: 2,
        ..fast_config()
    };
    let h = hub(config).await;
    h.registry
        .register(short_timeout("slow", "slow:latest"))
        .await
        .unwrap();
    h.runtime.set_default_script(Script::Hang).await;
    h.dispatcher.start().await.unwrap();

    let job_id = h.dispatcher.submit_job("slow", context()).await.unwrap();
    let status = wait_terminal(&h.dispatcher, job_id).await;
    h.dispatcher.shutdown().await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt_count, 2);
    assert!(status.error.unwrap().starts_with("TimedOut"));

    let kills = h
        .runtime
        .calls()
        .await
        .into_iter()
        .filter(|c| matches!(c, RuntimeCall::Kill(_)))
        .count();
    assert!(kills >= 2, "each timed out attempt is force-killed");
    assert_eq!(h.runtime.live_count().await, 0);

    let records = h.store.list_executions(job_id).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(
        records
            .iter()
            .all(|r| r.exit_status == Some(ExitStatus::TimedOut))
    );
}

#[tokio::test]
async fn second_container_waits_for_first_cleanup() {
    let config = DispatcherConfig {
        max_concurrent_executions: 1,
        ..fast_config()
    };
    let h = hub(config).await;
    h.registry
        .register(AgentDescriptor::new("first", "first:latest"))
        .await
        .unwrap();
    h.registry
        .register(AgentDescriptor::new("second", "second:latest"))
        .await
        .unwrap();
    h.runtime
        .push_script("first:latest", Script::success_after(Duration::from_millis(200)))
        .await;
    h.runtime
        .push_script("second:latest", Script::success_after(Duration::from_millis(200)))
        .await;
    h.dispatcher.start().await.unwrap();

    let d = h.dispatcher.submit_job("first", context()).await.unwrap();
    let e = h.dispatcher.submit_job("second", context()).await.unwrap();
    assert_eq!(wait_terminal(&h.dispatcher, d).await.state, JobState::Succeeded);
    assert_eq!(wait_terminal(&h.dispatcher, e).await.state, JobState::Succeeded);
    h.dispatcher.shutdown().await;

    let calls = h.runtime.calls().await;
    let creates: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, RuntimeCall::Create { .. }))
        .map(|(i, _)| i)
        .collect();
    let first_remove = calls
        .iter()
        .position(|c| matches!(c, RuntimeCall::Remove(_)))
        .unwrap();
    assert_eq!(creates.len(), 2);
    assert!(
        first_remove < creates[1],
        "second container started before the first was removed: {calls:?}"
    );
}

#[tokio::test]
async fn executions_of_one_job_never_overlap() {
    let h = hub(fast_config()).await;
    h.runtime.push_script(IMAGE, Script::crash(2)).await;
    h.runtime.push_script(IMAGE, Script::crash(2)).await;
    h.dispatcher.start().await.unwrap();

    let job_id = h.dispatcher.submit_job("echo", context()).await.unwrap();
    let status = wait_terminal(&h.dispatcher, job_id).await;
    h.dispatcher.shutdown().await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.attempt_count, 3);

    let mut records = h.store.list_executions(job_id).await.unwrap();
    records.sort_by_key(|r| r.attempt);
    assert_eq!(
        records.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    for pair in records.windows(2) {
        let ended = pair[0].ended_at.expect("earlier attempt is finished");
        assert!(ended <= pair[1].started_at);
    }
}

#[tokio::test]
async fn exhausted_retries_always_fail() {
    let h = hub(fast_config()).await;
    h.runtime.set_default_script(Script::crash(1)).await;
    h.dispatcher.start().await.unwrap();

    let job_id = h.dispatcher.submit_job("echo", context()).await.unwrap();
    let status = wait_terminal(&h.dispatcher, job_id).await;
    h.dispatcher.shutdown().await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt_count, 3);
    assert_eq!(
        status.error.as_deref(),
        Some("RuntimeCrash: agent exited with code 1")
    );
}

#[tokio::test]
async fn invalid_result_consumes_one_attempt() {
    let h = hub(fast_config()).await;
    h.runtime
        .push_script(IMAGE, Script::bad_result("{ not json"))
        .await;
    h.dispatcher.start().await.unwrap();

    let job_id = h.dispatcher.submit_job("echo", context()).await.unwrap();
    let status = wait_terminal(&h.dispatcher, job_id).await;
    h.dispatcher.shutdown().await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt_count, 1);
    assert!(status.error.unwrap().starts_with("ResultInvalid"));
}

#[tokio::test]
async fn every_launch_is_cleaned_up_once() {
    let h = hub(fast_config()).await;
    h.registry
        .register(short_timeout("slow", "slow:latest"))
        .await
        .unwrap();
    h.runtime.push_script(IMAGE, Script::crash(3)).await;
    h.runtime
        .push_script(IMAGE, Script::bad_result(r#"{"results": "nope"}"#))
        .await;
    h.runtime.push_script("slow:latest", Script::Hang).await;
    h.runtime
        .push_script(
            "slow:latest",
            Script::FailLaunch(LaunchFailureKind::InvalidSpec),
        )
        .await;
    h.dispatcher.start().await.unwrap();

    let jobs = [
        h.dispatcher.submit_job("echo", context()).await.unwrap(),
        h.dispatcher.submit_job("echo", context()).await.unwrap(),
        h.dispatcher.submit_job("slow", context()).await.unwrap(),
    ];
    for job_id in jobs {
        wait_terminal(&h.dispatcher, job_id).await;
    }
    h.dispatcher.shutdown().await;

    let calls = h.runtime.calls().await;
    let created = calls
        .iter()
        .filter(|c| matches!(c, RuntimeCall::Create { .. }))
        .count();
    let mut removed: HashMap<String, usize> = HashMap::new();
    for call in &calls {
        if let RuntimeCall::Remove(id) = call {
            *removed.entry(id.clone()).or_default() += 1;
        }
    }
    assert_eq!(removed.len(), created);
    assert!(removed.values().all(|&n| n == 1));
    assert_eq!(h.runtime.live_count().await, 0);
    assert_eq!(h.dispatcher.containers().active_containers().await, 0);
    assert_eq!(h.dispatcher.containers().available_slots(), 4);

    for job_id in jobs {
        for record in h.store.list_executions(job_id).await.unwrap() {
            assert!(record.is_closed(), "record {} left open", record.execution_id);
        }
    }
}

#[tokio::test]
async fn fatal_launch_error_is_not_retried() {
    let h = hub(fast_config()).await;
    h.runtime
        .push_script(IMAGE, Script::FailLaunch(LaunchFailureKind::InvalidSpec))
        .await;
    h.dispatcher.start().await.unwrap();

    let job_id = h.dispatcher.submit_job("echo", context()).await.unwrap();
    let status = wait_terminal(&h.dispatcher, job_id).await;
    h.dispatcher.shutdown().await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt_count, 1);
    assert!(status.error.unwrap().starts_with("LaunchError"));
}

#[tokio::test]
async fn resource_exhaustion_is_retried() {
    let h = hub(fast_config()).await;
    h.runtime
        .push_script(
            IMAGE,
            Script::FailLaunch(LaunchFailureKind::ResourceExhausted),
        )
        .await;
    h.dispatcher.start().await.unwrap();

    let job_id = h.dispatcher.submit_job("echo", context()).await.unwrap();
    let status = wait_terminal(&h.dispatcher, job_id).await;
    h.dispatcher.shutdown().await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.attempt_count, 2);
}

#[tokio::test]
async fn high_priority_drains_first() {
    let config = DispatcherConfig {
        workers: 1,
        max_concurrent_executions: 1,
        ..fast_config()
    };
    let h = hub(config).await;
    h.registry
        .register(AgentDescriptor::new("low", "low:latest"))
        .await
        .unwrap();
    h.registry
        .register(AgentDescriptor::new("high", "high:latest"))
        .await
        .unwrap();

    h.dispatcher
        .submit_job_with_priority("low", context(), Priority::Low)
        .await
        .unwrap();
    let urgent = h
        .dispatcher
        .submit_job_with_priority("high", context(), Priority::High)
        .await
        .unwrap();
    h.dispatcher.start().await.unwrap();
    wait_terminal(&h.dispatcher, urgent).await;
    h.dispatcher.shutdown().await;

    let first = h
        .runtime
        .calls()
        .await
        .into_iter()
        .find_map(|c| match c {
            RuntimeCall::Create { image, .. } => Some(image),
            _ => None,
        });
    assert_eq!(first.as_deref(), Some("high:latest"));
}

#[tokio::test]
async fn restart_requeues_stuck_job_once_and_finishes_it() {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    let runtime = Arc::new(ScriptedRuntime::new());

    // A process claimed the job, then died before launching a container.
    let crashed = hub_with(
        tempfile::tempdir().unwrap(),
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&runtime),
        fast_config(),
    )
    .await;
    let job_id = crashed.dispatcher.submit_job("echo", context()).await.unwrap();
    let lease = queue.dequeue_next(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(lease.job_id, job_id);
    let mut job = store.get_job(job_id).await.unwrap().unwrap();
    job.transition_to(JobState::Running).unwrap();
    job.attempt_count = 1;
    assert!(store.update_job(&job, JobState::Queued).await.unwrap());
    let dir = crashed.dir;

    let h = hub_with(dir, store, queue, runtime, fast_config()).await;
    let report = h.dispatcher.recover().await.unwrap();
    assert_eq!(report.jobs_requeued, 1);
    let again = h.dispatcher.recover().await.unwrap();
    assert_eq!(again.jobs_requeued, 0);

    h.dispatcher.start().await.unwrap();
    let status = wait_terminal(&h.dispatcher, job_id).await;
    h.dispatcher.shutdown().await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.attempt_count, 2);
    let recovered = h
        .events
        .events()
        .iter()
        .filter(|e| matches!(e, ObserverEvent::JobRecovered { .. }))
        .count();
    assert_eq!(recovered, 1);
}

#[tokio::test]
async fn exhausted_budget_fails_without_launch() {
    let h = hub(fast_config()).await;
    let job_id = uuid::Uuid::new_v4();
    let context_ref = h.contexts.write_context(job_id, context()).await.unwrap();
    let mut job = Job::new(job_id, "echo", context_ref, Priority::Normal);
    job.attempt_count = 3;
    h.store.insert_job(&job).await.unwrap();
    h.dispatcher.recover().await.unwrap();
    h.dispatcher.start().await.unwrap();

    let status = wait_terminal(&h.dispatcher, job_id).await;
    h.dispatcher.shutdown().await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt_count, 3);
    assert!(h.runtime.specs().await.is_empty());
}

#[tokio::test]
async fn failed_enqueue_is_repaired_by_recovery() {
    let h = hub(fast_config()).await;
    h.queue.set_available(false);
    let err = h.dispatcher.submit_job("echo", context()).await.unwrap_err();
    assert!(matches!(err, Error::Queue(QueueError::Unavailable { .. })));
    h.queue.set_available(true);

    let stranded = h.store.list_jobs(&[JobState::Queued], 10).await.unwrap();
    assert_eq!(stranded.len(), 1);
    let job_id = stranded[0].job_id;

    let report = h.dispatcher.recover().await.unwrap();
    assert_eq!(report.queued_reoffered, 1);
    h.dispatcher.start().await.unwrap();
    assert_eq!(
        wait_terminal(&h.dispatcher, job_id).await.state,
        JobState::Succeeded
    );
    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn workers_survive_a_queue_outage() {
    let config = DispatcherConfig {
        queue_backoff_base: Duration::from_millis(10),
        queue_backoff_max: Duration::from_millis(40),
        ..fast_config()
    };
    let h = hub(config).await;
    h.dispatcher.start().await.unwrap();
    h.queue.set_available(false);
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.queue.set_available(true);

    let job_id = h.dispatcher.submit_job("echo", context()).await.unwrap();
    let status = wait_terminal(&h.dispatcher, job_id).await;
    h.dispatcher.shutdown().await;

    assert_eq!(status.state, JobState::Succeeded);
    assert!(h.events.events().iter().any(|e| matches!(
        e,
        ObserverEvent::QueueUnavailable { .. }
    )));
}

fn hanging_agent() -> AgentDescriptor {
    AgentDescriptor::new("sleeper", "sleeper:latest").with_limits(ResourceLimits {
        timeout_secs: 60,
        ..ResourceLimits::default()
    })
}

async fn wait_live(runtime: &ScriptedRuntime, expected: usize) {
    for _ in 0..500 {
        if runtime.live_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expected} live containers");
}

#[tokio::test]
async fn second_dispatcher_cannot_recover_under_a_live_one() {
    let lock_dir = tempfile::tempdir().unwrap();
    let config = DispatcherConfig {
        lock_file: Some(lock_dir.path().join("dispatcher.lock")),
        ..fast_config()
    };
    let owner = hub(config.clone()).await;
    owner.registry.register(hanging_agent()).await.unwrap();
    owner.runtime.set_default_script(Script::Hang).await;
    owner.dispatcher.start().await.unwrap();
    let job_id = owner.dispatcher.submit_job("sleeper", context()).await.unwrap();
    wait_live(&owner.runtime, 1).await;

    let other = hub_with(
        tempfile::tempdir().unwrap(),
        Arc::clone(&owner.store),
        Arc::clone(&owner.queue),
        Arc::clone(&owner.runtime),
        config,
    )
    .await;
    let err = other.dispatcher.recover().await.unwrap_err();
    assert!(matches!(err, Error::Lock(LockError::Held { .. })));
    assert!(matches!(
        other.dispatcher.start().await,
        Err(Error::Lock(LockError::Held { .. }))
    ));

    // The running job and its container are left alone.
    assert_eq!(owner.runtime.live_count().await, 1);
    let status = owner.dispatcher.get_job_status(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Running);
    assert_eq!(status.attempt_count, 1);
    assert_eq!(owner.queue.depth().await.unwrap(), 1);

    owner.dispatcher.cancel_job(job_id).await.unwrap();
    let status = wait_terminal(&owner.dispatcher, job_id).await;
    owner.dispatcher.shutdown().await;
    assert_eq!(status.state, JobState::Cancelled);

    // With the owner gone the lock is free and nothing is left to repair.
    let report = other.dispatcher.recover().await.unwrap();
    assert_eq!(report.jobs_requeued, 0);
    assert_eq!(report.orphans_reaped, 0);
    assert_eq!(owner.queue.depth().await.unwrap(), 0);
    assert_eq!(owner.runtime.live_count().await, 0);
}

#[tokio::test]
async fn cancel_from_another_process_stops_the_container() {
    let owner = hub(fast_config()).await;
    owner.registry.register(hanging_agent()).await.unwrap();
    owner.runtime.set_default_script(Script::Hang).await;
    owner.dispatcher.start().await.unwrap();
    let job_id = owner.dispatcher.submit_job("sleeper", context()).await.unwrap();
    wait_live(&owner.runtime, 1).await;

    let other = hub_with(
        tempfile::tempdir().unwrap(),
        Arc::clone(&owner.store),
        Arc::clone(&owner.queue),
        Arc::clone(&owner.runtime),
        fast_config(),
    )
    .await;
    let status = other.dispatcher.cancel_job(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Cancelled);

    wait_live(&owner.runtime, 0).await;
    for _ in 0..500 {
        if owner.dispatcher.containers().active_containers().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    owner.dispatcher.shutdown().await;

    assert_eq!(owner.dispatcher.containers().active_containers().await, 0);
    let calls = owner.runtime.calls().await;
    assert!(calls.iter().any(|c| matches!(c, RuntimeCall::Kill(_))));
    assert_eq!(owner.queue.depth().await.unwrap(), 0);
    let status = owner.dispatcher.get_job_status(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Cancelled);
    assert_eq!(status.attempt_count, 1);
    let records = owner.store.list_executions(job_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].exit_status, Some(ExitStatus::Cancelled));
}
