//! Worker loop tests with a scripted engine.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{Script, ScriptedEngine, TestHarness};
use docqueue::db::task_repo;
use docqueue::engine::EngineRegistry;
use docqueue::task::TaskStatus;
use docqueue::worker::{PollOutcome, ShutdownSignal};

fn registry(engine: ScriptedEngine) -> EngineRegistry {
    let mut engines = EngineRegistry::new();
    engines.register(engine);
    engines
}

fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_run_loop_processes_all_outcomes_then_stops() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new("scripted")
        .on("bad.pdf", Script::Fail("corrupt input".to_string()))
        .on("boom.pdf", Script::Panic);
    let calls = engine.calls();

    let ok = harness.submit_file("ok.pdf", "x", "scripted", 0);
    let bad = harness.submit_file("bad.pdf", "x", "scripted", 0);
    let boom = harness.submit_file("boom.pdf", "x", "scripted", 0);

    let worker = harness.worker("loop-worker", registry(engine));
    let shutdown = ShutdownSignal::new();

    thread::scope(|s| {
        let signal = shutdown.clone();
        let worker = &worker;
        let runner = s.spawn(move || worker.run(&signal));

        let finished = wait_for(|| {
            [&ok, &bad, &boom]
                .iter()
                .all(|id| harness.task(id).status.is_terminal())
        });
        assert!(worker.health().running);
        shutdown.trigger();
        runner.join().unwrap();
        assert!(finished, "worker did not finish the queue in time");
    });

    assert!(!worker.health().running);
    assert_eq!(calls.lock().unwrap().len(), 3);

    let ok_task = harness.task(&ok);
    assert_eq!(ok_task.status, TaskStatus::Completed);
    let result_dir = harness.output_dir.join(&ok);
    assert_eq!(ok_task.result_path, Some(result_dir.to_string_lossy().into_owned()));
    assert!(result_dir.join("result.md").exists());

    let bad_task = harness.task(&bad);
    assert_eq!(bad_task.status, TaskStatus::Failed);
    assert_eq!(bad_task.error_message.as_deref(), Some("EngineFailed: corrupt input"));

    let boom_task = harness.task(&boom);
    assert_eq!(boom_task.status, TaskStatus::Failed);
    assert!(boom_task.error_message.unwrap().starts_with("EnginePanic: "));

    let health = worker.health();
    assert_eq!(health.tasks_completed, 1);
    assert_eq!(health.tasks_failed, 2);
}

#[test]
fn test_shutdown_interrupts_idle_sleep() {
    let harness = TestHarness::new();
    let mut settings = harness.settings();
    settings.poll_interval = Duration::from_secs(60);
    let worker = docqueue::worker::Worker::with_id(
        "sleepy",
        harness.db.clone(),
        registry(ScriptedEngine::new("scripted")),
        settings,
    );
    let shutdown = ShutdownSignal::new();

    let started = Instant::now();
    thread::scope(|s| {
        let signal = shutdown.clone();
        let worker = &worker;
        let runner = s.spawn(move || worker.run(&signal));
        thread::sleep(Duration::from_millis(100));
        shutdown.trigger();
        runner.join().unwrap();
    });
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[test]
fn test_straggler_result_is_discarded_after_reclaim() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new("scripted")
        .on("slow.pdf", Script::SleepThenSucceed(Duration::from_millis(500)));
    let id = harness.submit_file("slow.pdf", "x", "scripted", 0);
    let slow_worker = harness.worker("slow-worker", registry(engine));

    thread::scope(|s| {
        let slow = s.spawn(|| slow_worker.poll_once().unwrap());

        assert!(wait_for(|| {
            slow_worker.current_task().as_deref() == Some(id.as_str())
        }));
        assert_eq!(harness.task(&id).status, TaskStatus::Processing);

        // The claim is declared stale while the engine is still running.
        let later = chrono::Utc::now() + chrono::Duration::minutes(61);
        let reset =
            task_repo::reset_stale_tasks_at(&harness.db, chrono::Duration::minutes(60), later)
                .unwrap();
        assert_eq!(reset, 1);
        let second = harness.claim("fast-worker").unwrap();
        assert_eq!(second.task_id, id);

        let outcome = slow.join().unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Discarded {
                task_id: id.clone()
            }
        );

        // The second claim is untouched and can still finish.
        let task = harness.task(&id);
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.worker_id.as_deref(), Some("fast-worker"));
        assert!(task_repo::finalize_claim(
            &harness.db,
            &second,
            &task_repo::ClaimOutcome::Completed { result_path: None },
        )
        .unwrap());
    });

    assert_eq!(harness.task(&id).status, TaskStatus::Completed);
}

#[test]
fn test_loop_keeps_polling_through_store_outage() {
    let harness = TestHarness::new();
    let id = harness.submit_file("a.pdf", "x", "scripted", 0);
    let worker = harness.worker("outage-worker", registry(ScriptedEngine::new("scripted")));
    let shutdown = ShutdownSignal::new();

    harness.rename_table("tasks", "tasks_offline");
    thread::scope(|s| {
        let signal = shutdown.clone();
        let worker = &worker;
        let runner = s.spawn(move || worker.run(&signal));

        thread::sleep(Duration::from_millis(300));
        assert!(worker.health().running);
        assert_eq!(worker.health().tasks_completed, 0);

        harness.rename_table("tasks_offline", "tasks");
        let finished = wait_for(|| harness.task(&id).status == TaskStatus::Completed);
        shutdown.trigger();
        runner.join().unwrap();
        assert!(finished, "worker did not recover after the outage");
    });

    assert_eq!(worker.health().tasks_completed, 1);
}

#[test]
fn test_manual_poll_when_loop_disabled() {
    let harness = TestHarness::new();
    let id = harness.submit_file("a.pdf", "x", "scripted", 0);
    let mut settings = harness.settings();
    settings.enable_worker_loop = false;
    let worker = docqueue::worker::Worker::with_id(
        "manual",
        harness.db.clone(),
        registry(ScriptedEngine::new("scripted")),
        settings,
    );

    worker.run(&ShutdownSignal::new());
    assert_eq!(harness.task(&id).status, TaskStatus::Pending);
    assert!(!worker.health().loop_enabled);

    match worker.poll_once().unwrap() {
        PollOutcome::Completed { task_id, .. } => assert_eq!(task_id, id),
        other => panic!("Expected completion, got {:?}", other),
    }
    assert_eq!(worker.poll_once().unwrap(), PollOutcome::Idle);
}
