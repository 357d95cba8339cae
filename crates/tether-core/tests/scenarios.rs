//! End-to-end scheduling scenarios against the in-memory runner.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tether_core::testing::{COMPLETION_SUBTYPE, MockRunner, RecordingCommandRunner};
use tether_core::{
    CoordinatorEvent, ExpiryHandler, LeaseToken, OwnerKind, Preemption, QueueEvent, Scheduler,
    SchedulerHandle, TaskHooks, TaskRef, TaskSpec, TetherConfig,
};
use tokio::sync::broadcast;
use tether_proto::{RunnerMessage, TaskMessage, TaskStatus};

struct Harness {
    runner: Arc<MockRunner>,
    commands: Arc<RecordingCommandRunner>,
    scheduler: Arc<Scheduler>,
    handle: SchedulerHandle,
}

fn harness(config: TetherConfig) -> Harness {
    let runner = Arc::new(MockRunner::new());
    let commands = Arc::new(RecordingCommandRunner::new());
    let scheduler = Scheduler::new(runner.clone(), commands.clone(), config);
    let handle = scheduler.spawn();
    Harness {
        runner,
        commands,
        scheduler,
        handle,
    }
}

fn short_timeout() -> TetherConfig {
    TetherConfig {
        automated_timeout_secs: Some(10),
        ..TetherConfig::default()
    }
}

impl Harness {
    fn status(&self, r: TaskRef) -> Option<TaskStatus> {
        self.scheduler.queue().status(r)
    }

    fn texts(&self, r: TaskRef) -> Vec<String> {
        self.scheduler
            .queue()
            .get(r)
            .unwrap()
            .log
            .iter()
            .filter_map(|m| m.runner_message().and_then(|m| m.text.clone()))
            .collect()
    }

    async fn wait_for_status(&self, r: TaskRef, status: TaskStatus) {
        eventually(&format!("task {r} to become {status}"), || {
            self.status(r) == Some(status)
        })
        .await;
    }

    /// Waits until `r` runs under a root the coordinator already routes.
    async fn wait_until_running(&self, r: TaskRef) {
        self.wait_for_status(r, TaskStatus::Running).await;
        eventually("runner root to be tracked", || {
            self.runner
                .stack()
                .first()
                .is_some_and(|root| self.scheduler.coordinator().is_tracked(root))
        })
        .await;
    }
}

/// Polls `cond` under the paused clock for up to two virtual minutes.
async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(120), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Everything already published on a coordinator subscription.
fn drain(events: &mut broadcast::Receiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return seen,
        }
    }
}

/// Lets queued runner events drain.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Automated tasks
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_single_task_runs_to_completion() {
    let h = harness(TetherConfig::default());
    h.runner.set_script(
        "test",
        vec![
            RunnerMessage::say("text", "Hello"),
            RunnerMessage::say("text", "<completion>Hello</completion>"),
            RunnerMessage::say(COMPLETION_SUBTYPE, "Hello"),
        ],
    );

    let r = h.scheduler.queue().enqueue(TaskSpec::new("test"));
    h.wait_for_status(r, TaskStatus::Completed).await;

    let task = h.scheduler.queue().get(r).unwrap();
    assert_eq!(
        task.status_path(),
        vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::Completed]
    );
    assert_eq!(
        h.texts(r),
        vec!["Hello", "<completion>Hello</completion>", "Hello"]
    );
    assert_eq!(
        task.log.last(),
        Some(&TaskMessage::Status {
            status: TaskStatus::Completed
        })
    );
    assert!(task.runner_id.is_some());

    settle().await;
    assert!(!h.scheduler.coordinator().is_busy());
    h.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_subtask_completion_does_not_resolve_root() {
    let h = harness(TetherConfig::default());
    let r = h.scheduler.queue().enqueue(TaskSpec::new("parent"));
    h.wait_until_running(r).await;
    let root = h.runner.top().unwrap();

    let child = h.runner.spawn_subtask();
    eventually("child to be routed", || {
        h.scheduler.coordinator().is_tracked(&child)
    })
    .await;
    h.runner.say(&child, "text", "working in child");
    h.runner.say_partial(&root, "stream");
    h.runner.complete_top("child done");
    settle().await;
    assert_eq!(h.status(r), Some(TaskStatus::Running));

    h.runner.say(&root, "text", "back in root");
    h.runner.complete_top("root done");
    h.wait_for_status(r, TaskStatus::Completed).await;

    // Emission order survives, sibling traffic included; fragments do not.
    assert_eq!(
        h.texts(r),
        vec!["working in child", "child done", "back in root", "root done"]
    );
    h.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_task_becomes_asking_after_pause_hook() {
    let h = harness(short_timeout());
    h.runner
        .set_script("stall", vec![RunnerMessage::say("text", "thinking...")]);
    let mut events = h.scheduler.queue().subscribe();

    let hooks = TaskHooks {
        start: Some("setup-env".into()),
        pause: Some("save-state".into()),
        ..TaskHooks::default()
    };
    let r = h
        .scheduler
        .queue()
        .enqueue(TaskSpec::new("stall").with_hooks(hooks));

    let commands_at_asking = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if let Ok(QueueEvent::StatusChanged {
                to: TaskStatus::Asking,
                ..
            }) = events.recv().await
            {
                return h.commands.commands();
            }
        }
    })
    .await
    .expect("task should stall into asking");

    assert_eq!(commands_at_asking, vec!["setup-env", "save-state"]);
    let task = h.scheduler.queue().get(r).unwrap();
    assert_eq!(
        task.status_path(),
        vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::Asking]
    );
    settle().await;
    assert!(!h.scheduler.coordinator().is_busy());
    h.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abort_frees_runner_for_next_task() {
    let h = harness(TetherConfig::default());
    let mut coordinator_events = h.scheduler.coordinator().subscribe();
    let first = h.scheduler.queue().enqueue(TaskSpec::new("first").with_hooks(TaskHooks {
        pause: Some("pause-first".into()),
        ..TaskHooks::default()
    }));
    let second = h.scheduler.queue().enqueue(TaskSpec::new("second"));
    h.wait_until_running(first).await;

    h.scheduler.coordinator().abort_task_stack().await.unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if let Ok(CoordinatorEvent::RootTaskEnded { owner, status, .. }) =
                coordinator_events.recv().await
            {
                return (owner, status);
            }
        }
    })
    .await
    .expect("root should end");
    assert_eq!(ended, (OwnerKind::Automated, TaskStatus::Aborted));

    h.wait_for_status(first, TaskStatus::Aborted).await;
    h.wait_until_running(second).await;
    assert!(h.scheduler.coordinator().is_busy());
    assert_eq!(h.commands.commands(), vec!["pause-first"]);
    assert_eq!(h.runner.started_prompts(), vec!["first", "second"]);
    h.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failures_never_stall_the_queue() {
    let h = harness(TetherConfig::default());
    h.runner.fail_next_start();
    h.commands.fail_on("publish");
    h.runner
        .set_script("ok", vec![RunnerMessage::say(COMPLETION_SUBTYPE, "done")]);
    h.runner
        .set_script("publishes", vec![RunnerMessage::say(COMPLETION_SUBTYPE, "done")]);

    let broken_start = h.scheduler.queue().enqueue(TaskSpec::new("ok"));
    let broken_hook = h.scheduler.queue().enqueue(TaskSpec::new("publishes").with_hooks(
        TaskHooks {
            complete: Some("publish".into()),
            ..TaskHooks::default()
        },
    ));
    let fine = h.scheduler.queue().enqueue(TaskSpec::new("ok"));

    h.wait_for_status(fine, TaskStatus::Completed).await;
    assert_eq!(h.status(broken_start), Some(TaskStatus::Error));
    assert_eq!(h.status(broken_hook), Some(TaskStatus::Error));
    h.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_paused_queue_waits_for_resume() {
    let h = harness(TetherConfig {
        start_paused: true,
        ..TetherConfig::default()
    });
    h.runner
        .set_script("later", vec![RunnerMessage::say(COMPLETION_SUBTYPE, "done")]);
    let r = h.scheduler.queue().enqueue(TaskSpec::new("later"));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.status(r), Some(TaskStatus::Queued));

    h.scheduler.queue().resume();
    h.wait_for_status(r, TaskStatus::Completed).await;
    h.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ask_responses_keep_silent_task_running() {
    let h = harness(short_timeout());
    h.runner.set_script(
        "asks",
        vec![RunnerMessage::ask("followup", "Which branch?")],
    );
    let r = h.scheduler.queue().enqueue(TaskSpec::new("asks"));
    h.wait_until_running(r).await;
    let root = h.runner.top().unwrap();

    // Well past the 10s budget, with an answer every 6s.
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(6)).await;
        h.runner.respond_to_ask(&root);
    }
    settle().await;

    assert_eq!(h.status(r), Some(TaskStatus::Running));
    assert!(h.scheduler.coordinator().is_busy());
    assert!(h.scheduler.coordinator().is_tracked(&root));
    assert_eq!(h.scheduler.coordinator().human_root(), None);
    assert!(!h.scheduler.is_human_active());

    h.wait_for_status(r, TaskStatus::Asking).await;
    h.handle.shutdown().await;
}

/// Vetoes expiry until told to stop.
struct HoldLease {
    hold: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl ExpiryHandler for HoldLease {
    async fn on_expire(&self, _token: &LeaseToken) -> Preemption {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            Preemption::Prevent
        } else {
            Preemption::Allow
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_expiry_veto_keeps_silent_task_running() {
    let h = harness(short_timeout());
    let veto = Arc::new(HoldLease {
        hold: AtomicBool::new(true),
        calls: AtomicUsize::new(0),
    });
    h.scheduler.set_expiry_veto(veto.clone());
    h.runner
        .set_script("stall", vec![RunnerMessage::say("text", "thinking...")]);

    let r = h.scheduler.queue().enqueue(TaskSpec::new("stall").with_hooks(TaskHooks {
        pause: Some("save-state".into()),
        ..TaskHooks::default()
    }));
    h.wait_until_running(r).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.status(r), Some(TaskStatus::Running));
    assert!(h.scheduler.coordinator().is_busy());
    assert!(veto.calls.load(Ordering::SeqCst) >= 5);
    assert!(h.commands.commands().is_empty());

    veto.hold.store(false, Ordering::SeqCst);
    h.wait_for_status(r, TaskStatus::Asking).await;
    assert_eq!(h.commands.commands(), vec!["save-state"]);
    h.handle.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Human sessions
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_human_session_outlives_automated_budget() {
    let h = harness(short_timeout());
    let human = h.runner.start_human_task("long manual session");
    eventually("human session to be noticed", || {
        h.scheduler.is_human_active()
    })
    .await;
    let r = h.scheduler.queue().enqueue(TaskSpec::new("queued"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(h.scheduler.coordinator().is_busy());
    assert_eq!(h.scheduler.coordinator().lease().timeout(), None);
    assert_eq!(h.scheduler.coordinator().human_root(), Some(human));
    assert_eq!(h.status(r), Some(TaskStatus::Queued));
    assert!(h.runner.started_prompts().is_empty());
    h.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_human_session_hands_runner_back() {
    let h = harness(TetherConfig {
        human_timeout_secs: Some(5),
        ..TetherConfig::default()
    });
    h.runner
        .set_script("after", vec![RunnerMessage::say(COMPLETION_SUBTYPE, "done")]);
    let mut events = h.scheduler.coordinator().subscribe();

    let human = h.runner.start_human_task("walked away");
    eventually("human session to be noticed", || {
        h.scheduler.is_human_active()
    })
    .await;
    let r = h.scheduler.queue().enqueue(TaskSpec::new("after"));

    h.wait_for_status(r, TaskStatus::Completed).await;
    assert!(!h.scheduler.is_human_active());
    assert_eq!(h.runner.started_prompts(), vec!["after"]);
    assert!(drain(&mut events).contains(&CoordinatorEvent::RootTaskEnded {
        runner_id: human,
        owner: OwnerKind::Human,
        status: TaskStatus::Asking,
    }));
    h.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_human_session_blocks_automated_loop() {
    let h = harness(TetherConfig::default());
    h.runner.start_human_task("manual work");
    eventually("human session to be noticed", || {
        h.scheduler.is_human_active()
    })
    .await;

    let r = h.scheduler.queue().enqueue(TaskSpec::new("queued"));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.status(r), Some(TaskStatus::Queued));
    assert!(h.runner.started_prompts().is_empty());

    h.runner.complete_top("done by hand");
    h.wait_until_running(r).await;
    assert!(!h.scheduler.is_human_active());
    assert_eq!(h.runner.started_prompts(), vec!["queued"]);
    h.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_existing_stack_is_seeded_as_human_session() {
    let runner = Arc::new(MockRunner::new());
    runner.push_stack("left-over".into());
    let scheduler = Scheduler::new(
        runner.clone(),
        Arc::new(RecordingCommandRunner::new()),
        TetherConfig::default(),
    );
    let handle = scheduler.spawn();
    assert!(scheduler.is_human_active());

    let r = scheduler.queue().enqueue(TaskSpec::new("x"));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(scheduler.queue().status(r), Some(TaskStatus::Queued));
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_human_resume_of_automated_task_is_rerouted() {
    let h = harness(short_timeout());
    h.runner
        .set_script("flaky", vec![RunnerMessage::say("text", "stuck?")]);
    let r = h.scheduler.queue().enqueue(TaskSpec::new("flaky").with_hooks(TaskHooks {
        resume: Some("restore-state".into()),
        ..TaskHooks::default()
    }));
    h.wait_for_status(r, TaskStatus::Asking).await;
    let runner_id = h.scheduler.queue().get(r).unwrap().runner_id.unwrap();

    h.runner.human_resume(&runner_id);

    eventually("forced re-run to resume the runner task", || {
        h.runner.resumed() == vec![runner_id.clone()]
    })
    .await;
    h.wait_for_status(r, TaskStatus::Running).await;

    let task = h.scheduler.queue().get(r).unwrap();
    assert_eq!(task.attempts.len(), 1);
    assert_eq!(task.attempts[0].status, TaskStatus::Asking);
    assert_eq!(h.commands.commands(), vec!["restore-state"]);
    assert_eq!(h.runner.started_prompts(), vec!["flaky"]);
    h.handle.shutdown().await;
}
