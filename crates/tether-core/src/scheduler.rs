//! The dual-loop scheduler.
//!
//! The automated loop drains the task queue one task at a time whenever no
//! human session is in progress and the queue is not paused. The human
//! loop follows the coordinator's root notifications to know when a human
//! holds the runner, and turns a human resume of an automated task into a
//! forced re-run through the queue.
//!
//! A task's failure never stops the automated loop: every per-task error
//! marks that task `error` and the loop moves on.

use crate::channel::channel;
use crate::config::TetherConfig;
use crate::coordinator::{CoordinatorEvent, OwnerKind, RunnerCoordinator};
use crate::hooks::{CommandRunner, HookKind, run_hook};
use crate::lease::{ExpiryHandler, LeaseToken, LeaseTracker, Preemption};
use crate::lifecycle::{StatusHook, TaskLifecycle};
use crate::queue::{QueueEvent, TaskQueue, TaskRef};
use crate::task::Task;
use crate::utils::lock;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_proto::{Error, Result, Runner, TaskId, TaskMessage, TaskStatus};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `shutdown` lets the loops wind down before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Turns lease expiry of the running automated task into a signal for the
/// automated loop. Never vetoes unless a host veto is installed.
#[derive(Default)]
struct RunExpiry {
    armed: Mutex<Option<(LeaseToken, oneshot::Sender<()>)>>,
    veto: Mutex<Option<Arc<dyn ExpiryHandler>>>,
}

impl RunExpiry {
    fn arm(&self, token: LeaseToken) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.armed) = Some((token, tx));
        rx
    }

    fn disarm(&self) {
        lock(&self.armed).take();
    }
}

#[async_trait]
impl ExpiryHandler for RunExpiry {
    async fn on_expire(&self, token: &LeaseToken) -> Preemption {
        let veto = lock(&self.veto).clone();
        if let Some(veto) = veto
            && veto.on_expire(token).await == Preemption::Prevent
        {
            return Preemption::Prevent;
        }
        let armed = lock(&self.armed).take_if(|(armed, _)| &*armed == token);
        if let Some((_, fired)) = armed {
            let _ = fired.send(());
        }
        Preemption::Allow
    }
}

/// What the automated loop should run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextAction {
    Run(TaskRef),
    /// A task a human resumed outside the queue.
    Forced(TaskRef),
}

impl NextAction {
    fn task(self) -> TaskRef {
        match self {
            NextAction::Run(r) | NextAction::Forced(r) => r,
        }
    }
}

pub struct Scheduler {
    config: TetherConfig,
    queue: Arc<TaskQueue>,
    coordinator: Arc<RunnerCoordinator>,
    commands: Arc<dyn CommandRunner>,
    human_active: AtomicBool,
    forced: Mutex<Option<TaskRef>>,
    expiry: Arc<RunExpiry>,
}

impl Scheduler {
    /// Wires a queue, a lease tracker and a coordinator around `runner`.
    pub fn new(
        runner: Arc<dyn Runner>,
        commands: Arc<dyn CommandRunner>,
        config: TetherConfig,
    ) -> Arc<Self> {
        let expiry = Arc::new(RunExpiry::default());
        let lease = LeaseTracker::new(config.automated_timeout(), config.waiter_poll());
        lease.set_expiry_handler(expiry.clone());
        let coordinator = RunnerCoordinator::new(runner, lease, config.clone());
        let queue = Arc::new(TaskQueue::new(config.waiter_poll(), config.start_paused));
        Arc::new(Self {
            config,
            queue,
            coordinator,
            commands,
            human_active: AtomicBool::new(false),
            forced: Mutex::new(None),
            expiry,
        })
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn coordinator(&self) -> &Arc<RunnerCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    /// Returns true while a human-driven root task is in progress.
    pub fn is_human_active(&self) -> bool {
        self.human_active.load(Ordering::Acquire)
    }

    /// Task waiting to be re-run after a human resumed it.
    pub fn forced_task(&self) -> Option<TaskRef> {
        *lock(&self.forced)
    }

    /// Consulted before an automated lease expires. Returning
    /// [`Preemption::Prevent`] gives the task another full timeout.
    pub fn set_expiry_veto(&self, veto: Arc<dyn ExpiryHandler>) {
        *lock(&self.expiry.veto) = Some(veto);
    }

    /// Starts the coordinator pump and both loops.
    pub fn spawn(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let events = self.coordinator.subscribe();
        let queue_events = self.queue.subscribe();
        let mut tasks = Vec::with_capacity(3);

        if let Some(pump) = self.coordinator.spawn(shutdown_rx.clone()) {
            tasks.push(pump);
        }
        if let Some(root) = self.coordinator.seed_from_runner() {
            info!(runner_id = %root, "Runner already busy with a human session");
            self.human_active.store(true, Ordering::Release);
        }
        tasks.push(tokio::spawn(
            Arc::clone(self).human_loop(events, queue_events, shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(Arc::clone(self).automated_loop(shutdown_rx)));

        SchedulerHandle { shutdown, tasks }
    }

    fn peek_next(&self) -> Option<NextAction> {
        if self.is_human_active() || self.coordinator.human_root().is_some() {
            return None;
        }
        let forced = *lock(&self.forced);
        if let Some(r) = forced
            && self.queue.is_live(r)
        {
            return Some(NextAction::Forced(r));
        }
        if self.queue.is_paused() {
            return None;
        }
        self.queue.next_queued().map(NextAction::Run)
    }

    fn take_next(&self) -> Option<NextAction> {
        let next = self.peek_next()?;
        if let NextAction::Forced(r) = next {
            let mut forced = lock(&self.forced);
            if *forced == Some(r) {
                *forced = None;
            }
        } else {
            // A forced ref that went stale must not block the queue.
            let mut forced = lock(&self.forced);
            if forced.is_some_and(|r| !self.queue.is_live(r)) {
                *forced = None;
            }
        }
        Some(next)
    }

    async fn automated_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Automated loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let weak = Arc::downgrade(&self);
            let ready = self.queue.waiters().wait_until(move || {
                weak.upgrade()
                    .is_some_and(|scheduler| scheduler.peek_next().is_some())
            });
            tokio::select! {
                () = ready => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let Some(next) = self.take_next() else {
                continue;
            };
            let r = next.task();
            if let Err(e) = self.run_task(next).await {
                error!(task = %r, error = %e, "Automated task failed");
                self.mark_failed(r);
            }
        }
        info!("Automated loop stopped");
    }

    /// Moves a task that blew up mid-run to `error`.
    fn mark_failed(&self, r: TaskRef) {
        match self.queue.status(r) {
            Some(TaskStatus::Running) => {
                if let Err(e) = self.queue.set_status(r, TaskStatus::Error) {
                    warn!(task = %r, error = %e, "Could not mark task as failed");
                }
            }
            Some(status) => debug!(task = %r, %status, "Failed task already settled"),
            None => debug!(task = %r, "Failed task was removed"),
        }
    }

    async fn run_task(&self, next: NextAction) -> Result<()> {
        let r = next.task();
        if matches!(next, NextAction::Forced(_)) && self.queue.status(r) != Some(TaskStatus::Queued)
        {
            self.queue.submit(r)?;
        }
        self.queue.set_status(r, TaskStatus::Running)?;
        let task = self
            .queue
            .get(r)
            .ok_or_else(|| Error::UnknownTask(r.to_string()))?;
        info!(task_id = %task.id, "Starting automated task");

        // Never share a runner stack with leftovers.
        self.coordinator.abort_task_stack().await?;
        if tokio::time::timeout(
            self.config.abort_grace(),
            self.coordinator.wait_until_not_busy(),
        )
        .await
        .is_err()
        {
            warn!(task_id = %task.id, "Runner still busy after abort grace period; taking over");
        }

        let resume_from = match &task.runner_id {
            Some(id) if self.coordinator.can_resume_task(id).await => Some(id.clone()),
            _ => None,
        };
        let hook = if resume_from.is_some() {
            HookKind::Resume
        } else {
            HookKind::Start
        };
        run_hook(self.commands.as_ref(), &task.hooks, hook, &task.id).await?;

        let (sink, receiver) = channel();
        let lease = self.coordinator.lease().acquire();
        self.coordinator
            .lease()
            .set_timeout(self.config.automated_timeout());
        let mut expired = self.expiry.arm(lease.clone());

        let lifecycle = TaskLifecycle::new(Arc::clone(&self.queue), r, receiver)
            .on_status(self.status_hook(&task));
        let mut lifecycle = tokio::spawn(lifecycle.run());

        let started = match resume_from {
            Some(runner_id) => self
                .coordinator
                .resume_task(task.id.clone(), &runner_id, sink.clone(), lease.clone())
                .await
                .map(|()| runner_id),
            None => {
                self.coordinator
                    .start_task(
                        task.id.clone(),
                        &task.prompt,
                        &task.images,
                        sink.clone(),
                        lease.clone(),
                    )
                    .await
            }
        };
        let runner_id = match started {
            Ok(id) => id,
            Err(e) => {
                self.expiry.disarm();
                lifecycle.abort();
                self.coordinator.lease().release(&lease);
                return Err(e);
            }
        };
        self.queue.set_runner_id(r, runner_id.clone());
        debug!(task_id = %task.id, runner_id = %runner_id, "Automated task handed to runner");

        let went_silent = tokio::select! {
            outcome = &mut lifecycle => {
                match outcome {
                    Ok(outcome) => debug!(task_id = %task.id, ?outcome, "Task lifecycle finished"),
                    Err(e) => warn!(task_id = %task.id, error = %e, "Task lifecycle panicked"),
                }
                false
            }
            Ok(()) = &mut expired => true,
        };
        self.expiry.disarm();

        if went_silent {
            info!(task_id = %task.id, "Task went silent; leaving it for a human");
            let _ = sink.send(TaskMessage::Exit);
            let _ = lifecycle.await;
            if self.queue.status(r) == Some(TaskStatus::Running) {
                run_hook(self.commands.as_ref(), &task.hooks, HookKind::Pause, &task.id).await?;
                self.queue.set_status(r, TaskStatus::Asking)?;
            }
        }

        if self.queue.status(r) == Some(TaskStatus::Running) {
            return Err(Error::runner("task stream closed without a final status"));
        }
        Ok(())
    }

    /// Runs the completion or pause hook and picks the status to record.
    fn status_hook(&self, task: &Task) -> StatusHook {
        let commands = Arc::clone(&self.commands);
        let hooks = task.hooks.clone();
        let task_id = task.id.clone();
        Box::new(move |status| {
            async move {
                let kind = match status {
                    TaskStatus::Completed => HookKind::Complete,
                    TaskStatus::Aborted => HookKind::Pause,
                    other => return other,
                };
                match run_hook(commands.as_ref(), &hooks, kind, &task_id).await {
                    Ok(()) => status,
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "Hook failed; marking task as error");
                        TaskStatus::Error
                    }
                }
            }
            .boxed()
        })
    }

    async fn human_loop(
        self: Arc<Self>,
        mut events: broadcast::Receiver<CoordinatorEvent>,
        mut queue_events: broadcast::Receiver<QueueEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut queue_open = true;
        loop {
            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                removed = queue_events.recv(), if queue_open => {
                    queue_open = !matches!(removed, Err(RecvError::Closed));
                    self.on_queue_event(removed);
                    continue;
                }
                event = events.recv() => event,
            };

            match event {
                Ok(CoordinatorEvent::RootTaskStarted {
                    runner_id,
                    owner: OwnerKind::Human,
                }) => {
                    debug!(runner_id = %runner_id, "Human session in progress; automated loop yields");
                    self.human_active.store(true, Ordering::Release);
                }
                Ok(CoordinatorEvent::RootTaskEnded {
                    owner: OwnerKind::Human,
                    ..
                }) => self.resync_human(),
                Ok(CoordinatorEvent::AutomatedTaskResumed { task_id, runner_id }) => {
                    match self.queue.find(&task_id) {
                        Some(r) => {
                            info!(task_id = %task_id, runner_id = %runner_id, "Forcing re-run of resumed task");
                            *lock(&self.forced) = Some(r);
                        }
                        None => warn!(task_id = %task_id, "Resumed task is no longer queued"),
                    }
                    self.queue.waiters().wake();
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Human loop lagged behind coordinator events");
                    self.resync_human();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Forgets the runner roots of tasks that left the queue.
    fn on_queue_event(&self, event: std::result::Result<QueueEvent, RecvError>) {
        match event {
            Ok(QueueEvent::Removed { task_id }) => self.coordinator.forget_task(&task_id),
            Ok(_) | Err(RecvError::Closed) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Missed queue events; pruning automated roots");
                let live: HashSet<TaskId> =
                    self.queue.snapshot().into_iter().map(|task| task.id).collect();
                self.coordinator.retain_tasks(|task_id| live.contains(task_id));
            }
        }
    }

    fn resync_human(&self) {
        let active = self.coordinator.human_root().is_some();
        self.human_active.store(active, Ordering::Release);
        if !active {
            debug!("Human session over; waking automated loop");
            self.queue.waiters().wake();
        }
    }
}

/// Owns the running loops.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signals both loops and the event pump to stop and waits for them.
    ///
    /// A loop still busy with a task after a short grace is aborted.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for mut task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use crate::task::TaskSpec;
    use tether_proto::RunnerEvent;
    use crate::testing::{MockRunner, RecordingCommandRunner};

    fn scheduler(config: TetherConfig) -> (Arc<MockRunner>, Arc<Scheduler>) {
        let runner = Arc::new(MockRunner::new());
        let commands = Arc::new(RecordingCommandRunner::new());
        let scheduler = Scheduler::new(runner.clone(), commands, config);
        (runner, scheduler)
    }

    #[tokio::test]
    async fn test_paused_queue_has_nothing_runnable() {
        let (_runner, scheduler) = scheduler(TetherConfig {
            start_paused: true,
            ..TetherConfig::default()
        });
        scheduler.queue().enqueue(TaskSpec::new("x"));
        assert_eq!(scheduler.peek_next(), None);

        scheduler.queue().resume();
        assert!(matches!(scheduler.peek_next(), Some(NextAction::Run(_))));
    }

    #[tokio::test]
    async fn test_forced_task_wins_over_queue() {
        let (_runner, scheduler) = scheduler(TetherConfig::default());
        let first = scheduler.queue().enqueue(TaskSpec::new("first"));
        let forced = scheduler.queue().enqueue(TaskSpec::new("forced"));
        *lock(&scheduler.forced) = Some(forced);

        assert_eq!(scheduler.peek_next(), Some(NextAction::Forced(forced)));
        assert_eq!(scheduler.take_next(), Some(NextAction::Forced(forced)));
        assert_eq!(scheduler.forced_task(), None);
        assert_eq!(scheduler.peek_next(), Some(NextAction::Run(first)));
    }

    #[tokio::test]
    async fn test_stale_forced_ref_is_dropped() {
        let (_runner, scheduler) = scheduler(TetherConfig::default());
        let gone = scheduler.queue().enqueue(TaskSpec::new("gone"));
        let next = scheduler.queue().enqueue(TaskSpec::new("next"));
        *lock(&scheduler.forced) = Some(gone);
        scheduler.queue().remove(gone);

        assert_eq!(scheduler.take_next(), Some(NextAction::Run(next)));
        assert_eq!(scheduler.forced_task(), None);
    }

    #[tokio::test]
    async fn test_human_session_blocks_queue() {
        let (runner, scheduler) = scheduler(TetherConfig::default());
        scheduler.queue().enqueue(TaskSpec::new("x"));
        runner.push_stack("manual".into());
        scheduler.coordinator().seed_from_runner();
        assert_eq!(scheduler.peek_next(), None);
    }

    #[tokio::test]
    async fn test_removed_task_root_is_no_longer_rerouted() {
        let (_runner, scheduler) = scheduler(TetherConfig::default());
        let coordinator = scheduler.coordinator();
        let r = scheduler.queue().enqueue(TaskSpec::new("x").with_id("job"));
        let (sink, _rx) = channel();
        let lease = coordinator.lease().acquire();
        let root = coordinator
            .start_task(TaskId::new("job"), "x", &[], sink, lease)
            .await
            .unwrap();
        coordinator
            .handle_event(RunnerEvent::TaskAborted { id: root.clone() })
            .unwrap();

        let mut queue_events = scheduler.queue().subscribe();
        scheduler.queue().remove(r);
        scheduler.on_queue_event(Ok(queue_events.try_recv().unwrap()));

        // The root is still on the runner stack; reopening it is now an
        // ordinary human session.
        let mut events = coordinator.subscribe();
        coordinator
            .handle_event(RunnerEvent::TaskCreated { id: root.clone() })
            .unwrap();
        assert_eq!(coordinator.human_root(), Some(root.clone()));
        assert_eq!(
            events.try_recv().unwrap(),
            CoordinatorEvent::RootTaskStarted {
                runner_id: root,
                owner: OwnerKind::Human,
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expiry_signal_only_for_armed_token() {
        let expiry = RunExpiry::default();
        let lease = LeaseTracker::new(None, Duration::from_millis(100));
        let old = lease.acquire();
        let current = lease.acquire();
        let mut fired = expiry.arm(current.clone());

        assert_eq!(expiry.on_expire(&old).await, Preemption::Allow);
        assert!(fired.try_recv().is_err());

        assert_eq!(expiry.on_expire(&current).await, Preemption::Allow);
        assert!(fired.try_recv().is_ok());
    }
}
