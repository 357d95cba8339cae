//! Routes runner lifecycle events to logical tasks.
//!
//! The coordinator owns the map from runner identities to their owner. An
//! owner is either an automated task, which gets a message sink, or a
//! human-driven session, which only holds the lease. A root task and every
//! sub-task spawned beneath it share one owner; only the root ending
//! resolves it.
//!
//! Event handling never suspends. Each inbound event becomes a state update,
//! a message pushed onto a channel, or a broadcast notification.

use crate::channel::Sender;
use crate::config::TetherConfig;
use crate::lease::{LeaseToken, LeaseTracker};
use crate::utils::lock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tether_proto::{
    Error, Result, Runner, RunnerEvent, RunnerMessage, RunnerTaskId, TaskId, TaskMessage,
    TaskStatus,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Who drives a runner root task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Automated,
    Human,
}

impl std::fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OwnerKind::Automated => "automated",
            OwnerKind::Human => "human",
        })
    }
}

/// Notifications for the scheduler and hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    RootTaskStarted {
        runner_id: RunnerTaskId,
        owner: OwnerKind,
    },
    RootTaskEnded {
        runner_id: RunnerTaskId,
        owner: OwnerKind,
        status: TaskStatus,
    },
    /// The runner showed signs of life.
    Keepalive,
    /// A human resumed a root that belongs to an automated task. The stack
    /// is being aborted so the task can be re-run through the queue.
    AutomatedTaskResumed {
        task_id: TaskId,
        runner_id: RunnerTaskId,
    },
}

#[derive(Clone)]
enum Owner {
    Automated {
        task_id: TaskId,
        sink: Sender<TaskMessage, ()>,
        lease: LeaseToken,
    },
    Human {
        lease: LeaseToken,
    },
}

impl Owner {
    fn kind(&self) -> OwnerKind {
        match self {
            Owner::Automated { .. } => OwnerKind::Automated,
            Owner::Human { .. } => OwnerKind::Human,
        }
    }
}

#[derive(Clone)]
struct OwnerEntry {
    root: RunnerTaskId,
    owner: Owner,
}

/// An automated start registered just before the runner call.
struct PendingStart {
    task_id: TaskId,
    sink: Sender<TaskMessage, ()>,
    lease: LeaseToken,
}

#[derive(Default)]
struct CoordinatorState {
    owners: HashMap<RunnerTaskId, OwnerEntry>,
    pending: Option<PendingStart>,
    /// Latest root of each automated task still known to the queue.
    automated_roots: HashMap<RunnerTaskId, TaskId>,
    /// Identities of human sessions whose lease ran out while they were
    /// still on the runner stack.
    expired: HashSet<RunnerTaskId>,
}

pub struct RunnerCoordinator {
    runner: Arc<dyn Runner>,
    lease: LeaseTracker,
    config: TetherConfig,
    state: Mutex<CoordinatorState>,
    events: broadcast::Sender<CoordinatorEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<RunnerEvent>>>,
}

impl RunnerCoordinator {
    /// Creates a coordinator and subscribes to the runner right away, so
    /// no event emitted after construction is lost.
    pub fn new(runner: Arc<dyn Runner>, lease: LeaseTracker, config: TetherConfig) -> Arc<Self> {
        let receiver = runner.subscribe();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            runner,
            lease,
            config,
            state: Mutex::new(CoordinatorState::default()),
            events,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn lease(&self) -> &LeaseTracker {
        &self.lease
    }

    pub fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    pub fn is_busy(&self) -> bool {
        self.lease.is_busy()
    }

    pub async fn wait_until_not_busy(&self) {
        self.lease.wait_until_free().await;
    }

    /// Root identity of the human session in progress, if any.
    pub fn human_root(&self) -> Option<RunnerTaskId> {
        lock(&self.state)
            .owners
            .values()
            .find(|entry| matches!(entry.owner, Owner::Human { .. }))
            .map(|entry| entry.root.clone())
    }

    /// Returns true if `id` is currently routed to an owner.
    pub fn is_tracked(&self, id: &RunnerTaskId) -> bool {
        lock(&self.state).owners.contains_key(id)
    }

    /// Stops recognising the roots of a task that left the queue.
    pub fn forget_task(&self, task_id: &TaskId) {
        lock(&self.state)
            .automated_roots
            .retain(|_, owner| owner != task_id);
    }

    /// Keeps only the automated roots whose task passes `keep`.
    pub fn retain_tasks(&self, mut keep: impl FnMut(&TaskId) -> bool) {
        lock(&self.state)
            .automated_roots
            .retain(|_, task_id| keep(task_id));
    }

    /// Ends every human session whose lease is no longer the current one.
    ///
    /// A human lease only goes away without its root ending when it timed
    /// out, so the session is over as far as scheduling is concerned.
    pub fn end_expired_sessions(&self) {
        let current = self.lease.current();
        let roots: Vec<RunnerTaskId> = {
            let mut state = lock(&self.state);
            let stale: Vec<RunnerTaskId> = state
                .owners
                .iter()
                .filter(|(_, entry)| match &entry.owner {
                    Owner::Human { lease } => current.as_ref() != Some(lease),
                    Owner::Automated { .. } => false,
                })
                .map(|(id, _)| id.clone())
                .collect();
            let mut roots = Vec::new();
            for id in stale {
                if let Some(entry) = state.owners.get(&id)
                    && !roots.contains(&entry.root)
                {
                    roots.push(entry.root.clone());
                }
                state.expired.insert(id);
            }
            roots
        };
        for root in roots {
            warn!(runner_id = %root, "Human session went silent; releasing the runner");
            self.end_root(&root, TaskStatus::Asking);
        }
    }

    /// Pumps runner events until shutdown. Returns `None` if the event
    /// stream was already taken by an earlier call.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let Some(mut events) = lock(&self.receiver).take() else {
            warn!("Coordinator event pump already running");
            return None;
        };
        let this = Arc::clone(self);
        let mut busy = self.lease.subscribe();
        let mut lease_open = true;
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Coordinator event pump stopping");
                            break;
                        }
                    }
                    changed = busy.changed(), if lease_open => {
                        if changed.is_err() {
                            lease_open = false;
                            continue;
                        }
                        let free = !*busy.borrow_and_update();
                        if free {
                            this.end_expired_sessions();
                        }
                    }
                    event = events.recv() => {
                        let Some(event) = event else {
                            info!("Runner event stream closed");
                            break;
                        };
                        if let Err(e) = this.handle_event(event) {
                            if e.is_invariant_violation() {
                                error!(error = %e, "Busy tracking out of sync with runner");
                            } else {
                                warn!(error = %e, "Failed to handle runner event");
                            }
                        }
                    }
                }
            }
        }))
    }

    /// Applies one runner event.
    pub fn handle_event(self: &Arc<Self>, event: RunnerEvent) -> Result<()> {
        match event {
            RunnerEvent::TaskCreated { id } => self.on_created(id),
            RunnerEvent::TaskSpawned { parent, child } => self.on_spawned(&parent, child),
            RunnerEvent::TaskStarted { id } => self.on_started(&id),
            RunnerEvent::TaskPaused { .. }
            | RunnerEvent::TaskUnpaused { .. }
            | RunnerEvent::TaskAskResponded { .. } => self.lease.keepalive(),
            RunnerEvent::Message { id, message } => self.on_message(id, message),
            RunnerEvent::TaskAborted { id } => return self.on_aborted(&id),
        }
        Ok(())
    }

    fn on_created(self: &Arc<Self>, id: RunnerTaskId) {
        self.lease.keepalive();
        let stack = self.runner.current_task_stack();

        let mut state = lock(&self.state);
        state.expired.retain(|expired| stack.contains(expired));
        if state.owners.contains_key(&id) {
            return;
        }

        if let Some(root) = stack.first().filter(|root| *root != &id)
            && let Some(entry) = state.owners.get(root).cloned()
        {
            debug!(runner_id = %id, root = %root, "Sub-task inherits root owner");
            state.owners.insert(id, entry);
            return;
        }

        if stack.first().is_some_and(|root| state.expired.contains(root)) {
            let mut ids = stack.clone();
            if !ids.contains(&id) {
                ids.push(id);
            }
            for id in &ids {
                state.expired.remove(id);
            }
            debug!(root = %ids[0], "Expired human session is active again");
            let event = self.bind_human(&mut state, &ids);
            drop(state);
            self.emit(event);
            return;
        }

        if let Some(pending) = state.pending.take() {
            let event = Self::bind_automated(&mut state, id, pending);
            drop(state);
            self.emit(event);
            return;
        }

        if let Some(task_id) = state.automated_roots.get(&id).cloned() {
            let event = self.bind_human(&mut state, &[id.clone()]);
            drop(state);
            warn!(
                task_id = %task_id,
                runner_id = %id,
                "Automated task resumed outside the queue; aborting so it re-runs under the scheduler"
            );
            self.emit(event);
            self.emit(CoordinatorEvent::AutomatedTaskResumed {
                task_id,
                runner_id: id,
            });
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.abort_task_stack().await {
                    warn!(error = %e, "Failed to abort resumed automated task");
                }
            });
            return;
        }

        let event = self.bind_human(&mut state, &[id]);
        drop(state);
        self.emit(event);
    }

    fn on_spawned(&self, parent: &RunnerTaskId, child: RunnerTaskId) {
        self.lease.keepalive();
        let mut state = lock(&self.state);
        match state.owners.get(parent).cloned() {
            Some(entry) => {
                debug!(parent = %parent, child = %child, "Sub-task spawned");
                state.owners.insert(child, entry);
            }
            None => warn!(parent = %parent, child = %child, "Sub-task spawned under unknown parent"),
        }
    }

    fn on_started(&self, id: &RunnerTaskId) {
        self.lease.keepalive();
        let kind = {
            let state = lock(&self.state);
            match state.owners.get(id) {
                Some(entry) if &entry.root == id => Some(entry.owner.kind()),
                _ => None,
            }
        };
        match kind {
            Some(OwnerKind::Automated) => self.lease.set_timeout(self.config.automated_timeout()),
            Some(OwnerKind::Human) => self.lease.set_timeout(self.config.human_timeout()),
            None => {}
        }
    }

    fn on_message(&self, id: RunnerTaskId, message: RunnerMessage) {
        // Any traffic counts as liveness, streaming fragments included.
        self.lease.keepalive();
        self.emit(CoordinatorEvent::Keepalive);
        if message.partial {
            return;
        }

        let (entry, expired) = {
            let state = lock(&self.state);
            (state.owners.get(&id).cloned(), state.expired.contains(&id))
        };
        let Some(entry) = entry else {
            if expired {
                debug!(runner_id = %id, "Message from an expired human session; ignoring");
            } else {
                warn!(runner_id = %id, subtype = %message.subtype, "Message for unmapped runner task; ignoring");
            }
            return;
        };

        let completes_root = message.is_subtype(&self.config.completion_tag)
            && entry.root == id
            && self.runner.current_task_stack().len() <= 1;

        if let Owner::Automated { task_id, sink, .. } = &entry.owner
            && sink.send(TaskMessage::from_runner(id, message)).is_err()
        {
            debug!(task_id = %task_id, "Task stream already finished; dropping message");
        }

        if completes_root {
            self.end_root(&entry.root, TaskStatus::Completed);
        }
    }

    fn on_aborted(&self, id: &RunnerTaskId) -> Result<()> {
        self.lease.keepalive();
        let root = {
            let mut state = lock(&self.state);
            let Some(entry) = state.owners.get(id) else {
                if state.expired.remove(id) {
                    debug!(runner_id = %id, "Expired human session aborted");
                    return Ok(());
                }
                return Err(Error::UntrackedAbort(id.clone()));
            };
            if &entry.root != id {
                debug!(runner_id = %id, "Sub-task aborted");
                state.owners.remove(id);
                return Ok(());
            }
            entry.root.clone()
        };
        self.end_root(&root, TaskStatus::Aborted);
        Ok(())
    }

    /// Resolves the owner of `root` and frees the runner.
    fn end_root(&self, root: &RunnerTaskId, status: TaskStatus) {
        let owner = {
            let mut state = lock(&self.state);
            let owner = state.owners.get(root).map(|entry| entry.owner.clone());
            state.owners.retain(|_, entry| &entry.root != root);
            owner
        };
        let Some(owner) = owner else {
            return;
        };

        match &owner {
            Owner::Automated {
                task_id,
                sink,
                lease,
            } => {
                info!(task_id = %task_id, runner_id = %root, %status, "Automated root task ended");
                if sink.send(TaskMessage::Status { status }).is_err() {
                    debug!(task_id = %task_id, "Task stream already finished");
                }
                if sink.finish(()).is_err() {
                    debug!(task_id = %task_id, "Task stream closed before the root ended");
                }
                self.lease.release(lease);
            }
            Owner::Human { lease } => {
                info!(runner_id = %root, %status, "Human root task ended");
                self.lease.release(lease);
            }
        }

        self.emit(CoordinatorEvent::RootTaskEnded {
            runner_id: root.clone(),
            owner: owner.kind(),
            status,
        });
    }

    fn bind_automated(
        state: &mut CoordinatorState,
        id: RunnerTaskId,
        pending: PendingStart,
    ) -> CoordinatorEvent {
        info!(task_id = %pending.task_id, runner_id = %id, "Automated root task bound");
        // A task only ever resumes its latest root.
        state
            .automated_roots
            .retain(|_, task_id| task_id != &pending.task_id);
        state
            .automated_roots
            .insert(id.clone(), pending.task_id.clone());
        state.owners.insert(
            id.clone(),
            OwnerEntry {
                root: id.clone(),
                owner: Owner::Automated {
                    task_id: pending.task_id,
                    sink: pending.sink,
                    lease: pending.lease,
                },
            },
        );
        CoordinatorEvent::RootTaskStarted {
            runner_id: id,
            owner: OwnerKind::Automated,
        }
    }

    /// Binds `stack` (root first) to a fresh human session.
    fn bind_human(&self, state: &mut CoordinatorState, stack: &[RunnerTaskId]) -> CoordinatorEvent {
        let root = stack[0].clone();
        let lease = self.lease.acquire();
        self.lease.set_timeout(self.config.human_timeout());
        info!(runner_id = %root, "Human root task started");
        let entry = OwnerEntry {
            root: root.clone(),
            owner: Owner::Human { lease },
        };
        for id in stack {
            state.owners.insert(id.clone(), entry.clone());
        }
        CoordinatorEvent::RootTaskStarted {
            runner_id: root,
            owner: OwnerKind::Human,
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    /// Adopts whatever the runner is already running as a human session.
    pub fn seed_from_runner(&self) -> Option<RunnerTaskId> {
        let stack = self.runner.current_task_stack();
        let root = stack.first()?.clone();
        let mut state = lock(&self.state);
        if state.owners.contains_key(&root) {
            return None;
        }
        let event = self.bind_human(&mut state, &stack);
        drop(state);
        self.emit(event);
        Some(root)
    }

    /// Starts a fresh runner task on behalf of an automated task.
    ///
    /// The caller holds `lease`; it is released when the root ends.
    pub async fn start_task(
        &self,
        task_id: TaskId,
        prompt: &str,
        images: &[String],
        sink: Sender<TaskMessage, ()>,
        lease: LeaseToken,
    ) -> Result<RunnerTaskId> {
        self.set_pending(task_id, sink, lease);
        let result = self.runner.start_new_task(prompt, images).await;
        match result {
            Ok(id) => {
                self.bind_if_pending(&id);
                Ok(id)
            }
            Err(e) => {
                lock(&self.state).pending = None;
                Err(e)
            }
        }
    }

    /// Resumes `runner_id` from the runner's history for an automated task.
    pub async fn resume_task(
        &self,
        task_id: TaskId,
        runner_id: &RunnerTaskId,
        sink: Sender<TaskMessage, ()>,
        lease: LeaseToken,
    ) -> Result<()> {
        self.set_pending(task_id, sink, lease);
        match self.runner.resume_task(runner_id).await {
            Ok(()) => {
                self.bind_if_pending(runner_id);
                Ok(())
            }
            Err(e) => {
                lock(&self.state).pending = None;
                Err(e)
            }
        }
    }

    pub async fn can_resume_task(&self, runner_id: &RunnerTaskId) -> bool {
        self.runner.is_task_in_history(runner_id).await
    }

    /// Requests an abort of the whole runner stack.
    ///
    /// Completion is reported separately through `RootTaskEnded`.
    pub async fn abort_task_stack(&self) -> Result<()> {
        let depth = self.runner.current_task_stack().len();
        if depth > 0 {
            info!(depth, "Aborting runner task stack");
        }
        for _ in 0..depth {
            if self.runner.current_task_stack().is_empty() {
                break;
            }
            self.runner.clear_current_task().await?;
        }
        Ok(())
    }

    fn set_pending(&self, task_id: TaskId, sink: Sender<TaskMessage, ()>, lease: LeaseToken) {
        let mut state = lock(&self.state);
        if let Some(stale) = state.pending.replace(PendingStart {
            task_id,
            sink,
            lease,
        }) {
            warn!(task_id = %stale.task_id, "Replacing unclaimed pending start");
        }
    }

    /// Binds the start directly if the created event has not claimed it yet.
    fn bind_if_pending(&self, id: &RunnerTaskId) {
        let mut state = lock(&self.state);
        if state.owners.contains_key(id) {
            return;
        }
        let Some(pending) = state.pending.take() else {
            return;
        };
        let event = Self::bind_automated(&mut state, id.clone(), pending);
        drop(state);
        self.emit(event);
    }
}
