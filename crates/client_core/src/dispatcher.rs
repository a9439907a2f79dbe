use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use chrono::Utc;
use shared::{
    domain::{Todo, TodoId, TodoStatus},
    protocol::{CreateTodoRequest, OperationAck, UpdateTodoRequest},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    gateway::{GatewayError, TodoGateway},
    placeholder::next_placeholder_id,
    poller::{
        BackoffPolicy, Expectation, PollFailure, PollOutcome, PollTask, ReconciliationPoller,
    },
    store::{EntityStore, StoreEntry},
    ClientEvent,
};

const CREATE_FAILED: &str = "Failed to add todo";
const UPDATE_FAILED: &str = "Failed to update todo";
const DELETE_FAILED: &str = "Failed to delete todo";
const LOAD_FAILED: &str = "Failed to load todos";

/// A user intent, dispatched through [`TodoDispatcher::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TodoCommand {
    Load,
    Create(CreateTodoRequest),
    Update { id: TodoId, patch: UpdateTodoRequest },
    Toggle { id: TodoId },
    Delete { id: TodoId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    EmptyTitle,
    CreateInFlight,
    NotFound,
    /// The target has not been confirmed by the backend yet.
    NotConfirmed,
    Deleting,
    EmptyPatch,
    /// Patches may only carry steady states.
    TransientStatus,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("backend rejected the request: {0}")]
    Rejected(GatewayError),
    #[error(transparent)]
    Unconfirmed(#[from] PollFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The backend applied the change. Creates and updates carry the canonical entity.
    Confirmed(Option<Todo>),
    Ignored(IgnoreReason),
    /// A later operation on the same entity took over before this one settled.
    Superseded,
    /// Rolled back; `message` is what the user was shown.
    Failed {
        message: String,
        cause: DispatchError,
    },
}

impl CommandOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

/// The operation currently owning a canonical id's slot.
struct InFlight {
    op: u64,
    cancel: CancellationToken,
    /// Last state the backend confirmed; what a rollback restores.
    baseline: Todo,
    /// What the slot should hold once this operation lands.
    intended: Todo,
}

/// Handle the mutating flow keeps while its operation is outstanding.
struct Claim {
    op: u64,
    cancel: CancellationToken,
    placeholder_id: TodoId,
}

/// Clears the single-create flag however the create flow ends.
struct CreateGuard<'a>(&'a AtomicBool);

impl<'a> CreateGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CreateGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sequences optimistic mutations: placeholder into the store, call the
/// gateway, hand off to the poller, then confirm or roll back.
pub struct TodoDispatcher {
    gateway: Arc<dyn TodoGateway>,
    store: EntityStore,
    poller: ReconciliationPoller,
    policy: BackoffPolicy,
    create_in_flight: AtomicBool,
    in_flight: Mutex<HashMap<TodoId, InFlight>>,
    next_op: AtomicU64,
    last_error: RwLock<Option<String>>,
    events: broadcast::Sender<ClientEvent>,
}

impl TodoDispatcher {
    pub fn new(gateway: Arc<dyn TodoGateway>, policy: BackoffPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Self::new_with_events(gateway, policy, events)
    }

    pub fn new_with_events(
        gateway: Arc<dyn TodoGateway>,
        policy: BackoffPolicy,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let store = EntityStore::new(events.clone());
        Arc::new(Self {
            poller: ReconciliationPoller::new(Arc::clone(&gateway), store.clone()),
            gateway,
            store,
            policy,
            create_in_flight: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
            next_op: AtomicU64::new(1),
            last_error: RwLock::new(None),
            events,
        })
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Number of update/delete operations that have not settled yet.
    pub async fn outstanding(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn dispatch(&self, command: TodoCommand) -> CommandOutcome {
        match command {
            TodoCommand::Load => self.load().await,
            TodoCommand::Create(input) => self.create_with(input).await,
            TodoCommand::Update { id, patch } => self.update(&id, patch).await,
            TodoCommand::Toggle { id } => self.toggle(&id).await,
            TodoCommand::Delete { id } => self.delete(&id).await,
        }
    }

    pub async fn load(&self) -> CommandOutcome {
        match self.gateway.list().await {
            Ok(todos) => {
                info!(count = todos.len(), "todos: list loaded");
                self.store.load(todos).await;
                self.succeed(None).await
            }
            Err(err) => {
                self.store.load(Vec::new()).await;
                self.fail(LOAD_FAILED, DispatchError::Rejected(err)).await
            }
        }
    }

    pub async fn create(&self, title: &str) -> CommandOutcome {
        self.create_with(CreateTodoRequest::titled(title)).await
    }

    pub async fn create_with(&self, mut input: CreateTodoRequest) -> CommandOutcome {
        input.title = input.title.trim().to_string();
        if input.title.is_empty() {
            return CommandOutcome::Ignored(IgnoreReason::EmptyTitle);
        }

        let Some(_guard) = CreateGuard::acquire(&self.create_in_flight) else {
            info!(title = %input.title, "todos: create already in flight; ignoring");
            return CommandOutcome::Ignored(IgnoreReason::CreateInFlight);
        };

        let now = Utc::now();
        let placeholder = Todo {
            id: next_placeholder_id(),
            title: input.title.clone(),
            description: input.description.clone(),
            status: TodoStatus::Creating,
            priority: input.priority.unwrap_or_default(),
            due_date: input.due_date,
            created_at: now,
            updated_at: now,
        };
        let placeholder_id = placeholder.id.clone();
        self.store
            .insert(StoreEntry::placeholder(placeholder.clone(), None))
            .await;
        info!(placeholder_id = %placeholder_id, title = %input.title, "todos: create started");

        let ack = match self.gateway.create(&input).await.and_then(checked_ack) {
            Ok(ack) => ack,
            Err(err) => {
                return self
                    .abandon_create(&placeholder_id, DispatchError::Rejected(err))
                    .await
            }
        };

        // The placeholder now holds the acknowledged slot.
        let canonical_id = &ack.todo_id;
        self.store
            .replace(
                |entry| {
                    entry.todo.id == placeholder_id
                        || (!entry.is_placeholder() && &entry.todo.id == canonical_id)
                },
                StoreEntry::placeholder(placeholder, Some(canonical_id.clone())),
            )
            .await;

        let task = PollTask::new(
            ack.todo_id,
            placeholder_id.clone(),
            Expectation::Appears,
            self.policy,
        );
        match self.poller.run(task).await {
            PollOutcome::Confirmed(todo) => self.succeed(todo).await,
            PollOutcome::Cancelled => CommandOutcome::Superseded,
            PollOutcome::Failed(failure) => {
                self.abandon_create(&placeholder_id, failure.into()).await
            }
        }
    }

    pub async fn toggle(&self, id: &TodoId) -> CommandOutcome {
        self.update_with(id, |current| {
            Ok(UpdateTodoRequest::status(current.status.toggled()))
        })
        .await
    }

    pub async fn update(&self, id: &TodoId, patch: UpdateTodoRequest) -> CommandOutcome {
        if patch.is_empty() {
            return CommandOutcome::Ignored(IgnoreReason::EmptyPatch);
        }
        if patch.status.is_some_and(TodoStatus::is_transient) {
            return CommandOutcome::Ignored(IgnoreReason::TransientStatus);
        }
        self.update_with(id, move |_| Ok(patch)).await
    }

    async fn update_with(
        &self,
        id: &TodoId,
        build: impl FnOnce(&Todo) -> Result<UpdateTodoRequest, IgnoreReason>,
    ) -> CommandOutcome {
        let claimed = self
            .claim(id, |current| {
                let patch = build(current)?;
                let status = match patch.status {
                    Some(TodoStatus::Completed) if current.status != TodoStatus::Completed => {
                        TodoStatus::Completing
                    }
                    _ => TodoStatus::Updating,
                };
                Ok((patch.apply_to(current), status, patch))
            })
            .await;
        let (claim, patch) = match claimed {
            Ok(claimed) => claimed,
            Err(reason) => return CommandOutcome::Ignored(reason),
        };

        let acked = self.gateway.update(id, &patch).await.and_then(checked_ack);
        if claim.cancel.is_cancelled() {
            return CommandOutcome::Superseded;
        }
        if let Err(err) = acked {
            return self
                .roll_back(id, &claim, UPDATE_FAILED, DispatchError::Rejected(err))
                .await;
        }

        let task = PollTask::new(
            id.clone(),
            claim.placeholder_id.clone(),
            Expectation::Reflects(patch),
            self.policy,
        )
        .with_cancellation(claim.cancel.clone());
        match self.poller.run(task).await {
            PollOutcome::Confirmed(todo) => {
                self.release(id, &claim).await;
                self.succeed(todo).await
            }
            PollOutcome::Cancelled => CommandOutcome::Superseded,
            PollOutcome::Failed(failure) => {
                self.roll_back(id, &claim, UPDATE_FAILED, failure.into())
                    .await
            }
        }
    }

    pub async fn delete(&self, id: &TodoId) -> CommandOutcome {
        let claim = match self
            .claim(id, |current| Ok((current.clone(), TodoStatus::Deleting, ())))
            .await
        {
            Ok((claim, ())) => claim,
            Err(reason) => return CommandOutcome::Ignored(reason),
        };

        let acked = self.gateway.delete(id).await.and_then(checked_ack);
        if claim.cancel.is_cancelled() {
            return CommandOutcome::Superseded;
        }
        if let Err(err) = acked {
            return self
                .roll_back(id, &claim, DELETE_FAILED, DispatchError::Rejected(err))
                .await;
        }

        let task = PollTask::new(
            id.clone(),
            claim.placeholder_id.clone(),
            Expectation::Disappears,
            self.policy,
        )
        .with_cancellation(claim.cancel.clone());
        match self.poller.run(task).await {
            PollOutcome::Confirmed(_) => {
                let mut in_flight = self.in_flight.lock().await;
                if !owns_slot(&in_flight, id, &claim) {
                    return CommandOutcome::Superseded;
                }
                in_flight.remove(id);
                self.store.remove_where(|entry| entry.occupies(id)).await;
                drop(in_flight);
                info!(todo_id = %id, "todos: delete confirmed");
                self.succeed(None).await
            }
            PollOutcome::Cancelled => CommandOutcome::Superseded,
            PollOutcome::Failed(failure) => {
                self.roll_back(id, &claim, DELETE_FAILED, failure.into())
                    .await
            }
        }
    }

    /// Takes over the slot of `id`: cancels whatever operation held it and swaps
    /// in a placeholder built from the slot's intended state.
    ///
    /// `plan` receives the state the slot is heading towards and returns the
    /// new intended state, the transient status to show meanwhile, and
    /// whatever the caller needs to carry on.
    async fn claim<T>(
        &self,
        id: &TodoId,
        plan: impl FnOnce(&Todo) -> Result<(Todo, TodoStatus, T), IgnoreReason>,
    ) -> Result<(Claim, T), IgnoreReason> {
        if id.is_placeholder() {
            return Err(IgnoreReason::NotConfirmed);
        }

        let mut in_flight = self.in_flight.lock().await;
        let entry = self
            .store
            .find_slot(id)
            .await
            .ok_or(IgnoreReason::NotFound)?;
        match entry.todo.status {
            TodoStatus::Creating => return Err(IgnoreReason::NotConfirmed),
            TodoStatus::Deleting => return Err(IgnoreReason::Deleting),
            _ => {}
        }

        // A canonical row means the slot's last operation already landed,
        // even if its registry entry has not been released yet.
        let (baseline, current) = match in_flight.get(id) {
            Some(prior) if entry.is_placeholder() => {
                (prior.baseline.clone(), prior.intended.clone())
            }
            _ => (entry.todo.clone(), entry.todo.clone()),
        };
        let (intended, status, carried) = plan(&current)?;

        if let Some(prior) = in_flight.remove(id) {
            prior.cancel.cancel();
            info!(todo_id = %id, superseded_op = prior.op, "todos: superseding outstanding operation");
        }

        let placeholder = Todo {
            id: next_placeholder_id(),
            status,
            ..intended.clone()
        };
        let claim = Claim {
            op: self.next_op.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
            placeholder_id: placeholder.id.clone(),
        };
        in_flight.insert(
            id.clone(),
            InFlight {
                op: claim.op,
                cancel: claim.cancel.clone(),
                baseline,
                intended,
            },
        );
        self.store
            .replace(
                |existing| existing.occupies(id),
                StoreEntry::placeholder(placeholder, Some(id.clone())),
            )
            .await;
        info!(
            todo_id = %id,
            placeholder_id = %claim.placeholder_id,
            op = claim.op,
            ?status,
            "todos: optimistic change applied"
        );

        Ok((claim, carried))
    }

    /// Drops the registry entry for a settled operation, if it still owns the slot.
    async fn release(&self, id: &TodoId, claim: &Claim) {
        let mut in_flight = self.in_flight.lock().await;
        if owns_slot(&in_flight, id, claim) {
            in_flight.remove(id);
        }
    }

    async fn roll_back(
        &self,
        id: &TodoId,
        claim: &Claim,
        message: &str,
        cause: DispatchError,
    ) -> CommandOutcome {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !owns_slot(&in_flight, id, claim) {
                return CommandOutcome::Superseded;
            }
            let Some(settled) = in_flight.remove(id) else {
                return CommandOutcome::Superseded;
            };
            let placeholder_id = &claim.placeholder_id;
            self.store
                .replace(
                    |entry| &entry.todo.id == placeholder_id,
                    StoreEntry::canonical(settled.baseline),
                )
                .await;
        }
        warn!(todo_id = %id, op = claim.op, %cause, "todos: change rolled back");
        self.fail(message, cause).await
    }

    async fn abandon_create(&self, placeholder_id: &TodoId, cause: DispatchError) -> CommandOutcome {
        self.store
            .remove_where(|entry| &entry.todo.id == placeholder_id)
            .await;
        warn!(placeholder_id = %placeholder_id, %cause, "todos: create abandoned");
        self.fail(CREATE_FAILED, cause).await
    }

    async fn succeed(&self, todo: Option<Todo>) -> CommandOutcome {
        let had_error = self.last_error.write().await.take().is_some();
        if had_error {
            let _ = self.events.send(ClientEvent::ErrorCleared);
        }
        CommandOutcome::Confirmed(todo)
    }

    async fn fail(&self, message: &str, cause: DispatchError) -> CommandOutcome {
        error!(%cause, "{message}");
        *self.last_error.write().await = Some(message.to_string());
        let _ = self.events.send(ClientEvent::Error(message.to_string()));
        CommandOutcome::Failed {
            message: message.to_string(),
            cause,
        }
    }
}

fn owns_slot(in_flight: &HashMap<TodoId, InFlight>, id: &TodoId, claim: &Claim) -> bool {
    in_flight.get(id).is_some_and(|current| current.op == claim.op)
}

fn checked_ack(ack: OperationAck) -> Result<OperationAck, GatewayError> {
    if ack.todo_id.is_placeholder() {
        return Err(GatewayError::InvalidResponse(format!(
            "acknowledged id '{}' collides with the placeholder id space",
            ack.todo_id
        )));
    }
    Ok(ack)
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
