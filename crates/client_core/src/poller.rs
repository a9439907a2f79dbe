use std::{sync::Arc, time::Duration};

use shared::{
    domain::{Todo, TodoId},
    protocol::UpdateTodoRequest,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    gateway::{ErrorClass, GatewayError, TodoGateway},
    store::{EntityStore, StoreEntry},
};

/// Confirmation read budget: `max_attempts` reads, with
/// `min(base_delay * 2^(k-1), cap_delay)` between read `k` and read `k+1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(16),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, cap_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            cap_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.cap_delay, |delay| delay.min(self.cap_delay))
    }

    /// Upper bound on time spent sleeping across a whole run.
    pub fn total_budget(&self) -> Duration {
        (1..=self.max_attempts).map(|attempt| self.delay_for(attempt)).sum()
    }
}

/// The effect a confirmation read is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// A created entity shows up under its canonical id.
    Appears,
    /// The entity carries every field of the patch.
    Reflects(UpdateTodoRequest),
    /// The entity is gone.
    Disappears,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollFailure {
    #[error("backend did not confirm the change after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("confirmation read failed: {0}")]
    Aborted(GatewayError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The effect is visible. Carries the canonical entity unless it was a delete.
    Confirmed(Option<Todo>),
    /// A later operation on the same slot took over; the store was not touched.
    Cancelled,
    Failed(PollFailure),
}

/// One outstanding confirmation: what to read, what to expect, how long to keep trying.
#[derive(Debug)]
pub struct PollTask {
    target: TodoId,
    placeholder: TodoId,
    expectation: Expectation,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    attempts: u32,
}

impl PollTask {
    pub fn new(
        target: TodoId,
        placeholder: TodoId,
        expectation: Expectation,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            target,
            placeholder,
            expectation,
            policy,
            cancel: CancellationToken::new(),
            attempts: 0,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

enum Observation {
    Observed(Option<Todo>),
    NotYet(&'static str),
    Fatal(GatewayError),
}

fn observe(expectation: &Expectation, read: Result<Todo, GatewayError>) -> Observation {
    match (expectation, read) {
        (Expectation::Appears, Ok(todo)) => Observation::Observed(Some(todo)),
        (Expectation::Reflects(patch), Ok(todo)) => {
            if patch.is_reflected_by(&todo) {
                Observation::Observed(Some(todo))
            } else {
                Observation::NotYet("patch not applied yet")
            }
        }
        (Expectation::Disappears, Ok(_)) => Observation::NotYet("entity still present"),
        (Expectation::Disappears, Err(err)) if err.class() == ErrorClass::NotFound => {
            Observation::Observed(None)
        }
        (_, Err(err)) => match err.class() {
            ErrorClass::NotFound => Observation::NotYet("entity not visible yet"),
            ErrorClass::Transient => Observation::NotYet("transient read failure"),
            ErrorClass::Fatal => Observation::Fatal(err),
        },
    }
}

/// Reads canonical state until an acknowledged mutation becomes visible.
///
/// On confirmation of a create or update the poller itself swaps the
/// placeholder for the canonical entity; deletes are left to the caller.
pub struct ReconciliationPoller {
    gateway: Arc<dyn TodoGateway>,
    store: EntityStore,
}

impl ReconciliationPoller {
    pub fn new(gateway: Arc<dyn TodoGateway>, store: EntityStore) -> Self {
        Self { gateway, store }
    }

    pub async fn run(&self, mut task: PollTask) -> PollOutcome {
        while task.attempts < task.policy.max_attempts {
            task.attempts += 1;

            let read = tokio::select! {
                biased;
                _ = task.cancel.cancelled() => return cancelled(&task),
                read = self.gateway.get(&task.target) => read,
            };

            match observe(&task.expectation, read) {
                Observation::Observed(todo) => return self.confirm(&task, todo).await,
                Observation::NotYet(reason) => debug!(
                    todo_id = %task.target,
                    attempt = task.attempts,
                    max_attempts = task.policy.max_attempts,
                    reason,
                    "poll: effect not observed"
                ),
                Observation::Fatal(err) => {
                    warn!(
                        todo_id = %task.target,
                        attempt = task.attempts,
                        %err,
                        "poll: confirmation read rejected; giving up"
                    );
                    return PollOutcome::Failed(PollFailure::Aborted(err));
                }
            }

            if task.attempts < task.policy.max_attempts {
                let delay = task.policy.delay_for(task.attempts);
                tokio::select! {
                    biased;
                    _ = task.cancel.cancelled() => return cancelled(&task),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        warn!(
            todo_id = %task.target,
            attempts = task.attempts,
            "poll: attempt budget exhausted"
        );
        PollOutcome::Failed(PollFailure::Exhausted {
            attempts: task.attempts,
        })
    }

    async fn confirm(&self, task: &PollTask, todo: Option<Todo>) -> PollOutcome {
        if task.cancel.is_cancelled() {
            return cancelled(task);
        }

        let Some(todo) = todo else {
            info!(todo_id = %task.target, attempt = task.attempts, "poll: absence confirmed");
            return PollOutcome::Confirmed(None);
        };

        let placeholder = &task.placeholder;
        let canonical = &todo.id;
        let swapped = self
            .store
            .replace(
                |entry| {
                    &entry.todo.id == placeholder
                        || (!entry.is_placeholder() && &entry.todo.id == canonical)
                },
                StoreEntry::canonical(todo.clone()),
            )
            .await;

        if !swapped {
            // The placeholder was already replaced by a later operation.
            return cancelled(task);
        }

        info!(
            todo_id = %task.target,
            placeholder_id = %task.placeholder,
            attempt = task.attempts,
            "poll: change confirmed"
        );
        PollOutcome::Confirmed(Some(todo))
    }
}

fn cancelled(task: &PollTask) -> PollOutcome {
    info!(
        todo_id = %task.target,
        attempt = task.attempts,
        "poll: cancelled by a newer operation"
    );
    PollOutcome::Cancelled
}

#[cfg(test)]
#[path = "tests/poller_tests.rs"]
mod tests;
