use std::sync::Arc;

use shared::domain::{Todo, TodoId};
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use crate::ClientEvent;

/// One visible row: the entity plus, for placeholders, the canonical id it stands in for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub todo: Todo,
    pub stands_for: Option<TodoId>,
}

impl StoreEntry {
    pub fn canonical(todo: Todo) -> Self {
        Self {
            todo,
            stands_for: None,
        }
    }

    pub fn placeholder(todo: Todo, stands_for: Option<TodoId>) -> Self {
        Self { todo, stands_for }
    }

    pub fn is_placeholder(&self) -> bool {
        self.todo.id.is_placeholder()
    }

    /// Whether this row holds the logical slot of `id`.
    pub fn occupies(&self, id: &TodoId) -> bool {
        &self.todo.id == id || self.stands_for.as_ref() == Some(id)
    }
}

/// The client-visible ordered list. Every transform runs under one write lock,
/// so observers never see half of a swap.
#[derive(Clone)]
pub struct EntityStore {
    entries: Arc<RwLock<Vec<StoreEntry>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl EntityStore {
    pub fn new(events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    /// Appends `entry`. Callers guarantee the id is not already present.
    pub async fn insert(&self, entry: StoreEntry) -> bool {
        let mut guard = self.entries.write().await;
        if guard.iter().any(|existing| existing.todo.id == entry.todo.id) {
            warn!(todo_id = %entry.todo.id, "store: refusing duplicate insert");
            return false;
        }
        guard.push(entry);
        self.publish(&guard);
        true
    }

    pub async fn remove_where(&self, predicate: impl Fn(&StoreEntry) -> bool) -> Vec<StoreEntry> {
        let mut guard = self.entries.write().await;
        let (removed, kept): (Vec<_>, Vec<_>) = guard.drain(..).partition(|entry| predicate(entry));
        *guard = kept;
        if !removed.is_empty() {
            self.publish(&guard);
        }
        removed
    }

    /// Removes every match and puts `entry` where the first match was, in one step.
    /// Returns `false` and leaves the list untouched when nothing matches.
    pub async fn replace(&self, predicate: impl Fn(&StoreEntry) -> bool, entry: StoreEntry) -> bool {
        let mut guard = self.entries.write().await;
        let Some(position) = guard.iter().position(|existing| predicate(existing)) else {
            return false;
        };

        let mut index = 0;
        guard.retain(|existing| {
            let keep = index == position || !predicate(existing);
            index += 1;
            keep
        });
        guard[position] = entry;
        self.publish(&guard);
        true
    }

    pub async fn snapshot(&self) -> Vec<Todo> {
        visible(&self.entries.read().await)
    }

    pub async fn entries(&self) -> Vec<StoreEntry> {
        self.entries.read().await.clone()
    }

    pub async fn find_slot(&self, id: &TodoId) -> Option<StoreEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|entry| entry.occupies(id))
            .cloned()
    }

    /// Swaps in a fresh canonical list. Placeholders stay, and canonical rows
    /// whose slot a placeholder currently holds are left out.
    pub async fn load(&self, canonical: Vec<Todo>) {
        let mut guard = self.entries.write().await;
        let placeholders: Vec<StoreEntry> = guard
            .drain(..)
            .filter(StoreEntry::is_placeholder)
            .collect();

        let mut next: Vec<StoreEntry> = canonical
            .into_iter()
            .filter(|todo| !placeholders.iter().any(|entry| entry.occupies(&todo.id)))
            .map(StoreEntry::canonical)
            .collect();
        next.extend(placeholders);

        *guard = next;
        self.publish(&guard);
    }

    fn publish(&self, entries: &[StoreEntry]) {
        let _ = self.events.send(ClientEvent::TodosChanged(visible(entries)));
    }
}

fn visible(entries: &[StoreEntry]) -> Vec<Todo> {
    entries.iter().map(|entry| entry.todo.clone()).collect()
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
