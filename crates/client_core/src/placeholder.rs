use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use shared::domain::{TodoId, PLACEHOLDER_PREFIX};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// A fresh placeholder id: `temp-<unix-millis>-<seq>`.
///
/// The sequence number is process-wide, so two ids minted within the same
/// millisecond still differ.
pub fn next_placeholder_id() -> TodoId {
    let millis = Utc::now().timestamp_millis();
    let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    TodoId(format!("{PLACEHOLDER_PREFIX}{millis}-{sequence}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_are_unique_within_one_tick() {
        let ids: HashSet<TodoId> = (0..1_000).map(|_| next_placeholder_id()).collect();
        assert_eq!(ids.len(), 1_000);
        assert!(ids.iter().all(TodoId::is_placeholder));
    }

    #[test]
    fn canonical_ids_are_never_placeholders() {
        for canonical in ["42", "7", "0", "tempest", "temp"] {
            assert!(!TodoId::from(canonical).is_placeholder());
        }
    }
}
