//! Per-item failure isolation.
//!
//! Every item in a batch (an ingested row, a geocoded record) goes through
//! [`isolate`], so a failure is recorded against that item and never
//! aborts its siblings.

use std::fmt::Display;

/// Result of processing one item of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome<T> {
    /// The item was processed.
    Success(T),
    /// The item failed; the batch carries on.
    Failed {
        /// Identifies the item in logs (e.g. `"row 12"`).
        label: String,
        /// Why it failed.
        message: String,
    },
}

impl<T> ItemOutcome<T> {
    /// Records a failure for `label`.
    #[must_use]
    pub fn failed(label: impl Into<String>, message: impl Display) -> Self {
        let label = label.into();
        let message = message.to_string();
        log::warn!("{label} failed: {message}");
        Self::Failed { label, message }
    }

    /// Returns `true` for [`ItemOutcome::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The value, if the item succeeded.
    #[must_use]
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failed { .. } => None,
        }
    }

    /// The failure message, if the item failed.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Failed { message, .. } => Some(message),
        }
    }
}

/// Converts one item's `result` into an [`ItemOutcome`], logging failures.
pub fn isolate<T, E: Display>(label: impl Into<String>, result: Result<T, E>) -> ItemOutcome<T> {
    match result {
        Ok(value) => ItemOutcome::Success(value),
        Err(e) => ItemOutcome::failed(label, e),
    }
}

/// Counts successes and failures across `outcomes`.
#[must_use]
pub fn tally<T>(outcomes: &[ItemOutcome<T>]) -> (u64, u64) {
    outcomes.iter().fold((0, 0), |(ok, failed), outcome| {
        if outcome.is_success() {
            (ok + 1, failed)
        } else {
            (ok, failed + 1)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_keep_their_label_and_message() {
        let outcome: ItemOutcome<u32> = isolate("row 3", Err::<u32, _>("bad website"));
        assert_eq!(outcome.error(), Some("bad website"));
        assert_eq!(
            outcome,
            ItemOutcome::Failed {
                label: "row 3".to_string(),
                message: "bad website".to_string(),
            }
        );
    }

    #[test]
    fn one_failure_does_not_hide_the_others() {
        let outcomes: Vec<ItemOutcome<u32>> = vec![
            isolate("a", Ok::<_, String>(1)),
            isolate("b", Err("boom".to_string())),
            isolate("c", Ok::<_, String>(3)),
        ];
        assert_eq!(tally(&outcomes), (2, 1));
        let values: Vec<u32> = outcomes.into_iter().filter_map(ItemOutcome::ok).collect();
        assert_eq!(values, vec![1, 3]);
    }
}
