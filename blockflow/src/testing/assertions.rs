//! Test assertions for stage output.

use crate::stream::{ExecutionStatus, StreamedValue};

/// Counts values with the given status.
pub fn count_status<T>(values: &[StreamedValue<T>], status: ExecutionStatus) -> usize {
    values.iter().filter(|v| v.status() == status).count()
}

/// Asserts that every value succeeded.
pub fn assert_all_succeeded<T: std::fmt::Debug>(values: &[StreamedValue<T>]) {
    let failed: Vec<_> = values.iter().filter(|v| !v.is_succeeded()).collect();
    assert!(failed.is_empty(), "Expected every item to succeed, got: {failed:?}");
}

/// Asserts the number of values with the given status.
pub fn assert_status_count<T>(values: &[StreamedValue<T>], status: ExecutionStatus, expected: usize) {
    let actual = count_status(values, status);
    assert_eq!(
        actual, expected,
        "Expected {expected} values with status {status}, got {actual}"
    );
}

/// Returns the items of the values, sorted.
pub fn sorted_items<T: Clone + Ord>(values: &[StreamedValue<T>]) -> Vec<T> {
    let mut items: Vec<T> = values.iter().map(|v| v.item().clone()).collect();
    items.sort();
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ItemError;

    #[test]
    fn test_counts_and_items() {
        let values = vec![
            StreamedValue::succeeded(3),
            StreamedValue::faulted(1, ItemError::failed("x")),
            StreamedValue::not_executed(2),
        ];
        assert_status_count(&values, ExecutionStatus::Faulted, 1);
        assert_eq!(count_status(&values, ExecutionStatus::Canceled), 1);
        assert_eq!(sorted_items(&values), vec![1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "Expected every item to succeed")]
    fn test_assert_all_succeeded_panics() {
        assert_all_succeeded(&[StreamedValue::faulted(1, ItemError::failed("x"))]);
    }
}
