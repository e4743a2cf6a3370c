//! Prefixed ID generation.
//!
//! All entity IDs use a `prefix_` followed by a UUIDv7 (time-ordered), so
//! they sort by creation time and identify their type in logs and rows.

use uuid::Uuid;

/// Generate a prefixed ID using UUIDv7.
fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate a stored speed test result ID: `spt_<uuid7>`
pub fn speed_test_id() -> String {
    prefixed_id("spt")
}

/// Generate an orchestrated run ID: `run_<uuid7>`
pub fn run_id() -> String {
    prefixed_id("run")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_correct_prefix() {
        assert!(speed_test_id().starts_with("spt_"));
        assert!(run_id().starts_with("run_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = speed_test_id();
        let b = speed_test_id();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_are_sortable_by_time() {
        let a = run_id();
        let b = run_id();
        // UUIDv7 embeds the timestamp first, same prefix
        assert!(b > a, "Expected {b} > {a}");
    }
}
