//! Prefixed ID generation.
//!
//! Session IDs use a `ses_` prefix followed by a UUIDv7 (time-ordered), so
//! they are globally unique within a process, sortable by creation time, and
//! easy to pick out of gateway logs.

use uuid::Uuid;

/// Generate a prefixed ID using UUIDv7.
fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate a gateway session ID: `ses_<uuid7>`
pub fn session_id() -> String {
    prefixed_id("ses")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_have_prefix() {
        assert!(session_id().starts_with("ses_"));
    }

    #[test]
    fn session_ids_are_unique_and_sortable() {
        let a = session_id();
        let b = session_id();
        assert_ne!(a, b);
        assert!(b > a, "Expected {b} > {a}");
    }
}
