//! Canonical event topic constants published by the snaps controller.
//!
//! Hosts subscribe to these on the event bus to drive UI and bookkeeping.
//! Keep this list alphabetized within sections and favor dot.case names.

// Install / update lifecycle
pub const TOPIC_SNAP_ADDED: &str = "snaps.added";
pub const TOPIC_SNAP_INSTALLED: &str = "snaps.installed";
pub const TOPIC_SNAP_REMOVED: &str = "snaps.removed";
pub const TOPIC_SNAP_ROLLED_BACK: &str = "snaps.rolled_back";
pub const TOPIC_SNAP_UPDATED: &str = "snaps.updated";

// Enablement / registry verdicts
pub const TOPIC_SNAP_BLOCKED: &str = "snaps.blocked";
pub const TOPIC_SNAP_DISABLED: &str = "snaps.disabled";
pub const TOPIC_SNAP_ENABLED: &str = "snaps.enabled";
pub const TOPIC_SNAP_UNBLOCKED: &str = "snaps.unblocked";

// Execution sessions
pub const TOPIC_SNAP_CRASHED: &str = "snaps.crashed";
pub const TOPIC_SNAP_STARTED: &str = "snaps.started";
pub const TOPIC_SNAP_TERMINATED: &str = "snaps.terminated";

// Controller document
pub const TOPIC_SNAP_STATE_CHANGED: &str = "snaps.state.changed";

/// Every topic above, for subscribers that want to filter by prefix or assert coverage.
pub const ALL_TOPICS: &[&str] = &[
    TOPIC_SNAP_ADDED,
    TOPIC_SNAP_INSTALLED,
    TOPIC_SNAP_REMOVED,
    TOPIC_SNAP_ROLLED_BACK,
    TOPIC_SNAP_UPDATED,
    TOPIC_SNAP_BLOCKED,
    TOPIC_SNAP_DISABLED,
    TOPIC_SNAP_ENABLED,
    TOPIC_SNAP_UNBLOCKED,
    TOPIC_SNAP_CRASHED,
    TOPIC_SNAP_STARTED,
    TOPIC_SNAP_TERMINATED,
    TOPIC_SNAP_STATE_CHANGED,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn topics_are_unique_and_namespaced() {
        let unique: HashSet<&str> = ALL_TOPICS.iter().copied().collect();
        assert_eq!(unique.len(), ALL_TOPICS.len());
        assert!(ALL_TOPICS.iter().all(|t| t.starts_with("snaps.")));
    }
}
