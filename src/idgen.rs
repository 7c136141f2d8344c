//! Process-wide id allocation for nodes.
//!
//! The counter starts at zero, is monotonic and never reuses a value, so
//! every node created during the lifetime of the process gets a distinct
//! `uid` even when callers choose identical string ids.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UID: AtomicU64 = AtomicU64::new(0);

/// Allocate the next node uid.
pub fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// Resolve a node's string id: the explicit one if given, else `<prefix>-<uid>`.
pub fn id_or_default(id: Option<String>, prefix: &str, uid: u64) -> String {
    id.unwrap_or_else(|| format!("{prefix}-{uid}"))
}
