//! Long-poll dispatcher.
//!
//! Each poll parks on a `tasks` subscription and a single deadline timer,
//! with no other per-poll work, so thousands of outstanding polls are cheap.
//! Claims happen at the store, so two concurrent polls for one host can
//! never receive the same task; a spurious wake that loses the claim race
//! simply resumes waiting. Dropping the future (client disconnect) drops
//! the subscription and consumes nothing.

use std::time::Duration;

use phoenix_bus::{DomainEvent, Topic};
use phoenix_core::{Result, Task};

use crate::state::AppState;

/// Wait up to `max_wait` for a claimable task for `host_id`.
///
/// Returns `None` when the deadline elapses with nothing claimable.
pub async fn poll_task(state: &AppState, host_id: &str, max_wait: Duration) -> Result<Option<Task>> {
    // Subscribe before the first claim so an enqueue between the claim and
    // the park cannot be missed.
    let mut sub = state.bus.subscribe(Topic::Tasks);

    if let Some(task) = state.queue.claim_one(host_id).await? {
        return Ok(Some(task));
    }

    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return Ok(None),
            event = sub.recv() => {
                match event {
                    Some(DomainEvent::TaskEnqueued { host_id: target, .. })
                        if target == host_id || target == "*" =>
                    {
                        // One claim attempt per wake; losing the race to a
                        // concurrent poll just means we park again.
                        if let Some(task) = state.queue.claim_one(host_id).await? {
                            return Ok(Some(task));
                        }
                    }
                    Some(_) => {} // other host or a status change; keep waiting
                    None => return Ok(None), // bus gone: shutting down
                }
            }
        }
    }
}

/// Parse the `max_wait` query value: plain seconds (`"30"`) or with the
/// `s` suffix (`"30s"`), clamped to the configured ceiling.
pub fn parse_max_wait(raw: Option<&str>, ceiling: Duration) -> Duration {
    let requested = raw
        .map(|s| s.trim().trim_end_matches('s'))
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(ceiling);
    requested.min(ceiling)
}

// ── Tests ────────────────────────────────────────────────────────────
