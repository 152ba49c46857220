use std::time::Duration;

use tokio::time::{self, Instant};

use crate::{repository::Domain, VirtscopeResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a readiness poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The domain reported active.
    Active,

    /// The deadline passed while the domain still reported inactive.
    TimedOut,

    /// The domain was not started, so there was nothing to wait for.
    Skipped,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Polls a domain's active flag until it reports active or `timeout` has passed since `since`.
///
/// The flag is checked at least once. Between checks the task sleeps for `interval`, cut short
/// so the last check lands on the deadline.
pub async fn wait_until_active(
    domain: &Domain,
    timeout: Duration,
    interval: Duration,
    since: Instant,
) -> VirtscopeResult<Readiness> {
    // A timeout too large to represent never expires.
    let deadline = since.checked_add(timeout);
    let mut polls = 0u32;

    loop {
        let probe = domain.clone();
        let active = tokio::task::spawn_blocking(move || probe.is_active()).await??;
        polls += 1;

        if active {
            tracing::debug!("domain {} active after {} polls", domain.name(), polls);
            return Ok(Readiness::Active);
        }

        let pause = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!(
                        "domain {} not active after {:?} ({} polls)",
                        domain.name(),
                        timeout,
                        polls
                    );
                    return Ok(Readiness::TimedOut);
                }
                interval.min(deadline - now)
            }
            None => interval,
        };

        tracing::debug!("domain {} not active yet, poll {}", domain.name(), polls);
        time::sleep(pause).await;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
