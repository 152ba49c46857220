use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    runtime::{Handle, RuntimeFlavor},
    time::Instant,
};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::{
    config::{OnTimeout, ReadinessPolicy},
    repository::Domain,
    VirtscopeError, VirtscopeResult,
};

use super::{wait_until_active, LifecycleStrategy, Readiness, ScopeContext, ScopeState};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Per-scope options.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct ScopeOptions {
    /// The domain name. A fresh UUID is used when unset.
    #[builder(default, setter(strip_option, into))]
    pub name: Option<String>,

    /// Overrides the configured readiness timeout.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
}

/// A provisioned domain whose cleanup is guaranteed.
///
/// Cleanup runs exactly once: when [`close`](DomainScope::close) is awaited, or otherwise when
/// the scope is dropped. Dropping covers early returns, panics and cancellation of the task that
/// holds the scope. Cleanup from `Drop` can only log its errors and blocks the dropping thread
/// for as long as the stop-wait takes. On a multi-threaded runtime the worker hands its other
/// tasks off first; on a current-thread runtime everything else waits. Prefer `close` where
/// possible.
#[derive(Debug)]
pub struct DomainScope {
    domain: Domain,
    readiness: Readiness,
    guard: Option<CleanupGuard>,
}

/// Runs a strategy's cleanup when dropped unless it was already run.
#[derive(Debug)]
struct CleanupGuard {
    domain: Domain,
    strategy: Arc<dyn LifecycleStrategy>,
    context: ScopeContext,
    state: ScopeState,
    armed: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DomainScope {
    /// Provisions a domain with `strategy`, waits for it to become ready and returns the armed
    /// scope.
    ///
    /// If provisioning fails after the domain came into existence, the domain is cleaned up and
    /// the provisioning error is returned. If it fails before that, nothing is cleaned up.
    pub async fn enter(
        strategy: Arc<dyn LifecycleStrategy>,
        context: ScopeContext,
        readiness: ReadinessPolicy,
        options: ScopeOptions,
    ) -> VirtscopeResult<Self> {
        let name = options
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout = options.timeout.unwrap_or_else(|| readiness.timeout());
        let kind = strategy.kind();

        tracing::info!("entering {} scope for domain {}", kind, name);

        let started = Instant::now();

        // The guard is built on the blocking thread so that a cancelled `enter` still drops it
        // there and cleans up.
        let (result, guard) = tokio::task::spawn_blocking(move || {
            let mut state = ScopeState::new(name);
            let result = strategy.provision(&context, &mut state);
            let guard = state
                .domain()
                .cloned()
                .map(|domain| CleanupGuard::new(domain, strategy, context, state));
            (result, guard)
        })
        .await?;

        let guard = match (result, guard) {
            (Ok(()), Some(guard)) => guard,
            (Err(e), Some(guard)) => {
                tracing::error!("provisioning {} failed, cleaning up: {}", guard.name(), e);
                if let Err(cleanup_err) = guard.run_async().await {
                    tracing::error!("cleanup after failed provisioning failed: {}", cleanup_err);
                }
                return Err(e);
            }
            (Err(e), None) => {
                tracing::error!("provisioning failed before a domain existed: {}", e);
                return Err(e);
            }
            (Ok(()), None) => {
                return Err(VirtscopeError::custom(anyhow::anyhow!(
                    "{kind} strategy reported success without provisioning a domain"
                )))
            }
        };

        let domain = guard.domain.clone();
        let readiness_result = if guard.state.is_started() {
            wait_until_active(&domain, timeout, readiness.interval(), started).await
        } else {
            tracing::debug!("domain {} was not started, skipping readiness poll", domain.name());
            Ok(Readiness::Skipped)
        };

        let state = match readiness_result {
            Ok(state) => state,
            Err(e) => {
                if let Err(cleanup_err) = guard.run_async().await {
                    tracing::error!("cleanup after failed readiness poll failed: {}", cleanup_err);
                }
                return Err(e);
            }
        };

        if state == Readiness::TimedOut && *readiness.get_on_timeout() == OnTimeout::Fail {
            let name = domain.name().to_string();
            if let Err(cleanup_err) = guard.run_async().await {
                tracing::error!("cleanup of unready domain {} failed: {}", name, cleanup_err);
            }
            return Err(VirtscopeError::NotReady { name, timeout });
        }

        tracing::info!("domain {} ready ({:?})", domain.name(), state);

        Ok(Self {
            domain,
            readiness: state,
            guard: Some(guard),
        })
    }

    /// The provisioned domain.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// How the readiness poll ended.
    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    /// The snapshot taken during provisioning, if any.
    pub fn snapshot(&self) -> Option<&str> {
        self.guard.as_ref().and_then(|g| g.state.snapshot())
    }

    /// Runs cleanup now and reports its outcome.
    pub async fn close(mut self) -> VirtscopeResult<()> {
        match self.guard.take() {
            Some(guard) => guard.run_async().await,
            None => Ok(()),
        }
    }
}

impl CleanupGuard {
    fn new(
        domain: Domain,
        strategy: Arc<dyn LifecycleStrategy>,
        context: ScopeContext,
        state: ScopeState,
    ) -> Self {
        Self {
            domain,
            strategy,
            context,
            state,
            armed: true,
        }
    }

    fn name(&self) -> &str {
        self.state.name()
    }

    fn run(mut self) -> VirtscopeResult<()> {
        self.armed = false;
        tracing::info!(
            "cleaning up {} scope for domain {}",
            self.strategy.kind(),
            self.name()
        );
        self.strategy.cleanup(&self.context, &self.state)
    }

    async fn run_async(self) -> VirtscopeResult<()> {
        tokio::task::spawn_blocking(move || self.run()).await?
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        self.armed = false;
        tracing::info!(
            "scope for domain {} dropped, cleaning up",
            self.state.domain_name()
        );
        let cleanup = || self.strategy.cleanup(&self.context, &self.state);
        let result = match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(cleanup)
            }
            _ => cleanup(),
        };
        if let Err(e) = result {
            tracing::error!("cleanup of domain {} failed: {}", self.state.domain_name(), e);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `body` inside a scope and cleans up afterwards, whatever the body returns.
///
/// The body's result is returned. A cleanup failure is logged but never replaces it.
pub async fn with_scope<F, Fut, T>(
    strategy: Arc<dyn LifecycleStrategy>,
    context: ScopeContext,
    readiness: ReadinessPolicy,
    options: ScopeOptions,
    body: F,
) -> VirtscopeResult<T>
where
    F: FnOnce(Domain) -> Fut,
    Fut: Future<Output = VirtscopeResult<T>>,
{
    let scope = DomainScope::enter(strategy, context, readiness, options).await?;
    let result = body(scope.domain().clone()).await;

    let name = scope.domain().name().to_string();
    if let Err(e) = scope.close().await {
        tracing::error!("cleanup of domain {} failed: {}", name, e);
    }

    result
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
