//! The entry point tying a hypervisor session, the repositories and the lifecycle scopes together.

use std::{future::Future, path::PathBuf, sync::Arc};

use tokio::sync::OnceCell;

use crate::{
    config::ManagerConfig,
    hypervisor::{self, SharedHypervisor},
    image::ImageSupplier,
    lifecycle::{
        self, CreateOnly, DefineOnly, DefineWithSnapshot, DomainScope, LifecycleStrategy,
        ScopeContext, ScopeKind, ScopeOptions, ScopeTracker,
    },
    repository::{Domain, DomainRepository, SnapshotRepository, VolumeEntry},
    template::Template,
    utils, VirtscopeError, VirtscopeResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Manages ephemeral domains on one hypervisor session.
///
/// The disk image is resolved lazily on first use: from the image supplier when one is set,
/// otherwise from `image_path` in the configuration. The supplier runs at most once per manager.
///
/// ## Examples
///
/// ```no_run
/// use virtscope::{config::ManagerConfig, lifecycle::ScopeOptions, manager::VmManager};
///
/// # async fn example() -> virtscope::VirtscopeResult<()> {
/// let config = ManagerConfig::builder()
///     .connection_uri("qemu:///system")
///     .image_path("images/disk.qcow2")
///     .build();
///
/// let manager = VmManager::open(config)?;
/// let scope = manager.temp_domain(ScopeOptions::default()).await?;
/// println!("{} is running", scope.domain().name());
/// scope.close().await?;
/// manager.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct VmManager {
    config: ManagerConfig,
    session: SharedHypervisor,
    domains: DomainRepository,
    snapshots: SnapshotRepository,
    supplier: Option<Arc<dyn ImageSupplier>>,
    image_path: OnceCell<PathBuf>,
    scopes: ScopeTracker,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmManager {
    /// Opens a session to the configured connection URI.
    pub fn open(config: ManagerConfig) -> VirtscopeResult<Self> {
        let session = hypervisor::open(config.get_connection_uri())?;
        Ok(Self::with_session(session, config))
    }

    /// Wraps an already open session.
    pub fn with_session(session: SharedHypervisor, config: ManagerConfig) -> Self {
        let domains = DomainRepository::new(
            session.clone(),
            *config.get_stop(),
            config.get_artifact_dir().clone(),
        );
        let snapshots = SnapshotRepository::new(session.clone(), config.get_artifact_dir().clone());

        Self {
            config,
            session,
            domains,
            snapshots,
            supplier: None,
            image_path: OnceCell::new(),
            scopes: ScopeTracker::new(),
        }
    }

    /// Resolves the image through `supplier` instead of the configured path.
    pub fn with_image_supplier(mut self, supplier: impl ImageSupplier + 'static) -> Self {
        self.supplier = Some(Arc::new(supplier));
        self
    }

    /// The configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The hypervisor session.
    pub fn session(&self) -> &SharedHypervisor {
        &self.session
    }

    /// The domain repository.
    pub fn domains(&self) -> &DomainRepository {
        &self.domains
    }

    /// The snapshot repository.
    pub fn snapshots(&self) -> &SnapshotRepository {
        &self.snapshots
    }

    /// The absolute path of the disk image domains boot from.
    pub async fn image_path(&self) -> VirtscopeResult<PathBuf> {
        let path = self
            .image_path
            .get_or_try_init(|| async {
                match (&self.supplier, self.config.get_image_path()) {
                    (Some(supplier), _) => {
                        tracing::info!("resolving image with {:?}", supplier);
                        supplier.supply().await
                    }
                    (None, Some(path)) => utils::absolute_path(path),
                    (None, None) => Err(VirtscopeError::ImagePathNotConfigured),
                }
            })
            .await?;

        Ok(path.clone())
    }

    /// Loads the templates and resolves the image a scope needs.
    pub async fn scope_context(&self) -> VirtscopeResult<ScopeContext> {
        let image_path = self.image_path().await?;
        let template = Template::load(self.config.get_template_path())?;

        Ok(ScopeContext::builder()
            .domains(self.domains.clone())
            .snapshots(self.snapshots.clone())
            .template(template)
            .snapshot_template_path(self.config.get_snapshot_template_path().clone())
            .snapshot_name(self.config.get_snapshot_name().clone())
            .image_path(image_path)
            .start_defined(*self.config.get_start_defined())
            .tracker(self.scopes.clone())
            .build())
    }

    /// Enters a scope driven by any strategy.
    pub async fn enter(
        &self,
        strategy: Arc<dyn LifecycleStrategy>,
        options: ScopeOptions,
    ) -> VirtscopeResult<DomainScope> {
        let context = self.scope_context().await?;
        DomainScope::enter(strategy, context, *self.config.get_readiness(), options).await
    }

    /// Enters a scope of a built-in kind.
    pub async fn enter_kind(
        &self,
        kind: ScopeKind,
        options: ScopeOptions,
    ) -> VirtscopeResult<DomainScope> {
        self.enter(kind.strategy(), options).await
    }

    /// A transient domain that is deleted when the scope ends.
    pub async fn temp_domain(&self, options: ScopeOptions) -> VirtscopeResult<DomainScope> {
        self.enter(Arc::new(CreateOnly), options).await
    }

    /// A defined domain that is deleted when the scope ends.
    pub async fn temp_domain_defined(&self, options: ScopeOptions) -> VirtscopeResult<DomainScope> {
        self.enter(Arc::new(DefineOnly), options).await
    }

    /// A defined domain with a `snapshot_name` snapshot, reverted and deleted when the scope
    /// ends.
    pub async fn temp_domain_snapshot(
        &self,
        options: ScopeOptions,
    ) -> VirtscopeResult<DomainScope> {
        self.enter(Arc::new(DefineWithSnapshot), options).await
    }

    /// Runs `body` with a domain of the given kind, cleaning up afterwards.
    pub async fn with_scope<F, Fut, T>(
        &self,
        kind: ScopeKind,
        options: ScopeOptions,
        body: F,
    ) -> VirtscopeResult<T>
    where
        F: FnOnce(Domain) -> Fut,
        Fut: Future<Output = VirtscopeResult<T>>,
    {
        let context = self.scope_context().await?;
        lifecycle::with_scope(
            kind.strategy(),
            context,
            *self.config.get_readiness(),
            options,
            body,
        )
        .await
    }

    /// Lists every volume of every storage pool.
    pub fn list_all_volumes(&self) -> VirtscopeResult<Vec<VolumeEntry>> {
        self.domains.list_all_volumes()
    }

    /// The number of scopes entered through this manager that have not cleaned up yet.
    pub fn open_scopes(&self) -> usize {
        self.scopes.open_scopes()
    }

    /// Closes the session.
    ///
    /// Fails with [`VirtscopeError::ScopesStillOpen`] while a scope from this manager has not
    /// cleaned up. The session then stays open for those scopes and is released once the last
    /// of them drops it.
    pub fn close(self) -> VirtscopeResult<()> {
        let open = self.scopes.open_scopes();
        if open > 0 {
            tracing::warn!(
                "not closing session to {}: {} scope(s) still open",
                self.session.uri(),
                open
            );
            return Err(VirtscopeError::ScopesStillOpen(open));
        }

        self.session.close()?;
        tracing::info!("closed session to {}", self.session.uri());
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
