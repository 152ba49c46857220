use std::{fmt, path::PathBuf, str::FromStr, sync::Arc};

use getset::Getters;
use typed_builder::TypedBuilder;

use crate::{
    repository::{Domain, DomainRepository, SnapshotRepository},
    template::Template,
    VirtscopeError, VirtscopeResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything a strategy needs to provision and clean up one domain.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ScopeContext {
    /// The domain repository.
    domains: DomainRepository,

    /// The snapshot repository.
    snapshots: SnapshotRepository,

    /// The domain template.
    template: Template,

    /// Where the snapshot template is loaded from when a strategy needs it.
    #[builder(setter(into))]
    snapshot_template_path: PathBuf,

    /// The name of the snapshot taken by [`DefineWithSnapshot`].
    #[builder(setter(into))]
    snapshot_name: String,

    /// The disk image substituted for `IMAGE_PATH`.
    #[builder(setter(into))]
    image_path: PathBuf,

    /// Whether defined domains are started once provisioned.
    #[builder(default)]
    start_defined: bool,

    /// Marks this context as belonging to a scope that has not cleaned up yet.
    #[builder(default)]
    tracker: ScopeTracker,
}

/// Counts the scope contexts built from it that are still alive.
///
/// A context lives until its scope's cleanup has run, so a non-zero count means some domain
/// still needs the session.
#[derive(Debug, Clone, Default)]
pub struct ScopeTracker(Arc<()>);

/// What provisioning has produced so far.
///
/// Cleanup only runs when [`domain`](Self::domain) is set, so strategies record the domain as soon
/// as it exists.
#[derive(Debug, Clone)]
pub struct ScopeState {
    name: String,
    domain: Option<Domain>,
    snapshot: Option<String>,
    started: bool,
}

/// The built-in lifecycle strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// [`CreateOnly`].
    #[default]
    Create,

    /// [`DefineOnly`].
    Define,

    /// [`DefineWithSnapshot`].
    Snapshot,
}

/// Creates a transient, running domain and deletes it on cleanup.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOnly;

/// Defines a domain without starting it and deletes it on cleanup.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefineOnly;

/// Defines a domain, snapshots it before it ever runs, and on cleanup reverts to the snapshot
/// before deleting the domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefineWithSnapshot;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The provision and cleanup halves of a lifecycle scope.
///
/// Both halves block on the hypervisor. `cleanup` is called at most once, and only if
/// `provision` recorded a domain in the [`ScopeState`], whether or not `provision` returned an
/// error.
pub trait LifecycleStrategy: Send + Sync + fmt::Debug {
    /// Which built-in strategy this is, for logging.
    fn kind(&self) -> ScopeKind;

    /// Brings the domain named in `state` into existence.
    fn provision(&self, ctx: &ScopeContext, state: &mut ScopeState) -> VirtscopeResult<()>;

    /// Returns the hypervisor to its state before `provision`.
    fn cleanup(&self, ctx: &ScopeContext, state: &ScopeState) -> VirtscopeResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ScopeState {
    /// Starts with nothing provisioned.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: None,
            snapshot: None,
            started: false,
        }
    }

    /// The domain name the scope provisions.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name of the domain on the hypervisor: the provisioned domain's name once it exists,
    /// the requested name before that. Cleanup targets this name.
    pub fn domain_name(&self) -> &str {
        self.domain.as_ref().map_or(self.name.as_str(), |d| d.name())
    }

    /// The provisioned domain, once it exists.
    pub fn domain(&self) -> Option<&Domain> {
        self.domain.as_ref()
    }

    /// The snapshot taken during provisioning, if any.
    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    /// Whether provisioning left the domain running (or starting).
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Records the provisioned domain, arming cleanup.
    pub fn set_domain(&mut self, domain: Domain) {
        self.domain = Some(domain);
    }

    /// Records the snapshot taken during provisioning.
    pub fn set_snapshot(&mut self, snapshot: impl Into<String>) {
        self.snapshot = Some(snapshot.into());
    }

    /// Records that the domain was started.
    pub fn set_started(&mut self, started: bool) {
        self.started = started;
    }
}

impl ScopeTracker {
    /// Starts a new count.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of live clones other than this one.
    pub fn open_scopes(&self) -> usize {
        Arc::strong_count(&self.0) - 1
    }
}

impl ScopeKind {
    /// Returns the strategy implementing this kind.
    pub fn strategy(self) -> Arc<dyn LifecycleStrategy> {
        match self {
            ScopeKind::Create => Arc::new(CreateOnly),
            ScopeKind::Define => Arc::new(DefineOnly),
            ScopeKind::Snapshot => Arc::new(DefineWithSnapshot),
        }
    }

    /// The lowercase name used on the command line and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Create => "create",
            ScopeKind::Define => "define",
            ScopeKind::Snapshot => "snapshot",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl LifecycleStrategy for CreateOnly {
    fn kind(&self) -> ScopeKind {
        ScopeKind::Create
    }

    fn provision(&self, ctx: &ScopeContext, state: &mut ScopeState) -> VirtscopeResult<()> {
        let domain =
            ctx.domains
                .create_from_template(&ctx.template, state.name(), &ctx.image_path, false)?;
        state.set_domain(domain);
        state.set_started(true);
        Ok(())
    }

    fn cleanup(&self, ctx: &ScopeContext, state: &ScopeState) -> VirtscopeResult<()> {
        ctx.domains.delete_if_exists(state.domain_name())?;
        Ok(())
    }
}

impl LifecycleStrategy for DefineOnly {
    fn kind(&self) -> ScopeKind {
        ScopeKind::Define
    }

    fn provision(&self, ctx: &ScopeContext, state: &mut ScopeState) -> VirtscopeResult<()> {
        let domain =
            ctx.domains
                .create_from_template(&ctx.template, state.name(), &ctx.image_path, true)?;
        state.set_domain(domain);
        start_if_requested(ctx, state)
    }

    fn cleanup(&self, ctx: &ScopeContext, state: &ScopeState) -> VirtscopeResult<()> {
        ctx.domains.delete_if_exists(state.domain_name())?;
        Ok(())
    }
}

impl LifecycleStrategy for DefineWithSnapshot {
    fn kind(&self) -> ScopeKind {
        ScopeKind::Snapshot
    }

    fn provision(&self, ctx: &ScopeContext, state: &mut ScopeState) -> VirtscopeResult<()> {
        let domain =
            ctx.domains
                .create_from_template(&ctx.template, state.name(), &ctx.image_path, true)?;
        state.set_domain(domain);

        let template = Template::load(&ctx.snapshot_template_path)?;
        let snapshot = ctx.snapshots.create_from_template(
            &template,
            state.name(),
            &ctx.snapshot_name,
            &ctx.image_path,
        )?;
        state.set_snapshot(snapshot.name());

        start_if_requested(ctx, state)
    }

    fn cleanup(&self, ctx: &ScopeContext, state: &ScopeState) -> VirtscopeResult<()> {
        if let Some(snapshot) = state.snapshot() {
            match ctx.snapshots.revert(state.domain_name(), snapshot) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!("nothing to revert for {}: {}", state.domain_name(), e)
                }
                Err(e) => tracing::error!(
                    "failed to revert {} to snapshot {}: {}",
                    state.domain_name(),
                    snapshot,
                    e
                ),
            }
        }

        ctx.domains.delete_if_exists(state.domain_name())?;
        Ok(())
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeKind {
    type Err = VirtscopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ScopeKind::Create),
            "define" => Ok(ScopeKind::Define),
            "snapshot" => Ok(ScopeKind::Snapshot),
            _ => Err(VirtscopeError::InvalidArgument(format!(
                "unknown scope kind: {s} (expected create, define or snapshot)"
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn start_if_requested(ctx: &ScopeContext, state: &mut ScopeState) -> VirtscopeResult<()> {
    if ctx.start_defined {
        ctx.domains.start(state.name())?;
        state.set_started(true);
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::Arc};

    use tempfile::NamedTempFile;

    use super::*;
    use crate::{
        config::StopPolicy,
        hypervisor::{HypervisorEvent, MemoryHypervisor, Operation},
    };

    const TEMPLATE: &str = "<domain><name>$NAME</name><uuid>$UUID</uuid></domain>";
    const SNAPSHOT_TEMPLATE: &str =
        "<domainsnapshot><name>$SNAPSHOT_NAME</name></domainsnapshot>";

    fn context(hv: &Arc<MemoryHypervisor>, snapshot_template: &NamedTempFile) -> ScopeContext {
        let stop = StopPolicy::builder().timeout_secs(0).interval_ms(5).build();
        ScopeContext::builder()
            .domains(DomainRepository::new(hv.clone(), stop, "."))
            .snapshots(SnapshotRepository::new(hv.clone(), "."))
            .template(Template::new(TEMPLATE))
            .snapshot_template_path(snapshot_template.path())
            .snapshot_name("main")
            .image_path("/images/a.qcow2")
            .build()
    }

    fn snapshot_template() -> anyhow::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(SNAPSHOT_TEMPLATE.as_bytes())?;
        Ok(file)
    }

    #[test]
    fn test_scope_kind_parsing() -> anyhow::Result<()> {
        assert_eq!("create".parse::<ScopeKind>()?, ScopeKind::Create);
        assert_eq!("snapshot".parse::<ScopeKind>()?, ScopeKind::Snapshot);
        assert!("reboot".parse::<ScopeKind>().is_err());
        assert_eq!(ScopeKind::Define.to_string(), "define");
        assert_eq!(ScopeKind::Define.strategy().kind(), ScopeKind::Define);
        Ok(())
    }

    #[test]
    fn test_create_only() -> anyhow::Result<()> {
        let hv = Arc::new(MemoryHypervisor::new());
        let file = snapshot_template()?;
        let ctx = context(&hv, &file);
        let mut state = ScopeState::new("vm");

        CreateOnly.provision(&ctx, &mut state)?;
        assert!(state.is_started());
        assert!(state.domain().is_some());

        CreateOnly.cleanup(&ctx, &state)?;
        assert!(!hv.contains("vm"));

        Ok(())
    }

    #[test]
    fn test_define_only_leaves_domain_stopped() -> anyhow::Result<()> {
        let hv = Arc::new(MemoryHypervisor::new());
        let file = snapshot_template()?;
        let ctx = context(&hv, &file);
        let mut state = ScopeState::new("vm");

        DefineOnly.provision(&ctx, &mut state)?;
        assert!(!state.is_started());
        assert_eq!(hv.events(), vec![HypervisorEvent::Defined("vm".into())]);

        DefineOnly.cleanup(&ctx, &state)?;
        assert!(!hv.contains("vm"));

        Ok(())
    }

    #[test]
    fn test_define_with_snapshot_reverts_before_delete() -> anyhow::Result<()> {
        let hv = Arc::new(MemoryHypervisor::new());
        let file = snapshot_template()?;
        let mut ctx = context(&hv, &file);
        ctx.start_defined = true;
        let mut state = ScopeState::new("vm");

        DefineWithSnapshot.provision(&ctx, &mut state)?;
        assert_eq!(state.snapshot(), Some("main"));
        assert!(state.is_started());

        DefineWithSnapshot.cleanup(&ctx, &state)?;
        assert_eq!(
            hv.events(),
            vec![
                HypervisorEvent::Defined("vm".into()),
                HypervisorEvent::SnapshotCreated {
                    domain: "vm".into(),
                    snapshot: "main".into()
                },
                HypervisorEvent::Started("vm".into()),
                HypervisorEvent::Reverted {
                    domain: "vm".into(),
                    snapshot: "main".into()
                },
                HypervisorEvent::Undefined("vm".into()),
            ]
        );

        Ok(())
    }

    #[test]
    fn test_tracker_counts_live_contexts() -> anyhow::Result<()> {
        let hv = Arc::new(MemoryHypervisor::new());
        let file = snapshot_template()?;
        let tracker = ScopeTracker::new();
        assert_eq!(tracker.open_scopes(), 0);

        let mut ctx = context(&hv, &file);
        ctx.tracker = tracker.clone();
        let copy = ctx.clone();
        assert_eq!(tracker.open_scopes(), 2);

        drop(ctx);
        drop(copy);
        assert_eq!(tracker.open_scopes(), 0);

        Ok(())
    }

    #[test]
    fn test_cleanup_targets_recorded_domain() -> anyhow::Result<()> {
        let hv = Arc::new(MemoryHypervisor::new());
        let file = snapshot_template()?;
        let ctx = context(&hv, &file);
        hv.insert_domain("fixed-vm", true, false);

        let mut state = ScopeState::new("vm");
        assert_eq!(state.domain_name(), "vm");
        state.set_domain(ctx.domains.find("fixed-vm")?);
        assert_eq!(state.domain_name(), "fixed-vm");

        DefineOnly.cleanup(&ctx, &state)?;
        assert!(hv.domain_names().is_empty());

        Ok(())
    }

    #[test]
    fn test_failed_snapshot_keeps_domain_for_cleanup() -> anyhow::Result<()> {
        let hv = Arc::new(MemoryHypervisor::new());
        let file = snapshot_template()?;
        let ctx = context(&hv, &file);
        let mut state = ScopeState::new("vm");
        hv.fail_on(Operation::CreateSnapshot);

        assert!(DefineWithSnapshot.provision(&ctx, &mut state).is_err());
        assert!(state.domain().is_some());
        assert!(state.snapshot().is_none());

        DefineWithSnapshot.cleanup(&ctx, &state)?;
        assert!(!hv.contains("vm"));

        Ok(())
    }
}
