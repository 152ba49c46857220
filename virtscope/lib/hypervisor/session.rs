use std::{fmt, sync::Arc};

use crate::{HypervisorResult, VirtscopeResult};

use super::MemoryHypervisor;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// URI scheme that selects the in-process hypervisor.
pub const MEMORY_URI_SCHEME: &str = "memory";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A shared, open hypervisor session.
pub type SharedHypervisor = Arc<dyn Hypervisor>;

/// What a backend reports about a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    /// The domain name.
    pub name: String,

    /// The domain UUID, when the backend exposes one.
    pub uuid: Option<String>,

    /// Whether the domain is registered (defined) rather than transient.
    pub persistent: bool,
}

/// What a backend reports about a domain snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// The owning domain's name.
    pub domain: String,

    /// The snapshot name.
    pub name: String,

    /// Whether this is the domain's current snapshot.
    pub is_current: bool,

    /// Creation time in seconds since the Unix epoch, when known.
    pub creation_time: Option<i64>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// An open, bidirectional session with a hypervisor.
///
/// Domains and snapshots are addressed by name. Lookups of absent objects must fail with
/// [`HypervisorError::NoDomain`](crate::HypervisorError::NoDomain) or
/// [`HypervisorError::NoSnapshot`](crate::HypervisorError::NoSnapshot) so callers can tell
/// absence apart from other faults.
///
/// All methods block. The session may be shared between threads; the backend is responsible for
/// serializing conflicting operations.
pub trait Hypervisor: Send + Sync + fmt::Debug {
    /// The URI this session is connected to.
    fn uri(&self) -> &str;

    /// Lists every domain known to the hypervisor, running or not.
    fn list_domains(&self) -> HypervisorResult<Vec<DomainRecord>>;

    /// Looks up a domain by name.
    fn lookup_domain(&self, name: &str) -> HypervisorResult<DomainRecord>;

    /// Creates and starts a transient domain from an XML definition.
    fn create_domain(&self, xml: &str) -> HypervisorResult<DomainRecord>;

    /// Registers a domain from an XML definition without starting it.
    fn define_domain(&self, xml: &str) -> HypervisorResult<DomainRecord>;

    /// Starts a defined domain.
    fn start_domain(&self, name: &str) -> HypervisorResult<()>;

    /// Stops a running domain immediately.
    fn destroy_domain(&self, name: &str) -> HypervisorResult<()>;

    /// Unregisters a domain.
    fn undefine_domain(&self, name: &str) -> HypervisorResult<()>;

    /// Whether the domain is currently running.
    fn is_domain_active(&self, name: &str) -> HypervisorResult<bool>;

    /// Renames a domain.
    fn rename_domain(&self, name: &str, new_name: &str) -> HypervisorResult<()>;

    /// Fetches the live XML description of a domain.
    fn domain_xml(&self, name: &str) -> HypervisorResult<String>;

    /// Lists the names of all storage pools.
    fn list_storage_pools(&self) -> HypervisorResult<Vec<String>>;

    /// Lists the names of the volumes in a storage pool.
    fn list_volumes(&self, pool: &str) -> HypervisorResult<Vec<String>>;

    /// Creates a snapshot of a domain from an XML definition.
    fn create_snapshot(&self, domain: &str, xml: &str) -> HypervisorResult<SnapshotRecord>;

    /// Lists the snapshot names of a domain.
    fn list_snapshot_names(&self, domain: &str) -> HypervisorResult<Vec<String>>;

    /// Looks up a snapshot of a domain by name.
    fn lookup_snapshot(&self, domain: &str, name: &str) -> HypervisorResult<SnapshotRecord>;

    /// Reverts a domain to a snapshot. Must work on stopped domains.
    fn revert_to_snapshot(&self, domain: &str, snapshot: &str) -> HypervisorResult<()>;

    /// Fetches the XML description of a snapshot.
    fn snapshot_xml(&self, domain: &str, snapshot: &str) -> HypervisorResult<String>;

    /// Closes the session. Further calls may fail.
    fn close(&self) -> HypervisorResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Opens a hypervisor session for the given URI.
///
/// `memory:///` selects the in-process hypervisor. Any other URI is handed to libvirt, which
/// requires the `libvirt` feature.
pub fn open(uri: &str) -> VirtscopeResult<SharedHypervisor> {
    if is_memory_uri(uri) {
        tracing::info!("opening in-memory hypervisor session: {}", uri);
        return Ok(Arc::new(MemoryHypervisor::with_uri(uri)));
    }

    open_libvirt(uri)
}

/// Whether the URI selects the in-process hypervisor.
pub fn is_memory_uri(uri: &str) -> bool {
    uri.split_once(':')
        .is_some_and(|(scheme, _)| scheme == MEMORY_URI_SCHEME)
}

#[cfg(feature = "libvirt")]
fn open_libvirt(uri: &str) -> VirtscopeResult<SharedHypervisor> {
    Ok(Arc::new(super::LibvirtSession::open(uri)?))
}

#[cfg(not(feature = "libvirt"))]
fn open_libvirt(uri: &str) -> VirtscopeResult<SharedHypervisor> {
    Err(crate::VirtscopeError::ConnectionFailed {
        uri: uri.to_string(),
        reason: "libvirt support is not compiled in (enable the `libvirt` feature)".to_string(),
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
