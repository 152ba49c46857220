use std::sync::{Mutex, MutexGuard, PoisonError};

use virt::{
    connect::Connect,
    domain::Domain,
    domain_snapshot::DomainSnapshot,
    error::{Error as LibvirtError, ErrorNumber},
    storage_pool::StoragePool,
    sys,
};

use crate::{utils::element_text, HypervisorError, HypervisorResult, VirtscopeError, VirtscopeResult};

use super::{DomainRecord, Hypervisor, SnapshotRecord};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A libvirt connection.
///
/// Domains, pools and snapshots are looked up by name on every call, so no libvirt object
/// handles outlive a single operation.
#[derive(Debug)]
pub struct LibvirtSession {
    uri: String,
    conn: Mutex<Option<Connect>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LibvirtSession {
    /// Opens a connection to the given libvirt URI, e.g. `qemu:///system`.
    pub fn open(uri: &str) -> VirtscopeResult<Self> {
        let conn = Connect::open(Some(uri)).map_err(|e| {
            tracing::error!("failed to connect to libvirt at {}: {}", uri, e);
            VirtscopeError::ConnectionFailed {
                uri: uri.to_string(),
                reason: e.to_string(),
            }
        })?;

        tracing::info!("connected to libvirt at {}", uri);

        Ok(Self {
            uri: uri.to_string(),
            conn: Mutex::new(Some(conn)),
        })
    }

    fn conn(&self) -> HypervisorResult<MutexGuard<'_, Option<Connect>>> {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            return Err(HypervisorError::Backend("connection is closed".to_string()));
        }

        Ok(guard)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connect) -> HypervisorResult<T>) -> HypervisorResult<T> {
        let guard = self.conn()?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(HypervisorError::Backend("connection is closed".to_string())),
        }
    }

    fn with_domain<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Domain) -> Result<T, LibvirtError>,
    ) -> HypervisorResult<T> {
        self.with_conn(|conn| {
            let domain = Domain::lookup_by_name(conn, name).map_err(|e| domain_error(name, e))?;
            f(&domain).map_err(|e| domain_error(name, e))
        })
    }

    fn with_snapshot<T>(
        &self,
        domain_name: &str,
        snapshot_name: &str,
        f: impl FnOnce(&DomainSnapshot) -> Result<T, LibvirtError>,
    ) -> HypervisorResult<T> {
        self.with_conn(|conn| {
            let domain =
                Domain::lookup_by_name(conn, domain_name).map_err(|e| domain_error(domain_name, e))?;
            let snapshot = DomainSnapshot::lookup_by_name(&domain, snapshot_name, 0)
                .map_err(|e| snapshot_error(domain_name, snapshot_name, e))?;
            f(&snapshot).map_err(|e| snapshot_error(domain_name, snapshot_name, e))
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Hypervisor for LibvirtSession {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn list_domains(&self) -> HypervisorResult<Vec<DomainRecord>> {
        self.with_conn(|conn| {
            let domains = conn.list_all_domains(0).map_err(backend_error)?;
            domains.iter().map(domain_record).collect()
        })
    }

    fn lookup_domain(&self, name: &str) -> HypervisorResult<DomainRecord> {
        self.with_conn(|conn| {
            let domain = Domain::lookup_by_name(conn, name).map_err(|e| domain_error(name, e))?;
            domain_record(&domain)
        })
    }

    fn create_domain(&self, xml: &str) -> HypervisorResult<DomainRecord> {
        self.with_conn(|conn| {
            let domain = Domain::create_xml(conn, xml, sys::VIR_DOMAIN_NONE).map_err(backend_error)?;
            domain_record(&domain)
        })
    }

    fn define_domain(&self, xml: &str) -> HypervisorResult<DomainRecord> {
        self.with_conn(|conn| {
            let domain = Domain::define_xml(conn, xml).map_err(backend_error)?;
            domain_record(&domain)
        })
    }

    fn start_domain(&self, name: &str) -> HypervisorResult<()> {
        self.with_domain(name, |d| d.create().map(|_| ()))
    }

    fn destroy_domain(&self, name: &str) -> HypervisorResult<()> {
        self.with_domain(name, |d| d.destroy())
    }

    fn undefine_domain(&self, name: &str) -> HypervisorResult<()> {
        self.with_domain(name, |d| {
            d.undefine_flags(
                sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA | sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE,
            )
        })
    }

    fn is_domain_active(&self, name: &str) -> HypervisorResult<bool> {
        self.with_domain(name, |d| d.is_active())
    }

    fn rename_domain(&self, name: &str, new_name: &str) -> HypervisorResult<()> {
        self.with_domain(name, |d| d.rename(new_name, 0).map(|_| ()))
    }

    fn domain_xml(&self, name: &str) -> HypervisorResult<String> {
        self.with_domain(name, |d| d.get_xml_desc(0))
    }

    fn list_storage_pools(&self) -> HypervisorResult<Vec<String>> {
        self.with_conn(|conn| {
            let pools = conn.list_all_storage_pools(0).map_err(backend_error)?;
            pools
                .iter()
                .map(|p| p.get_name().map_err(backend_error))
                .collect()
        })
    }

    fn list_volumes(&self, pool: &str) -> HypervisorResult<Vec<String>> {
        self.with_conn(|conn| {
            let storage_pool = StoragePool::lookup_by_name(conn, pool).map_err(|e| {
                if e.code() == ErrorNumber::NoStoragePool {
                    HypervisorError::NoPool(pool.to_string())
                } else {
                    backend_error(e)
                }
            })?;
            let volumes = storage_pool.list_all_volumes(0).map_err(backend_error)?;
            volumes
                .iter()
                .map(|v| v.get_name().map_err(backend_error))
                .collect()
        })
    }

    fn create_snapshot(&self, domain_name: &str, xml: &str) -> HypervisorResult<SnapshotRecord> {
        self.with_conn(|conn| {
            let domain =
                Domain::lookup_by_name(conn, domain_name).map_err(|e| domain_error(domain_name, e))?;
            let snapshot = DomainSnapshot::create_xml(&domain, xml, 0).map_err(backend_error)?;
            snapshot_record(domain_name, &snapshot)
        })
    }

    fn list_snapshot_names(&self, domain_name: &str) -> HypervisorResult<Vec<String>> {
        self.with_domain(domain_name, |d| {
            d.list_all_snapshots(0)?
                .iter()
                .map(|s| s.get_name())
                .collect()
        })
    }

    fn lookup_snapshot(&self, domain: &str, name: &str) -> HypervisorResult<SnapshotRecord> {
        self.with_conn(|conn| {
            let d = Domain::lookup_by_name(conn, domain).map_err(|e| domain_error(domain, e))?;
            let snapshot = DomainSnapshot::lookup_by_name(&d, name, 0)
                .map_err(|e| snapshot_error(domain, name, e))?;
            snapshot_record(domain, &snapshot)
        })
    }

    fn revert_to_snapshot(&self, domain: &str, snapshot: &str) -> HypervisorResult<()> {
        self.with_snapshot(domain, snapshot, |s| s.revert(0))
    }

    fn snapshot_xml(&self, domain: &str, snapshot: &str) -> HypervisorResult<String> {
        self.with_snapshot(domain, snapshot, |s| s.get_xml_desc(0))
    }

    fn close(&self) -> HypervisorResult<()> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut conn) = guard.take() {
            conn.close().map_err(backend_error)?;
            tracing::info!("closed libvirt connection to {}", self.uri);
        }

        Ok(())
    }
}

impl Drop for LibvirtSession {
    fn drop(&mut self) {
        if let Err(e) = Hypervisor::close(self) {
            tracing::warn!("failed to close libvirt connection to {}: {}", self.uri, e);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn backend_error(e: LibvirtError) -> HypervisorError {
    match e.code() {
        ErrorNumber::OperationInvalid => HypervisorError::OperationInvalid(e.to_string()),
        ErrorNumber::XmlError | ErrorNumber::XmlDetail => {
            HypervisorError::InvalidDefinition(e.to_string())
        }
        _ => HypervisorError::Backend(e.to_string()),
    }
}

fn domain_error(name: &str, e: LibvirtError) -> HypervisorError {
    if e.code() == ErrorNumber::NoDomain {
        return HypervisorError::NoDomain(name.to_string());
    }

    backend_error(e)
}

fn snapshot_error(domain: &str, snapshot: &str, e: LibvirtError) -> HypervisorError {
    match e.code() {
        ErrorNumber::NoDomain => HypervisorError::NoDomain(domain.to_string()),
        ErrorNumber::NoDomainSnapshot => HypervisorError::NoSnapshot {
            domain: domain.to_string(),
            snapshot: snapshot.to_string(),
        },
        _ => backend_error(e),
    }
}

fn domain_record(domain: &Domain) -> HypervisorResult<DomainRecord> {
    Ok(DomainRecord {
        name: domain.get_name().map_err(backend_error)?,
        uuid: domain.get_uuid_string().ok(),
        persistent: domain.is_persistent().map_err(backend_error)?,
    })
}

fn snapshot_record(domain: &str, snapshot: &DomainSnapshot) -> HypervisorResult<SnapshotRecord> {
    let name = snapshot.get_name().map_err(backend_error)?;
    let is_current = snapshot
        .is_current(0)
        .map_err(|e| snapshot_error(domain, &name, e))?;
    let creation_time = snapshot
        .get_xml_desc(0)
        .ok()
        .and_then(|xml| element_text(&xml, "creationTime").and_then(|t| t.parse().ok()));

    Ok(SnapshotRecord {
        domain: domain.to_string(),
        name,
        is_current,
        creation_time,
    })
}
