use std::{
    collections::{BTreeMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{utils::element_text, HypervisorError, HypervisorResult};

use super::{DomainRecord, Hypervisor, SnapshotRecord};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The URI reported by a [`MemoryHypervisor`] created with [`MemoryHypervisor::new`].
pub const DEFAULT_MEMORY_URI: &str = "memory:///";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-process hypervisor.
///
/// It follows libvirt's observable semantics closely enough to exercise the lifecycle manager:
///
/// - transient domains vanish when they are stopped
/// - undefining a running domain turns it transient
/// - creating or redefining a domain with a taken name and a different UUID is rejected
/// - reverting to a snapshot restores the disk state and the running state captured with it
///
/// Failures can be injected per [`Operation`], domains can be made slow to report active with
/// [`set_activation_delay`](Self::set_activation_delay), and every state change is appended to
/// an event log readable with [`events`](Self::events).
#[derive(Debug)]
pub struct MemoryHypervisor {
    uri: String,
    state: Mutex<MemoryState>,
}

/// A state change recorded by the [`MemoryHypervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorEvent {
    /// A transient domain was created and started.
    Created(String),

    /// A domain was defined.
    Defined(String),

    /// A defined domain was started.
    Started(String),

    /// A stop request was issued for a domain.
    Destroyed(String),

    /// A domain was undefined.
    Undefined(String),

    /// A domain was renamed.
    Renamed {
        /// The old name.
        from: String,

        /// The new name.
        to: String,
    },

    /// A snapshot was created.
    SnapshotCreated {
        /// The domain name.
        domain: String,

        /// The snapshot name.
        snapshot: String,
    },

    /// A domain was reverted to a snapshot.
    Reverted {
        /// The domain name.
        domain: String,

        /// The snapshot name.
        snapshot: String,
    },

    /// The session was closed.
    Closed,
}

/// Operations that can be made to fail with [`MemoryHypervisor::fail_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`Hypervisor::list_domains`].
    ListDomains,

    /// [`Hypervisor::lookup_domain`].
    Lookup,

    /// [`Hypervisor::create_domain`].
    Create,

    /// [`Hypervisor::define_domain`].
    Define,

    /// [`Hypervisor::start_domain`].
    Start,

    /// [`Hypervisor::destroy_domain`].
    Destroy,

    /// [`Hypervisor::undefine_domain`].
    Undefine,

    /// [`Hypervisor::is_domain_active`].
    IsActive,

    /// [`Hypervisor::rename_domain`].
    Rename,

    /// [`Hypervisor::create_snapshot`].
    CreateSnapshot,

    /// [`Hypervisor::revert_to_snapshot`].
    Revert,
}

#[derive(Debug, Default)]
struct MemoryState {
    domains: BTreeMap<String, MemoryDomain>,
    pools: BTreeMap<String, Vec<String>>,
    events: Vec<HypervisorEvent>,
    failures: HashSet<Operation>,
    activation_delay: u32,
    closed: bool,
}

#[derive(Debug, Clone)]
struct MemoryDomain {
    uuid: Option<String>,
    xml: String,
    persistent: bool,
    active: bool,
    pending_polls: u32,
    stop_resistant: bool,
    disk_state: String,
    snapshots: Vec<MemorySnapshot>,
    current_snapshot: Option<String>,
}

#[derive(Debug, Clone)]
struct MemorySnapshot {
    name: String,
    xml: String,
    creation_time: Option<i64>,
    disk_state: String,
    active: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryHypervisor {
    /// Creates an empty hypervisor reporting [`DEFAULT_MEMORY_URI`].
    pub fn new() -> Self {
        Self::with_uri(DEFAULT_MEMORY_URI)
    }

    /// Creates an empty hypervisor reporting the given URI.
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Registers a domain directly, bypassing XML parsing.
    pub fn insert_domain(&self, name: &str, persistent: bool, active: bool) {
        let xml = format!("<domain><name>{name}</name></domain>");
        self.state().domains.insert(
            name.to_string(),
            MemoryDomain::new(None, xml, persistent, active),
        );
    }

    /// Adds a volume to a storage pool, creating the pool if needed.
    pub fn add_volume(&self, pool: &str, volume: &str) {
        self.state()
            .pools
            .entry(pool.to_string())
            .or_default()
            .push(volume.to_string());
    }

    /// Makes every call of `operation` fail until [`recover`](Self::recover) is called.
    pub fn fail_on(&self, operation: Operation) {
        self.state().failures.insert(operation);
    }

    /// Clears an injected failure.
    pub fn recover(&self, operation: Operation) {
        self.state().failures.remove(&operation);
    }

    /// Number of `is_domain_active` queries that report `false` after a domain starts.
    ///
    /// Until then the domain is booting: it is inactive, but a stop request still cancels the
    /// boot. Use `u32::MAX` for domains that never come up.
    pub fn set_activation_delay(&self, polls: u32) {
        self.state().activation_delay = polls;
    }

    /// Makes stop requests for a domain have no effect.
    pub fn set_stop_resistant(&self, name: &str, resistant: bool) {
        if let Some(domain) = self.state().domains.get_mut(name) {
            domain.stop_resistant = resistant;
        }
    }

    /// Overwrites the disk contents of a domain.
    pub fn set_disk_state(&self, name: &str, disk_state: &str) {
        if let Some(domain) = self.state().domains.get_mut(name) {
            domain.disk_state = disk_state.to_string();
        }
    }

    /// Returns the disk contents of a domain.
    pub fn disk_state(&self, name: &str) -> Option<String> {
        self.state().domains.get(name).map(|d| d.disk_state.clone())
    }

    /// Returns the names of all domains, sorted.
    pub fn domain_names(&self) -> Vec<String> {
        self.state().domains.keys().cloned().collect()
    }

    /// Whether a domain with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.state().domains.contains_key(name)
    }

    /// Returns the recorded state changes, oldest first.
    pub fn events(&self) -> Vec<HypervisorEvent> {
        self.state().events.clone()
    }

    /// Clears the event log.
    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Whether [`Hypervisor::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the state after checking that the session is open and `operation` is not failing.
    fn begin(&self, operation: Option<Operation>) -> HypervisorResult<MutexGuard<'_, MemoryState>> {
        let state = self.state();
        if state.closed {
            return Err(HypervisorError::Backend("connection is closed".to_string()));
        }

        if let Some(operation) = operation {
            if state.failures.contains(&operation) {
                return Err(HypervisorError::Backend(format!(
                    "injected failure: {:?}",
                    operation
                )));
            }
        }

        Ok(state)
    }
}

impl MemoryState {
    fn domain(&self, name: &str) -> HypervisorResult<&MemoryDomain> {
        self.domains
            .get(name)
            .ok_or_else(|| HypervisorError::NoDomain(name.to_string()))
    }

    fn domain_mut(&mut self, name: &str) -> HypervisorResult<&mut MemoryDomain> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NoDomain(name.to_string()))
    }

    fn record(&mut self, event: HypervisorEvent) {
        self.events.push(event);
    }
}

impl MemoryDomain {
    fn new(uuid: Option<String>, xml: String, persistent: bool, active: bool) -> Self {
        Self {
            uuid,
            xml,
            persistent,
            active,
            pending_polls: 0,
            stop_resistant: false,
            disk_state: String::new(),
            snapshots: Vec::new(),
            current_snapshot: None,
        }
    }

    /// Starts the domain, leaving it booting for `delay` activity queries.
    fn boot(&mut self, delay: u32) {
        self.active = delay == 0;
        self.pending_polls = delay;
    }

    fn is_running(&self) -> bool {
        self.active || self.pending_polls > 0
    }

    fn record(&self, name: &str) -> DomainRecord {
        DomainRecord {
            name: name.to_string(),
            uuid: self.uuid.clone(),
            persistent: self.persistent,
        }
    }

    fn snapshot(&self, domain: &str, name: &str) -> HypervisorResult<&MemorySnapshot> {
        self.snapshots
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| HypervisorError::NoSnapshot {
                domain: domain.to_string(),
                snapshot: name.to_string(),
            })
    }

    fn snapshot_record(&self, domain: &str, snapshot: &MemorySnapshot) -> SnapshotRecord {
        SnapshotRecord {
            domain: domain.to_string(),
            name: snapshot.name.clone(),
            is_current: self.current_snapshot.as_deref() == Some(snapshot.name.as_str()),
            creation_time: snapshot.creation_time,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for MemoryHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Hypervisor for MemoryHypervisor {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn list_domains(&self) -> HypervisorResult<Vec<DomainRecord>> {
        let state = self.begin(Some(Operation::ListDomains))?;
        Ok(state
            .domains
            .iter()
            .map(|(name, domain)| domain.record(name))
            .collect())
    }

    fn lookup_domain(&self, name: &str) -> HypervisorResult<DomainRecord> {
        let state = self.begin(Some(Operation::Lookup))?;
        Ok(state.domain(name)?.record(name))
    }

    fn create_domain(&self, xml: &str) -> HypervisorResult<DomainRecord> {
        let mut state = self.begin(Some(Operation::Create))?;
        let (name, uuid) = parse_definition(xml)?;
        if state.domains.contains_key(&name) {
            return Err(HypervisorError::OperationInvalid(format!(
                "domain {name} already exists"
            )));
        }

        let mut domain = MemoryDomain::new(uuid, xml.to_string(), false, false);
        domain.boot(state.activation_delay);
        let record = domain.record(&name);
        state.domains.insert(name.clone(), domain);
        state.record(HypervisorEvent::Created(name));

        Ok(record)
    }

    fn define_domain(&self, xml: &str) -> HypervisorResult<DomainRecord> {
        let mut state = self.begin(Some(Operation::Define))?;
        let (name, uuid) = parse_definition(xml)?;

        match state.domains.get_mut(&name) {
            Some(existing) => {
                if uuid.is_some() && existing.uuid.is_some() && existing.uuid != uuid {
                    return Err(HypervisorError::OperationInvalid(format!(
                        "domain {name} already exists with uuid {}",
                        existing.uuid.as_deref().unwrap_or_default()
                    )));
                }
                existing.xml = xml.to_string();
                existing.persistent = true;
            }
            None => {
                state.domains.insert(
                    name.clone(),
                    MemoryDomain::new(uuid, xml.to_string(), true, false),
                );
            }
        }

        let record = state.domain(&name)?.record(&name);
        state.record(HypervisorEvent::Defined(name));

        Ok(record)
    }

    fn start_domain(&self, name: &str) -> HypervisorResult<()> {
        let mut state = self.begin(Some(Operation::Start))?;
        let delay = state.activation_delay;
        let domain = state.domain_mut(name)?;
        if domain.is_running() {
            return Err(HypervisorError::OperationInvalid(format!(
                "domain {name} is already running"
            )));
        }

        domain.boot(delay);
        state.record(HypervisorEvent::Started(name.to_string()));

        Ok(())
    }

    fn destroy_domain(&self, name: &str) -> HypervisorResult<()> {
        let mut state = self.begin(Some(Operation::Destroy))?;
        let domain = state.domain_mut(name)?;
        if !domain.is_running() {
            return Err(HypervisorError::OperationInvalid(format!(
                "domain {name} is not running"
            )));
        }

        if !domain.stop_resistant {
            domain.active = false;
            domain.pending_polls = 0;
            if !domain.persistent {
                state.domains.remove(name);
            }
        }

        state.record(HypervisorEvent::Destroyed(name.to_string()));

        Ok(())
    }

    fn undefine_domain(&self, name: &str) -> HypervisorResult<()> {
        let mut state = self.begin(Some(Operation::Undefine))?;
        let domain = state.domain_mut(name)?;
        if !domain.persistent {
            return Err(HypervisorError::OperationInvalid(format!(
                "cannot undefine transient domain {name}"
            )));
        }

        if domain.active {
            domain.persistent = false;
        } else {
            state.domains.remove(name);
        }

        state.record(HypervisorEvent::Undefined(name.to_string()));

        Ok(())
    }

    fn is_domain_active(&self, name: &str) -> HypervisorResult<bool> {
        let mut state = self.begin(Some(Operation::IsActive))?;
        let domain = state.domain_mut(name)?;
        if domain.pending_polls > 0 {
            domain.pending_polls -= 1;
            domain.active = domain.pending_polls == 0;
            return Ok(false);
        }

        Ok(domain.active)
    }

    fn rename_domain(&self, name: &str, new_name: &str) -> HypervisorResult<()> {
        let mut state = self.begin(Some(Operation::Rename))?;
        if state.domains.contains_key(new_name) {
            return Err(HypervisorError::OperationInvalid(format!(
                "domain {new_name} already exists"
            )));
        }

        let domain = state.domain(name)?;
        if domain.active {
            return Err(HypervisorError::OperationInvalid(format!(
                "domain {name} must be inactive to be renamed"
            )));
        }

        if let Some(mut domain) = state.domains.remove(name) {
            domain.xml = domain.xml.replacen(
                &format!("<name>{name}</name>"),
                &format!("<name>{new_name}</name>"),
                1,
            );
            state.domains.insert(new_name.to_string(), domain);
        }

        state.record(HypervisorEvent::Renamed {
            from: name.to_string(),
            to: new_name.to_string(),
        });

        Ok(())
    }

    fn domain_xml(&self, name: &str) -> HypervisorResult<String> {
        let state = self.begin(None)?;
        Ok(state.domain(name)?.xml.clone())
    }

    fn list_storage_pools(&self) -> HypervisorResult<Vec<String>> {
        let state = self.begin(None)?;
        Ok(state.pools.keys().cloned().collect())
    }

    fn list_volumes(&self, pool: &str) -> HypervisorResult<Vec<String>> {
        let state = self.begin(None)?;
        state
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| HypervisorError::NoPool(pool.to_string()))
    }

    fn create_snapshot(&self, domain_name: &str, xml: &str) -> HypervisorResult<SnapshotRecord> {
        let mut state = self.begin(Some(Operation::CreateSnapshot))?;
        let name = element_text(xml, "name")
            .ok_or_else(|| {
                HypervisorError::InvalidDefinition("snapshot definition has no <name>".to_string())
            })?
            .to_string();
        let creation_time = element_text(xml, "creationTime").and_then(|t| t.parse().ok());

        let domain = state.domain_mut(domain_name)?;
        if domain.snapshots.iter().any(|s| s.name == name) {
            return Err(HypervisorError::OperationInvalid(format!(
                "snapshot {name} already exists on domain {domain_name}"
            )));
        }

        let snapshot = MemorySnapshot {
            name: name.clone(),
            xml: xml.to_string(),
            creation_time,
            disk_state: domain.disk_state.clone(),
            active: domain.active,
        };
        domain.current_snapshot = Some(name.clone());
        let record = domain.snapshot_record(domain_name, &snapshot);
        domain.snapshots.push(snapshot);

        state.record(HypervisorEvent::SnapshotCreated {
            domain: domain_name.to_string(),
            snapshot: name,
        });

        Ok(record)
    }

    fn list_snapshot_names(&self, domain: &str) -> HypervisorResult<Vec<String>> {
        let state = self.begin(None)?;
        Ok(state
            .domain(domain)?
            .snapshots
            .iter()
            .map(|s| s.name.clone())
            .collect())
    }

    fn lookup_snapshot(&self, domain: &str, name: &str) -> HypervisorResult<SnapshotRecord> {
        let state = self.begin(Some(Operation::Lookup))?;
        let memory_domain = state.domain(domain)?;
        let snapshot = memory_domain.snapshot(domain, name)?;
        Ok(memory_domain.snapshot_record(domain, snapshot))
    }

    fn revert_to_snapshot(&self, domain_name: &str, snapshot: &str) -> HypervisorResult<()> {
        let mut state = self.begin(Some(Operation::Revert))?;
        let domain = state.domain_mut(domain_name)?;
        let (disk_state, active) = {
            let snapshot = domain.snapshot(domain_name, snapshot)?;
            (snapshot.disk_state.clone(), snapshot.active)
        };

        domain.disk_state = disk_state;
        domain.active = active;
        domain.pending_polls = 0;
        domain.current_snapshot = Some(snapshot.to_string());

        state.record(HypervisorEvent::Reverted {
            domain: domain_name.to_string(),
            snapshot: snapshot.to_string(),
        });

        Ok(())
    }

    fn snapshot_xml(&self, domain: &str, snapshot: &str) -> HypervisorResult<String> {
        let state = self.begin(None)?;
        Ok(state.domain(domain)?.snapshot(domain, snapshot)?.xml.clone())
    }

    fn close(&self) -> HypervisorResult<()> {
        let mut state = self.state();
        if !state.closed {
            state.closed = true;
            state.record(HypervisorEvent::Closed);
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn parse_definition(xml: &str) -> HypervisorResult<(String, Option<String>)> {
    let name = element_text(xml, "name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            HypervisorError::InvalidDefinition("domain definition has no <name>".to_string())
        })?;
    let uuid = element_text(xml, "uuid").map(str::to_string);

    Ok((name.to_string(), uuid))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_XML: &str = "<domain><name>vm</name><uuid>1111</uuid></domain>";

    #[test]
    fn test_transient_domain_vanishes_on_destroy() -> anyhow::Result<()> {
        let hv = MemoryHypervisor::new();
        hv.create_domain(DOMAIN_XML)?;
        assert!(hv.is_domain_active("vm")?);

        hv.destroy_domain("vm")?;
        assert!(!hv.contains("vm"));
        assert!(matches!(
            hv.lookup_domain("vm"),
            Err(HypervisorError::NoDomain(_))
        ));

        Ok(())
    }

    #[test]
    fn test_undefine_running_domain_turns_transient() -> anyhow::Result<()> {
        let hv = MemoryHypervisor::new();
        hv.define_domain(DOMAIN_XML)?;
        hv.start_domain("vm")?;

        hv.undefine_domain("vm")?;
        assert!(!hv.lookup_domain("vm")?.persistent);

        hv.destroy_domain("vm")?;
        assert!(!hv.contains("vm"));

        Ok(())
    }

    #[test]
    fn test_redefine_with_different_uuid_is_rejected() -> anyhow::Result<()> {
        let hv = MemoryHypervisor::new();
        hv.define_domain(DOMAIN_XML)?;

        let err = hv
            .define_domain("<domain><name>vm</name><uuid>2222</uuid></domain>")
            .unwrap_err();
        assert!(matches!(err, HypervisorError::OperationInvalid(_)));

        Ok(())
    }

    #[test]
    fn test_activation_delay() -> anyhow::Result<()> {
        let hv = MemoryHypervisor::new();
        hv.set_activation_delay(2);
        hv.create_domain(DOMAIN_XML)?;

        assert!(!hv.is_domain_active("vm")?);
        assert!(!hv.is_domain_active("vm")?);
        assert!(hv.is_domain_active("vm")?);

        Ok(())
    }

    #[test]
    fn test_revert_restores_disk_and_run_state() -> anyhow::Result<()> {
        let hv = MemoryHypervisor::new();
        hv.define_domain(DOMAIN_XML)?;
        hv.set_disk_state("vm", "pristine");
        hv.create_snapshot(
            "vm",
            "<domainsnapshot><name>main</name><creationTime>42</creationTime></domainsnapshot>",
        )?;

        hv.start_domain("vm")?;
        hv.set_disk_state("vm", "dirty");

        hv.revert_to_snapshot("vm", "main")?;
        assert_eq!(hv.disk_state("vm").as_deref(), Some("pristine"));
        assert!(!hv.is_domain_active("vm")?);

        let snapshot = hv.lookup_snapshot("vm", "main")?;
        assert!(snapshot.is_current);
        assert_eq!(snapshot.creation_time, Some(42));

        Ok(())
    }

    #[test]
    fn test_injected_failure() -> anyhow::Result<()> {
        let hv = MemoryHypervisor::new();
        hv.fail_on(Operation::Create);
        assert!(matches!(
            hv.create_domain(DOMAIN_XML),
            Err(HypervisorError::Backend(_))
        ));

        hv.recover(Operation::Create);
        hv.create_domain(DOMAIN_XML)?;

        Ok(())
    }

    #[test]
    fn test_closed_session_rejects_calls() -> anyhow::Result<()> {
        let hv = MemoryHypervisor::new();
        hv.close()?;

        assert!(hv.is_closed());
        assert!(hv.list_domains().is_err());
        assert_eq!(hv.events(), vec![HypervisorEvent::Closed]);

        Ok(())
    }

    #[test]
    fn test_definition_without_name_is_rejected() {
        let hv = MemoryHypervisor::new();
        assert!(matches!(
            hv.define_domain("<domain></domain>"),
            Err(HypervisorError::InvalidDefinition(_))
        ));
    }
}
