use std::{
    path::{Path, PathBuf},
    thread,
    time::Instant,
};

use tokio::fs;

use crate::{
    config::StopPolicy,
    hypervisor::{DomainRecord, SharedHypervisor},
    template::{Template, TemplateValues},
    utils, HypervisorError, VirtscopeError, VirtscopeResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A live handle to a hypervisor domain.
///
/// The handle is a name plus the session it was obtained from. Queries go to the hypervisor
/// every time, so a handle to a domain that has since been removed reports
/// [`VirtscopeError::DomainNotFound`].
#[derive(Debug, Clone)]
pub struct Domain {
    session: SharedHypervisor,
    record: DomainRecord,
}

/// Creates, finds and removes domains by name.
#[derive(Debug, Clone)]
pub struct DomainRepository {
    session: SharedHypervisor,
    stop_policy: StopPolicy,
    artifact_dir: PathBuf,
}

/// What [`DomainRepository::delete_if_exists`] found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// There was no domain with that name.
    Absent,

    /// The domain was (stopped and) undefined.
    Undefined,

    /// The domain disappeared on its own once stopped, as transient domains do.
    Vanished,
}

/// A storage volume and the pool it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    /// The storage pool name.
    pub pool: String,

    /// The volume name.
    pub volume: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Domain {
    pub(crate) fn new(session: SharedHypervisor, record: DomainRecord) -> Self {
        Self { session, record }
    }

    /// The domain name.
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// The domain UUID, if the backend reported one.
    pub fn uuid(&self) -> Option<&str> {
        self.record.uuid.as_deref()
    }

    /// Whether the domain was registered when this handle was obtained.
    pub fn is_persistent(&self) -> bool {
        self.record.persistent
    }

    /// Whether the domain is running right now.
    pub fn is_active(&self) -> VirtscopeResult<bool> {
        self.session
            .is_domain_active(self.name())
            .map_err(HypervisorError::into_lookup_error)
    }

    /// Starts the domain.
    pub fn start(&self) -> VirtscopeResult<()> {
        self.session
            .start_domain(self.name())
            .map_err(HypervisorError::into_lookup_error)
    }

    /// Fetches the live XML description.
    pub fn xml_desc(&self) -> VirtscopeResult<String> {
        self.session
            .domain_xml(self.name())
            .map_err(HypervisorError::into_lookup_error)
    }
}

impl DomainRepository {
    /// Creates a repository over an open session.
    pub fn new(
        session: SharedHypervisor,
        stop_policy: StopPolicy,
        artifact_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session,
            stop_policy,
            artifact_dir: artifact_dir.into(),
        }
    }

    /// Looks a domain up by name.
    pub fn find(&self, name: &str) -> VirtscopeResult<Domain> {
        let record = self
            .session
            .lookup_domain(name)
            .map_err(HypervisorError::into_lookup_error)?;

        Ok(Domain::new(self.session.clone(), record))
    }

    /// Lists every domain the hypervisor knows about.
    pub fn list_all(&self) -> VirtscopeResult<Vec<Domain>> {
        Ok(self
            .session
            .list_domains()?
            .into_iter()
            .map(|record| Domain::new(self.session.clone(), record))
            .collect())
    }

    /// Renames a domain and returns a handle under its new name.
    pub fn rename(&self, name: &str, new_name: &str) -> VirtscopeResult<Domain> {
        self.find(name)?;
        self.session
            .rename_domain(name, new_name)
            .map_err(HypervisorError::into_lookup_error)?;

        tracing::info!("renamed domain {} to {}", name, new_name);

        self.find(new_name)
    }

    /// Whether the named domain is running.
    pub fn is_active(&self, name: &str) -> VirtscopeResult<bool> {
        self.session
            .is_domain_active(name)
            .map_err(HypervisorError::into_lookup_error)
    }

    /// Starts a defined domain.
    pub fn start(&self, name: &str) -> VirtscopeResult<()> {
        self.session
            .start_domain(name)
            .map_err(HypervisorError::into_lookup_error)?;

        tracing::info!("started domain {}", name);
        Ok(())
    }

    /// Removes a domain if it exists, stopping it first when it is running.
    ///
    /// Absence is success, including a domain that disappears part-way through. A running domain
    /// is sent stop requests every `stop.interval_ms` until it reports inactive; if that takes
    /// longer than `stop.timeout_secs` the call fails with [`VirtscopeError::StopTimeout`].
    /// Backend faults other than absence are logged and returned.
    pub fn delete_if_exists(&self, name: &str) -> VirtscopeResult<DeleteOutcome> {
        let record = match self.session.lookup_domain(name) {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                tracing::debug!("{}: does not exist, nothing to delete", name);
                return Ok(DeleteOutcome::Absent);
            }
            Err(e) => {
                tracing::error!("failed to look up domain {} for deletion: {}", name, e);
                return Err(e.into());
            }
        };

        if !self.stop_until_inactive(name, !record.persistent)? {
            tracing::info!("domain {} vanished after stopping", name);
            return Ok(DeleteOutcome::Vanished);
        }

        match self.session.undefine_domain(name) {
            Ok(()) => {
                tracing::info!("undefined domain {}", name);
                Ok(DeleteOutcome::Undefined)
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!("domain {} vanished before undefine", name);
                Ok(DeleteOutcome::Vanished)
            }
            Err(e) => {
                tracing::error!("failed to undefine domain {}: {}", name, e);
                Err(e.into())
            }
        }
    }

    /// Creates a domain from a template, replacing any domain that already has the name.
    ///
    /// The template is rendered with `NAME`, `IMAGE_PATH` and a fresh `UUID`. With
    /// `persist == false` the domain is created transient and running; with `persist == true` it
    /// is defined but not started.
    ///
    /// The rendered `<name>` must be `name`, otherwise nothing is submitted and
    /// [`VirtscopeError::DomainNameMismatch`] is returned.
    pub fn create_from_template(
        &self,
        template: &Template,
        name: &str,
        image_path: impl AsRef<Path>,
        persist: bool,
    ) -> VirtscopeResult<Domain> {
        self.delete_if_exists(name)?;

        let image_path = image_path.as_ref().display().to_string();
        let values = TemplateValues::for_domain(name, &image_path);
        let xml = template.render(&values);

        if let Some(found) = utils::element_text(&xml, "name") {
            if found != name {
                return Err(VirtscopeError::DomainNameMismatch {
                    expected: name.to_string(),
                    found: found.to_string(),
                });
            }
        }

        let record = if persist {
            self.session.define_domain(&xml)?
        } else {
            self.session.create_domain(&xml)?
        };

        if record.name != name {
            tracing::error!(
                "hypervisor named the domain {} instead of {}, removing it",
                record.name,
                name
            );
            self.delete_if_exists(&record.name)?;
            return Err(VirtscopeError::DomainNameMismatch {
                expected: name.to_string(),
                found: record.name,
            });
        }

        tracing::info!(
            "{} domain {} ({})",
            if persist { "defined" } else { "created" },
            record.name,
            record.uuid.as_deref().unwrap_or("no uuid")
        );

        Ok(Domain::new(self.session.clone(), record))
    }

    /// Writes the live XML description of a domain to `save-<name>.xml` in the artifact
    /// directory and returns the file path.
    pub async fn save_description(&self, name: &str) -> VirtscopeResult<PathBuf> {
        let xml = self.find(name)?.xml_desc()?;

        fs::create_dir_all(&self.artifact_dir).await?;
        let path = utils::domain_description_path(&self.artifact_dir, name);
        fs::write(&path, xml).await?;

        tracing::info!("saved description of {} to {}", name, path.display());
        Ok(path)
    }

    /// Lists every volume of every storage pool.
    pub fn list_all_volumes(&self) -> VirtscopeResult<Vec<VolumeEntry>> {
        let mut entries = Vec::new();
        for pool in self.session.list_storage_pools()? {
            for volume in self.session.list_volumes(&pool)? {
                entries.push(VolumeEntry {
                    pool: pool.clone(),
                    volume,
                });
            }
        }

        Ok(entries)
    }

    /// Sends stop requests until the domain is inactive.
    ///
    /// Transient domains only go away when stopped, so they always get at least one request.
    /// Returns whether the domain still exists afterwards.
    fn stop_until_inactive(&self, name: &str, transient: bool) -> VirtscopeResult<bool> {
        // `None` when the timeout is too large to represent, meaning no deadline.
        let deadline = Instant::now().checked_add(self.stop_policy.timeout());
        let mut requests = 0u32;

        loop {
            if !(transient && requests == 0) {
                if let Some(present) = self.settled(name)? {
                    return Ok(present);
                }
            }

            if requests > 0 && deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::error!(
                    "domain {} still active after {} stop requests",
                    name,
                    requests
                );
                return Err(VirtscopeError::StopTimeout {
                    name: name.to_string(),
                    timeout: self.stop_policy.timeout(),
                });
            }

            match self.session.destroy_domain(name) {
                Ok(()) => tracing::debug!("sent stop request to domain {}", name),
                Err(e) if e.is_not_found() => return Ok(false),
                // Raced with the domain stopping on its own.
                Err(HypervisorError::OperationInvalid(reason)) => {
                    tracing::debug!("stop request for {} rejected: {}", name, reason)
                }
                Err(e) => {
                    tracing::error!("failed to stop domain {}: {}", name, e);
                    return Err(e.into());
                }
            }
            requests += 1;

            if let Some(present) = self.settled(name)? {
                return Ok(present);
            }

            thread::sleep(self.stop_policy.interval());
        }
    }

    /// `Some(exists)` once the domain is inactive or gone, `None` while it is still running.
    fn settled(&self, name: &str) -> VirtscopeResult<Option<bool>> {
        match self.session.is_domain_active(name) {
            Ok(true) => Ok(None),
            Ok(false) => Ok(Some(true)),
            Err(e) if e.is_not_found() => Ok(Some(false)),
            Err(e) => {
                tracing::error!("failed to query state of domain {}: {}", name, e);
                Err(e.into())
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::hypervisor::{HypervisorEvent, MemoryHypervisor, Operation};

    const TEMPLATE: &str =
        "<domain><name>$NAME</name><uuid>$UUID</uuid><disk>$IMAGE_PATH</disk></domain>";

    fn repository() -> (Arc<MemoryHypervisor>, DomainRepository) {
        let hv = Arc::new(MemoryHypervisor::new());
        let stop = StopPolicy::builder().timeout_secs(0).interval_ms(5).build();
        let repo = DomainRepository::new(hv.clone(), stop, std::env::temp_dir());
        (hv, repo)
    }

    #[test]
    fn test_delete_absent_twice() -> anyhow::Result<()> {
        let (hv, repo) = repository();

        assert_eq!(repo.delete_if_exists("ghost")?, DeleteOutcome::Absent);
        assert_eq!(repo.delete_if_exists("ghost")?, DeleteOutcome::Absent);
        assert!(hv.events().is_empty());

        Ok(())
    }

    #[test]
    fn test_delete_stopped_domain_skips_stop() -> anyhow::Result<()> {
        let (hv, repo) = repository();
        hv.insert_domain("vm", true, false);

        assert_eq!(repo.delete_if_exists("vm")?, DeleteOutcome::Undefined);
        assert!(!hv.contains("vm"));
        assert_eq!(hv.events(), vec![HypervisorEvent::Undefined("vm".into())]);

        Ok(())
    }

    #[test]
    fn test_delete_running_defined_domain() -> anyhow::Result<()> {
        let (hv, repo) = repository();
        hv.insert_domain("vm", true, true);

        assert_eq!(repo.delete_if_exists("vm")?, DeleteOutcome::Undefined);
        assert!(!hv.contains("vm"));
        assert_eq!(
            hv.events(),
            vec![
                HypervisorEvent::Destroyed("vm".into()),
                HypervisorEvent::Undefined("vm".into()),
            ]
        );

        Ok(())
    }

    #[test]
    fn test_delete_running_transient_domain() -> anyhow::Result<()> {
        let (hv, repo) = repository();
        hv.insert_domain("vm", false, true);

        assert_eq!(repo.delete_if_exists("vm")?, DeleteOutcome::Vanished);
        assert!(!hv.contains("vm"));

        Ok(())
    }

    #[test]
    fn test_delete_times_out_on_stubborn_domain() {
        let (hv, repo) = repository();
        hv.insert_domain("vm", true, true);
        hv.set_stop_resistant("vm", true);

        let err = repo.delete_if_exists("vm").unwrap_err();
        assert!(matches!(err, VirtscopeError::StopTimeout { ref name, .. } if name == "vm"));
        assert!(hv.contains("vm"));
    }

    #[test]
    fn test_delete_with_unbounded_stop_timeout() -> anyhow::Result<()> {
        let hv = Arc::new(MemoryHypervisor::new());
        let stop = StopPolicy::builder()
            .timeout_secs(u64::MAX)
            .interval_ms(5)
            .build();
        let repo = DomainRepository::new(hv.clone(), stop, std::env::temp_dir());
        hv.insert_domain("vm", true, true);

        assert_eq!(repo.delete_if_exists("vm")?, DeleteOutcome::Undefined);
        assert!(!hv.contains("vm"));

        Ok(())
    }

    #[test]
    fn test_create_rejects_template_with_other_name() {
        let (hv, repo) = repository();
        let template = Template::new("<domain><name>fixed-vm</name><uuid>$UUID</uuid></domain>");

        let err = repo
            .create_from_template(&template, "vm", "/images/a.qcow2", true)
            .unwrap_err();

        assert!(matches!(
            err,
            VirtscopeError::DomainNameMismatch { ref expected, ref found }
                if expected == "vm" && found == "fixed-vm"
        ));
        assert!(hv.domain_names().is_empty());
        assert!(hv.events().is_empty());
    }

    #[test]
    fn test_delete_surfaces_backend_faults() {
        let (hv, repo) = repository();
        hv.insert_domain("vm", true, false);
        hv.fail_on(Operation::Undefine);

        let err = repo.delete_if_exists("vm").unwrap_err();
        assert!(matches!(err, VirtscopeError::Hypervisor(HypervisorError::Backend(_))));
    }

    #[test]
    fn test_create_replaces_existing_domain() -> anyhow::Result<()> {
        let (hv, repo) = repository();
        let template = Template::new(TEMPLATE);

        let first = repo.create_from_template(&template, "vm", "/images/a.qcow2", true)?;
        let second = repo.create_from_template(&template, "vm", "/images/a.qcow2", true)?;

        assert_eq!(hv.domain_names(), vec!["vm".to_string()]);
        assert_ne!(first.uuid(), second.uuid());
        assert_eq!(repo.find("vm")?.uuid(), second.uuid());

        Ok(())
    }

    #[test]
    fn test_create_transient_vs_defined() -> anyhow::Result<()> {
        let (_hv, repo) = repository();
        let template = Template::new(TEMPLATE);

        let transient = repo.create_from_template(&template, "a", "/images/a.qcow2", false)?;
        assert!(!transient.is_persistent());
        assert!(transient.is_active()?);

        let defined = repo.create_from_template(&template, "b", "/images/a.qcow2", true)?;
        assert!(defined.is_persistent());
        assert!(!defined.is_active()?);
        assert!(defined.xml_desc()?.contains("<disk>/images/a.qcow2</disk>"));

        Ok(())
    }

    #[test]
    fn test_find_and_rename() -> anyhow::Result<()> {
        let (hv, repo) = repository();
        hv.insert_domain("old", true, false);

        assert!(matches!(
            repo.find("missing"),
            Err(VirtscopeError::DomainNotFound(_))
        ));
        assert!(matches!(
            repo.rename("missing", "other"),
            Err(VirtscopeError::DomainNotFound(_))
        ));

        let renamed = repo.rename("old", "new")?;
        assert_eq!(renamed.name(), "new");
        assert_eq!(hv.domain_names(), vec!["new".to_string()]);

        Ok(())
    }

    #[test]
    fn test_list_all_volumes() -> anyhow::Result<()> {
        let (hv, repo) = repository();
        hv.add_volume("default", "a.qcow2");
        hv.add_volume("default", "b.qcow2");
        hv.add_volume("images", "c.qcow2");

        let volumes = repo.list_all_volumes()?;
        assert_eq!(volumes.len(), 3);
        assert_eq!(
            volumes[2],
            VolumeEntry {
                pool: "images".into(),
                volume: "c.qcow2".into()
            }
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_save_description() -> anyhow::Result<()> {
        let hv = Arc::new(MemoryHypervisor::new());
        let dir = tempfile::tempdir()?;
        let repo = DomainRepository::new(hv.clone(), StopPolicy::default(), dir.path());
        hv.insert_domain("vm", true, false);

        let path = repo.save_description("vm").await?;
        assert_eq!(path, dir.path().join("save-vm.xml"));
        assert_eq!(
            fs::read_to_string(&path).await?,
            "<domain><name>vm</name></domain>"
        );

        Ok(())
    }
}
