use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;

use crate::{
    hypervisor::{SharedHypervisor, SnapshotRecord},
    template::{Template, TemplateValues},
    utils, HypervisorError, VirtscopeResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A live handle to a domain snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    session: SharedHypervisor,
    record: SnapshotRecord,
}

/// Creates, finds and reverts snapshots of named domains.
#[derive(Debug, Clone)]
pub struct SnapshotRepository {
    session: SharedHypervisor,
    artifact_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Snapshot {
    pub(crate) fn new(session: SharedHypervisor, record: SnapshotRecord) -> Self {
        Self { session, record }
    }

    /// The snapshot name.
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// The name of the domain the snapshot belongs to.
    pub fn domain_name(&self) -> &str {
        &self.record.domain
    }

    /// Whether this was the domain's current snapshot when the handle was obtained.
    pub fn is_current(&self) -> bool {
        self.record.is_current
    }

    /// Creation time in seconds since the Unix epoch, when the backend reports it.
    pub fn creation_time(&self) -> Option<i64> {
        self.record.creation_time
    }

    /// Fetches the snapshot's XML description.
    pub fn xml_desc(&self) -> VirtscopeResult<String> {
        self.session
            .snapshot_xml(self.domain_name(), self.name())
            .map_err(HypervisorError::into_lookup_error)
    }

    /// Reverts the owning domain to this snapshot.
    pub fn revert(&self) -> VirtscopeResult<()> {
        self.session
            .revert_to_snapshot(self.domain_name(), self.name())
            .map_err(HypervisorError::into_lookup_error)
    }
}

impl SnapshotRepository {
    /// Creates a repository over an open session.
    pub fn new(session: SharedHypervisor, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            session,
            artifact_dir: artifact_dir.into(),
        }
    }

    /// Lists the names of a domain's snapshots.
    pub fn list_names(&self, domain_name: &str) -> VirtscopeResult<Vec<String>> {
        self.session
            .list_snapshot_names(domain_name)
            .map_err(HypervisorError::into_lookup_error)
    }

    /// Lists a domain's snapshots.
    pub fn list(&self, domain_name: &str) -> VirtscopeResult<Vec<Snapshot>> {
        self.list_names(domain_name)?
            .iter()
            .map(|name| self.lookup(domain_name, name))
            .collect()
    }

    /// Looks up a snapshot by domain and snapshot name.
    pub fn lookup(&self, domain_name: &str, snapshot_name: &str) -> VirtscopeResult<Snapshot> {
        let record = self
            .session
            .lookup_snapshot(domain_name, snapshot_name)
            .map_err(HypervisorError::into_lookup_error)?;

        Ok(Snapshot::new(self.session.clone(), record))
    }

    /// Creates a snapshot of an existing domain from a template.
    ///
    /// The template is rendered with `DOMAIN_NAME`, `SNAPSHOT_NAME`, `IMAGE_PATH`,
    /// `CREATION_TIME` (the current Unix time in seconds) and a fresh `UUID`.
    pub fn create_from_template(
        &self,
        template: &Template,
        domain_name: &str,
        snapshot_name: &str,
        image_path: impl AsRef<Path>,
    ) -> VirtscopeResult<Snapshot> {
        self.session
            .lookup_domain(domain_name)
            .map_err(HypervisorError::into_lookup_error)?;

        let image_path = image_path.as_ref().display().to_string();
        let values = TemplateValues::for_snapshot(
            domain_name,
            snapshot_name,
            &image_path,
            Utc::now().timestamp(),
        );
        let xml = template.render(&values);

        let record = self
            .session
            .create_snapshot(domain_name, &xml)
            .map_err(HypervisorError::into_lookup_error)?;

        tracing::info!("created snapshot {} of domain {}", record.name, domain_name);

        Ok(Snapshot::new(self.session.clone(), record))
    }

    /// Reverts a domain to one of its snapshots.
    pub fn revert(&self, domain_name: &str, snapshot_name: &str) -> VirtscopeResult<()> {
        self.session
            .revert_to_snapshot(domain_name, snapshot_name)
            .map_err(HypervisorError::into_lookup_error)?;

        tracing::info!("reverted domain {} to snapshot {}", domain_name, snapshot_name);
        Ok(())
    }

    /// Writes every snapshot description of a domain to `<domain>-<snapshot>-snapshot.xml` in
    /// the artifact directory and returns the written paths.
    pub async fn save_all_descriptions(&self, domain_name: &str) -> VirtscopeResult<Vec<PathBuf>> {
        let snapshots = self.list(domain_name)?;
        if snapshots.is_empty() {
            tracing::info!("domain {} has no snapshots to save", domain_name);
            return Ok(Vec::new());
        }

        fs::create_dir_all(&self.artifact_dir).await?;

        let mut paths = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let path =
                utils::snapshot_description_path(&self.artifact_dir, domain_name, snapshot.name());
            fs::write(&path, snapshot.xml_desc()?).await?;
            tracing::info!("saved snapshot description to {}", path.display());
            paths.push(path);
        }

        Ok(paths)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
