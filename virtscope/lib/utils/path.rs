use std::path::{Path, PathBuf};

use crate::VirtscopeResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The sub directory of the home directory where virtscope keeps its data.
pub const VIRTSCOPE_HOME_DIR: &str = ".virtscope";

/// The sub directory of the virtscope home where fetched images are cached.
pub const IMAGES_SUBDIR: &str = "images";

/// The default configuration file name.
pub const VIRTSCOPE_CONFIG_FILENAME: &str = "virtscope.yaml";

/// The environment variable that overrides the configured connection URI.
pub const VIRTSCOPE_URI_ENV_VAR: &str = "VIRTSCOPE_URI";

/// The environment variable holding the user name for remote image fetches.
pub const IMAGE_USER_ENV_VAR: &str = "VIRTSCOPE_IMAGE_USER";

/// The environment variable holding the password for remote image fetches.
pub const IMAGE_PASS_ENV_VAR: &str = "VIRTSCOPE_IMAGE_PASS";

/// The prefix of saved domain descriptions.
pub const DOMAIN_DESCRIPTION_PREFIX: &str = "save-";

/// The suffix of saved snapshot descriptions.
pub const SNAPSHOT_DESCRIPTION_SUFFIX: &str = "-snapshot.xml";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Makes a path absolute against the current directory without requiring it to exist.
pub fn absolute_path(path: impl AsRef<Path>) -> VirtscopeResult<PathBuf> {
    Ok(std::path::absolute(path.as_ref())?)
}

/// Renders a path the way it is substituted into templates.
pub fn template_path_string(path: impl AsRef<Path>) -> VirtscopeResult<String> {
    Ok(absolute_path(path)?.display().to_string())
}

/// The file a domain's live description is saved to.
pub fn domain_description_path(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref()
        .join(format!("{DOMAIN_DESCRIPTION_PREFIX}{name}.xml"))
}

/// The file a snapshot's description is saved to.
pub fn snapshot_description_path(dir: impl AsRef<Path>, domain: &str, snapshot: &str) -> PathBuf {
    dir.as_ref()
        .join(format!("{domain}-{snapshot}{SNAPSHOT_DESCRIPTION_SUFFIX}"))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_path_keeps_spaces() -> anyhow::Result<()> {
        let path = absolute_path("64bit/Linux Lite 5.8 (64bit).qcow2")?;
        assert!(path.is_absolute());
        assert!(path.ends_with("64bit/Linux Lite 5.8 (64bit).qcow2"));
        Ok(())
    }

    #[test]
    fn test_description_paths() {
        assert_eq!(
            domain_description_path("/tmp", "vm"),
            PathBuf::from("/tmp/save-vm.xml")
        );
        assert_eq!(
            snapshot_description_path("/tmp", "vm", "main"),
            PathBuf::from("/tmp/vm-main-snapshot.xml")
        );
    }
}
