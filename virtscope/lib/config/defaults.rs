use std::{path::PathBuf, sync::LazyLock};

use crate::utils::{IMAGES_SUBDIR, VIRTSCOPE_HOME_DIR};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default hypervisor connection URI.
pub const DEFAULT_CONNECTION_URI: &str = "qemu:///system";

/// The default domain template file.
pub const DEFAULT_TEMPLATE_PATH: &str = "temp-template.xml";

/// The default snapshot template file.
pub const DEFAULT_SNAPSHOT_TEMPLATE_PATH: &str = "temp-snapshot-template.xml";

/// The name of the snapshot taken by snapshot scopes.
pub const DEFAULT_SNAPSHOT_NAME: &str = "main";

/// How long a scope waits for its domain to become active, in seconds.
pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 30;

/// How often a scope checks whether its domain is active, in milliseconds.
pub const DEFAULT_READINESS_INTERVAL_MS: u64 = 100;

/// How long deletion waits for a running domain to stop, in seconds.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 60;

/// How often deletion re-issues the stop request, in milliseconds.
pub const DEFAULT_STOP_INTERVAL_MS: u64 = 1000;

/// The default image conversion program.
pub const DEFAULT_CONVERTER_PROGRAM: &str = "qemu-img";

/// The default target image format.
pub const DEFAULT_CONVERTER_FORMAT: &str = "qcow2";

/// Where fetched images are cached.
pub static DEFAULT_IMAGE_DOWNLOAD_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(VIRTSCOPE_HOME_DIR)
        .join(IMAGES_SUBDIR)
});
