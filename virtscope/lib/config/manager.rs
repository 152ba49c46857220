use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use tokio::fs;
use typed_builder::TypedBuilder;

use crate::{utils::VIRTSCOPE_URI_ENV_VAR, VirtscopeError, VirtscopeResult};

use super::{
    DEFAULT_CONNECTION_URI, DEFAULT_CONVERTER_FORMAT, DEFAULT_CONVERTER_PROGRAM,
    DEFAULT_IMAGE_DOWNLOAD_DIR, DEFAULT_READINESS_INTERVAL_MS, DEFAULT_READINESS_TIMEOUT_SECS,
    DEFAULT_SNAPSHOT_NAME, DEFAULT_SNAPSHOT_TEMPLATE_PATH, DEFAULT_STOP_INTERVAL_MS,
    DEFAULT_STOP_TIMEOUT_SECS, DEFAULT_TEMPLATE_PATH,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything the lifecycle manager needs to know that is not code.
///
/// Usually loaded from a `virtscope.yaml` file:
///
/// ```yaml
/// connection_uri: qemu:///system
/// image_path: "64bit/Linux Lite 5.8 (64bit).qcow2"
/// template_path: temp-qcow2-template.xml
/// readiness:
///   timeout_secs: 30
///   on_timeout: proceed
/// ```
///
/// Every field is optional in the file and falls back to the defaults in
/// [`config`](crate::config).
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub with_prefix")]
#[serde(default)]
pub struct ManagerConfig {
    /// The hypervisor connection URI.
    #[builder(default = DEFAULT_CONNECTION_URI.to_string(), setter(into))]
    connection_uri: String,

    /// The disk image substituted for `$IMAGE_PATH`, unless an image supplier is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    image_path: Option<PathBuf>,

    /// The domain template.
    #[builder(default = PathBuf::from(DEFAULT_TEMPLATE_PATH), setter(into))]
    template_path: PathBuf,

    /// The snapshot template used by snapshot scopes.
    #[builder(default = PathBuf::from(DEFAULT_SNAPSHOT_TEMPLATE_PATH), setter(into))]
    snapshot_template_path: PathBuf,

    /// The name of the snapshot taken by snapshot scopes.
    #[builder(default = DEFAULT_SNAPSHOT_NAME.to_string(), setter(into))]
    snapshot_name: String,

    /// Where saved domain and snapshot descriptions are written.
    #[builder(default = PathBuf::from("."), setter(into))]
    artifact_dir: PathBuf,

    /// How scopes wait for their domain to come up.
    #[builder(default)]
    readiness: ReadinessPolicy,

    /// How deletion waits for running domains to stop.
    #[builder(default)]
    stop: StopPolicy,

    /// Whether define-only and snapshot scopes start their domain after provisioning.
    #[builder(default)]
    start_defined: bool,

    /// Where a fresh image is fetched from.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    image_source: Option<ImageSourceConfig>,

    /// The image conversion program.
    #[builder(default)]
    converter: ConverterConfig,
}

/// How a scope waits for its domain to report active.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct ReadinessPolicy {
    /// Upper bound on the wait, in seconds.
    #[builder(default = DEFAULT_READINESS_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Pause between checks, in milliseconds.
    #[builder(default = DEFAULT_READINESS_INTERVAL_MS)]
    interval_ms: u64,

    /// What to do when the domain is still inactive at the deadline.
    #[builder(default)]
    on_timeout: OnTimeout,
}

/// What a scope does when its domain is not active by the readiness deadline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeout {
    /// Hand the domain to the caller anyway.
    #[default]
    Proceed,

    /// Clean up and fail with [`VirtscopeError::NotReady`].
    Fail,
}

/// How deletion stops a running domain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct StopPolicy {
    /// Upper bound on the wait, in seconds.
    #[builder(default = DEFAULT_STOP_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Pause between stop requests, in milliseconds.
    #[builder(default = DEFAULT_STOP_INTERVAL_MS)]
    interval_ms: u64,
}

/// A remote disk image.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ImageSourceConfig {
    /// The HTTP(S) URL of the image or of an archive containing it.
    #[builder(setter(into))]
    url: String,

    /// The image path inside the archive, relative to the extraction directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    member: Option<PathBuf>,

    /// Where the download and its extracted contents are kept.
    #[serde(default = "default_download_dir")]
    #[builder(default = default_download_dir(), setter(into))]
    download_dir: PathBuf,
}

/// The external program that converts disk images between formats.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct ConverterConfig {
    /// The program name or path.
    #[builder(default = DEFAULT_CONVERTER_PROGRAM.to_string(), setter(into))]
    program: String,

    /// The target format, also used as the output file extension.
    #[builder(default = DEFAULT_CONVERTER_FORMAT.to_string(), setter(into))]
    format: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ManagerConfig {
    /// Loads the configuration from a YAML file and applies environment overrides.
    pub async fn load(path: impl AsRef<Path>) -> VirtscopeResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).await?;
        let mut config = Self::from_yaml(&contents)?;
        config.apply_env_overrides();

        tracing::debug!("loaded config from {}: {:?}", path.display(), config);

        Ok(config)
    }

    /// Loads the configuration from a YAML file if it exists, or uses the defaults.
    pub async fn load_or_default(path: impl AsRef<Path>) -> VirtscopeResult<Self> {
        let path = path.as_ref();
        if fs::try_exists(path).await? {
            return Self::load(path).await;
        }

        tracing::debug!("config file {} not found, using defaults", path.display());
        let mut config = Self::default();
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parses the configuration from YAML text.
    pub fn from_yaml(contents: &str) -> VirtscopeResult<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(contents).map_err(VirtscopeError::InvalidConfig)
    }

    /// Applies `VIRTSCOPE_URI` if it is set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(uri) = std::env::var(VIRTSCOPE_URI_ENV_VAR) {
            if !uri.is_empty() {
                tracing::debug!("{} overrides connection uri: {}", VIRTSCOPE_URI_ENV_VAR, uri);
                self.connection_uri = uri;
            }
        }
    }
}

impl ReadinessPolicy {
    /// The readiness deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The pause between checks.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Returns a copy with a different deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }
}

impl StopPolicy {
    /// The stop deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The pause between stop requests.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn default_download_dir() -> PathBuf {
    DEFAULT_IMAGE_DOWNLOAD_DIR.clone()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
