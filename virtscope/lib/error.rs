use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
    time::Duration,
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a virtscope-related operation.
pub type VirtscopeResult<T> = Result<T, VirtscopeError>;

/// The result of a call into a hypervisor backend.
pub type HypervisorResult<T> = Result<T, HypervisorError>;

/// An error that occurred while managing domains, snapshots or images.
#[derive(Debug, Error)]
pub enum VirtscopeError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// A fault reported by the hypervisor backend.
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    /// Opening the hypervisor session failed.
    #[error("failed to open connection to {uri}: {reason}")]
    ConnectionFailed {
        /// The connection URI.
        uri: String,

        /// Why the connection could not be opened.
        reason: String,
    },

    /// The named domain does not exist.
    #[error("domain not found: {0}")]
    DomainNotFound(String),

    /// The named snapshot does not exist on the domain.
    #[error("snapshot not found: {domain}/{snapshot}")]
    SnapshotNotFound {
        /// The domain the snapshot was looked up on.
        domain: String,

        /// The snapshot name.
        snapshot: String,
    },

    /// A domain kept reporting active after repeated stop requests.
    #[error("domain {name} did not stop within {timeout:?}")]
    StopTimeout {
        /// The domain name.
        name: String,

        /// How long the stop loop waited.
        timeout: Duration,
    },

    /// A domain did not become active in time and the readiness policy requires it.
    #[error("domain {name} did not become active within {timeout:?}")]
    NotReady {
        /// The domain name.
        name: String,

        /// The readiness timeout.
        timeout: Duration,
    },

    /// A template file could not be read.
    #[error("failed to load template {path}: {source}")]
    TemplateLoad {
        /// The template path.
        path: PathBuf,

        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The image converter exited unsuccessfully.
    #[error("failed to convert {path}: {message}")]
    ConversionFailed {
        /// The source image path.
        path: PathBuf,

        /// The converter's exit code, if it exited normally.
        status: Option<i32>,

        /// A user-facing explanation.
        message: String,
    },

    /// The image converter program could not be located.
    #[error("image converter not found: {0}")]
    ConverterNotFound(String),

    /// Fetching a remote image failed.
    #[error("failed to fetch {url}: {reason}")]
    TransferFailed {
        /// The remote URL.
        url: String,

        /// Why the transfer failed.
        reason: String,
    },

    /// An HTTP request failed.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An HTTP middleware operation failed.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// The configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] serde_yaml::Error),

    /// No image path was configured and no supplier was set.
    #[error("no image path configured")]
    ImagePathNotConfigured,

    /// No remote image source was configured.
    #[error("no image source configured")]
    ImageSourceNotConfigured,

    /// A blocking task failed to complete.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An invalid argument was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A rendered template names a different domain than the one requested.
    #[error("template defines domain {found:?} instead of {expected:?}, use $NAME in <name>")]
    DomainNameMismatch {
        /// The requested name.
        expected: String,

        /// The name in the rendered definition.
        found: String,
    },

    /// The session still has open scopes whose cleanup needs it.
    #[error("{0} scope(s) still open, close them before the session")]
    ScopesStillOpen(usize),
}

/// A fault reported by a hypervisor backend.
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The backend has no domain with this name.
    #[error("no domain named {0}")]
    NoDomain(String),

    /// The backend has no snapshot with this name on the domain.
    #[error("no snapshot named {snapshot} on domain {domain}")]
    NoSnapshot {
        /// The domain name.
        domain: String,

        /// The snapshot name.
        snapshot: String,
    },

    /// The backend has no storage pool with this name.
    #[error("no storage pool named {0}")]
    NoPool(String),

    /// The operation conflicts with existing state.
    #[error("operation invalid: {0}")]
    OperationInvalid(String),

    /// The definition submitted to the backend was rejected.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// Any other backend fault.
    #[error("{0}")]
    Backend(String),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VirtscopeError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> VirtscopeError {
        VirtscopeError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns `true` if the error means the domain or snapshot is absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            VirtscopeError::DomainNotFound(_) | VirtscopeError::SnapshotNotFound { .. } => true,
            VirtscopeError::Hypervisor(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl HypervisorError {
    /// Returns `true` for the "no such object" family of faults.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HypervisorError::NoDomain(_)
                | HypervisorError::NoSnapshot { .. }
                | HypervisorError::NoPool(_)
        )
    }

    /// Maps a missing domain to [`VirtscopeError::DomainNotFound`] and a missing snapshot to
    /// [`VirtscopeError::SnapshotNotFound`]. Everything else is wrapped as is.
    pub fn into_lookup_error(self) -> VirtscopeError {
        match self {
            HypervisorError::NoDomain(name) => VirtscopeError::DomainNotFound(name),
            HypervisorError::NoSnapshot { domain, snapshot } => {
                VirtscopeError::SnapshotNotFound { domain, snapshot }
            }
            e => VirtscopeError::Hypervisor(e),
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `VirtscopeResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> VirtscopeResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
