use std::{
    env, fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header::CONTENT_LENGTH, Client, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    config::ImageSourceConfig,
    utils::{self, IMAGE_PASS_ENV_VAR, IMAGE_USER_ENV_VAR},
    VirtscopeError, VirtscopeResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An image that is already on local disk.
#[derive(Debug, Clone)]
pub struct LocalImage {
    path: PathBuf,
}

/// An image fetched over HTTP(S), optionally packed in a tar archive.
///
/// The download lands in the configured download directory under the URL's file name. When a
/// file of the same size as the remote `Content-Length` is already there, the fetch is skipped.
/// `.tar`, `.tar.gz` and `.tgz` downloads are unpacked next to the archive and the configured
/// member path is returned.
#[derive(Debug)]
pub struct RemoteImage {
    client: ClientWithMiddleware,
    source: ImageSourceConfig,
    credentials: Option<Credentials>,
}

/// How a downloaded file is packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// A plain tar archive.
    Tar,

    /// A gzip-compressed tar archive.
    TarGz,
}

#[derive(Clone)]
struct Credentials {
    user: String,
    password: String,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Produces the local path of the disk image domains boot from.
#[async_trait]
pub trait ImageSupplier: Send + Sync + fmt::Debug {
    /// Makes the image available locally and returns its absolute path.
    async fn supply(&self) -> VirtscopeResult<PathBuf>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalImage {
    /// Creates a supplier for an image at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RemoteImage {
    /// Creates a supplier for a remote image.
    ///
    /// Credentials are read from `VIRTSCOPE_IMAGE_USER` and `VIRTSCOPE_IMAGE_PASS`, after loading
    /// a `.env` file if there is one.
    pub fn new(source: ImageSourceConfig) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            source,
            credentials: Credentials::from_env(),
        }
    }

    /// Uses explicit credentials instead of the environment.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    /// Where the download is stored.
    pub fn download_path(&self) -> VirtscopeResult<PathBuf> {
        let url = self.url()?;
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                VirtscopeError::InvalidArgument(format!(
                    "image url has no file name: {}",
                    self.source.get_url()
                ))
            })?;

        Ok(self.source.get_download_dir().join(file_name))
    }

    /// Downloads the image unless an identically sized copy is already present.
    pub async fn download(&self) -> VirtscopeResult<PathBuf> {
        let url = self.url()?;
        let path = self.download_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let local_size = match fs::metadata(&path).await {
            Ok(metadata) => Some(metadata.len()),
            Err(_) => None,
        };

        if let Some(local_size) = local_size {
            match self.remote_size(&url).await {
                Some(remote_size) if remote_size == local_size => {
                    tracing::info!("file already exists, skipping download: {}", path.display());
                    return Ok(path);
                }
                Some(remote_size) => tracing::info!(
                    "local copy is {} bytes, remote is {} bytes, downloading again",
                    local_size,
                    remote_size
                ),
                None => tracing::warn!("remote size of {} unknown, downloading again", url),
            }
        }

        tracing::info!("downloading {} to {}", url, path.display());

        let response = self.authorized(self.client.get(url.clone())).send().await?;
        if !response.status().is_success() {
            return Err(VirtscopeError::TransferFailed {
                url: url.to_string(),
                reason: format!("server responded with {}", response.status()),
            });
        }

        let partial_path = path.with_extension("part");
        let mut file = fs::File::create(&partial_path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| VirtscopeError::TransferFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        file.flush().await?;
        drop(file);

        fs::rename(&partial_path, &path).await?;
        tracing::info!("downloaded {} bytes to {}", written, path.display());

        Ok(path)
    }

    async fn remote_size(&self, url: &Url) -> Option<u64> {
        let response = match self.authorized(self.client.head(url.clone())).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::debug!("HEAD {} returned {}", url, response.status());
                return None;
            }
            Err(e) => {
                tracing::debug!("HEAD {} failed: {}", url, e);
                return None;
            }
        };

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(credentials) => request.basic_auth(&credentials.user, Some(&credentials.password)),
            None => request,
        }
    }

    fn url(&self) -> VirtscopeResult<Url> {
        Url::parse(self.source.get_url()).map_err(|e| {
            VirtscopeError::InvalidArgument(format!(
                "invalid image url {}: {}",
                self.source.get_url(),
                e
            ))
        })
    }
}

impl ArchiveKind {
    /// Recognizes an archive by its file name.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

impl Credentials {
    fn from_env() -> Option<Self> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("no .env file loaded: {}", e);
        }

        let user = env::var(IMAGE_USER_ENV_VAR).ok()?;
        let password = env::var(IMAGE_PASS_ENV_VAR).unwrap_or_default();
        Some(Self { user, password })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ImageSupplier for LocalImage {
    async fn supply(&self) -> VirtscopeResult<PathBuf> {
        utils::absolute_path(&self.path)
    }
}

#[async_trait]
impl ImageSupplier for RemoteImage {
    async fn supply(&self) -> VirtscopeResult<PathBuf> {
        let downloaded = self.download().await?;

        let Some(kind) = ArchiveKind::detect(&downloaded) else {
            return utils::absolute_path(downloaded);
        };

        let member = self.source.get_member().as_ref().ok_or_else(|| {
            VirtscopeError::InvalidArgument(format!(
                "{} is an archive but no member path is configured",
                downloaded.display()
            ))
        })?;

        let extract_dir = self.source.get_download_dir().clone();
        unpack(&downloaded, &extract_dir, kind).await?;

        let image = extract_dir.join(member);
        if !fs::try_exists(&image).await? {
            return Err(VirtscopeError::InvalidArgument(format!(
                "archive {} has no member {}",
                downloaded.display(),
                member.display()
            )));
        }

        utils::absolute_path(image)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Unpacks a tar archive into `extract_dir`.
pub async fn unpack(archive: &Path, extract_dir: &Path, kind: ArchiveKind) -> VirtscopeResult<()> {
    fs::create_dir_all(extract_dir).await?;

    let archive = archive.to_path_buf();
    let extract_dir = extract_dir.to_path_buf();

    tracing::info!("extracting {} into {}", archive.display(), extract_dir.display());

    tokio::task::spawn_blocking(move || -> VirtscopeResult<()> {
        let file = std::io::BufReader::new(std::fs::File::open(&archive)?);
        match kind {
            ArchiveKind::Tar => tar::Archive::new(file).unpack(&extract_dir)?,
            ArchiveKind::TarGz => {
                tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(&extract_dir)?
            }
        }
        Ok(())
    })
    .await??;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
