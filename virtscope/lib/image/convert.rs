use std::{
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::process::Command;

use crate::{config::ConverterConfig, VirtscopeError, VirtscopeResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const CONVERSION_FAILED_MESSAGE: &str =
    "Failed to convert file. Make sure the file exists and you have permission to read it";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Converts disk images with `qemu-img convert`.
#[derive(Debug, Clone)]
pub struct QemuImgConverter {
    program: String,
    format: String,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Converts a disk image into another format.
#[async_trait]
pub trait ImageConverter: Send + Sync + fmt::Debug {
    /// Converts `source` and returns the path of the converted image.
    async fn convert(&self, source: &Path) -> VirtscopeResult<PathBuf>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl QemuImgConverter {
    /// Creates a converter running `program` with output format `format`.
    pub fn new(program: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            format: format.into(),
        }
    }

    /// The output format.
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Where the converted image of `source` is written: a sibling file with the format as its
    /// extension.
    pub fn output_path(&self, source: &Path) -> PathBuf {
        source.with_extension(&self.format)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ImageConverter for QemuImgConverter {
    async fn convert(&self, source: &Path) -> VirtscopeResult<PathBuf> {
        let destination = self.output_path(source);
        if destination == source {
            return Err(VirtscopeError::InvalidArgument(format!(
                "{} is already a {} image",
                source.display(),
                self.format
            )));
        }

        let program = which::which(&self.program)
            .map_err(|_| VirtscopeError::ConverterNotFound(self.program.clone()))?;

        tracing::info!(
            "converting {} to {} with {}",
            source.display(),
            destination.display(),
            program.display()
        );

        let status = Command::new(&program)
            .arg("convert")
            .arg(source)
            .arg("-O")
            .arg(&self.format)
            .arg(&destination)
            .status()
            .await?;

        if !status.success() {
            tracing::error!("{} exited with {}", program.display(), status);
            return Err(VirtscopeError::ConversionFailed {
                path: source.to_path_buf(),
                status: status.code(),
                message: CONVERSION_FAILED_MESSAGE.to_string(),
            });
        }

        tracing::info!("converted image written to {}", destination.display());
        Ok(destination)
    }
}

impl From<&ConverterConfig> for QemuImgConverter {
    fn from(config: &ConverterConfig) -> Self {
        Self::new(config.get_program(), config.get_format())
    }
}

impl Default for QemuImgConverter {
    fn default() -> Self {
        Self::from(&ConverterConfig::default())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_is_a_sibling() {
        let converter = QemuImgConverter::default();
        assert_eq!(
            converter.output_path(Path::new("/images/Linux Lite 5.8 (64bit).vmdk")),
            PathBuf::from("/images/Linux Lite 5.8 (64bit).qcow2")
        );
    }

    #[tokio::test]
    async fn test_missing_program() {
        let converter = QemuImgConverter::new("virtscope-no-such-converter", "qcow2");
        let err = converter
            .convert(Path::new("/images/a.vmdk"))
            .await
            .unwrap_err();
        assert!(matches!(err, VirtscopeError::ConverterNotFound(_)));
    }

    #[tokio::test]
    async fn test_same_format_is_rejected() {
        let converter = QemuImgConverter::default();
        let err = converter
            .convert(Path::new("/images/a.qcow2"))
            .await
            .unwrap_err();
        assert!(matches!(err, VirtscopeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_conversion_failure() {
        // `false` accepts any arguments and exits with 1.
        let converter = QemuImgConverter::new("false", "qcow2");
        let err = converter
            .convert(Path::new("/images/a.vmdk"))
            .await
            .unwrap_err();

        match err {
            VirtscopeError::ConversionFailed { path, status, message } => {
                assert_eq!(path, PathBuf::from("/images/a.vmdk"));
                assert_eq!(status, Some(1));
                assert!(message.contains("Make sure the file exists"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_successful_conversion_returns_output_path() -> anyhow::Result<()> {
        let converter = QemuImgConverter::new("true", "raw");
        let output = converter.convert(Path::new("/images/a.vmdk")).await?;
        assert_eq!(output, PathBuf::from("/images/a.raw"));
        Ok(())
    }
}
