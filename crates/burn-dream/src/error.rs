use std::fmt;

use burn_dream_samplers::SchedulerError;
use burn_dream_tiling::TilingError;
use thiserror::Error;

/// External inference collaborator that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    TextEncoder,
    Denoiser,
    VaeEncoder,
    VaeDecoder,
    Upscaler,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TextEncoder => "text encoder",
            Self::Denoiser => "denoiser",
            Self::VaeEncoder => "VAE encoder",
            Self::VaeDecoder => "VAE decoder",
            Self::Upscaler => "upscaler",
        })
    }
}

/// Failure reported by an inference service implementation
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ServiceError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors that abort a generation request
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Tiling(#[from] TilingError),

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{service} failed: {source}")]
    Service {
        service: ServiceKind,
        #[source]
        source: ServiceError,
    },

    #[error("request needs the {0} but none was provided")]
    MissingService(ServiceKind),

    #[error("non-finite values in {0}")]
    NonFinite(String),
}

impl PipelineError {
    pub(crate) fn service(service: ServiceKind) -> impl FnOnce(ServiceError) -> Self {
        move |source| Self::Service { service, source }
    }

    /// Failure inside an external collaborator, as opposed to a caller mistake
    pub fn is_external(&self) -> bool {
        matches!(self, Self::Service { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Rejects tensors whose dimensions differ from `expected`
pub(crate) fn check_dims<const D: usize>(
    what: &'static str,
    expected: [usize; D],
    actual: [usize; D],
) -> Result<()> {
    if expected != actual {
        return Err(PipelineError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_chain() {
        let io = std::io::Error::other("socket closed");
        let err = PipelineError::Service {
            service: ServiceKind::Denoiser,
            source: ServiceError::with_source("inference call failed", io),
        };
        assert!(err.is_external());
        assert_eq!(err.to_string(), "denoiser failed: inference call failed");

        let source = std::error::Error::source(&err).unwrap();
        let root = std::error::Error::source(source).unwrap();
        assert_eq!(root.to_string(), "socket closed");
    }

    #[test]
    fn test_lower_errors_convert() {
        let err: PipelineError = SchedulerError::TimestepsNotSet.into();
        assert!(matches!(err, PipelineError::Scheduler(_)));
        assert!(!err.is_external());

        let err: PipelineError = TilingError::EmptyTiles.into();
        assert!(matches!(err, PipelineError::Tiling(TilingError::EmptyTiles)));
    }

    #[test]
    fn test_check_dims() {
        assert!(check_dims("latent", [1, 4, 8, 8], [1, 4, 8, 8]).is_ok());
        let err = check_dims("latent", [1, 4, 8, 8], [1, 4, 8, 9]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "shape mismatch for latent: expected [1, 4, 8, 8], got [1, 4, 8, 9]"
        );
    }
}
