//! Health probe trait.

use futures::future::BoxFuture;
use std::future::Future;

/// Errors a probe can report. Any error demotes the backend; the variants
/// exist for logging and metrics labels.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    /// The backend could not be reached (connect refused, reset, ...).
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    /// The backend answered but the response could not be parsed.
    #[error("invalid probe response: {0}")]
    InvalidResponse(String),
}

/// A single active check against one backend.
///
/// Implemented by the backend transports (an HTTP GET of the configured
/// request path, a FastCGI request for the configured script). The probe
/// resolves to the response status code; the monitor compares it against
/// its expected code.
///
/// Closures returning a future get a blanket implementation:
///
/// ```rust
/// use director_health::HealthProbe;
///
/// let probe = || async { Ok::<u16, director_health::ProbeError>(200) };
/// let _boxed = probe.probe();
/// ```
pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> BoxFuture<'static, Result<u16, ProbeError>>;
}

impl<F, Fut> HealthProbe for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<u16, ProbeError>> + Send + 'static,
{
    fn probe(&self) -> BoxFuture<'static, Result<u16, ProbeError>> {
        Box::pin(self())
    }
}

impl HealthProbe for std::sync::Arc<dyn HealthProbe> {
    fn probe(&self) -> BoxFuture<'static, Result<u16, ProbeError>> {
        (**self).probe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_probe_resolves() {
        let probe = || async { Ok::<u16, ProbeError>(204) };
        assert_eq!(probe.probe().await.unwrap(), 204);
    }

    #[tokio::test]
    async fn probe_error_is_displayable() {
        let probe = || async { Err(ProbeError::Unreachable("connection refused".into())) };
        let err = probe.probe().await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}
