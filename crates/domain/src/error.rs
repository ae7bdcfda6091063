/// Shared error type used across all tandem crates.
///
/// The set of variants is closed: every failure that crosses a crate
/// boundary is folded into one of these, and each variant maps to a stable
/// string kind that is surfaced to clients in `error` events.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("provider terminated: {0}")]
    ProviderTerminated(String),

    #[error("plan invalid: {0}")]
    PlanInvalid(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("cancelled")]
    Cancelled,

    #[error("config: {0}")]
    Config(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Stable string identifier for the client-facing error taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport-error",
            Error::RateLimited(_) => "rate-limited",
            Error::Timeout(_) => "timeout",
            Error::ValidationFailed(_) => "validation-failed",
            Error::ToolNotFound(_) => "tool-not-found",
            Error::Provider { .. } => "provider-error",
            Error::ProviderTerminated(_) => "provider-terminated",
            Error::PlanInvalid(_) => "plan-invalid",
            Error::Denied(_) => "denied",
            Error::Cancelled => "cancelled",
            Error::Config(_) => "config-error",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether the LLM gateway may transparently retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited(_) | Error::Timeout(_) | Error::Transport(_)
        )
    }
}

impl From<std::io::Error> for Error {
    // Broken pipes and failed reads are transport failures; the original
    // error is flattened so the taxonomy stays cloneable.
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(Error::Timeout("llm".into()).kind(), "timeout");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(
            Error::Provider {
                provider: "filesystem".into(),
                message: "boom".into()
            }
            .kind(),
            "provider-error"
        );
        assert_eq!(Error::PlanInvalid("x".into()).kind(), "plan-invalid");
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::RateLimited("q".into()).is_retryable());
        assert!(Error::Timeout("t".into()).is_retryable());
        assert!(Error::Transport("pipe".into()).is_retryable());
        assert!(!Error::Denied("no".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn io_error_maps_to_transport() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(e.kind(), "transport-error");
    }
}
