use reqwest::StatusCode;

/// Failures talking to the control plane.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The API key was rejected (HTTP 401/403). Never retried.
    #[error("Control plane rejected the API key (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("Control plane request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Control plane returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Malformed control plane response: {0}")]
    Decode(String),
}

impl SourceError {
    /// Authentication failures must stop the agent.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Worth retrying with backoff: network trouble, throttling, or a
    /// server-side failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => {
                *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || *status >= 500
            }
            Self::Unauthorized { .. } | Self::Decode(_) => false,
        }
    }
}

/// Invalid or missing agent configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{key} is invalid: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Reasons the agent loop stops with an error.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A control-plane error the loop cannot recover from.
    #[error("Fatal control plane error: {0}")]
    ControlPlane(#[from] SourceError),

    #[error("Work directory {path} is unusable: {source}")]
    WorkDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
