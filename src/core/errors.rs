//! Classified error kinds shared across the engine.

use thiserror::Error;

/// Errors with a meaning callers are expected to match on. Everything else
/// travels as a plain `anyhow` chain.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A mandatory session configuration field is missing.
    #[error("session: {0} is empty")]
    Config(&'static str),

    /// The cancellation token fired before or during the operation.
    #[error("operation interrupted")]
    Interrupted,

    /// The tunnel state machine rejected the request.
    #[error("session: cannot create a new tunnel of this kind: we are already using a proxy")]
    AlreadyUsingProxy,

    /// The selector exhausted every candidate probe service.
    #[error("all available probe services failed")]
    AllProbeServicesFailed,

    /// The tactics stream closed without producing a working connection.
    #[error("no connection tactic succeeded for {domain}:{port}")]
    NoWorkingTactic { domain: String, port: u16 },

    /// A service endpoint the transport cannot reach as configured.
    #[error("probe services: unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    /// The remote API answered with a non-2xx status, forwarded verbatim.
    #[error("remote api: http status {0}")]
    HttpStatus(u16),

    /// No experiment registered under the requested name.
    #[error("no such experiment: {0}")]
    UnknownExperiment(String),
}

impl EngineError {
    /// Short category label used as a structured logging field.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Interrupted => "interrupted",
            EngineError::AlreadyUsingProxy => "tunnel_conflict",
            EngineError::AllProbeServicesFailed => "all_services_failed",
            EngineError::NoWorkingTactic { .. } => "no_working_tactic",
            EngineError::UnsupportedEndpoint(_) => "unsupported_endpoint",
            EngineError::HttpStatus(_) => "http_status",
            EngineError::UnknownExperiment(_) => "unknown_experiment",
        }
    }
}
