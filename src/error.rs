//! Error definitions for the firmlink agent
//!
//! One taxonomy for the whole library. Recoverable conditions (a transport
//! hiccup, a single malformed message) are absorbed close to where they
//! happen and surface as booleans or log lines; unrecoverable conditions
//! (link down at boot, exhausted connect retries) go through the injected
//! restart primitive instead of bubbling up as errors, since a headless
//! device has no operator to report to.

use thiserror::Error;

/// Error types for the connectivity agent
#[derive(Debug, Error)]
pub enum AgentError {
    /// Network link is not up; fatal, escalates to a device restart
    #[error("network link unavailable")]
    LinkUnavailable,

    /// Wall-clock synchronization did not complete within its poll budget
    ///
    /// Soft failure: startup proceeds with a warning. Certificate
    /// validity-window checks may still fail downstream.
    #[error("time synchronization failed")]
    TimeSyncFailed,

    /// Supplied credential material was rejected before any network attempt
    ///
    /// Fatal to the connection attempt, never retried. The operator must fix
    /// the configuration and restart the process.
    #[error("invalid credentials: {0}")]
    CredentialInvalid(String),

    /// A single broker connect attempt failed; retryable with backoff
    #[error("broker connect failed: {0}")]
    TransportConnectFailed(String),

    /// The bounded connect-retry budget is spent; escalates to restart
    #[error("broker connect retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    /// An outbound publish did not go through; the caller may retry
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// An inbound payload did not parse; dropped, never propagated upward
    #[error("malformed inbound payload: {0}")]
    MalformedPayload(String),

    /// Configuration value outside its accepted range
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Physical output line could not be driven
    #[error("output driver failure: {0}")]
    OutputFailure(String),
}
