//! Error types for the relay server
//!
//! Defines setup and transport errors. Uses thiserror for ergonomic
//! error definitions.

use thiserror::Error;

/// Relay server errors
///
/// Setup errors (`NotTls`, certificate problems, bind failures) are fatal to
/// server startup. `ClosedConnection` is the per-client transport error
/// returned when enqueueing to an already closed write pump.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The server was built without a TLS configuration
    #[error("server has no TLS configuration")]
    NotTls,

    /// Write attempted on a closed client connection
    #[error("closed connection")]
    ClosedConnection,

    /// Certificate file did not contain the expected material
    #[error("certificate error: {0}")]
    Certificate(String),

    /// IO error (bind, accept, read, write)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Self-signed certificate generation error
    #[error("certificate generation error: {0}")]
    CertificateGen(#[from] rcgen::Error),
}
