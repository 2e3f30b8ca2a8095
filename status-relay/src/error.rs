use thiserror::Error;

/// Errors that stop the server.
///
/// Nothing that happens on a single connection ends up here; connection
/// failures are handled by evicting the user.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}
