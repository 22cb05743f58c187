/// Core error type for the bridge.
///
/// Adapter crates should map their specific errors into this type so the
/// dispatch loop can handle failures consistently (apology reply vs
/// skip-and-retry vs refuse to start).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport pull failed: {0}")]
    TransportPull(String),

    #[error("transport push failed: {0}")]
    TransportPush(String),

    #[error("completion request timed out")]
    CompletionTimeout,

    #[error("completion request failed: {0}")]
    CompletionRequest(String),

    #[error("completion service returned status {status}")]
    CompletionHttp { status: u16 },

    #[error("completion response could not be decoded: {0}")]
    CompletionDecode(String),
}

pub type Result<T> = std::result::Result<T, Error>;
