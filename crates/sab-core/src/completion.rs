use async_trait::async_trait;

use crate::Result;

/// The remote completion service: prompt in, reply text out.
///
/// Implementations own their transport details (endpoint, timeout) and map
/// failures into the typed completion errors so the dispatch loop can fall
/// back to an apology reply.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}
