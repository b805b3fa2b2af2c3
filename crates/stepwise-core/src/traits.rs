use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// The opaque text-generation call a turn delegates to.
pub trait Generator: Send + Sync + 'static {
    /// Produce a reply and zero or more requested actions for one turn.
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<Generation>>;
}

/// Persistence backend for conversation threads.
pub trait ThreadStore: Send + Sync + 'static {
    /// Load a thread, or `None` if it has never been saved.
    fn load(&self, id: &ThreadId) -> BoxFuture<'_, Result<Option<ThreadSnapshot>>>;

    /// Insert or replace a thread.
    fn save(&self, snapshot: &ThreadSnapshot) -> BoxFuture<'_, Result<()>>;

    /// Discard a thread. Deleting an unknown id is not an error.
    fn delete(&self, id: &ThreadId) -> BoxFuture<'_, Result<()>>;

    /// List known thread ids.
    fn list(&self) -> BoxFuture<'_, Result<Vec<ThreadId>>>;
}
