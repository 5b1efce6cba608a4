//! The text generation backend, seen from the transports.
//!
//! Transports only depend on the [`Generator`] trait. A generator turns a prompt into an
//! answer, either all at once or as a [`FragmentStream`] fed by a task the generator
//! spawns. Failures are opaque: transports show the error text to the user as the answer.

use crate::error::Error;
use crate::stream::FragmentStream;
use std::sync::Arc;

pub mod upstream;

pub use upstream::UpstreamGenerator;

/// `DynGenerator` is a type alias for a [`Generator`] shared by every transport.
pub type DynGenerator = Arc<dyn Generator + Send + Sync>;

#[async_trait::async_trait]
pub trait Generator {
    /// Generate the complete answer to `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String, Error>;

    /// Start generating the answer to `prompt`, returning its fragments as they are
    /// produced. The producing task stops when the returned stream is dropped or
    /// cancelled.
    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream, Error>;
}
