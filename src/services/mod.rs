//! External service clients: Google APIs, embeddings, LLM completions.

pub mod embeddings;
pub mod google;
pub mod llm;

pub use embeddings::EmbeddingService;
pub use google::{GoogleProvider, HttpGoogleProvider, SyncItem, SyncPage};
pub use llm::LlmService;
