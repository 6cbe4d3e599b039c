//! LLM — provider adapter for the chat and plant identification flows.
//!
//! DESIGN
//! ======
//! Services depend on the provider-neutral traits in [`types`]; the only
//! concrete provider is Gemini, configured from environment variables.
//! There is no retry or backoff layer: every failure surfaces once, as a
//! single [`LlmError`], to the caller that issued the request.

pub mod config;
pub mod gemini;
pub mod types;

pub use config::LlmConfig;
pub use gemini::GeminiClient;
pub use types::{ChatModel, ChatSession, InlineImage, LlmError, TextStream, VisionModel};

/// Build the Gemini client from environment variables.
///
/// # Errors
///
/// Returns an error if the API key is missing or the HTTP client fails.
pub fn from_env() -> Result<GeminiClient, LlmError> {
    GeminiClient::new(LlmConfig::from_env()?)
}
