//! LLM types — provider-neutral traits, payloads and errors.
//!
//! The chat and identify services only ever see these traits, so the
//! Gemini client can be swapped for a scripted mock in tests.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced by LLM client operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// A configuration value could not be parsed.
    #[error("config parse failed: {0}")]
    ConfigParse(String),

    /// The required API key environment variable is not set.
    #[error("missing API key: env var {var} not set")]
    MissingApiKey { var: String },

    /// The HTTP request to the LLM provider failed.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// The LLM provider returned a non-success HTTP status.
    #[error("API response error: status {status}")]
    ApiResponse { status: u16, body: String },

    /// The LLM provider response body could not be deserialized.
    #[error("API response parse failed: {0}")]
    ApiParse(String),

    /// The provider answered but the response carried no text.
    #[error("API response contained no text")]
    EmptyResponse,

    /// Image bytes could not be loaded for encoding.
    #[error("image read failed: {0}")]
    ImageRead(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Base64-encoded image ready for transport to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineImage {
    pub mime_type: String,
    /// Standard-alphabet base64, no data-URL prefix.
    pub data: String,
}

/// Lazy, finite, ordered sequence of response fragments.
///
/// The stream ends after the last fragment. An `Err` item ends the turn;
/// nothing is yielded after it.
pub type TextStream<'a> = BoxStream<'a, Result<String, LlmError>>;

// =============================================================================
// PROVIDER TRAITS
// =============================================================================

/// Creates conversational sessions. Enables mocking in tests.
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    /// Open a fresh multi-turn session primed with `system` instructions.
    ///
    /// # Errors
    ///
    /// Returns an [`LlmError`] if the provider refuses to create the session.
    async fn start_chat(&self, system: &str) -> Result<Box<dyn ChatSession>, LlmError>;
}

/// A stateful conversation handle. History is owned by the session.
#[async_trait::async_trait]
pub trait ChatSession: Send {
    /// Send one user message and stream the model reply.
    ///
    /// The returned stream borrows the session; the turn is committed to
    /// the session history only once the stream has been drained.
    ///
    /// # Errors
    ///
    /// Returns an [`LlmError`] if the request cannot be opened. Failures
    /// after the stream is open arrive as `Err` items.
    async fn send_message_stream<'a>(&'a mut self, message: &str) -> Result<TextStream<'a>, LlmError>;
}

/// One-shot multimodal analysis.
#[async_trait::async_trait]
pub trait VisionModel: Send + Sync {
    /// Ask the model about `image`, returning the complete text answer.
    ///
    /// # Errors
    ///
    /// Returns an [`LlmError`] if the request fails or the response carries
    /// no text.
    async fn analyze_image(&self, image: &InlineImage, instruction: &str) -> Result<String, LlmError>;
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
