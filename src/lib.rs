//! Gardening assistant: a streamed chat and a plant identifier backed by a
//! hosted Gemini model.

pub mod llm;
pub mod services;
