//! Interactive flows built on the LLM adapter.
//!
//! ARCHITECTURE
//! ============
//! Each service owns its view state (transcript, selected image, result)
//! and exposes transitions as methods, so any front end can render it.
//! The two services are independent of each other.

pub mod chat;
pub mod identify;
