//! Plant identification — one image, one instruction, one answer.
//!
//! DESIGN
//! ======
//! The analyzer holds at most one selected image and the latest result.
//! `accept` swaps the image (after a size check) and clears the result;
//! `analyze` base64-encodes the bytes and makes a single non-streaming
//! provider call. All failures end as a fixed user-visible message.
//!
//! TRADE-OFFS
//! ==========
//! Every accepted image bumps a generation counter. If the image is
//! replaced while an analysis is outstanding, that call keeps the
//! single-flight slot until it returns, but its answer is dropped because
//! it describes the previous image. A dropped `analyze` future frees the
//! slot on its way out.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use tracing::{info, warn};

use crate::llm::{InlineImage, LlmError, VisionModel};

/// Largest accepted image, inclusive.
pub const MAX_IMAGE_BYTES: u64 = 4 * 1024 * 1024;
pub const DEFAULT_INSTRUCTION: &str = "What plant is this and how do I care for it?";
pub const IMAGE_TOO_LARGE: &str = "Image size should be less than 4MB.";
pub const ANALYSIS_FAILED: &str = "Failed to analyze the image. Please try again.";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentifyError {
    #[error("image is {size} bytes; limit is {limit}")]
    ImageTooLarge { size: u64, limit: u64 },
    #[error("no image selected")]
    NoImage,
    #[error("an analysis is already running")]
    Busy,
    #[error("cannot read image {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Read lazily when the image is encoded.
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

/// A user-selected image. Only `size` is needed to accept it; the bytes
/// are loaded when an analysis encodes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub source: ImageSource,
}

impl ImageFile {
    #[must_use]
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: bytes.len() as u64,
            source: ImageSource::Bytes(bytes),
        }
    }

    /// Describe an on-disk image from its metadata. The type string is
    /// trusted as given.
    ///
    /// # Errors
    ///
    /// [`IdentifyError::Unreadable`] if the file's metadata cannot be read.
    pub async fn from_path(path: impl AsRef<Path>, mime_type: impl Into<String>) -> Result<Self, IdentifyError> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| IdentifyError::Unreadable { path: path.to_path_buf(), reason: e.to_string() })?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Ok(Self { name, mime_type: mime_type.into(), size: meta.len(), source: ImageSource::Path(path.to_path_buf()) })
    }

    /// Load the bytes and base64-encode them for transport.
    ///
    /// # Errors
    ///
    /// [`LlmError::ImageRead`] if the file cannot be read.
    pub async fn encode(&self) -> Result<InlineImage, LlmError> {
        let data = match &self.source {
            ImageSource::Bytes(bytes) => BASE64_STANDARD.encode(bytes),
            ImageSource::Path(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| LlmError::ImageRead(format!("{}: {e}", path.display())))?;
                BASE64_STANDARD.encode(bytes)
            }
        };
        Ok(InlineImage { mime_type: self.mime_type.clone(), data })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Empty,
    ImageAccepted,
    Analyzing,
    ResultReady,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Completed(String),
    /// Encoding or provider failure; carries the user-visible message.
    Failed(String),
    /// The image was replaced while the call was outstanding.
    Superseded,
}

struct IdentifyState {
    phase: Phase,
    image: Option<ImageFile>,
    generation: u64,
    in_flight: bool,
    instruction: String,
    result: Option<String>,
    error: Option<String>,
}

// =============================================================================
// ANALYZER
// =============================================================================

pub struct ImageAnalyzer {
    vision: Arc<dyn VisionModel>,
    state: Mutex<IdentifyState>,
}

impl ImageAnalyzer {
    #[must_use]
    pub fn new(vision: Arc<dyn VisionModel>) -> Self {
        Self {
            vision,
            state: Mutex::new(IdentifyState {
                phase: Phase::Empty,
                image: None,
                generation: 0,
                in_flight: false,
                instruction: DEFAULT_INSTRUCTION.to_string(),
                result: None,
                error: None,
            }),
        }
    }

    /// Select `file` as the image to analyze.
    ///
    /// # Errors
    ///
    /// [`IdentifyError::ImageTooLarge`] above [`MAX_IMAGE_BYTES`]. The
    /// user-visible error is set and the previous image and result stay.
    pub fn accept(&self, file: ImageFile) -> Result<(), IdentifyError> {
        let mut state = self.lock();
        if file.size > MAX_IMAGE_BYTES {
            warn!(name = %file.name, size = file.size, "identify: image rejected, too large");
            state.error = Some(IMAGE_TOO_LARGE.to_string());
            return Err(IdentifyError::ImageTooLarge { size: file.size, limit: MAX_IMAGE_BYTES });
        }

        info!(name = %file.name, size = file.size, mime_type = %file.mime_type, "identify: image accepted");
        state.generation += 1;
        state.image = Some(file);
        state.phase = Phase::ImageAccepted;
        state.result = None;
        state.error = None;
        Ok(())
    }

    /// Analyze the held image with the current instruction.
    ///
    /// # Errors
    ///
    /// [`IdentifyError::NoImage`] before any image is accepted and
    /// [`IdentifyError::Busy`] while a call is outstanding. No request is
    /// issued in either case.
    pub async fn analyze(&self) -> Result<AnalysisOutcome, IdentifyError> {
        let (image, instruction, generation) = {
            let mut state = self.lock();
            let Some(image) = state.image.clone() else {
                return Err(IdentifyError::NoImage);
            };
            if state.in_flight {
                return Err(IdentifyError::Busy);
            }
            let generation = state.generation;
            state.in_flight = true;
            state.phase = Phase::Analyzing;
            state.result = None;
            state.error = None;
            (image, effective_instruction(&state.instruction), generation)
        };

        let mut guard = AnalysisGuard { analyzer: self, generation, finished: false };
        info!(name = %image.name, generation, "identify: analysis started");
        let answer = match image.encode().await {
            Ok(inline) => self.vision.analyze_image(&inline, &instruction).await,
            Err(e) => Err(e),
        };

        let mut state = self.lock();
        guard.finished = true;
        state.in_flight = false;
        if state.generation != generation {
            info!(generation, current = state.generation, "identify: result dropped, image replaced");
            return Ok(AnalysisOutcome::Superseded);
        }

        Ok(match answer {
            Ok(text) => {
                info!(generation, result_len = text.len(), "identify: analysis completed");
                state.phase = Phase::ResultReady;
                state.result = Some(text.clone());
                AnalysisOutcome::Completed(text)
            }
            Err(e) => {
                warn!(generation, error = %e, "identify: analysis failed");
                state.phase = Phase::Error;
                state.error = Some(ANALYSIS_FAILED.to_string());
                AnalysisOutcome::Failed(ANALYSIS_FAILED.to_string())
            }
        })
    }

    pub fn set_instruction(&self, instruction: impl Into<String>) {
        self.lock().instruction = instruction.into();
    }

    #[must_use]
    pub fn instruction(&self) -> String {
        self.lock().instruction.clone()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    #[must_use]
    pub fn image(&self) -> Option<ImageFile> {
        self.lock().image.clone()
    }

    #[must_use]
    pub fn result(&self) -> Option<String> {
        self.lock().result.clone()
    }

    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    #[must_use]
    pub fn is_analyzing(&self) -> bool {
        self.lock().in_flight
    }

    fn lock(&self) -> MutexGuard<'_, IdentifyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the single-flight slot when an `analyze` future is dropped
/// before the provider answers.
struct AnalysisGuard<'a> {
    analyzer: &'a ImageAnalyzer,
    generation: u64,
    finished: bool,
}

impl Drop for AnalysisGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.analyzer.lock();
        state.in_flight = false;
        if state.phase == Phase::Analyzing {
            state.phase = Phase::ImageAccepted;
        }
        warn!(generation = self.generation, "identify: analysis abandoned");
    }
}

/// A blank instruction falls back to the default question.
fn effective_instruction(instruction: &str) -> String {
    if instruction.trim().is_empty() { DEFAULT_INSTRUCTION.to_string() } else { instruction.to_string() }
}

#[cfg(test)]
#[path = "identify_test.rs"]
mod tests;
