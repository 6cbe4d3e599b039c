//! Gemini REST client.
//!
//! Thin HTTP wrapper for `generateContent` (one-shot, multimodal) and
//! `streamGenerateContent?alt=sse` (chat streaming). SSE framing and
//! response parsing are pure functions so they can be tested without a
//! network.
//!
//! DESIGN
//! ======
//! A chat is just the client plus a local `contents` history. Each turn
//! sends the whole history; the user turn is pushed before the request and
//! the model reply is pushed once its stream has been drained. A failed
//! turn is popped again so the next request never carries a dangling user
//! message.

use std::collections::VecDeque;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::LlmConfig;
use super::types::{ChatModel, ChatSession, InlineImage, LlmError, TextStream, VisionModel};

const API_KEY_HEADER: &str = "x-goog-api-key";

// =============================================================================
// CLIENT
// =============================================================================

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiClient {
    /// Build a client from typed config.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::HttpClientBuild`] if the HTTP client cannot be built.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| LlmError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, api_key: config.api_key, base_url: config.base_url, model: config.model })
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, body: &GenerateContentRequest<'_>) -> Result<String, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let response = self.post(url, body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::ApiRequest(e.to_string()))?;
        parse_response(&text)?.ok_or(LlmError::EmptyResponse)
    }

    async fn generate_stream(&self, body: &GenerateContentRequest<'_>) -> Result<TextStream<'static>, LlmError> {
        let url = format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, self.model);
        let response = self.post(url, body).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| LlmError::ApiRequest(e.to_string())))
            .boxed();
        Ok(decode_sse_stream(bytes))
    }

    async fn post(&self, url: String, body: &GenerateContentRequest<'_>) -> Result<reqwest::Response, LlmError> {
        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::ApiRequest(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let text = response
                .text()
                .await
                .map_err(|e| LlmError::ApiRequest(e.to_string()))?;
            warn!(status, message = %error_message(&text), "gemini: request rejected");
            return Err(LlmError::ApiResponse { status, body: text });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ChatModel for GeminiClient {
    async fn start_chat(&self, system: &str) -> Result<Box<dyn ChatSession>, LlmError> {
        let system = (!system.trim().is_empty()).then(|| Content::system(system));
        Ok(Box::new(GeminiChat { client: self.clone(), system, history: Vec::new() }))
    }
}

#[async_trait::async_trait]
impl VisionModel for GeminiClient {
    async fn analyze_image(&self, image: &InlineImage, instruction: &str) -> Result<String, LlmError> {
        let contents = [Content {
            role: Some("user".into()),
            parts: vec![Part::inline(image), Part::text(instruction)],
        }];
        let body = GenerateContentRequest { contents: &contents, system_instruction: None };
        self.generate(&body).await
    }
}

// =============================================================================
// CHAT SESSION
// =============================================================================

pub struct GeminiChat {
    client: GeminiClient,
    system: Option<Content>,
    history: Vec<Content>,
}

#[async_trait::async_trait]
impl ChatSession for GeminiChat {
    async fn send_message_stream<'a>(&'a mut self, message: &str) -> Result<TextStream<'a>, LlmError> {
        begin_turn(&mut self.history, message);
        let opened = {
            let body = GenerateContentRequest { contents: &self.history, system_instruction: self.system.as_ref() };
            self.client.generate_stream(&body).await
        };
        match opened {
            Ok(fragments) => Ok(commit_on_completion(fragments, &mut self.history)),
            Err(e) => {
                self.history.pop();
                Err(e)
            }
        }
    }
}

/// Append the user turn. A trailing user turn means an earlier stream was
/// dropped before it finished; that turn never got a reply, so it goes.
fn begin_turn(history: &mut Vec<Content>, message: &str) {
    if history.last().is_some_and(|last| last.role.as_deref() == Some("user")) {
        debug!(history_len = history.len(), "gemini: dropping unanswered user turn");
        history.pop();
    }
    history.push(Content::turn("user", message));
}

struct PendingTurn<'a> {
    fragments: TextStream<'static>,
    history: &'a mut Vec<Content>,
    reply: String,
    done: bool,
}

/// Pass fragments through while recording the reply; the model turn lands
/// in `history` when the stream is exhausted. On error the user turn is
/// removed instead.
fn commit_on_completion<'a>(fragments: TextStream<'static>, history: &'a mut Vec<Content>) -> TextStream<'a> {
    let turn = PendingTurn { fragments, history, reply: String::new(), done: false };
    stream::unfold(turn, |mut turn| async move {
        if turn.done {
            return None;
        }
        match turn.fragments.next().await {
            Some(Ok(text)) => {
                turn.reply.push_str(&text);
                Some((Ok(text), turn))
            }
            Some(Err(e)) => {
                turn.history.pop();
                turn.done = true;
                Some((Err(e), turn))
            }
            None => {
                if turn.reply.is_empty() {
                    turn.history.pop();
                } else {
                    let reply = std::mem::take(&mut turn.reply);
                    turn.history.push(Content::turn("model", &reply));
                }
                debug!(history_len = turn.history.len(), "gemini: turn committed");
                None
            }
        }
    })
    .boxed()
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: &'a [Content],
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<&'a Content>,
}

#[derive(Debug, Clone, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

impl Content {
    fn turn(role: &str, text: &str) -> Self {
        Self { role: Some(role.into()), parts: vec![Part::text(text)] }
    }

    fn system(text: &str) -> Self {
        Self { role: None, parts: vec![Part::text(text)] }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineDataPayload,
    },
}

impl Part {
    fn text(text: &str) -> Self {
        Self::Text { text: text.to_string() }
    }

    fn inline(image: &InlineImage) -> Self {
        Self::InlineData {
            inline_data: InlineDataPayload { mime_type: image.mime_type.clone(), data: image.data.clone() },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineDataPayload {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<PartResponse>,
}

#[derive(Deserialize)]
struct PartResponse {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: Option<i64>,
    message: Option<String>,
    status: Option<String>,
}

// =============================================================================
// PARSING
// =============================================================================

/// Extract the text of the first candidate. `Ok(None)` when the payload is
/// valid but carries no text (e.g. a trailing finish-reason chunk).
fn parse_response(json: &str) -> Result<Option<String>, LlmError> {
    let api: GenerateContentResponse = serde_json::from_str(json).map_err(|e| LlmError::ApiParse(e.to_string()))?;

    if let Some(err) = api.error {
        let status = err.code.and_then(|c| u16::try_from(c).ok()).unwrap_or(500);
        return Err(LlmError::ApiResponse { status, body: describe_error(&err, json) });
    }

    let text: String = api
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter(|part| !part.thought)
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();

    Ok((!text.is_empty()).then_some(text))
}

/// Human-readable summary of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorWrapper>(body).map_or_else(|_| body.to_string(), |w| describe_error(&w.error, body))
}

fn describe_error(err: &ErrorBody, raw: &str) -> String {
    let message = err.message.clone().unwrap_or_else(|| raw.to_string());
    match err.status.as_deref() {
        Some(status) if !status.is_empty() => format!("{status}: {message}"),
        _ => message,
    }
}

// =============================================================================
// SERVER-SENT EVENTS
// =============================================================================

/// Incremental SSE framer. Feed raw bytes, get back complete `data`
/// payloads. Lines may be split anywhere across chunks.
#[derive(Default)]
struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            self.feed_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        events
    }

    /// Flush whatever is buffered once the byte stream has ended.
    fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buf.is_empty() {
            let raw = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&raw);
            self.feed_line(line.trim_end_matches('\r'), &mut events);
        }
        self.flush_event(&mut events);
        events
    }

    fn feed_line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            self.flush_event(events);
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // `event:`, `id:`, `retry:` and `:` comments carry nothing we use.
    }

    fn flush_event(&mut self, events: &mut Vec<String>) {
        if !self.data.is_empty() {
            events.push(self.data.join("\n"));
            self.data.clear();
        }
    }
}

struct SseState<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

/// Turn a byte stream of SSE frames into text fragments. Chunks without
/// text are skipped; the first error ends the stream.
fn decode_sse_stream<'a, S, B>(bytes: S) -> TextStream<'a>
where
    S: Stream<Item = Result<B, LlmError>> + Unpin + Send + 'a,
    B: AsRef<[u8]> + Send + 'a,
{
    let state = SseState { bytes, decoder: SseDecoder::default(), pending: VecDeque::new(), done: false };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(data) = st.pending.pop_front() {
                match parse_response(&data) {
                    Ok(Some(text)) => return Some((Ok(text), st)),
                    Ok(None) => continue,
                    Err(e) => {
                        st.pending.clear();
                        st.done = true;
                        return Some((Err(e), st));
                    }
                }
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.push(chunk.as_ref());
                    st.pending.extend(events);
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.done = true;
                    let events = st.decoder.finish();
                    st.pending.extend(events);
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
#[path = "gemini_test.rs"]
mod tests;
