//! Normalization of the daemon's newline-delimited JSON streams (build,
//! pull, push) into one message shape, plus the channel plumbing that
//! carries those messages from scanner tasks to a consumer.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bollard::models::{BuildInfo, BuildInfoAux, CreateImageInfo, PushImageInfo};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Stream id the daemon uses for trace envelopes.
pub const TRACE_ENVELOPE_ID: &str = "moby.buildkit.trace";

/// Out-of-band payload attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuxPayload {
    /// Id of a freshly built image.
    ImageId(String),
    /// Result of pushing one tag.
    PushResult {
        tag: String,
        digest: String,
        size: i64,
    },
}

/// One normalized unit of daemon output. Exactly one branch per unit;
/// consumers match on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMessage {
    Status {
        message: String,
        progress: Option<String>,
    },
    Stream(String),
    Aux(AuxPayload),
    Error(String),
}

impl ResponseMessage {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
            progress: None,
        }
    }

    /// Single display line for this message, used by sinks and by the
    /// equivalence between the legacy and trace shapes.
    pub fn summary(&self) -> String {
        match self {
            Self::Status { message, progress } => match progress {
                Some(progress) => format!("{message} {progress}"),
                None => message.clone(),
            },
            Self::Stream(line) => line.trim_end_matches('\n').to_string(),
            Self::Aux(AuxPayload::ImageId(id)) => format!("image id: {id}"),
            Self::Aux(AuxPayload::PushResult { tag, digest, size }) => {
                format!("{tag}: digest: {digest} size: {size}")
            }
            Self::Error(error) => format!("error: {error}"),
        }
    }
}

impl std::fmt::Display for ResponseMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary())
    }
}

enum Event {
    Message(ResponseMessage),
    Eof,
}

/// Producer handle. Clone one per concurrent daemon stream feeding the
/// same reader; each producer must call `finish()` exactly once.
#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl MessageSender {
    pub fn send(&self, message: ResponseMessage) {
        let _ = self.tx.send(Event::Message(message));
    }

    /// Marks this producer's stream as ended.
    pub fn finish(&self) {
        let _ = self.tx.send(Event::Eof);
    }

    /// Spawns a scanner task that reads newline-delimited JSON from
    /// `reader`, parses each line and forwards the results, finishing
    /// when the reader ends.
    pub fn feed_ndjson<R>(self, reader: R)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = reader.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        for message in parse_line(&line) {
                            self.send(message);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.send(ResponseMessage::Error(e.to_string()));
                        break;
                    }
                }
            }
            self.finish();
        });
    }
}

/// Consumer over one or more merged producer streams. The reader only
/// reports completion after `expected_eofs` end markers, so concurrent
/// producers can interleave freely.
pub struct MessageReader {
    rx: mpsc::UnboundedReceiver<Event>,
    expected_eofs: usize,
    seen_eofs: usize,
}

/// Builds a connected sender/reader pair expecting `expected_eofs`
/// producer end markers.
pub fn message_channel(expected_eofs: usize) -> (MessageSender, MessageReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MessageSender { tx },
        MessageReader {
            rx,
            expected_eofs,
            seen_eofs: 0,
        },
    )
}

impl MessageReader {
    /// Next message, or `None` once every expected producer finished
    /// (or all senders dropped).
    pub async fn next(&mut self) -> Option<ResponseMessage> {
        loop {
            if self.expected_eofs > 0 && self.seen_eofs >= self.expected_eofs {
                return None;
            }
            match self.rx.recv().await {
                Some(Event::Message(message)) => return Some(message),
                Some(Event::Eof) => {
                    self.seen_eofs += 1;
                    debug!(
                        "Stream EOF {}/{} observed",
                        self.seen_eofs, self.expected_eofs
                    );
                }
                None => return None,
            }
        }
    }

    /// Drains the stream, invoking `on_message` per message. Returns the
    /// collected aux payloads, or the first error carried in-stream.
    pub async fn listen<F>(mut self, mut on_message: F) -> Result<Vec<AuxPayload>>
    where
        F: FnMut(&ResponseMessage),
    {
        let mut aux = Vec::new();
        let mut first_error: Option<String> = None;
        while let Some(message) = self.next().await {
            on_message(&message);
            match message {
                ResponseMessage::Aux(payload) => aux.push(payload),
                ResponseMessage::Error(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                _ => {}
            }
        }
        match first_error {
            Some(error) => Err(EngineError::Stream(error)),
            None => Ok(aux),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: Option<String>,
    stream: Option<String>,
    status: Option<String>,
    progress: Option<String>,
    error: Option<String>,
    #[serde(rename = "errorDetail")]
    error_detail: Option<RawErrorDetail>,
    aux: Option<serde_json::Value>,
}

/// Parses one raw daemon line. Both shapes are recognized: the legacy
/// status/stream/aux/error object, and the trace envelope whose aux is a
/// base64-encoded status report. Unparseable lines pass through as raw
/// stream text.
pub fn parse_line(line: &str) -> Vec<ResponseMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let raw: RawMessage = match serde_json::from_str(trimmed) {
        Ok(raw) => raw,
        Err(_) => return vec![ResponseMessage::Stream(line.to_string())],
    };

    if raw.id.as_deref() == Some(TRACE_ENVELOPE_ID) {
        if let Some(serde_json::Value::String(encoded)) = &raw.aux {
            return decode_trace_aux(encoded);
        }
    }

    let mut messages = Vec::new();
    if let Some(error) = raw.error {
        let detail = raw.error_detail.and_then(|d| d.message);
        messages.push(ResponseMessage::Error(detail.unwrap_or(error)));
        return messages;
    }
    if let Some(stream) = raw.stream {
        messages.push(ResponseMessage::Stream(stream));
    }
    if let Some(status) = raw.status {
        if let Some(payload) = parse_push_status(&status) {
            messages.push(ResponseMessage::Aux(payload));
        } else {
            messages.push(ResponseMessage::Status {
                message: status,
                progress: raw.progress,
            });
        }
    }
    if let Some(aux) = raw.aux {
        if let Some(payload) = parse_aux_value(&aux) {
            messages.push(ResponseMessage::Aux(payload));
        }
    }
    messages
}

fn parse_aux_value(aux: &serde_json::Value) -> Option<AuxPayload> {
    if let Some(id) = aux.get("ID").and_then(|v| v.as_str()) {
        return Some(AuxPayload::ImageId(id.to_string()));
    }
    let tag = aux.get("Tag").and_then(|v| v.as_str())?;
    let digest = aux.get("Digest").and_then(|v| v.as_str())?;
    let size = aux.get("Size").and_then(|v| v.as_i64()).unwrap_or(0);
    Some(AuxPayload::PushResult {
        tag: tag.to_string(),
        digest: digest.to_string(),
        size,
    })
}

/// Recognizes the terminal push status line
/// `<tag>: digest: sha256:… size: <n>`.
pub fn parse_push_status(status: &str) -> Option<AuxPayload> {
    let (tag, rest) = status.split_once(": digest: ")?;
    let mut parts = rest.split_whitespace();
    let digest = parts.next()?;
    if !digest.starts_with("sha256:") {
        return None;
    }
    let size = match (parts.next(), parts.next()) {
        (Some("size:"), Some(n)) => n.parse::<i64>().ok()?,
        _ => return None,
    };
    Some(AuxPayload::PushResult {
        tag: tag.trim().to_string(),
        digest: digest.to_string(),
        size,
    })
}

#[derive(Debug, Default, Deserialize)]
struct TraceVertex {
    name: Option<String>,
    cached: Option<bool>,
    completed: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TraceStatus {
    id: Option<String>,
    current: Option<i64>,
    total: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct TraceLog {
    msg: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TraceReport {
    #[serde(default)]
    vertexes: Vec<TraceVertex>,
    #[serde(default)]
    statuses: Vec<TraceStatus>,
    #[serde(default)]
    logs: Vec<TraceLog>,
}

/// Decodes a trace envelope's aux payload and re-synthesizes summary
/// messages. Reports that do not decode degrade to a generic progress
/// status instead of failing the stream.
fn decode_trace_aux(encoded: &str) -> Vec<ResponseMessage> {
    let bytes = match BASE64.decode(encoded.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Undecodable trace aux payload: {}", e);
            return vec![ResponseMessage::status("build trace received")];
        }
    };

    let report: TraceReport = match serde_json::from_slice(&bytes) {
        Ok(report) => report,
        Err(_) => return vec![ResponseMessage::status("build in progress")],
    };

    let mut messages = Vec::new();
    for vertex in report.vertexes {
        let Some(name) = vertex.name else { continue };
        if vertex.cached == Some(true) {
            messages.push(ResponseMessage::Stream(format!("CACHED {name}\n")));
        } else if vertex.completed.is_some() {
            messages.push(ResponseMessage::Stream(format!("{name}\n")));
        } else {
            messages.push(ResponseMessage::status(name));
        }
    }
    for status in report.statuses {
        let Some(id) = status.id else { continue };
        let progress = match (status.current, status.total) {
            (Some(current), Some(total)) if total > 0 => Some(format!("{current}/{total}")),
            _ => None,
        };
        messages.push(ResponseMessage::Status {
            message: id,
            progress,
        });
    }
    for log in report.logs {
        if let Some(msg) = log.msg {
            messages.push(ResponseMessage::Stream(msg));
        }
    }
    if messages.is_empty() {
        messages.push(ResponseMessage::status("build in progress"));
    }
    messages
}

/// Typed-stream conversions used when bollard already deserialized the
/// line for us.
pub fn from_build_info(info: BuildInfo) -> Vec<ResponseMessage> {
    let mut messages = Vec::new();
    if let Some(error) = info.error {
        let detail = info.error_detail.and_then(|d| d.message);
        messages.push(ResponseMessage::Error(detail.unwrap_or(error)));
        return messages;
    }
    if let Some(stream) = info.stream {
        messages.push(ResponseMessage::Stream(stream));
    }
    if let Some(status) = info.status {
        messages.push(ResponseMessage::Status {
            message: status,
            progress: info.progress,
        });
    }
    if let Some(BuildInfoAux::Default(image_id)) = info.aux {
        if let Some(id) = image_id.id {
            messages.push(ResponseMessage::Aux(AuxPayload::ImageId(id)));
        }
    }
    messages
}

pub fn from_create_image_info(info: CreateImageInfo) -> Vec<ResponseMessage> {
    let mut messages = Vec::new();
    if let Some(error) = info.error {
        messages.push(ResponseMessage::Error(error));
        return messages;
    }
    if let Some(status) = info.status {
        messages.push(ResponseMessage::Status {
            message: status,
            progress: info.progress,
        });
    }
    messages
}

pub fn from_push_info(info: PushImageInfo) -> Vec<ResponseMessage> {
    let mut messages = Vec::new();
    if let Some(error) = info.error {
        messages.push(ResponseMessage::Error(error));
        return messages;
    }
    if let Some(status) = info.status {
        if let Some(payload) = parse_push_status(&status) {
            messages.push(ResponseMessage::Aux(payload));
        } else {
            messages.push(ResponseMessage::Status {
                message: status,
                progress: info.progress,
            });
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_error_takes_priority() {
        let messages =
            parse_line(r#"{"error":"boom","errorDetail":{"message":"boom: no space"}}"#);
        assert_eq!(
            messages,
            vec![ResponseMessage::Error("boom: no space".to_string())]
        );
    }

    #[test]
    fn push_status_line_becomes_digest_aux() {
        let messages = parse_line(r#"{"status":"latest: digest: sha256:abcd size: 529"}"#);
        assert_eq!(
            messages,
            vec![ResponseMessage::Aux(AuxPayload::PushResult {
                tag: "latest".to_string(),
                digest: "sha256:abcd".to_string(),
                size: 529,
            })]
        );
    }

    #[test]
    fn non_json_passes_through_as_stream() {
        let messages = parse_line("plain progress text");
        assert_eq!(
            messages,
            vec![ResponseMessage::Stream("plain progress text".to_string())]
        );
    }

    #[test]
    fn trace_envelope_with_json_report_resynthesizes() {
        let report = serde_json::json!({
            "vertexes": [{"name": "[1/3] FROM alpine", "cached": true}],
            "logs": [{"msg": "hello\n"}],
        });
        let encoded = BASE64.encode(serde_json::to_vec(&report).unwrap());
        let line = format!(r#"{{"id":"moby.buildkit.trace","aux":"{encoded}"}}"#);

        let messages = parse_line(&line);
        assert!(messages
            .iter()
            .any(|m| m.summary().contains("CACHED [1/3] FROM alpine")));
        assert!(messages.iter().any(|m| m.summary() == "hello"));
    }

    #[test]
    fn trace_envelope_with_binary_report_degrades_gracefully() {
        let encoded = BASE64.encode([0x08u8, 0x96, 0x01, 0xff]);
        let line = format!(r#"{{"id":"moby.buildkit.trace","aux":"{encoded}"}}"#);
        let messages = parse_line(&line);
        assert_eq!(
            messages,
            vec![ResponseMessage::status("build in progress")]
        );
    }
}
