//! Classification of inbound websocket frames.
//!
//! [`observe`] never fails: anything that is not JSON is reported as an opaque
//! frame, and missing pieces of an audio frame turn into sentinel strings.
//! Logging is left to [`crate::lifecycle`], this module only decides what there
//! is to log.

use std::{fmt, time::Duration};

use base64::{
    Engine, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use botwatch_proto::AUDIO_EVENT;
use serde_json::Value;
use tokio::time::Instant;

use crate::session::Session;

/// Every n-th parsed message is logged in detail.
pub const LOG_EVERY: u64 = 10;
/// A parsed message is also logged in detail once this much time has passed
/// since the last detailed record.
pub const LOG_INTERVAL: Duration = Duration::from_secs(5);

const MAX_RENDERED_CHARS: usize = 500;

const UNKNOWN: &str = "UNKNOWN";
const NO_TIMESTAMP: &str = "NO TIMESTAMP";

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// Frame was not JSON.
    Opaque { count: u64, size: usize },
    /// Parsed, but the rate policy kept it out of the log.
    Suppressed { count: u64 },
    Audio {
        count: u64,
        event: String,
        audio: AudioSummary,
    },
    Event {
        count: u64,
        event: String,
        rendered: String,
    },
}

impl Observation {
    pub fn count(&self) -> u64 {
        match self {
            Observation::Opaque { count, .. }
            | Observation::Suppressed { count }
            | Observation::Audio { count, .. }
            | Observation::Event { count, .. } => *count,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioSummary {
    pub audio_count: u64,
    pub participant: String,
    pub buffer: BufferSize,
    pub timestamp: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferSize {
    Bytes(usize),
    Missing,
}

impl fmt::Display for BufferSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferSize::Bytes(len) => write!(f, "{len}"),
            BufferSize::Missing => f.write_str("NO BUFFER"),
        }
    }
}

/// Account for one inbound data frame and classify it.
pub fn observe(session: &mut Session, payload: &[u8], now: Instant) -> Observation {
    session.message_count += 1;
    let count = session.message_count;

    let record: Value = match serde_json::from_slice(payload) {
        Ok(record) => record,
        Err(_) => {
            return Observation::Opaque {
                count,
                size: payload.len(),
            };
        }
    };

    if !should_log(session, now) {
        return Observation::Suppressed { count };
    }
    session.last_log = now;

    let event = event_tag(&record).unwrap_or(UNKNOWN).to_owned();

    if is_audio(&record) {
        session.audio_message_count += 1;
        Observation::Audio {
            count,
            event,
            audio: summarize_audio(&record, session.audio_message_count),
        }
    } else {
        Observation::Event {
            count,
            event,
            rendered: render(&record),
        }
    }
}

fn should_log(session: &Session, now: Instant) -> bool {
    session.message_count % LOG_EVERY == 0
        || now.saturating_duration_since(session.last_log) > LOG_INTERVAL
}

fn event_tag(record: &Value) -> Option<&str> {
    ["event", "type"].into_iter().find_map(|key| {
        record
            .get(key)
            .and_then(Value::as_str)
            .filter(|tag| !tag.is_empty())
    })
}

fn is_audio(record: &Value) -> bool {
    ["event", "type"]
        .into_iter()
        .any(|key| record.get(key).and_then(Value::as_str) == Some(AUDIO_EVENT))
}

fn summarize_audio(record: &Value, audio_count: u64) -> AudioSummary {
    let audio = record.pointer("/data/data");
    let field = |name: &str| audio.and_then(|audio| audio.get(name));

    let participant = field("participant");
    let participant = ["name", "id"]
        .into_iter()
        .find_map(|key| participant.and_then(|p| p.get(key)).and_then(describe))
        .unwrap_or_else(|| UNKNOWN.to_owned());

    let buffer = match field("buffer").and_then(Value::as_str) {
        Some(encoded) if !encoded.is_empty() => decode_buffer(encoded),
        _ => BufferSize::Missing,
    };

    let timestamp = field("timestamp")
        .and_then(describe)
        .unwrap_or_else(|| NO_TIMESTAMP.to_owned());

    AudioSummary {
        audio_count,
        participant,
        buffer,
        timestamp,
    }
}

/// Url-safe symbols are accepted, anything else outside the alphabet is
/// skipped and decoding stops at the first pad.
fn decode_buffer(encoded: &str) -> BufferSize {
    let mut symbols: String = encoded
        .chars()
        .take_while(|&c| c != '=')
        .filter_map(|c| match c {
            '-' => Some('+'),
            '_' => Some('/'),
            c if c.is_ascii_alphanumeric() || c == '+' || c == '/' => Some(c),
            _ => None,
        })
        .collect();

    // a single trailing symbol holds less than one byte
    if symbols.len() % 4 == 1 {
        symbols.pop();
    }

    match LENIENT_BASE64.decode(&symbols) {
        Ok(bytes) => BufferSize::Bytes(bytes.len()),
        Err(_) => BufferSize::Missing,
    }
}

/// Printable form of a JSON value, `None` for null and empty strings.
fn describe(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn render(record: &Value) -> String {
    let mut rendered = serde_json::to_string_pretty(record).unwrap_or_else(|_| record.to_string());
    if let Some((idx, _)) = rendered.char_indices().nth(MAX_RENDERED_CHARS) {
        rendered.truncate(idx);
    }
    rendered
}
