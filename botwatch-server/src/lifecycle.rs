use std::net::SocketAddr;

use botwatch_proto::HEALTH_PATH;
use serde::Deserialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, error, info};

use crate::{
    observer::Observation,
    session::{Session, label},
};

const NO_REASON: &str = "No reason provided";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    /// Request headers on connect and a rendering of every logged event.
    #[default]
    Detailed,
    /// Only identifiers, event tags and audio summaries.
    Minimal,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log mode `{0}`, expected `detailed` or `minimal`")]
pub struct UnknownLogMode(String);

pub fn parse_log_mode(s: &str) -> Result<LogMode, UnknownLogMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "detailed" => Ok(LogMode::Detailed),
        "minimal" => Ok(LogMode::Minimal),
        _ => Err(UnknownLogMode(s.to_owned())),
    }
}

/// Request metadata captured before the upgrade.
#[derive(Clone, Debug, Default)]
pub struct RequestDetails {
    pub uri: String,
    pub origin: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseSummary {
    pub code: u16,
    pub reason: String,
}

impl CloseSummary {
    pub fn reason_label(&self) -> &str {
        if self.reason.is_empty() {
            NO_REASON
        } else {
            &self.reason
        }
    }
}

pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

pub fn server_started(addr: SocketAddr) {
    let port = addr.port();
    info!(%addr, "bot test websocket server started");
    info!("health check: http://localhost:{port}{HEALTH_PATH}");
    info!("websocket url: ws://localhost:{port}?bot_id=test&connection_type=recall");
    info!("waiting for bot to connect...");
}

pub fn connection_opened(session: &Session, request: &RequestDetails, mode: LogMode) {
    match mode {
        LogMode::Detailed => info!(
            timestamp = %now_rfc3339(),
            bot_id = session.bot_label(),
            connection_type = session.connection_type_label(),
            url = %request.uri,
            origin = label(request.origin.as_deref()),
            user_agent = label(request.user_agent.as_deref()),
            "new websocket connection"
        ),
        LogMode::Minimal => info!(
            timestamp = %now_rfc3339(),
            bot_id = session.bot_label(),
            connection_type = session.connection_type_label(),
            "new websocket connection"
        ),
    }
}

pub fn observation(observation: &Observation, mode: LogMode) {
    let message_no = observation.count();
    match observation {
        Observation::Opaque { size, .. } => {
            info!(message_no, size, "binary/non-JSON message received");
        }
        Observation::Suppressed { .. } => debug!(message_no, "message received"),
        Observation::Audio { event, audio, .. } => {
            info!(
                message_no,
                %event,
                audio_message_no = audio.audio_count,
                participant = %audio.participant,
                buffer_size = %audio.buffer,
                audio_timestamp = %audio.timestamp,
                "audio data received"
            );
        }
        Observation::Event { event, rendered, .. } => match mode {
            LogMode::Detailed => info!(message_no, %event, "message received\n{rendered}"),
            LogMode::Minimal => info!(message_no, %event, "message received"),
        },
    }
}

pub fn connection_closed(session: &Session, close: &CloseSummary) {
    info!(
        bot_id = session.bot_label(),
        close_code = close.code,
        reason = close.reason_label(),
        total_messages = session.message_count,
        total_audio_messages = session.audio_message_count,
        duration = ?session.opened_at.elapsed(),
        "websocket closed"
    );
}

pub fn socket_error(session: &Session, err: &axum::Error) {
    error!(bot_id = session.bot_label(), error = %err, "websocket error");
}
