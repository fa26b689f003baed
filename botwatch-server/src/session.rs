use botwatch_proto::msg::ConnectParams;
use tokio::time::Instant;

/// Per-connection bookkeeping, owned by the task driving that socket.
#[derive(Clone, Debug)]
pub struct Session {
    pub bot_id: Option<String>,
    pub connection_type: Option<String>,
    pub message_count: u64,
    pub audio_message_count: u64,
    /// When the last detailed record was emitted, or when the session opened.
    pub last_log: Instant,
    pub opened_at: Instant,
}

impl Session {
    pub fn new(params: ConnectParams, now: Instant) -> Self {
        Session {
            bot_id: params.bot_id,
            connection_type: params.connection_type,
            message_count: 0,
            audio_message_count: 0,
            last_log: now,
            opened_at: now,
        }
    }

    /// Bot id for log output.
    pub fn bot_label(&self) -> &str {
        label(self.bot_id.as_deref())
    }

    pub fn connection_type_label(&self) -> &str {
        label(self.connection_type.as_deref())
    }
}

pub const NOT_PROVIDED: &str = "NOT PROVIDED";

/// Absent and empty values both read as not provided.
pub fn label(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or(NOT_PROVIDED)
}
