use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const GREETING_TYPE: &str = "connection.established";

const GREETING_MESSAGE: &str = "Connected to bot test server";
const HEALTH_MESSAGE: &str = "bot test server running";

/// Query parameters a bot attaches to the websocket URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub bot_id: Option<String>,
    pub connection_type: Option<String>,
}

impl ConnectParams {
    /// Build from decoded query pairs, the first occurrence of a key wins.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut params = ConnectParams::default();
        for (key, value) in pairs {
            let slot = match key.as_ref() {
                "bot_id" => &mut params.bot_id,
                "connection_type" => &mut params.connection_type,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into());
            }
        }
        params
    }
}

/// First frame sent to every accepted websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    #[serde(rename = "type")]
    pub kind: String,
    pub bot_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub message: String,
}

impl ConnectionEstablished {
    pub fn new(bot_id: Option<String>) -> Self {
        ConnectionEstablished {
            kind: GREETING_TYPE.to_owned(),
            bot_id,
            timestamp: OffsetDateTime::now_utc(),
            message: GREETING_MESSAGE.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub message: String,
}

impl HealthStatus {
    pub fn ok() -> Self {
        HealthStatus {
            status: "ok".to_owned(),
            timestamp: OffsetDateTime::now_utc(),
            message: HEALTH_MESSAGE.to_owned(),
        }
    }
}
