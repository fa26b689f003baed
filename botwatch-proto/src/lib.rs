pub mod msg;

/// Event tag carried by frames holding one participant's raw audio chunk.
pub const AUDIO_EVENT: &str = "audio_separate_raw.data";

/// Path of the liveness endpoint.
pub const HEALTH_PATH: &str = "/health";
