use crate::network::NetworkId;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Idle,
    Connecting,
    Reading,
    Closing,
    Stopped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SupervisorStatus {
    pub state: Lifecycle,
    pub connected: bool,
    pub network: Option<NetworkId>,
    pub necessary: bool,
    pub active_foreground: u32,
    pub pending_events: usize,
    pub push_channel_disabled: bool,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connect_failures: u64,
    pub messages_dispatched: u64,
    pub decode_errors: u64,
    pub dispatch_errors: u64,
    pub worker_restarts: u64,
    pub last_failure: Option<String>,
    pub updated_ts_unix_ms: Option<u64>,
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
